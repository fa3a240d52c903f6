//! Local tunnel in front of an attested responder.
//!
//! `responder` serves the hello/session endpoints with the mock provider and
//! forwards to `--target`. `tunnel` listens locally and carries every
//! accepted connection over a fresh tcp-envelope session.
//!
//! ```text
//! cargo run --example tunnel -- responder --listen 127.0.0.1:8443 --target 127.0.0.1:8080
//! cargo run --example tunnel -- tunnel --listen 127.0.0.1:9000 --url http://127.0.0.1:8443
//! ```

use std::net::SocketAddr;

use anyhow::Result;
use attested_channel::policy::AcceptAll;
use attested_channel::proxy::client::ClientConfig;
use attested_channel::proxy::server::{run, ServerConfig};
use attested_channel::proxy::tunnel::{run_tunnel, TunnelConfig};
use attested_channel::session::retry::RetryPolicy;
use attested_channel::{MockProvider, MockVerifier};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tunnel", about = "Attested channel responder and local tunnel")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve hello/session with mock attestation.
    Responder {
        #[arg(long, default_value = "127.0.0.1:8443")]
        listen: SocketAddr,

        /// Service behind the responder
        #[arg(long, default_value = "127.0.0.1:8080")]
        target: SocketAddr,

        /// Opaque user data bound into every document
        #[arg(long)]
        user_data: Option<String>,
    },
    /// Listen locally and tunnel to a responder.
    Tunnel {
        #[arg(long, default_value = "127.0.0.1:9000")]
        listen: SocketAddr,

        /// Responder URL, e.g. `https://host:8443/.well-known/lockhost`
        #[arg(long)]
        url: String,

        /// Retry failed session setups this many times
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Args::parse().command {
        Command::Responder {
            listen,
            target,
            user_data,
        } => {
            tracing::warn!("using mock attestation; do not expose this responder");
            let config = ServerConfig::new(listen, target);
            run(config, MockProvider::new(), user_data.map(String::into_bytes)).await?;
        }
        Command::Tunnel {
            listen,
            url,
            retries,
        } => {
            let mut client = ClientConfig::new(url);
            if retries > 0 {
                client.session.retry_policy = Some(RetryPolicy {
                    max_retries: retries,
                    ..RetryPolicy::default()
                });
            }
            let config = TunnelConfig {
                listen_addr: listen,
                client,
            };
            run_tunnel(config, MockVerifier::new(), AcceptAll).await?;
        }
    }
    Ok(())
}
