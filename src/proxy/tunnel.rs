use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::attestation::AttestationVerifier;
use crate::error::Error;
use crate::policy::AttestationPolicy;
use crate::session::retry::with_retry;
use crate::transport::tcp;

use super::client::{Client, ClientConfig};
use super::relay;

/// Configuration for the local tunnel.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Plaintext listener for local applications.
    pub listen_addr: SocketAddr,
    pub client: ClientConfig,
}

/// Bind `config.listen_addr` and tunnel every accepted connection.
pub async fn run_tunnel<V, P>(config: TunnelConfig, verifier: V, policy: P) -> Result<(), Error>
where
    V: AttestationVerifier + 'static,
    P: AttestationPolicy + 'static,
{
    let listener = tcp::listen(config.listen_addr).await?;
    let client = Arc::new(Client::new(config.client, verifier, policy)?);
    serve_tunnel(listener, client).await
}

/// Accept loop. Each connection gets its own tcp-envelope session, since an
/// earlier one may have expired on the responder.
pub async fn serve_tunnel<V, P>(listener: TcpListener, client: Arc<Client<V, P>>) -> Result<(), Error>
where
    V: AttestationVerifier + 'static,
    P: AttestationPolicy + 'static,
{
    tracing::info!(addr = %listener.local_addr()?, "tunnel listening");

    loop {
        let (stream, peer_addr) = tcp::accept(&listener).await?;
        let client = Arc::clone(&client);

        tokio::spawn(async move {
            tracing::debug!(%peer_addr, "accepted local connection");
            if let Err(e) = tunnel_connection(stream, &client).await {
                tracing::warn!(%peer_addr, error = %e, "tunnel connection failed");
            }
        });
    }
}

async fn tunnel_connection<V, P>(stream: TcpStream, client: &Client<V, P>) -> Result<(), Error>
where
    V: AttestationVerifier,
    P: AttestationPolicy,
{
    let (channel, _) = match client.retry_policy() {
        Some(policy) => with_retry(policy, || client.connect()).await?,
        None => client.connect().await?,
    };
    relay(channel, stream, client.net_timeout(), || {}).await
}
