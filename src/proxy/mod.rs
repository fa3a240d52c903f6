//! HTTP surfaces of the channel: the responder server, the initiator client
//! and the local TCP tunnel built on top of it.

/// Initiator side: hello over HTTP, json calls and tcp upgrades.
pub mod client;
/// Responder side: hello, session and cert endpoints.
pub mod server;
/// Local TCP listener relaying each connection through a fresh tcp session.
pub mod tunnel;
#[cfg(feature = "tls")]
pub mod tls;
mod web_error;

use std::time::Duration;

use bytes::Bytes;
use reqwest::Url;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, SessionError};
use crate::session::channel::{Message, SecureChannel, SecureReceiver, SecureSender};
use crate::session::DEFAULT_PREFIX;

/// Value of the `Upgrade` header that turns a session POST into a duplex stream.
pub const UPGRADE_PROTOCOL: &str = "attested-duplex";

const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Split `https://host[:port]/path` into `("https://host:port", "/path")`.
///
/// The port defaults to the scheme's; an empty path becomes the default prefix.
pub fn split_url(url: &str) -> Result<(String, String), Error> {
    let parsed =
        Url::parse(url).map_err(|e| SessionError::InvalidConfig(format!("bad url {url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| SessionError::InvalidConfig(format!("url {url} has no host")))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| SessionError::InvalidConfig(format!("url {url} has no port")))?;
    let origin = format!("{}://{host}:{port}", parsed.scheme());

    let path = parsed.path().trim_end_matches('/');
    let prefix = if path.is_empty() {
        DEFAULT_PREFIX.to_string()
    } else {
        path.to_string()
    };
    Ok((origin, prefix))
}

/// Pump bytes between a secure channel and a plain stream until both
/// directions are done.
///
/// A Shutdown from the peer half-closes `stream`; EOF on `stream` sends
/// Shutdown to the peer. `on_activity` runs after every successful write in
/// either direction. Writes to `stream` are bounded by `write_timeout`.
pub async fn relay<T, S, F>(
    channel: SecureChannel<T>,
    stream: S,
    write_timeout: Duration,
    on_activity: F,
) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite,
    S: AsyncRead + AsyncWrite,
    F: Fn() + Sync,
{
    let (mut sender, mut receiver) = channel.split();
    let (mut local_read, mut local_write) = tokio::io::split(stream);

    tokio::try_join!(
        inbound(&mut receiver, &mut local_write, write_timeout, &on_activity),
        outbound(&mut local_read, &mut sender, &on_activity),
    )?;
    Ok(())
}

async fn inbound<R, W, F>(
    receiver: &mut SecureReceiver<R>,
    local: &mut W,
    write_timeout: Duration,
    on_activity: &F,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(),
{
    loop {
        match receiver.recv().await? {
            Message::Data(data) => {
                let write = async {
                    local.write_all(&data).await?;
                    local.flush().await
                };
                tokio::time::timeout(write_timeout, write)
                    .await
                    .map_err(|_| SessionError::Timeout("relay write"))??;
                on_activity();
            }
            Message::Heartbeat => {}
            Message::Shutdown => {
                tracing::debug!("peer finished sending");
                local.shutdown().await.ok();
                return Ok(());
            }
        }
    }
}

async fn outbound<R, W, F>(
    local: &mut R,
    sender: &mut SecureSender<W>,
    on_activity: &F,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(),
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        let n = local.read(&mut buf).await?;
        if n == 0 {
            tracing::debug!("local side finished sending");
            return sender.shutdown().await;
        }
        sender.send(Bytes::copy_from_slice(&buf[..n])).await?;
        on_activity();
    }
}
