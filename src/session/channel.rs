use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{Decoder, Encoder};

use crate::crypto::seal::{OpeningContext, SealingContext};
use crate::crypto::{CipherSuite, SessionKeys};
use crate::error::{Error, SessionError};
use crate::frame::codec::FrameCodec;
use crate::frame::{Flags, Frame, FrameType};

use super::SessionConfig;

/// Bytes a sealed frame payload adds on top of the plaintext (nonce + tag).
pub const FRAME_OVERHEAD: usize =
    CipherSuite::X25519XChaChaPoly.nonce_len() + CipherSuite::X25519XChaChaPoly.tag_len();

/// A message received from a secure channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Decrypted application data.
    Data(Bytes),
    /// Keep-alive with no payload.
    Heartbeat,
    /// The peer will send nothing more.
    Shutdown,
}

/// Sending half of a [`SecureChannel`].
pub struct SecureSender<W> {
    writer: W,
    sealer: SealingContext,
    codec: FrameCodec,
    max_chunk: usize,
    net_timeout: Duration,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> SecureSender<W> {
    pub fn new(writer: W, keys: &SessionKeys, config: &SessionConfig) -> Self {
        Self {
            writer,
            sealer: SealingContext::new(&keys.tx),
            codec: FrameCodec::with_max_payload_size(config.max_payload_size),
            max_chunk: (config.max_payload_size as usize).saturating_sub(FRAME_OVERHEAD).max(1),
            net_timeout: config.net_timeout,
            closed: false,
        }
    }

    /// Encrypt and send `payload`. Payloads larger than one frame are split
    /// into consecutive Data frames.
    pub async fn send(&mut self, payload: Bytes) -> Result<(), Error> {
        if payload.is_empty() {
            return self.send_sealed(FrameType::Data, &[]).await;
        }
        for chunk in payload.chunks(self.max_chunk) {
            self.send_sealed(FrameType::Data, chunk).await?;
        }
        Ok(())
    }

    pub async fn heartbeat(&mut self) -> Result<(), Error> {
        self.send_sealed(FrameType::Heartbeat, &[]).await
    }

    /// Send a sealed Shutdown frame and half-close the writer.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.send_sealed(FrameType::Shutdown, &[]).await?;
        self.closed = true;
        tokio::time::timeout(self.net_timeout, self.writer.shutdown())
            .await
            .map_err(|_| SessionError::Timeout("shutdown"))??;
        Ok(())
    }

    async fn send_sealed(&mut self, msg_type: FrameType, plaintext: &[u8]) -> Result<(), Error> {
        if self.closed {
            return Err(SessionError::Closed.into());
        }
        let flags = Flags::empty();
        let (sealed, seq) = self.sealer.seal(plaintext, msg_type as u8, flags.raw())?;
        let frame = Frame::new(msg_type, flags, seq, Bytes::from(sealed));

        let mut buf = BytesMut::new();
        self.codec.encode(frame, &mut buf)?;

        let write = async {
            self.writer.write_all(&buf).await?;
            self.writer.flush().await
        };
        tokio::time::timeout(self.net_timeout, write)
            .await
            .map_err(|_| SessionError::Timeout("write"))??;
        Ok(())
    }
}

/// Receiving half of a [`SecureChannel`].
pub struct SecureReceiver<R> {
    reader: R,
    opener: OpeningContext,
    codec: FrameCodec,
    read_buf: BytesMut,
    failed: bool,
}

impl<R: AsyncRead + Unpin> SecureReceiver<R> {
    pub fn new(reader: R, keys: &SessionKeys, config: &SessionConfig) -> Self {
        Self {
            reader,
            opener: OpeningContext::new(&keys.rx),
            codec: FrameCodec::with_max_payload_size(config.max_payload_size),
            read_buf: BytesMut::with_capacity(8 * 1024),
            failed: false,
        }
    }

    /// Receive the next message. A frame that fails authentication, arrives
    /// out of order or cannot be parsed ends the stream: this call returns
    /// the error and every later call returns `SessionError::Closed`.
    pub async fn recv(&mut self) -> Result<Message, Error> {
        if self.failed {
            return Err(SessionError::Closed.into());
        }
        let result = self.recv_inner().await;
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    async fn recv_inner(&mut self) -> Result<Message, Error> {
        let frame = self.recv_frame().await?;
        let header = &frame.header;
        let plaintext = self
            .opener
            .open(
                &frame.payload,
                header.sequence,
                header.msg_type as u8,
                header.flags.raw(),
            )
            .map_err(|e| {
                tracing::warn!(sequence = header.sequence, error = %e, "frame rejected");
                e
            })?;

        Ok(match header.msg_type {
            FrameType::Data => Message::Data(Bytes::from(plaintext)),
            FrameType::Heartbeat => Message::Heartbeat,
            FrameType::Shutdown => Message::Shutdown,
        })
    }

    async fn recv_frame(&mut self) -> Result<Frame, Error> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                return Ok(frame);
            }
            let n = self.reader.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(SessionError::Closed.into());
            }
        }
    }
}

/// Bidirectional encrypted channel over any `AsyncRead + AsyncWrite` transport.
///
/// Both directions are independent. Closing the sending side does not close
/// the receiving side; [`close`](Self::close) tears down both and the
/// transport.
pub struct SecureChannel<T> {
    sender: SecureSender<WriteHalf<T>>,
    receiver: SecureReceiver<ReadHalf<T>>,
    close_grace: Duration,
}

impl<T: AsyncRead + AsyncWrite> SecureChannel<T> {
    /// Wrap an established transport with the negotiated keys.
    pub fn new(transport: T, keys: &SessionKeys, config: &SessionConfig) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        Self {
            sender: SecureSender::new(writer, keys, config),
            receiver: SecureReceiver::new(reader, keys, config),
            close_grace: config.close_grace,
        }
    }

    pub async fn send(&mut self, payload: Bytes) -> Result<(), Error> {
        self.sender.send(payload).await
    }

    pub async fn recv(&mut self) -> Result<Message, Error> {
        self.receiver.recv().await
    }

    pub async fn heartbeat(&mut self) -> Result<(), Error> {
        self.sender.heartbeat().await
    }

    /// Tell the peer we are done sending. Receiving stays open.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.sender.shutdown().await
    }

    /// Split into halves that can be driven from separate tasks.
    pub fn split(self) -> (SecureSender<WriteHalf<T>>, SecureReceiver<ReadHalf<T>>) {
        (self.sender, self.receiver)
    }

    /// Graceful teardown: send Shutdown, then drop the transport. If the
    /// shutdown does not finish within the configured grace period the
    /// transport is dropped anyway.
    pub async fn close(mut self) {
        let grace = self.close_grace;
        match tokio::time::timeout(grace, self.sender.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "shutdown failed, dropping transport"),
            Err(_) => tracing::debug!(?grace, "shutdown timed out, dropping transport"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Pipe = SecureChannel<tokio::io::DuplexStream>;

    fn pair(config: &SessionConfig) -> (Pipe, Pipe) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let initiator = SessionKeys::new([1; 32], [2; 32]);
        let responder = SessionKeys::new([2; 32], [1; 32]);
        (
            SecureChannel::new(a, &initiator, config),
            SecureChannel::new(b, &responder, config),
        )
    }

    #[tokio::test]
    async fn data_heartbeat_shutdown() {
        let (mut a, mut b) = pair(&SessionConfig::default());

        a.send(Bytes::from_static(b"hello")).await.unwrap();
        a.heartbeat().await.unwrap();
        a.shutdown().await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Message::Data(Bytes::from_static(b"hello")));
        assert_eq!(b.recv().await.unwrap(), Message::Heartbeat);
        assert_eq!(b.recv().await.unwrap(), Message::Shutdown);
        assert!(matches!(
            b.recv().await,
            Err(Error::Session(SessionError::Closed))
        ));

        // b can still talk to a after a half-closed.
        b.send(Bytes::from_static(b"reply")).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Message::Data(Bytes::from_static(b"reply")));
    }

    #[tokio::test]
    async fn large_payload_is_chunked() {
        let config = SessionConfig::builder().max_payload_size(1024).build().unwrap();
        let (mut a, mut b) = pair(&config);

        let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        a.send(Bytes::from(payload.clone())).await.unwrap();
        a.shutdown().await.unwrap();

        let mut received = Vec::new();
        let mut frames = 0;
        loop {
            match b.recv().await.unwrap() {
                Message::Data(d) => {
                    assert!(d.len() <= 1024 - FRAME_OVERHEAD);
                    received.extend_from_slice(&d);
                    frames += 1;
                }
                Message::Shutdown => break,
                Message::Heartbeat => {}
            }
        }
        assert_eq!(received, payload);
        assert!(frames > 1);
    }

    #[tokio::test]
    async fn key_mismatch_fails_closed() {
        let (a, b) = tokio::io::duplex(4096);
        let config = SessionConfig::default();
        let mut tx = SecureChannel::new(a, &SessionKeys::new([1; 32], [2; 32]), &config);
        let mut rx = SecureChannel::new(b, &SessionKeys::new([2; 32], [9; 32]), &config);

        tx.send(Bytes::from_static(b"secret")).await.unwrap();
        let err = rx.recv().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CryptoIntegrity);

        tx.send(Bytes::from_static(b"more")).await.unwrap();
        assert!(matches!(rx.recv().await, Err(Error::Session(SessionError::Closed))));
    }

    #[tokio::test]
    async fn send_after_shutdown_is_closed() {
        let (mut a, _b) = pair(&SessionConfig::default());
        a.shutdown().await.unwrap();
        assert!(a.shutdown().await.is_ok());
        assert!(matches!(
            a.send(Bytes::from_static(b"late")).await,
            Err(Error::Session(SessionError::Closed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn write_is_bounded_by_timeout() {
        let config = SessionConfig::builder()
            .net_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        // Nobody reads the other end, so the small pipe fills up.
        let (a, _b) = tokio::io::duplex(64);
        let mut channel = SecureChannel::new(a, &SessionKeys::new([1; 32], [2; 32]), &config);

        let err = channel
            .send(Bytes::from(vec![0u8; 4096]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::Timeout("write"))));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_bounded() {
        let config = SessionConfig::builder()
            .net_timeout(Duration::from_secs(60))
            .close_grace(Duration::from_millis(100))
            .build()
            .unwrap();
        let (a, _b) = tokio::io::duplex(16);
        let mut channel = SecureChannel::new(a, &SessionKeys::new([1; 32], [2; 32]), &config);
        // Fill the pipe so the Shutdown frame cannot be written.
        let _ = tokio::time::timeout(
            Duration::from_millis(10),
            channel.send(Bytes::from(vec![0u8; 256])),
        )
        .await;

        let started = tokio::time::Instant::now();
        channel.close().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
