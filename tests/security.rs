#![cfg(feature = "mock")]
//! Wire-level checks on the sealed channel and on key agreement.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::Decoder;

use attested_channel::attestation::types::AttestationDocument;
use attested_channel::crypto::kx::{KeyPair, Role};
use attested_channel::error::{AttestError, CryptoError, Error};
use attested_channel::frame::codec::FrameCodec;
use attested_channel::policy::AcceptAll;
use attested_channel::session::cache::Session;
use attested_channel::session::channel::FRAME_OVERHEAD;
use attested_channel::session::handshake::{
    respond, session_cookie, Established, HelloParams, HelloResponse, COOKIE_MAX_AGE,
};
use attested_channel::{
    AttestationProvider, Envelope, ErrorKind, FrameType, Initiator, Message, MockProvider,
    MockVerifier, SecureChannel, SessionConfig, TrustRoot,
};

async fn handshake_with(provider: &dyn AttestationProvider) -> Result<(Established, Session), Error> {
    let mut initiator = Initiator::new(Envelope::Tcp);
    let request = initiator.start()?;
    let (session, body) = respond(&HelloParams::from(&request), provider, None).await?;
    let response = HelloResponse {
        status: 200,
        set_cookie: Some(session_cookie(&body.session_id, COOKIE_MAX_AGE)),
        body: serde_json::to_vec(&body).unwrap(),
    };
    let (established, _) = initiator
        .complete(response, &MockVerifier::new(), &TrustRoot::Builtin, &AcceptAll)
        .await?;
    Ok((established, session))
}

/// Read everything the peer wrote until it half-closed.
async fn drain(mut io: tokio::io::DuplexStream) -> BytesMut {
    let mut wire = BytesMut::new();
    while io.read_buf(&mut wire).await.unwrap() > 0 {}
    wire
}

#[tokio::test]
async fn control_frames_are_sealed() {
    let (established, _) = handshake_with(&MockProvider::new()).await.unwrap();
    let (a, b) = tokio::io::duplex(16 * 1024);
    let mut channel = SecureChannel::new(a, &established.keys, &SessionConfig::default());

    channel.heartbeat().await.unwrap();
    channel.shutdown().await.unwrap();

    let mut wire = drain(b).await;
    let mut codec = FrameCodec::new();
    let heartbeat = codec.decode(&mut wire).unwrap().unwrap();
    let shutdown = codec.decode(&mut wire).unwrap().unwrap();

    assert_eq!(heartbeat.header.msg_type, FrameType::Heartbeat);
    assert_eq!(shutdown.header.msg_type, FrameType::Shutdown);
    // Empty plaintext still carries a nonce and a tag.
    assert_eq!(heartbeat.payload.len(), FRAME_OVERHEAD);
    assert_eq!(shutdown.payload.len(), FRAME_OVERHEAD);
    assert_eq!(shutdown.header.sequence, heartbeat.header.sequence + 1);
}

#[tokio::test]
async fn replayed_frame_is_rejected() {
    let (established, session) = handshake_with(&MockProvider::new()).await.unwrap();
    let config = SessionConfig::default();

    let (a, b) = tokio::io::duplex(16 * 1024);
    let mut sender = SecureChannel::new(a, &established.keys, &config);
    sender.send(Bytes::from_static(b"pay once")).await.unwrap();
    drop(sender);
    let wire = drain(b).await;

    let (mut inject, c) = tokio::io::duplex(16 * 1024);
    let mut receiver = SecureChannel::new(c, &session.keys, &config);
    inject.write_all(&wire).await.unwrap();
    inject.write_all(&wire).await.unwrap();

    assert_eq!(
        receiver.recv().await.unwrap(),
        Message::Data(Bytes::from_static(b"pay once"))
    );
    let err = receiver.recv().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Crypto(CryptoError::UnexpectedSequence {
            received: 0,
            expected: 1
        })
    ));
    assert_eq!(err.kind(), ErrorKind::CryptoIntegrity);
}

#[test]
fn non_contributory_peer_key_is_rejected() {
    let result = KeyPair::generate().derive_session_keys(&[0u8; 32], &[0xAA; 32], Role::Initiator);
    assert!(matches!(result, Err(CryptoError::NonContributoryKey)));

    let result = KeyPair::generate().derive_session_keys(&[1u8; 31], &[0xAA; 32], Role::Responder);
    assert!(matches!(
        result,
        Err(CryptoError::InvalidKeyLength {
            expected: 32,
            actual: 31
        })
    ));
}

/// Provider that forgets to bind the responder key into its document.
struct UnboundKeyProvider(MockProvider);

#[async_trait]
impl AttestationProvider for UnboundKeyProvider {
    async fn attest(
        &self,
        user_data: Option<&[u8]>,
        nonce: Option<&[u8]>,
        _public_key: Option<&[u8]>,
    ) -> Result<AttestationDocument, AttestError> {
        self.0.attest(user_data, nonce, None).await
    }
}

#[tokio::test]
async fn document_without_public_key_fails_handshake() {
    let err = handshake_with(&UnboundKeyProvider(MockProvider::new()))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Attestation(AttestError::MissingField(ref field)) if field == "public_key"
    ));
}
