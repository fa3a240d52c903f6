#![cfg(feature = "mock")]
//! Handshake, channel and double-attestation tests without HTTP: the hello
//! travels as plain structs and streams are in-memory duplexes.

use std::time::Duration;

use base64::prelude::*;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;

use attested_channel::attestation::types::{AttestationDocument, PcrTuple};
use attested_channel::crypto::kx::KeyPair;
use attested_channel::error::{AttestError, Error, SessionError};
use attested_channel::policy::AcceptAll;
use attested_channel::session::attest_exchange::{
    line_stream, request_attestation, AttestedEndpoint, ExchangeMessage,
};
use attested_channel::session::cache::Session;
use attested_channel::session::handshake::{
    respond, session_cookie, Established, HelloBody, HelloParams, HelloResponse, COOKIE_MAX_AGE,
};
use attested_channel::{
    AttestationProvider, AttestationVerifier, Envelope, ErrorKind, Initiator, Message,
    MockProvider, MockVerifier, SecureChannel, SessionConfig, TrustRoot,
};

fn response_for(body: &HelloBody) -> HelloResponse {
    HelloResponse {
        status: 200,
        set_cookie: Some(session_cookie(&body.session_id, COOKIE_MAX_AGE)),
        body: serde_json::to_vec(body).unwrap(),
    }
}

/// Run both halves of the hello against `provider`.
async fn establish(provider: &MockProvider, envelope: Envelope) -> (Established, Session) {
    let mut initiator = Initiator::new(envelope);
    let request = initiator.start().unwrap();
    let (session, body) = respond(&HelloParams::from(&request), provider, None)
        .await
        .unwrap();
    let (established, _) = initiator
        .complete(
            response_for(&body),
            &MockVerifier::new(),
            &TrustRoot::Builtin,
            &AcceptAll,
        )
        .await
        .unwrap();
    (established, session)
}

type Duplex = tokio::io::DuplexStream;

fn channels(
    established: &Established,
    session: &Session,
) -> (SecureChannel<Duplex>, SecureChannel<Duplex>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let config = SessionConfig::default();
    (
        SecureChannel::new(a, &established.keys, &config),
        SecureChannel::new(b, &session.keys, &config),
    )
}

#[tokio::test]
async fn full_session_data_exchange() {
    let provider = MockProvider::new();
    let (established, session) = establish(&provider, Envelope::Tcp).await;
    assert_eq!(established.session_id, session.id);
    let (mut client, mut server) = channels(&established, &session);

    client
        .send(Bytes::from_static(b"hello from client"))
        .await
        .unwrap();
    assert_eq!(
        server.recv().await.unwrap(),
        Message::Data(Bytes::from_static(b"hello from client"))
    );

    server
        .send(Bytes::from_static(b"hello from server"))
        .await
        .unwrap();
    client.heartbeat().await.unwrap();
    assert_eq!(
        client.recv().await.unwrap(),
        Message::Data(Bytes::from_static(b"hello from server"))
    );
    assert_eq!(server.recv().await.unwrap(), Message::Heartbeat);

    client.shutdown().await.unwrap();
    assert_eq!(server.recv().await.unwrap(), Message::Shutdown);
}

#[tokio::test]
async fn many_chunks_arrive_in_order() {
    let provider = MockProvider::new();
    let (established, session) = establish(&provider, Envelope::Tcp).await;
    let (mut client, mut server) = channels(&established, &session);

    let chunks: Vec<Bytes> = (0..200u32)
        .map(|i| Bytes::from(format!("chunk-{i:04}-").repeat(1 + (i as usize % 7))))
        .collect();

    let expected = chunks.clone();
    let writer = tokio::spawn(async move {
        for chunk in chunks {
            client.send(chunk).await.unwrap();
        }
        client.shutdown().await.unwrap();
    });

    let mut received = Vec::new();
    loop {
        match server.recv().await.unwrap() {
            Message::Data(data) => received.push(data),
            Message::Heartbeat => {}
            Message::Shutdown => break,
        }
    }
    writer.await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn flipped_byte_fails_integrity() {
    use tokio::io::AsyncReadExt;

    let provider = MockProvider::new();
    let (established, session) = establish(&provider, Envelope::Tcp).await;
    let config = SessionConfig::default();

    // client -> tamper -> server
    let (client_io, mut tamper_in) = tokio::io::duplex(64 * 1024);
    let (mut tamper_out, server_io) = tokio::io::duplex(64 * 1024);
    let mut client = SecureChannel::new(client_io, &established.keys, &config);
    let mut server = SecureChannel::new(server_io, &session.keys, &config);

    client
        .send(Bytes::from_static(b"transfer 100 to alice"))
        .await
        .unwrap();

    let mut wire = vec![0u8; 1024];
    let n = tamper_in.read(&mut wire).await.unwrap();
    // Last byte of the sealed payload.
    wire[n - 1] ^= 0x01;
    tamper_out.write_all(&wire[..n]).await.unwrap();

    let err = server.recv().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CryptoIntegrity);
    let err = server.recv().await.unwrap_err();
    assert!(matches!(err, Error::Session(SessionError::Closed)));
}

#[tokio::test]
async fn replayed_hello_response_is_rejected() {
    let provider = MockProvider::new();

    let mut earlier = Initiator::new(Envelope::Json);
    let earlier_request = earlier.start().unwrap();
    let (_, stale) = respond(&HelloParams::from(&earlier_request), &provider, None)
        .await
        .unwrap();

    let mut initiator = Initiator::new(Envelope::Json);
    initiator.start().unwrap();
    let err = initiator
        .complete(
            response_for(&stale),
            &MockVerifier::new(),
            &TrustRoot::Builtin,
            &AcceptAll,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Attestation(AttestError::NonceMismatch)));
}

#[tokio::test]
async fn repeated_hellos_yield_fresh_documents_and_keys() {
    let provider = MockProvider::new();
    let mut initiator = Initiator::new(Envelope::Json);
    let params = HelloParams::from(&initiator.start().unwrap());

    let (first, first_body) = respond(&params, &provider, None).await.unwrap();
    let (second, second_body) = respond(&params, &provider, None).await.unwrap();

    assert_ne!(first_body.attest_doc, second_body.attest_doc);
    assert_ne!(first.id, second.id);
    assert_ne!(first.keys.tx, second.keys.tx);
    assert_ne!(first.keys.rx, second.keys.rx);
    assert_eq!(provider.calls(), 2);
}

/// The initiator's public key travels unauthenticated. Replacing it yields
/// a session whose first frame cannot be opened.
#[tokio::test]
async fn substituted_initiator_key_breaks_first_frame() {
    let provider = MockProvider::new();
    let mut initiator = Initiator::new(Envelope::Tcp);
    let mut request = initiator.start().unwrap();

    let attacker = KeyPair::generate();
    request.public_key = BASE64_STANDARD.encode(attacker.public_bytes());
    let (session, body) = respond(&HelloParams::from(&request), &provider, None)
        .await
        .unwrap();

    // The document is genuine and bound to the right nonce, so the
    // initiator cannot tell.
    let (established, _) = initiator
        .complete(
            response_for(&body),
            &MockVerifier::new(),
            &TrustRoot::Builtin,
            &AcceptAll,
        )
        .await
        .unwrap();

    let (mut client, mut server) = channels(&established, &session);
    client.send(Bytes::from_static(b"secret")).await.unwrap();
    let err = server.recv().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CryptoIntegrity);
}

#[tokio::test]
async fn double_attestation_over_stream() {
    let (near_io, far_io) = tokio::io::duplex(64 * 1024);
    let workload = MockProvider::with_pcrs(PcrTuple::new(["aa", "bb", "cc"]));
    let mut endpoint = AttestedEndpoint::new(near_io, workload, Some(b"model-v3".to_vec()));

    let near = tokio::spawn(async move {
        // Answers the challenge transparently, then hands over app lines.
        assert_eq!(endpoint.recv().await.unwrap().as_deref(), Some("after attestation"));
        endpoint.send(r#"{"type":"chat"}"#).await.unwrap();
        endpoint.close().await.unwrap();
    });

    let mut far = line_stream(far_io);
    let verified = request_attestation(
        &mut far,
        &MockVerifier::new(),
        &TrustRoot::Builtin,
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    assert_eq!(verified.pcrs, PcrTuple::new(["aa", "bb", "cc"]));
    assert_eq!(verified.user_data.as_deref(), Some(&b"model-v3"[..]));
    assert!(verified.public_key.is_none());

    far.send("after attestation").await.unwrap();
    assert_eq!(far.next().await.unwrap().unwrap(), r#"{"type":"chat"}"#);
    assert!(far.next().await.is_none());
    near.await.unwrap();
}

/// A challenge and application data arriving in the same read are still
/// told apart.
#[tokio::test]
async fn challenge_coalesced_with_app_data() {
    let (near_io, mut far_io) = tokio::io::duplex(64 * 1024);
    let mut endpoint = AttestedEndpoint::new(near_io, MockProvider::new(), None);

    let nonce = [5u8; 32];
    let challenge = ExchangeMessage::AttestNonce {
        nonce: BASE64_STANDARD.encode(nonce),
    };
    let burst = format!("{}\nhello\n", challenge.to_line().unwrap());
    far_io.write_all(burst.as_bytes()).await.unwrap();

    assert_eq!(endpoint.recv().await.unwrap().as_deref(), Some("hello"));

    let mut far = line_stream(far_io);
    let reply = far.next().await.unwrap().unwrap();
    let Some(ExchangeMessage::AttestDoc { doc }) = ExchangeMessage::parse(&reply) else {
        panic!("expected attest_doc, got {reply}");
    };
    let doc = AttestationDocument::new(BASE64_STANDARD.decode(doc).unwrap());
    let verified = MockVerifier::new()
        .verify(&doc, &TrustRoot::Builtin)
        .await
        .unwrap();
    verified.check_nonce(&nonce).unwrap();
}

#[tokio::test]
async fn double_attestation_rejects_wrong_nonce() {
    let (near_io, far_io) = tokio::io::duplex(64 * 1024);

    let near = tokio::spawn(async move {
        let mut near = line_stream(near_io);
        let challenge = near.next().await.unwrap().unwrap();
        assert!(matches!(
            ExchangeMessage::parse(&challenge),
            Some(ExchangeMessage::AttestNonce { .. })
        ));
        // Answer with a document bound to some other nonce.
        let stale = MockProvider::new()
            .attest(None, Some(&[7u8; 32]), None)
            .await
            .unwrap();
        let reply = ExchangeMessage::AttestDoc {
            doc: BASE64_STANDARD.encode(&stale.raw),
        };
        near.send(reply.to_line().unwrap()).await.unwrap();
        near
    });

    let err = request_attestation(
        &mut line_stream(far_io),
        &MockVerifier::new(),
        &TrustRoot::Builtin,
        Duration::from_secs(1),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Attestation(AttestError::NonceMismatch)));
    near.await.unwrap();
}

#[tokio::test]
async fn double_attestation_times_out() {
    let (_near_io, far_io) = tokio::io::duplex(64 * 1024);

    let err = request_attestation(
        &mut line_stream(far_io),
        &MockVerifier::new(),
        &TrustRoot::Builtin,
        Duration::from_millis(50),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeTransport);
}
