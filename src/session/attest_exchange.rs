//! Second attestation riding inside an established tcp-envelope stream.
//!
//! Both ends speak newline-delimited JSON over the relayed byte stream, so
//! the exchange does not depend on how the relay chunks bytes into frames.
//! The far end writes `{"type":"attest_nonce","nonce":<b64>}`; the near end
//! answers `{"type":"attest_doc","doc":<b64>}`, a fresh document bound to
//! that nonce. Every other line belongs to the application.

use std::time::Duration;

use base64::prelude::*;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::attestation::types::{AttestationDocument, TrustRoot, VerifiedAttestation};
use crate::attestation::{AttestationProvider, AttestationVerifier};
use crate::crypto::random_nonce;
use crate::error::{AttestError, Error, SessionError};

/// Longest line either end buffers. Large enough for a base64 document.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// A byte stream split into text lines.
pub type LineStream<S> = Framed<S, LinesCodec>;

/// Frame `io` into lines bounded by [`MAX_LINE_LENGTH`].
pub fn line_stream<S: AsyncRead + AsyncWrite>(io: S) -> LineStream<S> {
    Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

fn line_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::Io(e) => Error::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            SessionError::ProtocolViolation(format!("line longer than {MAX_LINE_LENGTH} bytes"))
                .into()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExchangeMessage {
    AttestNonce { nonce: String },
    AttestDoc { doc: String },
    #[serde(other)]
    Unknown,
}

impl ExchangeMessage {
    /// Parse one line. Anything that is not a known exchange message
    /// yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        match serde_json::from_str(line) {
            Ok(Self::Unknown) | Err(_) => None,
            Ok(msg) => Some(msg),
        }
    }

    pub fn to_line(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(|e| SessionError::ProtocolViolation(format!("encode exchange message: {e}")).into())
    }
}

/// Near end: a line stream that answers attestation challenges on its own
/// and hands every other line to the application.
pub struct AttestedEndpoint<S, P> {
    lines: LineStream<S>,
    provider: P,
    user_data: Option<Vec<u8>>,
}

impl<S, P> AttestedEndpoint<S, P>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: AttestationProvider,
{
    pub fn new(io: S, provider: P, user_data: Option<Vec<u8>>) -> Self {
        Self {
            lines: line_stream(io),
            provider,
            user_data,
        }
    }

    /// Send one application line. `line` must not contain a newline.
    pub async fn send(&mut self, line: &str) -> Result<(), Error> {
        self.lines.send(line).await.map_err(line_error)
    }

    /// Next application line, or `None` once the peer stopped sending.
    /// Challenges are answered transparently.
    pub async fn recv(&mut self) -> Result<Option<String>, Error> {
        while let Some(line) = self.lines.next().await {
            let line = line.map_err(line_error)?;
            match ExchangeMessage::parse(&line) {
                Some(ExchangeMessage::AttestNonce { nonce }) => self.answer(&nonce).await?,
                _ => return Ok(Some(line)),
            }
        }
        Ok(None)
    }

    async fn answer(&mut self, nonce_b64: &str) -> Result<(), Error> {
        let nonce = BASE64_STANDARD
            .decode(nonce_b64)
            .map_err(|_| SessionError::ProtocolViolation("attest_nonce is not base64".into()))?;
        let doc = self
            .provider
            .attest(self.user_data.as_deref(), Some(nonce.as_slice()), None)
            .await?;
        tracing::debug!(doc_len = doc.raw.len(), "answering attestation challenge");
        let reply = ExchangeMessage::AttestDoc {
            doc: BASE64_STANDARD.encode(&doc.raw),
        };
        self.lines.send(reply.to_line()?).await.map_err(line_error)
    }

    /// Flush pending lines and half-close the stream.
    pub async fn close(mut self) -> Result<(), Error> {
        SinkExt::<String>::close(&mut self.lines)
            .await
            .map_err(line_error)
    }

    pub fn into_inner(self) -> S {
        self.lines.into_inner()
    }
}

/// Far end: challenge the peer with a fresh nonce and validate its answer.
///
/// The next line must be the `attest_doc`; anything else, or no answer
/// within `timeout`, fails the exchange. Call it before application lines
/// start flowing.
pub async fn request_attestation<S>(
    lines: &mut LineStream<S>,
    verifier: &dyn AttestationVerifier,
    trust_root: &TrustRoot,
    timeout: Duration,
) -> Result<VerifiedAttestation, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = random_nonce();
    let challenge = ExchangeMessage::AttestNonce {
        nonce: BASE64_STANDARD.encode(nonce),
    };

    let exchange = async {
        lines.send(challenge.to_line()?).await.map_err(line_error)?;
        let line = match lines.next().await {
            Some(line) => line.map_err(line_error)?,
            None => return Err(Error::from(SessionError::Closed)),
        };
        match ExchangeMessage::parse(&line) {
            Some(ExchangeMessage::AttestDoc { doc }) => Ok(doc),
            _ => Err(Error::from(SessionError::UnexpectedMessage {
                expected: "attest_doc",
                actual: line.chars().take(64).collect(),
            })),
        }
    };
    let doc = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| SessionError::Timeout("attestation exchange"))??;

    let raw = BASE64_STANDARD
        .decode(doc)
        .map_err(|_| AttestError::VerificationFailed("attest_doc is not base64".into()))?;
    let verified = verifier
        .verify(&AttestationDocument::new(raw), trust_root)
        .await?;
    verified.check_nonce(&nonce)?;
    Ok(verified)
}
