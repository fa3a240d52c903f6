//! The hello exchange that turns an attestation document into session keys.
//!
//! Initiator: `Init -> HelloSent -> DocReceived -> DocValidated ->
//! PolicyEvaluated -> KeysDerived -> Established`. Any error leaves the
//! machine in `Failed` with the ephemeral secret dropped.
//!
//! The transport is not part of this module: the initiator produces a
//! [`HelloRequest`] and consumes a [`HelloResponse`], and the responder maps
//! [`HelloParams`] to a [`Session`] plus a [`HelloBody`].

use std::fmt;
use std::mem;

use base64::prelude::*;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::attestation::types::{AttestationDocument, TrustRoot, VerifiedAttestation};
use crate::attestation::{AttestationProvider, AttestationVerifier};
use crate::crypto::kx::{KeyPair, Role};
use crate::crypto::{random_nonce, transcript, Nonce, SessionKeys, NONCE_LEN};
use crate::envelope::Envelope;
use crate::error::{Error, SessionError};
use crate::policy::AttestationPolicy;

use super::cache::{Session, SessionCache, SessionId};

/// Name of the cookie carrying the session id.
pub const COOKIE_NAME: &str = "sessionlh";

/// Cookie lifetime in seconds (one year). Independent of the cache TTL.
pub const COOKIE_MAX_AGE: u64 = 31_536_000;

/// Query parameters of `GET {prefix}/hello`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub nonce: String,
    pub envelope: Envelope,
}

/// Raw hello parameters as the responder receives them. Every field is
/// optional so that missing ones surface as `BadRequest`, not as an
/// extractor rejection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HelloParams {
    #[serde(rename = "publicKey")]
    pub public_key: Option<String>,
    pub nonce: Option<String>,
    pub envelope: Option<String>,
}

impl From<&HelloRequest> for HelloParams {
    fn from(req: &HelloRequest) -> Self {
        Self {
            public_key: Some(req.public_key.clone()),
            nonce: Some(req.nonce.clone()),
            envelope: Some(req.envelope.to_string()),
        }
    }
}

/// JSON body of a successful hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloBody {
    #[serde(rename = "attestDoc")]
    pub attest_doc: String,
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
}

/// What the initiator got back from the hello endpoint.
#[derive(Debug, Clone)]
pub struct HelloResponse {
    pub status: u16,
    /// Value of the `Set-Cookie` header, if any.
    pub set_cookie: Option<String>,
    pub body: Vec<u8>,
}

/// `Set-Cookie` value for a freshly created session.
pub fn session_cookie(id: &str, max_age: u64) -> String {
    format!("{COOKIE_NAME}={id}; max-age={max_age}; path=/")
}

/// Finds `sessionlh=<id>` in a `Cookie` or `Set-Cookie` header value.
pub fn session_id_from_cookie(header: &str) -> Option<&str> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == COOKIE_NAME && !value.is_empty()).then_some(value)
    })
}

fn new_session_id() -> SessionId {
    let mut id = [0u8; 16];
    OsRng.fill_bytes(&mut id);
    hex::encode(id)
}

fn decode_field<const N: usize>(value: Option<&str>, name: &str) -> Result<[u8; N], SessionError> {
    let value = value.ok_or_else(|| SessionError::BadRequest(format!("missing {name}")))?;
    let bytes = BASE64_STANDARD
        .decode(value)
        .map_err(|_| SessionError::BadRequest(format!("{name} is not base64")))?;
    bytes.as_slice().try_into().map_err(|_| {
        SessionError::BadRequest(format!("{name} must be {N} bytes, got {}", bytes.len()))
    })
}

/// Validated hello parameters.
struct Hello {
    public_key: [u8; 32],
    nonce: Nonce,
    envelope: Envelope,
}

impl TryFrom<&HelloParams> for Hello {
    type Error = SessionError;

    fn try_from(params: &HelloParams) -> Result<Self, SessionError> {
        let public_key = decode_field::<32>(params.public_key.as_deref(), "publicKey")?;
        let nonce = decode_field::<NONCE_LEN>(params.nonce.as_deref(), "nonce")?;
        let envelope = params
            .envelope
            .as_deref()
            .ok_or_else(|| SessionError::BadRequest("missing envelope".into()))?
            .parse()?;
        Ok(Self {
            public_key,
            nonce,
            envelope,
        })
    }
}

/// Responder side of the hello: validate, attest, derive.
///
/// Parameters are checked before the provider is called, so a malformed
/// hello never costs an attestation.
pub async fn respond(
    params: &HelloParams,
    provider: &dyn AttestationProvider,
    user_data: Option<&[u8]>,
) -> Result<(Session, HelloBody), Error> {
    let hello = Hello::try_from(params)?;

    let keypair = KeyPair::generate();
    let responder_pk = keypair.public_bytes();

    let doc = provider
        .attest(user_data, Some(&hello.nonce), Some(&responder_pk))
        .await?;

    let transcript =
        transcript::compute_transcript(&doc.hash(), &hello.public_key, &responder_pk, &hello.nonce);
    let keys = keypair.derive_session_keys(&hello.public_key, &transcript, Role::Responder)?;

    let id = new_session_id();
    let body = HelloBody {
        attest_doc: BASE64_STANDARD.encode(&doc.raw),
        session_id: id.clone(),
    };
    let session = Session {
        id,
        envelope: hello.envelope,
        keys,
    };
    Ok((session, body))
}

/// Responder bound to a provider and a session cache.
pub struct Responder {
    provider: Box<dyn AttestationProvider>,
    cache: SessionCache<Session>,
    user_data: Option<Vec<u8>>,
}

impl Responder {
    pub fn new(
        provider: impl AttestationProvider + 'static,
        cache: SessionCache<Session>,
        user_data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            provider: Box::new(provider),
            cache,
            user_data,
        }
    }

    pub fn cache(&self) -> &SessionCache<Session> {
        &self.cache
    }

    /// Run [`respond`] and store the new session.
    pub async fn hello(&self, params: &HelloParams) -> Result<HelloBody, Error> {
        let (session, body) =
            respond(params, self.provider.as_ref(), self.user_data.as_deref()).await?;
        tracing::info!(
            session = %session.id,
            envelope = %session.envelope,
            "session established"
        );
        self.cache.set(session.id.clone(), session);
        Ok(body)
    }
}

/// Externally visible handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    HelloSent,
    DocReceived,
    DocValidated,
    PolicyEvaluated,
    KeysDerived,
    Established,
    Failed,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::HelloSent => "HelloSent",
            Self::DocReceived => "DocReceived",
            Self::DocValidated => "DocValidated",
            Self::PolicyEvaluated => "PolicyEvaluated",
            Self::KeysDerived => "KeysDerived",
            Self::Established => "Established",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum State {
    Init,
    HelloSent {
        keypair: KeyPair,
        nonce: Nonce,
    },
    DocReceived {
        keypair: KeyPair,
        nonce: Nonce,
        session_id: SessionId,
        doc: AttestationDocument,
    },
    DocValidated {
        keypair: KeyPair,
        nonce: Nonce,
        session_id: SessionId,
        verified: VerifiedAttestation,
    },
    PolicyEvaluated {
        keypair: KeyPair,
        nonce: Nonce,
        session_id: SessionId,
        verified: VerifiedAttestation,
    },
    KeysDerived {
        session_id: SessionId,
        keys: SessionKeys,
        verified: VerifiedAttestation,
    },
    Established,
    Failed,
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            Self::Init => Phase::Init,
            Self::HelloSent { .. } => Phase::HelloSent,
            Self::DocReceived { .. } => Phase::DocReceived,
            Self::DocValidated { .. } => Phase::DocValidated,
            Self::PolicyEvaluated { .. } => Phase::PolicyEvaluated,
            Self::KeysDerived { .. } => Phase::KeysDerived,
            Self::Established => Phase::Established,
            Self::Failed => Phase::Failed,
        }
    }
}

/// Outcome of a completed initiator handshake.
#[derive(Debug)]
pub struct Established {
    /// Session id from the `sessionlh` cookie.
    pub session_id: SessionId,
    pub keys: SessionKeys,
    /// The responder's validated attestation.
    pub attestation: VerifiedAttestation,
}

/// Client side of the hello exchange.
pub struct Initiator {
    envelope: Envelope,
    state: State,
}

impl Initiator {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            state: State::Init,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn envelope(&self) -> Envelope {
        self.envelope
    }

    /// The validated attestation, once the document has been checked.
    pub fn attestation(&self) -> Option<&VerifiedAttestation> {
        match &self.state {
            State::DocValidated { verified, .. }
            | State::PolicyEvaluated { verified, .. }
            | State::KeysDerived { verified, .. } => Some(verified),
            _ => None,
        }
    }

    /// Move out the current state. Until a transition succeeds the machine is `Failed`.
    fn take(&mut self) -> State {
        mem::replace(&mut self.state, State::Failed)
    }

    fn wrong_state(&mut self, other: State, expected: Phase) -> Error {
        let actual = other.phase().name();
        self.state = other;
        SessionError::InvalidState {
            expected: expected.name(),
            actual,
        }
        .into()
    }

    /// Generate the ephemeral key pair and nonce.
    pub fn start(&mut self) -> Result<HelloRequest, Error> {
        match self.take() {
            State::Init => {
                let keypair = KeyPair::generate();
                let nonce = random_nonce();
                let request = HelloRequest {
                    public_key: BASE64_STANDARD.encode(keypair.public_bytes()),
                    nonce: BASE64_STANDARD.encode(nonce),
                    envelope: self.envelope,
                };
                self.state = State::HelloSent { keypair, nonce };
                Ok(request)
            }
            other => Err(self.wrong_state(other, Phase::Init)),
        }
    }

    /// Accept the hello response: status, session cookie and document.
    pub fn receive(&mut self, response: HelloResponse) -> Result<(), Error> {
        match self.take() {
            State::HelloSent { keypair, nonce } => {
                if response.status != 200 {
                    return Err(SessionError::BadStatus(response.status).into());
                }
                let session_id = response
                    .set_cookie
                    .as_deref()
                    .and_then(session_id_from_cookie)
                    .ok_or_else(|| {
                        SessionError::ProtocolViolation("hello response set no session cookie".into())
                    })?
                    .to_string();
                let body: HelloBody = serde_json::from_slice(&response.body).map_err(|e| {
                    SessionError::ProtocolViolation(format!("hello body is not valid JSON: {e}"))
                })?;
                let raw = BASE64_STANDARD.decode(&body.attest_doc).map_err(|_| {
                    SessionError::ProtocolViolation("attestDoc is not base64".into())
                })?;

                self.state = State::DocReceived {
                    keypair,
                    nonce,
                    session_id,
                    doc: AttestationDocument::new(raw),
                };
                Ok(())
            }
            other => Err(self.wrong_state(other, Phase::HelloSent)),
        }
    }

    /// Validate the document against `trust_root` and check its nonce.
    pub async fn validate(
        &mut self,
        verifier: &dyn AttestationVerifier,
        trust_root: &TrustRoot,
    ) -> Result<(), Error> {
        match self.take() {
            State::DocReceived {
                keypair,
                nonce,
                session_id,
                doc,
            } => {
                let verified = verifier.verify(&doc, trust_root).await.map_err(|e| {
                    tracing::warn!(error = %e, "attestation rejected");
                    e
                })?;
                if let Err(e) = verified.check_nonce(&nonce) {
                    tracing::warn!("attestation nonce mismatch");
                    return Err(e.into());
                }
                self.state = State::DocValidated {
                    keypair,
                    nonce,
                    session_id,
                    verified,
                };
                Ok(())
            }
            other => Err(self.wrong_state(other, Phase::DocReceived)),
        }
    }

    /// Ask `policy` whether the attested peer is acceptable.
    pub async fn evaluate<P>(&mut self, policy: &P) -> Result<P::Output, Error>
    where
        P: AttestationPolicy + ?Sized,
    {
        match self.take() {
            State::DocValidated {
                keypair,
                nonce,
                session_id,
                verified,
            } => {
                let output = policy
                    .evaluate(&verified.pcrs, verified.user_data.as_deref())
                    .await
                    .map_err(|e| {
                        tracing::warn!(reason = %e.reason, "policy rejected peer");
                        e
                    })?;
                self.state = State::PolicyEvaluated {
                    keypair,
                    nonce,
                    session_id,
                    verified,
                };
                Ok(output)
            }
            other => Err(self.wrong_state(other, Phase::DocValidated)),
        }
    }

    /// Derive session keys against the attested public key.
    pub fn derive(&mut self) -> Result<(), Error> {
        match self.take() {
            State::PolicyEvaluated {
                keypair,
                nonce,
                session_id,
                verified,
            } => {
                let responder_pk = verified.attested_public_key()?;
                let initiator_pk = keypair.public_bytes();
                let transcript = transcript::compute_transcript(
                    &verified.document_hash,
                    &initiator_pk,
                    &responder_pk,
                    &nonce,
                );
                let keys = keypair.derive_session_keys(&responder_pk, &transcript, Role::Initiator)?;
                self.state = State::KeysDerived {
                    session_id,
                    keys,
                    verified,
                };
                Ok(())
            }
            other => Err(self.wrong_state(other, Phase::PolicyEvaluated)),
        }
    }

    pub fn finish(&mut self) -> Result<Established, Error> {
        match self.take() {
            State::KeysDerived {
                session_id,
                keys,
                verified,
            } => {
                self.state = State::Established;
                Ok(Established {
                    session_id,
                    keys,
                    attestation: verified,
                })
            }
            other => Err(self.wrong_state(other, Phase::KeysDerived)),
        }
    }

    /// Drive every step after `start` against an already received response.
    pub async fn complete<P>(
        &mut self,
        response: HelloResponse,
        verifier: &dyn AttestationVerifier,
        trust_root: &TrustRoot,
        policy: &P,
    ) -> Result<(Established, P::Output), Error>
    where
        P: AttestationPolicy + ?Sized,
    {
        self.receive(response)?;
        self.validate(verifier, trust_root).await?;
        let output = self.evaluate(policy).await?;
        self.derive()?;
        Ok((self.finish()?, output))
    }
}
