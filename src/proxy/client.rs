use std::time::Duration;

use reqwest::header::{CONNECTION, COOKIE, SET_COOKIE, UPGRADE};
use reqwest::{StatusCode, Upgraded};
use tokio::io::DuplexStream;

use crate::attestation::types::TrustRoot;
use crate::attestation::AttestationVerifier;
use crate::crypto::seal::{open_box, seal_box, SealedBox, SealedMessage};
use crate::envelope::{Envelope, InnerRequest, InnerResponse};
use crate::error::{Error, SessionError};
use crate::policy::AttestationPolicy;
use crate::session::channel::SecureChannel;
use crate::session::handshake::{Established, HelloResponse, Initiator, COOKIE_NAME};
use crate::session::retry::RetryPolicy;
use crate::session::SessionConfig;

use super::{relay, split_url, RELAY_BUF_SIZE, UPGRADE_PROTOCOL};

/// Configuration for the initiator side.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `https://host[:port]/prefix`; an empty path selects the default prefix.
    pub url: String,
    pub session: SessionConfig,
    pub trust_root: TrustRoot,
    /// The responder's certificate is usually self-signed; trust comes from
    /// the attestation document.
    pub accept_invalid_certs: bool,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session: SessionConfig::default(),
            trust_root: TrustRoot::default(),
            accept_invalid_certs: true,
        }
    }
}

/// Initiator bound to one responder URL, a verifier and a policy.
///
/// `call` keeps a json-envelope session between calls; `connect` opens a
/// fresh tcp-envelope session every time.
pub struct Client<V, P> {
    http: reqwest::Client,
    origin: String,
    prefix: String,
    config: SessionConfig,
    trust_root: TrustRoot,
    verifier: V,
    policy: P,
    json_session: Option<Established>,
}

impl<V, P> Client<V, P>
where
    V: AttestationVerifier,
    P: AttestationPolicy,
{
    pub fn new(config: ClientConfig, verifier: V, policy: P) -> Result<Self, Error> {
        let (origin, prefix) = split_url(&config.url)?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self {
            http,
            origin,
            prefix,
            config: config.session,
            trust_root: config.trust_root,
            verifier,
            policy,
            json_session: None,
        })
    }

    pub fn net_timeout(&self) -> Duration {
        self.config.net_timeout
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.config.retry_policy.as_ref()
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}{endpoint}", self.origin, self.prefix)
    }

    /// Run a complete hello for `envelope`, bounded by the handshake timeout.
    pub async fn handshake(&self, envelope: Envelope) -> Result<(Established, P::Output), Error> {
        tokio::time::timeout(self.config.handshake_timeout, self.hello(envelope))
            .await
            .map_err(|_| SessionError::Timeout("handshake"))?
    }

    async fn hello(&self, envelope: Envelope) -> Result<(Established, P::Output), Error> {
        let mut initiator = Initiator::new(envelope);
        let request = initiator.start()?;

        let response = self
            .http
            .get(self.url("/hello"))
            .query(&request)
            .send()
            .await?;
        let status = response.status().as_u16();
        let set_cookie = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await?.to_vec();

        let (established, output) = initiator
            .complete(
                HelloResponse {
                    status,
                    set_cookie,
                    body,
                },
                &self.verifier,
                &self.trust_root,
                &self.policy,
            )
            .await?;
        tracing::info!(
            session = %established.session_id,
            %envelope,
            pcrs = %established.attestation.pcrs,
            "attested session established"
        );
        Ok((established, output))
    }

    /// Send one request through the json envelope.
    ///
    /// A 404 from the responder means the session expired there: the client
    /// re-handshakes exactly once and retries. A second 404 is
    /// [`SessionError::SessionExpired`].
    pub async fn call(&mut self, request: &InnerRequest) -> Result<InnerResponse, Error> {
        let plaintext = serde_json::to_vec(request).map_err(|e| {
            SessionError::ProtocolViolation(format!("encode inner request: {e}"))
        })?;

        let established = match self.json_session.take() {
            Some(established) => established,
            None => self.handshake(Envelope::Json).await?.0,
        };

        let first = self.post_sealed(&established, &plaintext).await?;
        let (established, reply) = match first {
            Some(reply) => (established, reply),
            None => {
                tracing::debug!(
                    session = %established.session_id,
                    "session gone on responder, re-handshaking"
                );
                let fresh = self.handshake(Envelope::Json).await?.0;
                let retried = self.post_sealed(&fresh, &plaintext).await?;
                match retried {
                    Some(reply) => (fresh, reply),
                    None => return Err(SessionError::SessionExpired.into()),
                }
            }
        };

        let opened =
            SealedBox::try_from(&reply).and_then(|b| open_box(&established.keys.rx, &b))?;
        let response = serde_json::from_slice(&opened)
            .map_err(|e| SessionError::ProtocolViolation(format!("inner response: {e}")))?;
        self.json_session = Some(established);
        Ok(response)
    }

    /// Drop the cached json-envelope session; the next call handshakes.
    pub fn forget_session(&mut self) {
        self.json_session = None;
    }

    /// `Ok(None)` when the responder does not know the session.
    async fn post_sealed(
        &self,
        established: &Established,
        plaintext: &[u8],
    ) -> Result<Option<SealedMessage>, Error> {
        let sealed = SealedMessage::from(&seal_box(&established.keys.tx, plaintext)?);
        let exchange = async {
            let response = self
                .http
                .post(self.url("/session"))
                .header(COOKIE, format!("{COOKIE_NAME}={}", established.session_id))
                .json(&sealed)
                .send()
                .await?;
            match response.status() {
                StatusCode::OK => Ok(Some(response.json::<SealedMessage>().await?)),
                StatusCode::NOT_FOUND => Ok(None),
                other => Err(Error::from(SessionError::BadStatus(other.as_u16()))),
            }
        };
        bounded(self.config.net_timeout, "json call", exchange).await
    }

    /// Handshake a tcp-envelope session and upgrade it into a [`SecureChannel`].
    pub async fn connect(&self) -> Result<(SecureChannel<Upgraded>, P::Output), Error> {
        let (established, output) = self.handshake(Envelope::Tcp).await?;
        let upgraded = bounded(
            self.config.net_timeout,
            "session upgrade",
            self.upgrade(&established),
        )
        .await?;
        tracing::debug!(session = %established.session_id, "tcp envelope open");
        let channel = SecureChannel::new(upgraded, &established.keys, &self.config);
        Ok((channel, output))
    }

    /// Like [`connect`](Self::connect), but hands back a plain byte stream.
    /// A background task relays it through the sealed channel.
    pub async fn connect_stream(&self) -> Result<(DuplexStream, P::Output), Error> {
        let (channel, output) = self.connect().await?;
        let (local, relayed) = tokio::io::duplex(RELAY_BUF_SIZE * 4);
        let write_timeout = self.config.net_timeout;
        tokio::spawn(async move {
            if let Err(e) = relay(channel, relayed, write_timeout, || {}).await {
                tracing::debug!(error = %e, "stream relay ended");
            }
        });
        Ok((local, output))
    }

    async fn upgrade(&self, established: &Established) -> Result<Upgraded, Error> {
        let response = self
            .http
            .post(self.url("/session"))
            .header(COOKIE, format!("{COOKIE_NAME}={}", established.session_id))
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, UPGRADE_PROTOCOL)
            .send()
            .await?;
        match response.status() {
            StatusCode::SWITCHING_PROTOCOLS => Ok(response.upgrade().await?),
            StatusCode::NOT_FOUND => Err(SessionError::SessionExpired.into()),
            other => Err(SessionError::BadStatus(other.as_u16()).into()),
        }
    }
}

async fn bounded<T>(
    timeout: Duration,
    what: &'static str,
    fut: impl std::future::Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| SessionError::Timeout(what))?
}
