pub mod attest_exchange;
pub mod cache;
pub mod channel;
pub mod handshake;
pub mod retry;

use std::time::Duration;

use crate::error::{Error, SessionError};

use self::retry::RetryPolicy;

/// Path prefix under which the responder serves `hello`, `session` and `cert`.
pub const DEFAULT_PREFIX: &str = "/.well-known/lockhost";

/// Configuration shared by both ends of a session.
///
/// The cipher suite is always X25519 + HKDF-SHA256 + XChaCha20-Poly1305.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on every single network operation: connect, write, json call (default: 5s).
    pub net_timeout: Duration,

    /// Bound on the whole hello round trip, attestation included (default: 5s).
    pub handshake_timeout: Duration,

    /// Sliding lifetime of a responder-side session (default: 5 minutes).
    pub session_ttl: Duration,

    /// `max-age` of the session cookie in seconds (default: one year).
    pub cookie_max_age: u64,

    /// Maximum frame payload in bytes (default: 16 MiB).
    pub max_payload_size: u32,

    /// Path prefix of the responder endpoints.
    pub prefix: String,

    /// How long a graceful close may take before the transport is dropped (default: 5s).
    pub close_grace: Duration,

    /// Optional retry policy for callers that establish channels repeatedly.
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            net_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            session_ttl: Duration::from_secs(5 * 60),
            cookie_max_age: handshake::COOKIE_MAX_AGE,
            max_payload_size: crate::frame::MAX_PAYLOAD_SIZE,
            prefix: DEFAULT_PREFIX.to_string(),
            close_grace: Duration::from_secs(5),
            retry_policy: None,
        }
    }
}

impl SessionConfig {
    /// Create a builder for constructing a `SessionConfig`.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// `{prefix}{path}`, e.g. `/.well-known/lockhost/hello`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.prefix.trim_end_matches('/'))
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }
}

impl SessionConfigBuilder {
    pub fn net_timeout(mut self, timeout: Duration) -> Self {
        self.config.net_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Zero is allowed: sessions then expire as soon as they are created.
    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.config.session_ttl = ttl;
        self
    }

    pub fn cookie_max_age(mut self, seconds: u64) -> Self {
        self.config.cookie_max_age = seconds;
        self
    }

    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.config.close_grace = grace;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = Some(policy);
        self
    }

    /// Build the `SessionConfig`, validating that all values are sensible.
    pub fn build(self) -> Result<SessionConfig, Error> {
        let config = self.config;
        let invalid = |msg: &str| -> Result<SessionConfig, Error> {
            Err(SessionError::InvalidConfig(msg.to_string()).into())
        };

        if config.net_timeout.is_zero() {
            return invalid("net_timeout must be > 0");
        }
        if config.handshake_timeout.is_zero() {
            return invalid("handshake_timeout must be > 0");
        }
        if config.max_payload_size <= channel::FRAME_OVERHEAD as u32
            || config.max_payload_size > crate::frame::MAX_PAYLOAD_SIZE
        {
            return invalid("max_payload_size must leave room for the AEAD overhead and be <= 16 MiB");
        }
        if !config.prefix.starts_with('/') {
            return invalid("prefix must start with '/'");
        }
        Ok(config)
    }
}
