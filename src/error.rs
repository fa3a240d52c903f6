use std::io;

/// Errors from frame parsing and encoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid magic bytes: expected 0xA7C4, got 0x{0:04X}")]
    InvalidMagic(u16),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u32, max: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("HKDF expand failed: invalid length")]
    HkdfExpandFailed,

    #[error("AEAD encryption failed")]
    SealFailed,

    #[error("AEAD decryption failed: ciphertext is invalid or tampered")]
    OpenFailed,

    #[error("sealed payload too short: {0} bytes")]
    Truncated(usize),

    #[error("sequence overflow: maximum sequence number reached")]
    SequenceOverflow,

    #[error("unexpected sequence number: received {received}, expected {expected}")]
    UnexpectedSequence { received: u64, expected: u64 },

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("non-contributory key exchange: peer sent small-subgroup or identity point")]
    NonContributoryKey,
}

/// Errors from attestation operations.
#[derive(Debug, thiserror::Error)]
pub enum AttestError {
    #[error("attestation generation failed: {0}")]
    GenerationFailed(String),

    #[error("attestation verification failed: {0}")]
    VerificationFailed(String),

    #[error("attestation nonce does not match the handshake nonce")]
    NonceMismatch,

    #[error("attested public key is malformed: {0}")]
    MalformedPublicKey(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("trust root unavailable: {0}")]
    TrustRoot(String),
}

/// Errors from session establishment and communication.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("peer answered with status {0}")]
    BadStatus(u16),

    #[error("handshake in state {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: String,
    },

    #[error("session not found after re-handshake")]
    SessionExpired,

    #[error("session closed")]
    Closed,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Rejection returned by an [`AttestationPolicy`](crate::policy::AttestationPolicy).
///
/// The reason is caller-defined and reaches the caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("policy rejected peer: {reason}")]
pub struct PolicyRejection {
    pub reason: String,
}

impl PolicyRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Coarse classification of every failure the channel can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect/read/write failure or timeout. Retryable by the caller.
    HandshakeTransport,
    /// Malformed hello, non-JSON body, unexpected status.
    ProtocolViolation,
    /// Validator rejected the document, or its nonce did not match.
    AttestationInvalid,
    /// The policy hook declined the peer.
    PolicyRejected,
    /// Authenticated decryption failed. Treated as tampering.
    CryptoIntegrity,
    /// Session absent on the responder after the single re-handshake.
    SessionExpired,
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Attestation(#[from] AttestError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Policy(#[from] PolicyRejection),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::Http(_) | Error::Frame(FrameError::Io(_)) => {
                ErrorKind::HandshakeTransport
            }
            Error::Frame(_) => ErrorKind::ProtocolViolation,
            Error::Crypto(CryptoError::InvalidKeyLength { .. })
            | Error::Crypto(CryptoError::NonContributoryKey) => ErrorKind::ProtocolViolation,
            Error::Crypto(_) => ErrorKind::CryptoIntegrity,
            Error::Attestation(_) => ErrorKind::AttestationInvalid,
            Error::Policy(_) => ErrorKind::PolicyRejected,
            Error::Session(SessionError::Closed) | Error::Session(SessionError::Timeout(_)) => {
                ErrorKind::HandshakeTransport
            }
            Error::Session(SessionError::SessionExpired) => ErrorKind::SessionExpired,
            Error::Session(_) => ErrorKind::ProtocolViolation,
        }
    }

    /// Whether the caller may retry the whole attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::HandshakeTransport
    }
}

pub type Result<T> = std::result::Result<T, Error>;
