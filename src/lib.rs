pub mod attestation;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod policy;
#[cfg(feature = "tcp")]
pub mod proxy;
pub mod session;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use envelope::{Envelope, InnerRequest, InnerResponse};
pub use error::{Error, ErrorKind, Result};
pub use frame::{Flags, Frame, FrameType};
pub use session::channel::{Message, SecureChannel};
pub use session::handshake::{Initiator, Responder};
pub use session::SessionConfig;

pub use attestation::types::{PcrTuple, TrustRoot, VerifiedAttestation};
pub use attestation::{AttestationProvider, AttestationVerifier};
pub use policy::AttestationPolicy;

#[cfg(feature = "mock")]
pub use attestation::mock::{MockProvider, MockVerifier};
