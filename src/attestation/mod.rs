pub mod types;

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "command")]
pub mod command;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AttestError;
use types::{AttestationDocument, TrustRoot, VerifiedAttestation};

/// Produces attestation documents (runs inside the attested environment).
#[async_trait]
pub trait AttestationProvider: Send + Sync {
    /// Generate an attestation document, optionally binding user data, a nonce,
    /// and a public key into it.
    async fn attest(
        &self,
        user_data: Option<&[u8]>,
        nonce: Option<&[u8]>,
        public_key: Option<&[u8]>,
    ) -> Result<AttestationDocument, AttestError>;
}

/// Validates attestation documents against a trust root (runs on the peer).
///
/// Any failure is fatal to the handshake. Implementations must not return a
/// partially trusted result.
#[async_trait]
pub trait AttestationVerifier: Send + Sync {
    async fn verify(
        &self,
        doc: &AttestationDocument,
        trust_root: &TrustRoot,
    ) -> Result<VerifiedAttestation, AttestError>;
}

#[async_trait]
impl<P: AttestationProvider + ?Sized> AttestationProvider for Arc<P> {
    async fn attest(
        &self,
        user_data: Option<&[u8]>,
        nonce: Option<&[u8]>,
        public_key: Option<&[u8]>,
    ) -> Result<AttestationDocument, AttestError> {
        (**self).attest(user_data, nonce, public_key).await
    }
}

#[async_trait]
impl<V: AttestationVerifier + ?Sized> AttestationVerifier for Arc<V> {
    async fn verify(
        &self,
        doc: &AttestationDocument,
        trust_root: &TrustRoot,
    ) -> Result<VerifiedAttestation, AttestError> {
        (**self).verify(doc, trust_root).await
    }
}
