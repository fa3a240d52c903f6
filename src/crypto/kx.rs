use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::{SessionKeys, SymmetricKey};
use crate::error::CryptoError;

const INITIATOR_TO_RESPONDER: &[u8] = b"attested-channel initiator->responder";
const RESPONDER_TO_INITIATOR: &[u8] = b"attested-channel responder->initiator";

/// Which end of the handshake derives the keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// An ephemeral X25519 key pair. The secret is consumed by the single
/// key agreement it takes part in.
pub struct KeyPair {
    secret: EphemeralSecret,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_bytes(&self) -> super::PublicKey {
        self.public.to_bytes()
    }

    /// Perform X25519 Diffie-Hellman with `their_public` and derive the
    /// directional session keys via HKDF, salted with the transcript hash.
    ///
    /// Rejects keys of the wrong length and non-contributory points, so a
    /// peer cannot force a known shared secret.
    pub fn derive_session_keys(
        self,
        their_public: &[u8],
        transcript_hash: &[u8; 32],
        role: Role,
    ) -> Result<SessionKeys, CryptoError> {
        let their_public: [u8; 32] =
            their_public
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: their_public.len(),
                })?;

        let shared_secret = self.secret.diffie_hellman(&PublicKey::from(their_public));
        if !shared_secret.was_contributory() {
            return Err(CryptoError::NonContributoryKey);
        }

        let hkdf = Hkdf::<Sha256>::new(Some(transcript_hash), shared_secret.as_bytes());

        let mut to_responder: SymmetricKey = [0u8; 32];
        let mut to_initiator: SymmetricKey = [0u8; 32];

        hkdf.expand(INITIATOR_TO_RESPONDER, &mut to_responder)
            .map_err(|_| CryptoError::HkdfExpandFailed)?;
        hkdf.expand(RESPONDER_TO_INITIATOR, &mut to_initiator)
            .map_err(|_| CryptoError::HkdfExpandFailed)?;

        Ok(match role {
            Role::Initiator => SessionKeys::new(to_responder, to_initiator),
            Role::Responder => SessionKeys::new(to_initiator, to_responder),
        })
    }
}
