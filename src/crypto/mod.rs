pub mod kx;
pub mod seal;
pub mod transcript;

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Supported cipher suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    /// X25519 key exchange + HKDF-SHA256 + XChaCha20Poly1305.
    X25519XChaChaPoly,
}

impl CipherSuite {
    /// AEAD nonce length in bytes.
    pub const fn nonce_len(self) -> usize {
        match self {
            Self::X25519XChaChaPoly => 24,
        }
    }

    /// AEAD tag length in bytes.
    pub const fn tag_len(self) -> usize {
        match self {
            Self::X25519XChaChaPoly => 16,
        }
    }
}

/// 32-byte symmetric key.
pub type SymmetricKey = [u8; 32];

/// 32-byte X25519 public key.
pub type PublicKey = [u8; 32];

/// Length of the handshake nonce.
pub const NONCE_LEN: usize = 32;

/// Per-handshake anti-replay nonce.
pub type Nonce = [u8; NONCE_LEN];

/// Fill a fresh handshake nonce from the OS RNG.
pub fn random_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Directional session keys. `tx` seals what this peer sends, `rx` opens what
/// it receives. The initiator's `tx` is the responder's `rx`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub tx: SymmetricKey,
    pub rx: SymmetricKey,
}

impl SessionKeys {
    pub fn new(tx: SymmetricKey, rx: SymmetricKey) -> Self {
        Self { tx, rx }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("tx", &"<redacted>")
            .field("rx", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_are_fresh() {
        assert_ne!(random_nonce(), random_nonce());
    }

    #[test]
    fn keys_debug_is_redacted() {
        let keys = SessionKeys::new([1; 32], [2; 32]);
        let shown = format!("{keys:?}");
        assert!(shown.contains("redacted"));
        assert!(!shown.contains("1, 1"));
    }
}
