use std::fmt;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::error::AttestError;

/// Raw attestation document bytes (opaque to the protocol).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationDocument {
    pub raw: Vec<u8>,
}

impl AttestationDocument {
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    /// SHA-256 of the raw bytes, used for transcript binding.
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(&self.raw).into()
    }
}

/// Where a verifier finds the root of trust for the document's signing chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustRoot {
    /// PEM bundle held in memory.
    Pem(Vec<u8>),
    /// PEM bundle on disk.
    File(PathBuf),
    /// The verifier's own compiled-in root.
    Builtin,
}

impl Default for TrustRoot {
    fn default() -> Self {
        Self::Builtin
    }
}

/// Ordered PCR values as lowercase hex strings. Order and count are part of
/// the identity: `[a, b]` and `[b, a]` are different tuples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrTuple(pub Vec<String>);

impl PcrTuple {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Hex SHA-256 of the concatenated values.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for value in &self.0 {
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for PcrTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

/// The result of a successful attestation verification.
#[derive(Debug, Clone)]
pub struct VerifiedAttestation {
    /// Hash of the attestation document for transcript binding.
    pub document_hash: [u8; 32],

    /// Public key bound into the document (if any).
    pub public_key: Option<Vec<u8>>,

    /// User data bound into the document (if any).
    pub user_data: Option<Vec<u8>>,

    /// Nonce bound into the document (if any).
    pub nonce: Option<Vec<u8>>,

    pub pcrs: PcrTuple,
}

impl VerifiedAttestation {
    /// Byte-exact comparison of the embedded nonce. A document without a
    /// nonce never matches.
    pub fn check_nonce(&self, expected: &[u8]) -> Result<(), AttestError> {
        match self.nonce.as_deref() {
            Some(nonce) if nonce == expected => Ok(()),
            _ => Err(AttestError::NonceMismatch),
        }
    }

    /// The embedded X25519 public key.
    pub fn attested_public_key(&self) -> Result<[u8; 32], AttestError> {
        let key = self
            .public_key
            .as_deref()
            .ok_or_else(|| AttestError::MissingField("public_key".into()))?;
        key.try_into().map_err(|_| {
            AttestError::MalformedPublicKey(format!("expected 32 bytes, got {}", key.len()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verified(nonce: Option<Vec<u8>>, public_key: Option<Vec<u8>>) -> VerifiedAttestation {
        VerifiedAttestation {
            document_hash: [0; 32],
            public_key,
            user_data: None,
            nonce,
            pcrs: PcrTuple::default(),
        }
    }

    #[test]
    fn pcr_digest_is_order_sensitive() {
        let a = PcrTuple::new(["aa", "bb"]);
        let b = PcrTuple::new(["bb", "aa"]);
        assert_ne!(a.digest(), b.digest());
        assert_eq!(
            a.digest(),
            hex::encode(Sha256::digest(b"aabb")),
            "digest is over the plain concatenation"
        );
    }

    #[test]
    fn nonce_check() {
        let v = verified(Some(vec![1; 32]), None);
        assert!(v.check_nonce(&[1; 32]).is_ok());
        assert!(matches!(
            v.check_nonce(&[2; 32]),
            Err(AttestError::NonceMismatch)
        ));

        let missing = verified(None, None);
        assert!(matches!(
            missing.check_nonce(&[1; 32]),
            Err(AttestError::NonceMismatch)
        ));
    }

    #[test]
    fn attested_key_shape() {
        assert!(verified(None, Some(vec![9; 32])).attested_public_key().is_ok());
        assert!(matches!(
            verified(None, Some(vec![9; 31])).attested_public_key(),
            Err(AttestError::MalformedPublicKey(_))
        ));
        assert!(matches!(
            verified(None, None).attested_public_key(),
            Err(AttestError::MissingField(_))
        ));
    }
}
