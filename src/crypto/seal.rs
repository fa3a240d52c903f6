use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{CipherSuite, SymmetricKey};
use crate::error::CryptoError;
use crate::frame::PROTOCOL_VERSION;

const NONCE_LEN: usize = CipherSuite::X25519XChaChaPoly.nonce_len();
const TAG_LEN: usize = CipherSuite::X25519XChaChaPoly.tag_len();

const BOX_CONTEXT: &[u8] = b"attested-channel/json";

/// Builds per-frame AAD: `version || msg_type || flags || sequence`.
///
/// Binding `msg_type` and `flags` stops an active attacker from flipping the
/// frame type in the unencrypted header.
fn build_aad(version: u8, msg_type: u8, flags: u8, sequence: u64) -> [u8; 11] {
    let mut aad = [0u8; 11];
    aad[0] = version;
    aad[1] = msg_type;
    aad[2] = flags;
    aad[3..].copy_from_slice(&sequence.to_be_bytes());
    aad
}

fn cipher(key: &SymmetricKey) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(key.into())
}

/// Encrypts `plaintext` under a fresh random nonce. Output is `nonce || ciphertext`.
fn seal_with_aad(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher(key)
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::SealFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_with_aad(key: &SymmetricKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Truncated(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher(key)
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::OpenFailed)
}

/// Context for encrypting outgoing frames.
pub struct SealingContext {
    key: Zeroizing<SymmetricKey>,
    sequence: u64,
}

impl SealingContext {
    pub fn new(key: &SymmetricKey) -> Self {
        Self {
            key: Zeroizing::new(*key),
            sequence: 0,
        }
    }

    /// Encrypt one frame payload. Returns `nonce || ciphertext` and the
    /// sequence number to put in the frame header.
    pub fn seal(
        &mut self,
        plaintext: &[u8],
        msg_type: u8,
        flags: u8,
    ) -> Result<(Vec<u8>, u64), CryptoError> {
        let seq = self.sequence;
        self.sequence = seq.checked_add(1).ok_or(CryptoError::SequenceOverflow)?;

        let aad = build_aad(PROTOCOL_VERSION, msg_type, flags, seq);
        let sealed = seal_with_aad(&self.key, plaintext, &aad)?;
        Ok((sealed, seq))
    }

    /// Next sequence number to be used.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Context for decrypting incoming frames.
pub struct OpeningContext {
    key: Zeroizing<SymmetricKey>,
    /// Only this sequence number is accepted next.
    expected: u64,
}

impl OpeningContext {
    pub fn new(key: &SymmetricKey) -> Self {
        Self {
            key: Zeroizing::new(*key),
            expected: 0,
        }
    }

    /// Decrypt one frame payload. Frames must arrive in exact order; a gap,
    /// replay or reorder is rejected before any decryption is attempted.
    pub fn open(
        &mut self,
        sealed: &[u8],
        sequence: u64,
        msg_type: u8,
        flags: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        if sequence != self.expected {
            return Err(CryptoError::UnexpectedSequence {
                received: sequence,
                expected: self.expected,
            });
        }

        let aad = build_aad(PROTOCOL_VERSION, msg_type, flags, sequence);
        let plaintext = open_with_aad(&self.key, sealed, &aad)?;

        self.expected = self
            .expected
            .checked_add(1)
            .ok_or(CryptoError::SequenceOverflow)?;
        Ok(plaintext)
    }
}

/// One-shot sealed message used by the json envelope. Both fields are
/// base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

fn box_aad() -> Vec<u8> {
    let mut aad = Vec::with_capacity(BOX_CONTEXT.len() + 1);
    aad.extend_from_slice(BOX_CONTEXT);
    aad.push(PROTOCOL_VERSION);
    aad
}

/// Seal a complete message under `key` with a fresh nonce.
pub fn seal_box(key: &SymmetricKey, plaintext: &[u8]) -> Result<SealedBox, CryptoError> {
    let sealed = seal_with_aad(key, plaintext, &box_aad())?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce);
    Ok(SealedBox {
        nonce: nonce_bytes,
        ciphertext: ciphertext.to_vec(),
    })
}

/// Open a message sealed by [`seal_box`].
pub fn open_box(key: &SymmetricKey, sealed: &SealedBox) -> Result<Vec<u8>, CryptoError> {
    if sealed.ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Truncated(sealed.ciphertext.len()));
    }
    cipher(key)
        .decrypt(
            XNonce::from_slice(&sealed.nonce),
            Payload {
                msg: &sealed.ciphertext,
                aad: &box_aad(),
            },
        )
        .map_err(|_| CryptoError::OpenFailed)
}

/// Wire form of a [`SealedBox`]: `{ "nonce": <b64>, "encrypted": <b64> }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedMessage {
    pub nonce: String,
    pub encrypted: String,
}

impl From<&SealedBox> for SealedMessage {
    fn from(sealed: &SealedBox) -> Self {
        use base64::prelude::*;
        Self {
            nonce: BASE64_STANDARD.encode(sealed.nonce),
            encrypted: BASE64_STANDARD.encode(&sealed.ciphertext),
        }
    }
}

impl TryFrom<&SealedMessage> for SealedBox {
    type Error = CryptoError;

    fn try_from(msg: &SealedMessage) -> Result<Self, Self::Error> {
        use base64::prelude::*;
        let nonce = BASE64_STANDARD
            .decode(&msg.nonce)
            .map_err(|_| CryptoError::OpenFailed)?;
        let nonce: [u8; NONCE_LEN] = nonce
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Truncated(nonce.len()))?;
        let ciphertext = BASE64_STANDARD
            .decode(&msg.encrypted)
            .map_err(|_| CryptoError::OpenFailed)?;
        Ok(Self { nonce, ciphertext })
    }
}
