use sha2::{Digest, Sha256};

use super::{Nonce, PublicKey};
use crate::frame::PROTOCOL_VERSION;

/// Compute the transcript hash binding the session to the attestation and key material.
///
/// `transcript = SHA256(doc_hash || initiator_pk || responder_pk || nonce || version)`
///
/// Roles are fixed by the hello exchange, so the keys are hashed in role
/// order. Both sides hold the same attestation document, the initiator after
/// receiving it and the responder after producing it.
pub fn compute_transcript(
    document_hash: &[u8; 32],
    initiator_pk: &PublicKey,
    responder_pk: &PublicKey,
    nonce: &Nonce,
) -> [u8; 32] {
    let mut hasher = Sha256::new();

    hasher.update(document_hash);
    hasher.update(initiator_pk);
    hasher.update(responder_pk);
    hasher.update(nonce);
    hasher.update([PROTOCOL_VERSION]);

    hasher.finalize().into()
}
