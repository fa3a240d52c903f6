use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::types::{AttestationDocument, PcrTuple, TrustRoot, VerifiedAttestation};
use super::{AttestationProvider, AttestationVerifier};
use crate::error::AttestError;

const MARKER: &[u8] = b"MOCK_ATT_V2\0";

/// PCR value reported by mock documents unless configured otherwise.
pub const ZERO_PCR: &str =
    "000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000";

/// Mock attestation provider for testing. Produces a document holding the
/// length-prefixed user data, nonce, public key and PCR values.
///
/// # Security Warning
///
/// This provider performs **zero cryptographic verification** and must
/// never be used in production. Enable it only via `features = ["mock"]`
/// for development and testing.
pub struct MockProvider {
    pcrs: PcrTuple,
    calls: AtomicUsize,
}

impl MockProvider {
    /// Provider reporting three all-zero PCRs.
    pub fn new() -> Self {
        Self::with_pcrs(PcrTuple::new([ZERO_PCR, ZERO_PCR, ZERO_PCR]))
    }

    pub fn with_pcrs(pcrs: PcrTuple) -> Self {
        Self {
            pcrs,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of documents produced so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn put_field(raw: &mut Vec<u8>, field: Option<&[u8]>) {
    match field {
        Some(data) => {
            raw.extend_from_slice(&(data.len() as u32).to_le_bytes());
            raw.extend_from_slice(data);
        }
        None => raw.extend_from_slice(&0u32.to_le_bytes()),
    }
}

#[async_trait]
impl AttestationProvider for MockProvider {
    async fn attest(
        &self,
        user_data: Option<&[u8]>,
        nonce: Option<&[u8]>,
        public_key: Option<&[u8]>,
    ) -> Result<AttestationDocument, AttestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut raw = Vec::new();
        raw.extend_from_slice(MARKER);
        for field in [user_data, nonce, public_key] {
            put_field(&mut raw, field);
        }
        raw.extend_from_slice(&(self.pcrs.len() as u32).to_le_bytes());
        for pcr in self.pcrs.iter() {
            put_field(&mut raw, Some(pcr.as_bytes()));
        }

        Ok(AttestationDocument::new(raw))
    }
}

struct Reader<'a> {
    raw: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn u32(&mut self) -> Result<usize, AttestError> {
        let end = self.offset + 4;
        let bytes = self
            .raw
            .get(self.offset..end)
            .ok_or_else(|| AttestError::VerificationFailed("truncated mock document".into()))?;
        self.offset = end;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
    }

    fn field(&mut self) -> Result<Option<Vec<u8>>, AttestError> {
        let len = self.u32()?;
        if len == 0 {
            return Ok(None);
        }
        let end = self.offset + len;
        let data = self
            .raw
            .get(self.offset..end)
            .ok_or_else(|| AttestError::VerificationFailed("truncated mock document".into()))?;
        self.offset = end;
        Ok(Some(data.to_vec()))
    }
}

/// Mock attestation verifier for testing. Accepts any document produced by
/// [`MockProvider`] under any trust root, unless built with [`MockVerifier::rejecting`].
pub struct MockVerifier {
    reject: Option<String>,
}

impl MockVerifier {
    pub fn new() -> Self {
        Self { reject: None }
    }

    /// Verifier that fails every document with `reason`.
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            reject: Some(reason.into()),
        }
    }
}

impl Default for MockVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AttestationVerifier for MockVerifier {
    async fn verify(
        &self,
        doc: &AttestationDocument,
        _trust_root: &TrustRoot,
    ) -> Result<VerifiedAttestation, AttestError> {
        if let Some(reason) = &self.reject {
            return Err(AttestError::VerificationFailed(reason.clone()));
        }

        let raw = &doc.raw;
        if !raw.starts_with(MARKER) {
            return Err(AttestError::VerificationFailed(
                "not a mock attestation document".to_string(),
            ));
        }

        let mut reader = Reader {
            raw,
            offset: MARKER.len(),
        };
        let user_data = reader.field()?;
        let nonce = reader.field()?;
        let public_key = reader.field()?;

        let count = reader.u32()?;
        let mut pcrs = Vec::with_capacity(count.min(32));
        for _ in 0..count {
            let value = reader.field()?.unwrap_or_default();
            let value = String::from_utf8(value)
                .map_err(|_| AttestError::VerificationFailed("PCR is not hex text".into()))?;
            pcrs.push(value);
        }

        Ok(VerifiedAttestation {
            document_hash: doc.hash(),
            public_key,
            user_data,
            nonce,
            pcrs: PcrTuple(pcrs),
        })
    }
}
