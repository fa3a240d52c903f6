//! Caller-supplied acceptance rules evaluated once per handshake, after the
//! attestation document has been validated and before any key is derived.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::attestation::types::PcrTuple;
use crate::error::PolicyRejection;

/// Decides whether an attested peer is acceptable.
///
/// On approval the policy may return caller-defined metadata, which reaches
/// the caller alongside the established session. A rejection aborts the
/// handshake and its reason is surfaced unchanged.
#[async_trait]
pub trait AttestationPolicy: Send + Sync {
    type Output: Send;

    async fn evaluate(
        &self,
        pcrs: &PcrTuple,
        user_data: Option<&[u8]>,
    ) -> Result<Self::Output, PolicyRejection>;
}

#[async_trait]
impl<F, T> AttestationPolicy for F
where
    F: Fn(&PcrTuple, Option<&[u8]>) -> Result<T, PolicyRejection> + Send + Sync,
    T: Send,
{
    type Output = T;

    async fn evaluate(
        &self,
        pcrs: &PcrTuple,
        user_data: Option<&[u8]>,
    ) -> Result<T, PolicyRejection> {
        self(pcrs, user_data)
    }
}

/// Accepts every peer whose document validated. Returns the PCR tuple.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl AttestationPolicy for AcceptAll {
    type Output = PcrTuple;

    async fn evaluate(
        &self,
        pcrs: &PcrTuple,
        _user_data: Option<&[u8]>,
    ) -> Result<PcrTuple, PolicyRejection> {
        Ok(pcrs.clone())
    }
}

/// Compares the SHA-256 of the concatenated PCR tuple with an expected hex
/// digest, and optionally the attested user data with an expected string.
#[derive(Debug, Clone)]
pub struct PcrDigestPolicy {
    expected_digest: String,
    expected_user_data: Option<String>,
}

impl PcrDigestPolicy {
    pub fn new(expected_digest: impl Into<String>) -> Self {
        Self {
            expected_digest: expected_digest.into().to_ascii_lowercase(),
            expected_user_data: None,
        }
    }

    pub fn with_user_data(mut self, expected: impl Into<String>) -> Self {
        self.expected_user_data = Some(expected.into());
        self
    }
}

#[async_trait]
impl AttestationPolicy for PcrDigestPolicy {
    type Output = PcrTuple;

    async fn evaluate(
        &self,
        pcrs: &PcrTuple,
        user_data: Option<&[u8]>,
    ) -> Result<PcrTuple, PolicyRejection> {
        let digest = pcrs.digest();
        if digest != self.expected_digest {
            return Err(PolicyRejection::new(format!(
                "PCR digest {digest} does not match {}",
                self.expected_digest
            )));
        }

        if let Some(expected) = &self.expected_user_data {
            let actual = user_data.map(String::from_utf8_lossy);
            if actual.as_deref() != Some(expected.as_str()) {
                return Err(PolicyRejection::new("attested user data does not match"));
            }
        }

        Ok(pcrs.clone())
    }
}

/// Checks individual PCR values by index. Indices not listed are ignored;
/// a listed index the peer did not report is a rejection.
#[derive(Debug, Clone, Default)]
pub struct ExpectedPcrs {
    values: BTreeMap<usize, String>,
}

impl ExpectedPcrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pcr(mut self, index: usize, value: impl Into<String>) -> Self {
        self.values
            .insert(index, value.into().to_ascii_lowercase());
        self
    }
}

#[async_trait]
impl AttestationPolicy for ExpectedPcrs {
    type Output = PcrTuple;

    async fn evaluate(
        &self,
        pcrs: &PcrTuple,
        _user_data: Option<&[u8]>,
    ) -> Result<PcrTuple, PolicyRejection> {
        for (&idx, expected) in &self.values {
            match pcrs.get(idx) {
                Some(actual) if actual.eq_ignore_ascii_case(expected) => {}
                Some(actual) => {
                    return Err(PolicyRejection::new(format!(
                        "PCR{idx} mismatch: expected {expected}, got {actual}"
                    )))
                }
                None => return Err(PolicyRejection::new(format!("PCR{idx} missing"))),
            }
        }
        Ok(pcrs.clone())
    }
}
