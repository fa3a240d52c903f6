//! Provider and verifier backed by external attestation binaries.
//!
//! `attest <public_key|null> <nonce|null> <user_data|null>` takes base64
//! arguments and prints the base64 document. `attest-parse <doc> <root.pem>`
//! prints `public_key,nonce,user_data,pcr0,pcr1,...` with base64 fields and
//! hex PCRs.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use tokio::process::Command;

use super::types::{AttestationDocument, PcrTuple, TrustRoot, VerifiedAttestation};
use super::{AttestationProvider, AttestationVerifier};
use crate::error::AttestError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

fn arg(field: Option<&[u8]>) -> String {
    match field {
        Some(data) if !data.is_empty() => BASE64_STANDARD.encode(data),
        _ => "null".to_string(),
    }
}

async fn run(program: &Path, args: &[String], timeout: Duration) -> Result<String, String> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to start {}: {e}", program.display()))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| format!("{} timed out", program.display()))?
        .map_err(|e| format!("failed to wait for {}: {e}", program.display()))?;

    if !output.status.success() {
        return Err(format!(
            "{} exited with {}: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Runs the `attest` binary for each document.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: PathBuf,
    timeout: Duration,
}

impl CommandProvider {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AttestationProvider for CommandProvider {
    async fn attest(
        &self,
        user_data: Option<&[u8]>,
        nonce: Option<&[u8]>,
        public_key: Option<&[u8]>,
    ) -> Result<AttestationDocument, AttestError> {
        let args = [arg(public_key), arg(nonce), arg(user_data)];
        let stdout = run(&self.program, &args, self.timeout)
            .await
            .map_err(AttestError::GenerationFailed)?;
        let raw = BASE64_STANDARD
            .decode(stdout)
            .map_err(|e| AttestError::GenerationFailed(format!("document is not base64: {e}")))?;
        Ok(AttestationDocument::new(raw))
    }
}

/// Runs the `attest-parse` binary, which validates the document's chain
/// against a PEM root on disk.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    program: PathBuf,
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn optional_b64(field: &str, name: &str) -> Result<Option<Vec<u8>>, AttestError> {
    if field.is_empty() {
        return Ok(None);
    }
    BASE64_STANDARD
        .decode(field)
        .map(Some)
        .map_err(|e| AttestError::VerificationFailed(format!("{name} is not base64: {e}")))
}

/// Parse `public_key,nonce,user_data,pcr0,pcr1,...`.
fn parse_claims(line: &str, document_hash: [u8; 32]) -> Result<VerifiedAttestation, AttestError> {
    let mut parts = line.trim_end_matches(',').split(',');
    let mut next = |name: &str| {
        parts
            .next()
            .map(str::to_string)
            .ok_or_else(|| AttestError::MissingField(name.to_string()))
    };

    let public_key = optional_b64(&next("public_key")?, "public_key")?;
    let nonce = optional_b64(&next("nonce")?, "nonce")?;
    let user_data = optional_b64(&next("user_data")?, "user_data")?;
    let pcrs = PcrTuple::new(parts.map(str::to_ascii_lowercase));

    Ok(VerifiedAttestation {
        document_hash,
        public_key,
        user_data,
        nonce,
        pcrs,
    })
}

#[async_trait]
impl AttestationVerifier for CommandVerifier {
    async fn verify(
        &self,
        doc: &AttestationDocument,
        trust_root: &TrustRoot,
    ) -> Result<VerifiedAttestation, AttestError> {
        let root = match trust_root {
            TrustRoot::File(path) => path.display().to_string(),
            TrustRoot::Pem(_) | TrustRoot::Builtin => {
                return Err(AttestError::TrustRoot(
                    "attest-parse needs a PEM file path".into(),
                ))
            }
        };

        let args = [BASE64_STANDARD.encode(&doc.raw), root];
        let stdout = run(&self.program, &args, self.timeout)
            .await
            .map_err(AttestError::VerificationFailed)?;

        parse_claims(&stdout, doc.hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_arguments() {
        assert_eq!(arg(None), "null");
        assert_eq!(arg(Some(b"")), "null");
        assert_eq!(arg(Some(b"hi")), "aGk=");
    }

    #[test]
    fn parses_claims_line() {
        let pk = BASE64_STANDARD.encode([1u8; 32]);
        let nonce = BASE64_STANDARD.encode([2u8; 32]);
        let line = format!("{pk},{nonce},,AB01,cd02,ef03,");

        let verified = parse_claims(&line, [0; 32]).unwrap();
        assert_eq!(verified.public_key, Some(vec![1u8; 32]));
        assert_eq!(verified.nonce, Some(vec![2u8; 32]));
        assert!(verified.user_data.is_none());
        assert_eq!(verified.pcrs, PcrTuple::new(["ab01", "cd02", "ef03"]));
    }

    #[test]
    fn short_line_is_missing_field() {
        let result = parse_claims("only-one", [0; 32]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_binary_fails_closed() {
        let verifier = CommandVerifier::new("/nonexistent/attest-parse");
        let doc = AttestationDocument::new(vec![1, 2, 3]);
        let result = verifier
            .verify(&doc, &TrustRoot::File("/tmp/root.pem".into()))
            .await;
        assert!(matches!(result, Err(AttestError::VerificationFailed(_))));
    }
}
