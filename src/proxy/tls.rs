//! Serving the responder over TLS. The certificate carries no trust: clients
//! accept it as is and rely on the attestation document instead.

use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;

use crate::error::{Error, SessionError};
use crate::session::handshake::Responder;

use super::server::{router, ServerConfig};

/// Install the ring crypto provider once per process.
fn install_provider() {
    // Fails only if a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// TLS identity from PEM files, or an ephemeral self-signed one for
/// `127.0.0.1` and `localhost` when either file cannot be read.
pub async fn identity(cert: &Path, key: &Path) -> Result<RustlsConfig, Error> {
    install_provider();
    match RustlsConfig::from_pem_file(cert, key).await {
        Ok(config) => {
            tracing::info!(cert = %cert.display(), "using certificate from disk");
            Ok(config)
        }
        Err(e) => {
            tracing::info!(error = %e, "no usable certificate on disk, generating one");
            self_signed(vec!["127.0.0.1".to_string(), "localhost".to_string()]).await
        }
    }
}

/// Ephemeral self-signed identity for `subject_alt_names`.
pub async fn self_signed(subject_alt_names: Vec<String>) -> Result<RustlsConfig, Error> {
    install_provider();
    let certified = rcgen::generate_simple_self_signed(subject_alt_names)
        .map_err(|e| SessionError::InvalidConfig(format!("self-signed certificate: {e}")))?;
    let config = RustlsConfig::from_pem(
        certified.cert.pem().into_bytes(),
        certified.key_pair.serialize_pem().into_bytes(),
    )
    .await?;
    Ok(config)
}

/// Serve the responder over TLS on `config.listen_addr`.
pub async fn serve_tls(
    responder: Arc<Responder>,
    config: ServerConfig,
    tls: RustlsConfig,
) -> Result<(), Error> {
    let app = router(responder, &config)?;
    tracing::info!(
        addr = %config.listen_addr,
        prefix = %config.session.prefix,
        target = %config.target,
        "responder listening (TLS)"
    );
    axum_server::bind_rustls(config.listen_addr, tls)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
