//! TLS setup for store connections, driven by the configured `ssl_mode`.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{info, warn};

use crate::config::SslMode;

/// rustls connector for deadpool-postgres, or `None` when TLS is disabled.
pub fn postgres_connector(mode: SslMode) -> Option<MakeRustlsConnect> {
    client_config(mode).map(MakeRustlsConnect::new)
}

/// rustls client configuration for `mode`.
pub fn client_config(mode: SslMode) -> Option<ClientConfig> {
    match mode {
        SslMode::Disable => {
            warn!("TLS is disabled, credentials are sent in plaintext");
            None
        }
        SslMode::Require => {
            warn!(
                "ssl_mode=require encrypts traffic but does not verify the server \
                 certificate; use verify-full outside trusted networks"
            );
            Some(
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate::new()))
                    .with_no_client_auth(),
            )
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            if mode == SslMode::VerifyCa {
                info!("ssl_mode=verify-ca also verifies the hostname with rustls");
            }
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Some(
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        }
    }
}

/// mysql_async TLS options for `mode`.
#[cfg(feature = "mysql")]
pub fn mysql_ssl_opts(mode: SslMode) -> Option<mysql_async::SslOpts> {
    match mode {
        SslMode::Disable => {
            warn!("TLS is disabled, credentials are sent in plaintext");
            None
        }
        SslMode::Require => Some(mysql_async::SslOpts::default().with_danger_accept_invalid_certs(true)),
        SslMode::VerifyCa => Some(mysql_async::SslOpts::default().with_danger_skip_domain_validation(true)),
        SslMode::VerifyFull => Some(mysql_async::SslOpts::default()),
    }
}

/// Skips certificate chain and hostname validation for `ssl_mode=require`.
///
/// Handshake signatures are still checked, so the session is encrypted to
/// whoever holds the presented certificate's key.
#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyCertificate {
    fn new() -> Self {
        Self {
            algorithms: ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
