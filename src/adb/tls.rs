// STLS: wireless debugging upgrades the socket to TLS 1.3 right after CNXN.
// adbd authenticates us by the public key inside our client certificate and
// never presents a CA-signed certificate itself.
use super::error::{AdbError, AdbResult};
use super::key::AdbKey;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;

fn tls_error(context: &str, e: impl std::fmt::Display) -> AdbError {
    AdbError::TlsFailed {
        description: format!("{context}: {e}"),
    }
}

/// Accepts whatever certificate adbd presents; the handshake signature is
/// still checked so the session key is bound to that certificate.
#[derive(Debug)]
struct AdbdCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AdbdCertVerifier {
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

/// Self-signed certificate wrapping the ADB key, DER encoded.
fn client_certificate(key: &AdbKey, pkcs8: &[u8]) -> AdbResult<CertificateDer<'static>> {
    let key_pair = rcgen::KeyPair::try_from(pkcs8)
        .map_err(|e| tls_error("ADB key cannot sign certificates", e))?;
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())
        .map_err(|e| tls_error("certificate parameters", e))?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, key.label());
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| tls_error("self-signing client certificate", e))?;
    Ok(cert.der().clone())
}

/// Client configuration presenting `key` as the TLS client identity.
pub fn client_config(key: &AdbKey) -> AdbResult<Arc<ClientConfig>> {
    let pkcs8 = key.private_key_pkcs8_der()?;
    let certificate = client_certificate(key, &pkcs8)?;

    let provider: CryptoProvider = rustls::crypto::ring::default_provider();
    let verifier = AdbdCertVerifier {
        algorithms: provider.signature_verification_algorithms.clone(),
    };

    let config = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("TLS 1.3 unavailable", e))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(
            vec![certificate],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pkcs8)),
        )
        .map_err(|e| tls_error("client certificate rejected", e))?;

    Ok(Arc::new(config))
}

/// Server name handed to rustls; adbd ignores SNI but rustls needs one.
pub fn server_name(host: &str) -> AdbResult<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|e| tls_error("invalid server name", e))
}
