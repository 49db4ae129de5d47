//! # Transport Cryptography
//!
//! QUIC/TLS plumbing for Abyss connections:
//!
//! - **TLS configs**: TLS 1.3 only, Ed25519 only, mandatory client auth
//! - **Verifiers**: accept exactly one self-signed Ed25519 transport
//!   certificate; identity is established later by the AHMP handshake
//! - **Close codes**: application error codes carried by QUIC CONNECTION_CLOSE
//!
//! ## Security
//!
//! The `dangerous()` APIs are used on purpose. TLS here only proves possession
//! of an ephemeral Ed25519 key; the binding certificate exchanged inside the
//! encrypted handshake ties that key to a root identity.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::{ClientConfig, VarInt};
use rustls::pki_types::CertificateDer;

use crate::identity::TlsIdentity;

/// Lazily-initialized crypto provider for rustls, backed by ring.
static CRYPTO_PROVIDER: LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier of every Abyss connection.
pub const ALPN: &[u8] = b"abyss";

/// Server name presented by dialers. Certificates are not name-checked.
pub const SERVER_NAME: &str = "abyss";

/// Connections with no traffic for this long are dropped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Keep-alive ping interval, well under [`IDLE_TIMEOUT`].
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Close Codes
// ============================================================================

/// Application close codes sent with QUIC CONNECTION_CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CloseCode {
    RedundantConnection = 0x1000,
    AhmpStreamFail = 0x1001,
    AhmpParseFail = 0x1002,
    CryptoFail = 0x1010,
    AuthenticationFail = 0x1011,
    HandshakeTimeout = 0x1020,
    Close = 0x1100,
    Override = 0x1101,
    AbystNoAbyss = 0x2000,
}

impl CloseCode {
    pub fn code(self) -> VarInt {
        VarInt::from_u32(self as u32)
    }

    pub fn reason(self) -> &'static [u8] {
        match self {
            CloseCode::RedundantConnection => b"redundant connection",
            CloseCode::AhmpStreamFail => b"ahmp stream failure",
            CloseCode::AhmpParseFail => b"ahmp parse failure",
            CloseCode::CryptoFail => b"cryptographic failure",
            CloseCode::AuthenticationFail => b"authentication failure",
            CloseCode::HandshakeTimeout => b"handshake timeout",
            CloseCode::Close => b"close",
            CloseCode::Override => b"override",
            CloseCode::AbystNoAbyss => b"abyst without abyss",
        }
    }

    pub fn from_code(code: VarInt) -> Option<Self> {
        let code = u32::try_from(code.into_inner()).ok()?;
        [
            CloseCode::RedundantConnection,
            CloseCode::AhmpStreamFail,
            CloseCode::AhmpParseFail,
            CloseCode::CryptoFail,
            CloseCode::AuthenticationFail,
            CloseCode::HandshakeTimeout,
            CloseCode::Close,
            CloseCode::Override,
            CloseCode::AbystNoAbyss,
        ]
        .into_iter()
        .find(|c| *c as u32 == code)
    }

    /// Close `connection` with this code.
    pub fn apply(self, connection: &quinn::Connection) {
        connection.close(self.code(), self.reason());
    }
}

// ============================================================================
// QUIC Configuration
// ============================================================================

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        IDLE_TIMEOUT
            .try_into()
            .context("idle timeout out of range")?,
    ));
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    Ok(transport)
}

pub fn create_server_config(tls: &TlsIdentity) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(Arc::clone(&CRYPTO_PROVIDER))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3")?
        .with_client_cert_verifier(Arc::new(Ed25519ClientCertVerifier))
        .with_single_cert(tls.cert_chain(), tls.private_key())
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));
    Ok(server_config)
}

pub fn create_client_config(tls: &TlsIdentity) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(Arc::clone(&CRYPTO_PROVIDER))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(Ed25519ServerCertVerifier))
        .with_client_auth_cert(tls.cert_chain(), tls.private_key())
        .context("failed to create client TLS config with client auth")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));
    Ok(client_config)
}

// ============================================================================
// Certificate Helpers
// ============================================================================

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    crate::identity::ed25519_key_of(&cert)
}

/// The peer's transport certificate as presented during the TLS handshake.
pub fn peer_transport_cert(connection: &quinn::Connection) -> Option<Vec<u8>> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer> = peer_identity.downcast_ref()?;
    match certs.as_slice() {
        [cert] => Some(cert.as_ref().to_vec()),
        _ => None,
    }
}

/// BLAKE3 of a transport certificate's DER, keyed in the peer registry.
pub fn hash_tls_cert(cert_der: &[u8]) -> [u8; 32] {
    *blake3::hash(cert_der).as_bytes()
}

fn check_transport_cert(
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
) -> Result<(), rustls::Error> {
    if !intermediates.is_empty() {
        return Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::ApplicationVerificationFailure,
        ));
    }
    extract_public_key_from_cert(end_entity.as_ref())
        .map(|_| ())
        .ok_or(rustls::Error::InvalidCertificate(
            rustls::CertificateError::BadEncoding,
        ))
}

#[derive(Debug)]
struct Ed25519ClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for Ed25519ClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        check_transport_cert(end_entity, intermediates)?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Ed25519ServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for Ed25519ServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        check_transport_cert(end_entity, intermediates)?;
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{RootKey, RootSecret};

    #[test]
    fn transport_cert_carries_tls_public_key() {
        let secret = RootSecret::new(&RootKey::generate()).expect("root secret");
        for _ in 0..5 {
            let tls = secret.new_tls_identity().expect("tls identity");
            let chain = tls.cert_chain();
            assert_eq!(chain.len(), 1);
            let extracted = extract_public_key_from_cert(chain[0].as_ref())
                .expect("public key extraction must succeed");
            assert_eq!(extracted, tls.public_key());
        }
    }

    #[test]
    fn configs_build() {
        let secret = RootSecret::new(&RootKey::generate()).unwrap();
        let tls = secret.new_tls_identity().unwrap();
        create_server_config(&tls).expect("server config");
        create_client_config(&tls).expect("client config");
    }

    #[test]
    fn close_codes_round_trip() {
        for code in [CloseCode::RedundantConnection, CloseCode::HandshakeTimeout, CloseCode::AbystNoAbyss] {
            assert_eq!(CloseCode::from_code(code.code()), Some(code));
        }
        assert_eq!(CloseCode::from_code(VarInt::from_u32(7)), None);
    }

    #[test]
    fn tls_cert_hash_is_stable() {
        let der = b"certificate";
        assert_eq!(hash_tls_cert(der), hash_tls_cert(der));
        assert_ne!(hash_tls_cert(der), hash_tls_cert(b"other"));
    }
}
