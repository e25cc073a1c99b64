// Devices serve certificates we have no chain for and present a host
// certificate whose subject is empty. Lockdown only authenticates through the
// shared root, so peer verification is a no-op.
// https://github.com/rustls/rustls/issues/578

use rustls::{
    ClientConfig, DigitallySignedStruct, ServerConfig,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
};
use std::sync::Arc;
use tracing::debug;

use crate::{LinkError, pairing_file::PairingFile};

/// Accepts whatever certificate the device presents
#[derive(Debug)]
pub struct NoServerNameVerification;

impl ServerCertVerifier for NoServerNameVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ED448,
        ]
    }
}

/// Client side: present the host certificate, trust any device certificate
pub fn create_client_config(pairing_file: &PairingFile) -> Result<ClientConfig, LinkError> {
    let private_key = PrivateKeyDer::from_pem_slice(&pairing_file.host_private_key)?;
    let certificate = CertificateDer::from_pem_slice(&pairing_file.host_certificate)?;

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoServerNameVerification))
        .with_client_auth_cert(vec![certificate], private_key)?;
    config.resumption = rustls::client::Resumption::disabled();

    debug!("Created TLS client config from pair record");
    Ok(config)
}

/// Server side: the host certificate doubles as the server identity, the
/// device trusts it through the shared root
pub fn create_server_config(pairing_file: &PairingFile) -> Result<ServerConfig, LinkError> {
    let private_key = PrivateKeyDer::from_pem_slice(&pairing_file.host_private_key)?;
    let certificate = CertificateDer::from_pem_slice(&pairing_file.host_certificate)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![certificate], private_key)?;
    // Tickets would arrive after a handshake-only session went plaintext
    config.send_tls13_tickets = 0;

    debug!("Created TLS server config from pair record");
    Ok(config)
}
