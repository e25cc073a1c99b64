//! Certificate minting for the classic pair record and the tunnel listener

use std::str::FromStr;

use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1::DecodeRsaPublicKey,
    pkcs1v15::{Signature, SigningKey},
    pkcs8::{EncodePrivateKey, LineEnding},
};
use sha1::Sha1;
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::EncodePem,
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::Validity,
};

use crate::LinkError;

const TEN_YEARS: std::time::Duration = std::time::Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// PEM encoded material of a freshly minted pair record
#[derive(Clone, Debug)]
pub(crate) struct CaReturn {
    pub root_cert: Vec<u8>,
    pub root_key: Vec<u8>,
    pub host_cert: Vec<u8>,
    pub host_key: Vec<u8>,
    pub device_cert: Vec<u8>,
}

fn cert_error(e: impl std::fmt::Display) -> LinkError {
    LinkError::CertificateGeneration(e.to_string())
}

/// Generates a 2048 bit RSA key from the OS rng
pub(crate) fn generate_rsa_key() -> Result<RsaPrivateKey, LinkError> {
    let mut rng = rsa::rand_core::OsRng;
    RsaPrivateKey::new(&mut rng, 2048).map_err(cert_error)
}

/// The root carries the CA profile, everything it signs is a leaf with key
/// encipherment enabled. Lockdown validates SHA1-with-RSA only.
fn make_sha1_cert(
    profile: Profile,
    signing_key: &RsaPrivateKey,
    public_key: &RsaPublicKey,
    subject: Name,
) -> Result<Certificate, LinkError> {
    let signer = SigningKey::<Sha1>::new(signing_key.clone());
    let spki = SubjectPublicKeyInfoOwned::from_key(public_key.clone()).map_err(cert_error)?;
    let builder = CertificateBuilder::new(
        profile,
        SerialNumber::new(&[1]).map_err(cert_error)?,
        Validity::from_now(TEN_YEARS).map_err(cert_error)?,
        subject,
        spki,
        &signer,
    )
    .map_err(cert_error)?;
    builder.build::<Signature>().map_err(cert_error)
}

fn leaf_profile() -> Profile {
    Profile::Leaf {
        issuer: Name::default(),
        enable_key_agreement: false,
        enable_key_encipherment: true,
    }
}

fn to_pem(cert: &Certificate) -> Result<Vec<u8>, LinkError> {
    Ok(cert.to_pem(LineEnding::LF).map_err(cert_error)?.into_bytes())
}

fn key_to_pem(key: &RsaPrivateKey) -> Result<Vec<u8>, LinkError> {
    Ok(key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(cert_error)?
        .as_bytes()
        .to_vec())
}

/// Mints root, host and device certificates for a classic pair record.
///
/// `device_public_key_pem` is the PKCS#1 PEM the device reports as
/// `DevicePublicKey`.
pub(crate) fn generate_certificates(device_public_key_pem: &[u8]) -> Result<CaReturn, LinkError> {
    let device_public_key = RsaPublicKey::from_pkcs1_pem(
        std::str::from_utf8(device_public_key_pem).map_err(cert_error)?,
    )
    .map_err(cert_error)?;

    let root_key = generate_rsa_key()?;
    let host_key = generate_rsa_key()?;

    let root_cert = make_sha1_cert(
        Profile::Root,
        &root_key,
        &RsaPublicKey::from(&root_key),
        Name::default(),
    )?;
    let host_cert = make_sha1_cert(
        leaf_profile(),
        &root_key,
        &RsaPublicKey::from(&host_key),
        Name::default(),
    )?;
    let device_cert = make_sha1_cert(
        leaf_profile(),
        &root_key,
        &device_public_key,
        Name::from_str("CN=Device").map_err(cert_error)?,
    )?;

    Ok(CaReturn {
        root_cert: to_pem(&root_cert)?,
        root_key: key_to_pem(&root_key)?,
        host_cert: to_pem(&host_cert)?,
        host_key: key_to_pem(&host_key)?,
        device_cert: to_pem(&device_cert)?,
    })
}

/// Self-signed SHA256-with-RSA certificate presented on the QUIC tunnel
#[cfg(feature = "tunnel")]
pub(crate) fn self_signed_sha256(key: &RsaPrivateKey) -> Result<Certificate, LinkError> {
    let signer = SigningKey::<sha2::Sha256>::new(key.clone());
    let spki =
        SubjectPublicKeyInfoOwned::from_key(RsaPublicKey::from(key)).map_err(cert_error)?;
    let builder = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::new(&[1]).map_err(cert_error)?,
        Validity::from_now(TEN_YEARS).map_err(cert_error)?,
        Name::from_str("CN=ioslink").map_err(cert_error)?,
        spki,
        &signer,
    )
    .map_err(cert_error)?;
    builder.build::<Signature>().map_err(cert_error)
}
