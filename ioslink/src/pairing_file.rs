//! Classic pair record handling
//!
//! A pair record holds the PKI the host minted while pairing plus the
//! identifiers Lockdown expects on every `StartSession`. Certificates and
//! keys are kept as the PEM bytes found in the record so that saving and
//! reading it back yields byte-identical fields.

use std::path::Path;

use plist::Data;
use rustls::pki_types::{CertificateDer, pem::PemObject};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::LinkError;

/// A complete classic pair record
#[derive(Clone, Debug, PartialEq)]
pub struct PairingFile {
    /// Device certificate, PEM
    pub device_certificate: Vec<u8>,
    /// Host private key, PEM
    pub host_private_key: Vec<u8>,
    /// Host certificate, PEM
    pub host_certificate: Vec<u8>,
    /// Root private key, PEM
    pub root_private_key: Vec<u8>,
    /// Root certificate, PEM
    pub root_certificate: Vec<u8>,
    /// Host identifier persisted by usbmuxd
    pub system_buid: String,
    /// Per-pairing UUID sent on every StartSession
    pub host_id: String,
    /// Escrow bag allowing access while the device is locked
    pub escrow_bag: Vec<u8>,
    pub wifi_mac_address: String,
    pub udid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    root_private_key: Data,
    root_certificate: Data,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(default)]
    escrow_bag: Option<Data>,
    #[serde(rename = "WiFiMACAddress", default)]
    wifi_mac_address: String,
    #[serde(rename = "UDID", skip_serializing_if = "Option::is_none", default)]
    udid: Option<String>,
}

impl PairingFile {
    /// Reads a pair record from disk
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    /// Writes the record to disk as an XML plist
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), LinkError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.serialize()?)?;
        Ok(())
    }

    /// Parses a pair record from plist bytes (XML or binary)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        let raw: RawPairingFile = match plist::from_bytes(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unable to parse pair record: {e:?}");
                return Err(LinkError::UnexpectedResponse);
            }
        };
        raw.try_into()
    }

    /// Parses a pair record from an already decoded plist
    pub fn from_value(v: &plist::Value) -> Result<Self, LinkError> {
        let raw: RawPairingFile = plist::from_value(v)?;
        raw.try_into()
    }

    /// The record as a plist dictionary, the shape usbmuxd stores
    pub fn to_value(&self) -> Result<plist::Value, LinkError> {
        Ok(plist::to_value(&RawPairingFile::from(self.clone()))?)
    }

    /// Serializes the record to an XML plist
    pub fn serialize(&self) -> Result<Vec<u8>, LinkError> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &RawPairingFile::from(self.clone()))?;
        Ok(buf)
    }

    pub fn host_certificate_der(&self) -> Result<CertificateDer<'static>, LinkError> {
        Ok(CertificateDer::from_pem_slice(&self.host_certificate)?)
    }

    pub fn device_certificate_der(&self) -> Result<CertificateDer<'static>, LinkError> {
        Ok(CertificateDer::from_pem_slice(&self.device_certificate)?)
    }

    pub fn root_certificate_der(&self) -> Result<CertificateDer<'static>, LinkError> {
        Ok(CertificateDer::from_pem_slice(&self.root_certificate)?)
    }
}

impl TryFrom<RawPairingFile> for PairingFile {
    type Error = LinkError;

    fn try_from(value: RawPairingFile) -> Result<Self, Self::Error> {
        let p = Self {
            device_certificate: value.device_certificate.into(),
            host_private_key: value.host_private_key.into(),
            host_certificate: value.host_certificate.into(),
            root_private_key: value.root_private_key.into(),
            root_certificate: value.root_certificate.into(),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Into::into).unwrap_or_default(),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        };
        // Fail at load time rather than at the first TLS handshake
        p.host_certificate_der()?;
        p.device_certificate_der()?;
        p.root_certificate_der()?;
        Ok(p)
    }
}

impl From<PairingFile> for RawPairingFile {
    fn from(value: PairingFile) -> Self {
        Self {
            device_certificate: Data::new(value.device_certificate),
            host_private_key: Data::new(value.host_private_key),
            host_certificate: Data::new(value.host_certificate),
            root_private_key: Data::new(value.root_private_key),
            root_certificate: Data::new(value.root_certificate),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: Some(Data::new(value.escrow_bag)),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        }
    }
}

#[cfg(all(test, feature = "pair"))]
pub(crate) mod tests {
    use super::*;

    static MINTED: std::sync::OnceLock<PairingFile> = std::sync::OnceLock::new();

    /// A record with freshly minted certificates, shared by the TLS tests
    pub(crate) fn minted_pairing_file() -> PairingFile {
        MINTED.get_or_init(mint).clone()
    }

    fn mint() -> PairingFile {
        use rsa::pkcs1::EncodeRsaPublicKey;
        let device_key = crate::ca::generate_rsa_key().unwrap();
        let device_pem = rsa::RsaPublicKey::from(&device_key)
            .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        let ca = crate::ca::generate_certificates(device_pem.as_bytes()).unwrap();
        PairingFile {
            device_certificate: ca.device_cert,
            host_private_key: ca.host_key,
            host_certificate: ca.host_cert,
            root_private_key: ca.root_key,
            root_certificate: ca.root_cert,
            system_buid: "30142955-444094379208051516".into(),
            host_id: "5C8E8F27-DF5A-4B3C-9B49-2F3C1A1E2C11".into(),
            escrow_bag: vec![0xAB; 32],
            wifi_mac_address: "a0:b1:c2:d3:e4:f5".into(),
            udid: Some("udid0".into()),
        }
    }

    #[test]
    fn persisted_record_is_byte_identical() {
        let record = minted_pairing_file();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("udid0.plist");

        record.write_to_file(&path).unwrap();
        let read = PairingFile::read_from_file(&path).unwrap();
        assert_eq!(read, record);

        let value = record.to_value().unwrap();
        assert_eq!(PairingFile::from_value(&value).unwrap(), record);
    }

    #[test]
    fn rejects_records_without_certificates() {
        let mut dict = plist::Dictionary::new();
        dict.insert("SystemBUID".into(), "buid".into());
        dict.insert("HostID".into(), "host".into());
        let mut buf = Vec::new();
        plist::Value::Dictionary(dict).to_writer_xml(&mut buf).unwrap();
        assert!(PairingFile::from_bytes(&buf).is_err());
    }
}
