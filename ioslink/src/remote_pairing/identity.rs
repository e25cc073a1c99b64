//! Long-term credentials of iOS 17+ pairing
//!
//! The host keeps one [`SelfIdentity`] per install and one
//! [`DevicePairRecord`] per device it has paired with. Both are binary plists
//! under the remote pairing directory.

use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use plist::Data;
use rsa::rand_core::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::LinkError;

pub const SELF_IDENTITY_FILE: &str = "selfIdentity.plist";

#[derive(Clone)]
pub struct SelfIdentity {
    signing_key: SigningKey,
    hostname: String,
    identifier: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawSelfIdentity {
    seed: Data,
    hostname: String,
}

impl SelfIdentity {
    pub fn generate(hostname: impl Into<String>) -> Self {
        Self::from_seed(SigningKey::generate(&mut OsRng), hostname.into())
    }

    fn from_seed(signing_key: SigningKey, hostname: String) -> Self {
        // Stable across runs so the device recognizes us on pair-verify
        let identifier = uuid::Uuid::new_v3(&uuid::Uuid::NAMESPACE_DNS, hostname.as_bytes())
            .to_string()
            .to_uppercase();
        Self {
            signing_key,
            hostname,
            identifier,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub(crate) fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }

    pub async fn read_from_file(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let bytes = tokio::fs::read(path).await?;
        let raw: RawSelfIdentity = plist::from_bytes(&bytes)?;
        let seed: [u8; 32] = Vec::from(raw.seed)
            .try_into()
            .map_err(|_| LinkError::Decode("self identity seed is not 32 bytes".into()))?;
        Ok(Self::from_seed(SigningKey::from_bytes(&seed), raw.hostname))
    }

    pub async fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), LinkError> {
        let raw = RawSelfIdentity {
            seed: Data::new(self.signing_key.to_bytes().to_vec()),
            hostname: self.hostname.clone(),
        };
        let mut buf = Vec::new();
        plist::to_writer_binary(&mut buf, &raw)?;
        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, buf).await?;
        Ok(())
    }

    /// Reads the identity in `dir`, minting and saving one on first use
    pub async fn load_or_create(dir: impl AsRef<Path>, hostname: &str) -> Result<Self, LinkError> {
        let path = dir.as_ref().join(SELF_IDENTITY_FILE);
        match Self::read_from_file(&path).await {
            Ok(s) => {
                debug!("Loaded self identity {}", s.identifier);
                Ok(s)
            }
            Err(LinkError::Socket(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                let s = Self::generate(hostname);
                s.write_to_file(&path).await?;
                info!("Created self identity {} at {}", s.identifier, path.display());
                Ok(s)
            }
            Err(e) => {
                warn!("Unreadable self identity at {}: {e}", path.display());
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for SelfIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfIdentity")
            .field("hostname", &self.hostname)
            .field("identifier", &self.identifier)
            .field("public_key", &self.public_key())
            .finish()
    }
}

/// What the host remembers about a device after manual pairing
#[derive(Debug, Clone, PartialEq)]
pub struct DevicePairRecord {
    pub udid: String,
    /// The identifier the device signs pair-verify with
    pub identifier: String,
    pub public_key: VerifyingKey,
    /// The device's opack info blob, kept verbatim
    pub info: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawDevicePairRecord {
    #[serde(rename = "UDID")]
    udid: String,
    identifier: String,
    public_key: Data,
    #[serde(default)]
    info: Option<Data>,
}

impl DevicePairRecord {
    pub fn path(dir: impl AsRef<Path>, udid: &str) -> PathBuf {
        dir.as_ref().join(format!("{udid}.plist"))
    }

    pub async fn read_from_file(path: impl AsRef<Path>) -> Result<Self, LinkError> {
        let bytes = tokio::fs::read(path).await?;
        let raw: RawDevicePairRecord = plist::from_bytes(&bytes)?;
        let key: [u8; 32] = Vec::from(raw.public_key)
            .try_into()
            .map_err(|_| LinkError::Decode("device public key is not 32 bytes".into()))?;
        Ok(Self {
            udid: raw.udid,
            identifier: raw.identifier,
            public_key: VerifyingKey::from_bytes(&key)
                .map_err(|e| LinkError::Decode(format!("device public key: {e}")))?,
            info: raw.info.map(Into::into).unwrap_or_default(),
        })
    }

    pub async fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), LinkError> {
        let raw = RawDevicePairRecord {
            udid: self.udid.clone(),
            identifier: self.identifier.clone(),
            public_key: Data::new(self.public_key.to_bytes().to_vec()),
            info: Some(Data::new(self.info.clone())),
        };
        let mut buf = Vec::new();
        plist::to_writer_binary(&mut buf, &raw)?;
        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, buf).await?;
        Ok(())
    }

    /// The record for `udid` in `dir`, `None` if the device was never paired
    pub async fn load(dir: impl AsRef<Path>, udid: &str) -> Result<Option<Self>, LinkError> {
        match Self::read_from_file(Self::path(dir, udid)).await {
            Ok(r) => Ok(Some(r)),
            Err(LinkError::Socket(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_is_created_once_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let first = SelfIdentity::load_or_create(dir.path(), "build-host").await.unwrap();
        let second = SelfIdentity::load_or_create(dir.path(), "ignored").await.unwrap();

        assert_eq!(first.identifier(), second.identifier());
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(second.hostname(), "build-host");
        assert_eq!(first.identifier(), first.identifier().to_uppercase());

        // binary plist with the two documented keys
        let raw = std::fs::read(dir.path().join(SELF_IDENTITY_FILE)).unwrap();
        assert!(raw.starts_with(b"bplist00"));
        let v: plist::Dictionary = plist::from_bytes(&raw).unwrap();
        assert_eq!(v.get("Seed").and_then(|s| s.as_data()).map(|s| s.len()), Some(32));
        assert_eq!(v.get("Hostname").and_then(|s| s.as_string()), Some("build-host"));
    }

    #[tokio::test]
    async fn device_record_is_keyed_by_udid() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DevicePairRecord::load(dir.path(), "udid0").await.unwrap().is_none());

        let record = DevicePairRecord {
            udid: "udid0".into(),
            identifier: "device-identifier".into(),
            public_key: SelfIdentity::generate("device").public_key(),
            info: vec![0xe0],
        };
        record
            .write_to_file(DevicePairRecord::path(dir.path(), "udid0"))
            .await
            .unwrap();
        assert_eq!(
            DevicePairRecord::load(dir.path(), "udid0").await.unwrap(),
            Some(record)
        );
    }
}
