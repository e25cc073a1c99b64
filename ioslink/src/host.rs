//! Explicit context objects shared by every call
//!
//! A [`Host`] carries what would otherwise be process-wide state: where
//! usbmuxd listens, where pair records live, and the label sent with every
//! request. A [`Device`] is one attached device as usbmuxd reported it.

use std::{
    fmt::Display,
    fs::TryLockError,
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use tracing::{debug, warn};

use crate::{LinkError, pairing_file::PairingFile};

/// Environment variable overriding the pair record directory
pub const PAIR_DIR_ENV: &str = "IOSLINK_PAIR_DIR";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Host-wide configuration
#[derive(Debug, Clone)]
pub struct Host {
    #[cfg(feature = "usbmuxd")]
    pub usbmuxd: crate::usbmuxd::UsbmuxdAddr,
    pub pair_dir: PathBuf,
    pub label: String,
}

impl Host {
    /// Builds the host context from the environment
    pub fn from_env() -> Self {
        Self {
            #[cfg(feature = "usbmuxd")]
            usbmuxd: crate::usbmuxd::UsbmuxdAddr::from_env_var().unwrap_or_default(),
            pair_dir: default_pair_dir(),
            label: "ioslink".to_string(),
        }
    }

    pub fn with_pair_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pair_dir = dir.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Where the host mirrors the classic pair record for `udid`
    pub fn pair_record_path(&self, udid: &str) -> PathBuf {
        self.pair_dir.join(format!("{udid}.plist"))
    }

    /// Directory of the iOS 17+ self identity and device pair records
    pub fn remote_pair_dir(&self) -> PathBuf {
        self.pair_dir.join("remote")
    }

    /// Reads the host's mirror of the classic pair record
    pub fn read_mirrored_pair_record(&self, udid: &str) -> Result<PairingFile, LinkError> {
        let path = self.pair_record_path(udid);
        if !path.exists() {
            return Err(LinkError::NotPaired(format!(
                "{udid}: no record at {}, run `ioslink pair` with the device attached",
                path.display()
            )));
        }
        let _lock = self.lock_udid(udid)?;
        PairingFile::read_from_file(path)
    }

    /// Writes the host's mirror of the classic pair record
    pub fn write_mirrored_pair_record(
        &self,
        udid: &str,
        record: &PairingFile,
    ) -> Result<(), LinkError> {
        let _lock = self.lock_udid(udid)?;
        record.write_to_file(self.pair_record_path(udid))
    }

    /// Takes the per-UDID lock on the pair record directory.
    ///
    /// The lock is an advisory OS lock on `<udid>.lock`, released when the
    /// guard drops or the process exits. Blocks for up to ten seconds, so
    /// async callers go through [`Host::lock_udid_async`].
    pub fn lock_udid(&self, udid: &str) -> Result<PairDirLock, LinkError> {
        self.lock_udid_within(udid, LOCK_TIMEOUT)
    }

    /// [`Host::lock_udid`] on the blocking pool
    pub async fn lock_udid_async(&self, udid: &str) -> Result<PairDirLock, LinkError> {
        let host = self.clone();
        let udid = udid.to_string();
        tokio::task::spawn_blocking(move || host.lock_udid(&udid))
            .await
            .map_err(std::io::Error::other)?
    }

    /// [`Host::read_mirrored_pair_record`] on the blocking pool
    pub async fn read_mirrored_pair_record_async(
        &self,
        udid: &str,
    ) -> Result<PairingFile, LinkError> {
        let host = self.clone();
        let udid = udid.to_string();
        tokio::task::spawn_blocking(move || host.read_mirrored_pair_record(&udid))
            .await
            .map_err(std::io::Error::other)?
    }

    /// [`Host::write_mirrored_pair_record`] on the blocking pool
    pub async fn write_mirrored_pair_record_async(
        &self,
        udid: &str,
        record: &PairingFile,
    ) -> Result<(), LinkError> {
        let host = self.clone();
        let udid = udid.to_string();
        let record = record.clone();
        tokio::task::spawn_blocking(move || host.write_mirrored_pair_record(&udid, &record))
            .await
            .map_err(std::io::Error::other)?
    }

    fn lock_udid_within(&self, udid: &str, timeout: Duration) -> Result<PairDirLock, LinkError> {
        std::fs::create_dir_all(&self.pair_dir)?;
        let path = self.pair_dir.join(format!("{udid}.lock"));
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let start = std::time::Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => {
                    debug!("Locked pair records for {udid}");
                    return Ok(PairDirLock { file, path });
                }
                Err(TryLockError::WouldBlock) => {
                    if start.elapsed() > timeout {
                        warn!("Timed out waiting for {}", path.display());
                        return Err(LinkError::Timeout);
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(TryLockError::Error(e)) => return Err(e.into()),
            }
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_pair_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(PAIR_DIR_ENV) {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".ioslink").join("pair_records")
}

/// Held while a pair record is read or written. The lock file itself stays
/// on disk.
#[derive(Debug)]
pub struct PairDirLock {
    file: std::fs::File,
    path: PathBuf,
}

impl Drop for PairDirLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release {}: {e}", self.path.display());
        }
    }
}

/// `major.minor.patch` as reported in `ProductVersion`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProductVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ProductVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for ProductVersion {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = |required: bool| -> Result<u16, LinkError> {
            match parts.next() {
                Some(p) => p
                    .parse()
                    .map_err(|_| LinkError::Decode(format!("bad version component `{p}`"))),
                None if required => Err(LinkError::Decode(format!("bad version `{s}`"))),
                None => Ok(0),
            }
        };
        Ok(Self {
            major: next(true)?,
            minor: next(false)?,
            patch: next(false)?,
        })
    }
}

impl Display for ProductVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What the device's iOS version lets the host do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Services are reached through RSD over a tunnel (iOS 17+)
    pub supports_rsd: bool,
    /// Lockdown can hand out a CoreDeviceProxy tunnel (iOS 17.4+)
    pub userspace_tun: bool,
}

impl From<ProductVersion> for Capabilities {
    fn from(v: ProductVersion) -> Self {
        Self {
            supports_rsd: v >= ProductVersion::new(17, 0, 0),
            userspace_tun: v >= ProductVersion::new(17, 4, 0),
        }
    }
}

/// Address of a running tunnel and the RSD port behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub address: IpAddr,
    pub rsd_port: u16,
}

/// One attached device
#[derive(Debug, Clone)]
pub struct Device {
    pub udid: String,
    /// Reassigned by usbmuxd on every attach
    pub device_id: u32,
    pub product_version: Option<ProductVersion>,
    pub tunnel: Option<TunnelInfo>,
    #[cfg(feature = "rsd")]
    pub rsd: Option<crate::rsd::RsdPortMap>,
}

impl Device {
    pub fn new(udid: impl Into<String>, device_id: u32) -> Self {
        Self {
            udid: udid.into(),
            device_id,
            product_version: None,
            tunnel: None,
            #[cfg(feature = "rsd")]
            rsd: None,
        }
    }

    /// Capabilities derived from the product version, all false if the
    /// version has not been read yet
    pub fn capabilities(&self) -> Capabilities {
        self.product_version.map(Into::into).unwrap_or_default()
    }
}
