//! Lockdown client
//!
//! Lockdown listens on port 62078 on every device and brokers access to all
//! other services. A connection moves from unsessioned to sessioned once
//! `StartSession` succeeds, and to TLS when the device asks for it.

use std::time::Duration;

use plist::Value;
use tracing::{debug, info, warn};

use crate::{
    Connection, LinkError, TlsState, host::ProductVersion, pairing_file::PairingFile,
    provider::DeviceProvider,
};

/// Fixed device-side Lockdown port
pub const LOCKDOWND_PORT: u16 = 62078;

/// Upper bound on waiting for the user to answer the trust dialog
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);
const PAIRING_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Services that authenticate with a TLS handshake and then talk plaintext
pub const HANDSHAKE_ONLY_SERVICES: &[&str] = &[
    "com.apple.instruments.remoteserver",
    "com.apple.accessibility.axAuditDaemon.remoteserver",
    "com.apple.testmanagerd.lockdown",
    "com.apple.debugserver",
];

/// A Lockdown session scoped to one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub ssl_enabled: bool,
}

/// What `StartService` handed back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedService {
    pub service: String,
    pub port: u16,
    pub enable_service_ssl: bool,
}

impl StartedService {
    /// Whether the service wants a full TLS session or only the handshake
    pub fn handshake_only(&self) -> bool {
        HANDSHAKE_ONLY_SERVICES.contains(&self.service.as_str())
    }
}

/// Client for the Lockdown service
#[derive(Debug)]
pub struct LockdownClient {
    pub connection: Connection,
    session: Option<Session>,
}

impl LockdownClient {
    /// Opens a fresh connection to Lockdown through the provider
    pub async fn connect(provider: &dyn DeviceProvider) -> Result<Self, LinkError> {
        let connection = provider.connect(LOCKDOWND_PORT).await?;
        Ok(Self::new(connection))
    }

    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            session: None,
        }
    }

    /// The active session, if `StartSession` succeeded
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn request(&self, name: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().into());
        req.insert("Request".into(), name.into());
        req
    }

    /// Asks Lockdown to identify itself, `com.apple.mobile.lockdown` on a
    /// healthy device
    pub async fn query_type(&mut self) -> Result<String, LinkError> {
        let req = self.request("QueryType");
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let res = self.connection.read_plist().await?;
        match res.get("Type").and_then(|t| t.as_string()) {
            Some(t) => Ok(t.to_string()),
            None => Err(LinkError::UnexpectedResponse),
        }
    }

    /// Reads a value, optionally scoped to a domain. Without a key the device
    /// returns the whole domain as a dictionary.
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, LinkError> {
        let mut req = self.request("GetValue");
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let mut res = self.connection.read_plist().await?;
        match res.remove("Value") {
            Some(v) => Ok(v),
            None => Err(LinkError::UnexpectedResponse),
        }
    }

    /// Every value in the default domain
    pub async fn get_all_values(&mut self) -> Result<plist::Dictionary, LinkError> {
        match self.get_value(None, None).await? {
            Value::Dictionary(d) => Ok(d),
            _ => Err(LinkError::UnexpectedResponse),
        }
    }

    pub async fn set_value(
        &mut self,
        key: impl Into<String>,
        value: Value,
        domain: Option<&str>,
    ) -> Result<(), LinkError> {
        let mut req = self.request("SetValue");
        req.insert("Key".into(), key.into().into());
        req.insert("Value".into(), value);
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        self.connection.read_plist().await?;
        Ok(())
    }

    /// Parses the device's `ProductVersion`
    pub async fn product_version(&mut self) -> Result<ProductVersion, LinkError> {
        match self.get_value(Some("ProductVersion"), None).await? {
            Value::String(v) => v.parse(),
            _ => Err(LinkError::UnexpectedResponse),
        }
    }

    /// Starts a session with the record's `HostID` and `SystemBUID`, switching
    /// the connection to TLS when the device asks for it
    pub async fn start_session(&mut self, pairing_file: &PairingFile) -> Result<Session, LinkError> {
        let mut req = self.request("StartSession");
        req.insert("HostID".into(), pairing_file.host_id.clone().into());
        req.insert("SystemBUID".into(), pairing_file.system_buid.clone().into());
        self.connection.send_plist(Value::Dictionary(req)).await?;

        let res = self.connection.read_plist().await?;
        let session_id = match res.get("SessionID").and_then(|s| s.as_string()) {
            Some(s) => s.to_string(),
            None => {
                warn!("StartSession reply carries no SessionID");
                return Err(LinkError::UnexpectedResponse);
            }
        };
        let ssl_enabled = res
            .get("EnableSessionSSL")
            .and_then(|s| s.as_boolean())
            .unwrap_or(false);

        if ssl_enabled {
            self.connection.enable_session_ssl(pairing_file).await?;
        }
        debug!("Lockdown session {session_id} started, ssl {ssl_enabled}");

        let session = Session {
            session_id,
            ssl_enabled,
        };
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Ends the session and drops back to plaintext on the same socket
    pub async fn stop_session(&mut self) -> Result<(), LinkError> {
        let session = match self.session.take() {
            Some(s) => s,
            None => return Err(LinkError::SessionInactive),
        };
        let mut req = self.request("StopSession");
        req.insert("SessionID".into(), session.session_id.into());
        self.connection.send_plist(Value::Dictionary(req)).await?;
        self.connection.read_plist().await?;

        if self.connection.tls_state() != TlsState::Plaintext {
            self.connection.disable_session_ssl().await?;
        }
        Ok(())
    }

    /// Asks Lockdown to start `service` and reports where it listens
    pub async fn start_service(
        &mut self,
        service: impl Into<String>,
    ) -> Result<StartedService, LinkError> {
        let service = service.into();
        let mut req = self.request("StartService");
        req.insert("Service".into(), service.clone().into());
        self.connection.send_plist(Value::Dictionary(req)).await?;

        let res = match self.connection.read_plist().await {
            Ok(r) => r,
            Err(LinkError::ServiceNotFound(s)) => {
                if HANDSHAKE_ONLY_SERVICES.contains(&service.as_str()) {
                    warn!("{service} is missing, is the developer disk image mounted?");
                }
                return Err(LinkError::ServiceNotFound(s));
            }
            Err(e) => return Err(e),
        };

        let port = match res.get("Port").and_then(|p| p.as_unsigned_integer()) {
            Some(p) => u16::try_from(p).map_err(|_| LinkError::UnexpectedResponse)?,
            None => {
                warn!("StartService reply for {service} has no port");
                return Err(LinkError::UnexpectedResponse);
            }
        };
        // Absent over USB on older releases
        let enable_service_ssl = res
            .get("EnableServiceSSL")
            .and_then(|s| s.as_boolean())
            .unwrap_or(false);

        Ok(StartedService {
            service,
            port,
            enable_service_ssl,
        })
    }

    /// Mints a fresh PKI and asks the device to trust this host.
    ///
    /// Waits while the trust dialog is showing, up to [`PAIRING_TIMEOUT`].
    /// The returned record is not persisted anywhere, see [`pair_and_save`]
    /// for the full flow.
    #[cfg(feature = "pair")]
    pub async fn pair(
        &mut self,
        host_id: impl Into<String>,
        system_buid: impl Into<String>,
    ) -> Result<PairingFile, LinkError> {
        let host_id = host_id.into();
        let system_buid = system_buid.into();

        let device_public_key = match self.get_value(Some("DevicePublicKey"), None).await? {
            Value::Data(d) => d,
            _ => {
                warn!("DevicePublicKey is not data");
                return Err(LinkError::UnexpectedResponse);
            }
        };
        let wifi_mac_address = match self.get_value(Some("WiFiAddress"), None).await? {
            Value::String(s) => s,
            _ => {
                warn!("WiFiAddress is not a string");
                return Err(LinkError::UnexpectedResponse);
            }
        };

        let ca = crate::ca::generate_certificates(&device_public_key)?;

        let mut record = plist::Dictionary::new();
        record.insert("DeviceCertificate".into(), Value::Data(ca.device_cert.clone()));
        record.insert("HostCertificate".into(), Value::Data(ca.host_cert.clone()));
        record.insert("RootCertificate".into(), Value::Data(ca.root_cert.clone()));
        record.insert("SystemBUID".into(), system_buid.clone().into());
        record.insert("HostID".into(), host_id.clone().into());

        let mut options = plist::Dictionary::new();
        options.insert("ExtendedPairingErrors".into(), true.into());

        let mut req = self.request("Pair");
        req.insert("PairRecord".into(), Value::Dictionary(record));
        req.insert("ProtocolVersion".into(), "2".into());
        req.insert("PairingOptions".into(), Value::Dictionary(options));
        let req = Value::Dictionary(req);

        let started = tokio::time::Instant::now();
        let res = loop {
            self.connection.send_plist(req.clone()).await?;
            match self.connection.read_plist().await {
                Ok(res) => break res,
                Err(LinkError::PairingDialogPending) => {
                    if started.elapsed() >= PAIRING_TIMEOUT {
                        warn!("Trust dialog was not answered in time");
                        return Err(LinkError::PairingDialogPending);
                    }
                    info!("Waiting for the user to trust this host");
                    tokio::time::sleep(PAIRING_RETRY_INTERVAL).await;
                }
                Err(LinkError::Lockdown { error, .. }) if error == "InvalidPairRecord" => {
                    return Err(LinkError::CertificateRejected);
                }
                Err(e) => return Err(e),
            }
        };

        let escrow_bag = res
            .get("EscrowBag")
            .and_then(|e| e.as_data())
            .map(|e| e.to_vec())
            .unwrap_or_default();

        Ok(PairingFile {
            device_certificate: ca.device_cert,
            host_private_key: ca.host_key,
            host_certificate: ca.host_cert,
            root_private_key: ca.root_key,
            root_certificate: ca.root_cert,
            system_buid,
            host_id,
            escrow_bag,
            wifi_mac_address,
            udid: None,
        })
    }
}

impl From<Connection> for LockdownClient {
    fn from(value: Connection) -> Self {
        Self::new(value)
    }
}

/// Opens Lockdown and starts a session with the provider's pair record
pub async fn connect_lockdown_with_session(
    provider: &dyn DeviceProvider,
) -> Result<LockdownClient, LinkError> {
    let pairing_file = provider.get_pairing_file().await?;
    let mut lockdown = LockdownClient::connect(provider).await?;
    lockdown.start_session(&pairing_file).await?;
    Ok(lockdown)
}

/// Applies the TLS mode a started service asks for to a fresh connection
pub async fn upgrade_service_connection(
    connection: &mut Connection,
    started: &StartedService,
    pairing_file: &PairingFile,
) -> Result<(), LinkError> {
    if !started.enable_service_ssl {
        return Ok(());
    }
    if started.handshake_only() {
        debug!("{} authenticates with a TLS handshake only", started.service);
        connection
            .enable_session_ssl_handshake_only(pairing_file)
            .await
    } else {
        connection.enable_session_ssl(pairing_file).await
    }
}

/// Opens the port a service was started on. The Lockdown connection is never
/// reused, every service gets a fresh connection.
pub async fn connect_service(
    provider: &dyn DeviceProvider,
    started: &StartedService,
    pairing_file: &PairingFile,
) -> Result<Connection, LinkError> {
    let mut connection = provider.connect(started.port).await?;
    upgrade_service_connection(&mut connection, started, pairing_file).await?;
    Ok(connection)
}

/// Starts `service` through a sessioned Lockdown and connects to it
pub async fn start_service(
    provider: &dyn DeviceProvider,
    service: &str,
) -> Result<Connection, LinkError> {
    let pairing_file = provider.get_pairing_file().await?;
    let mut lockdown = LockdownClient::connect(provider).await?;
    lockdown.start_session(&pairing_file).await?;
    let started = lockdown.start_service(service).await?;
    debug!("{service} listening on device port {}", started.port);
    connect_service(provider, &started, &pairing_file).await
}

/// Pairs with a device attached through usbmuxd and persists the record both
/// in usbmuxd and in the host's mirror
#[cfg(all(feature = "pair", feature = "usbmuxd"))]
pub async fn pair_and_save(
    host: &crate::Host,
    udid: &str,
    device_id: u32,
) -> Result<PairingFile, LinkError> {
    let provider = crate::provider::UsbmuxdProvider::from_host(host, udid, device_id);
    let system_buid = host.usbmuxd.connect().await?.get_buid().await?;
    let host_id = uuid::Uuid::new_v4().to_string().to_uppercase();

    let mut lockdown = LockdownClient::connect(&provider).await?;
    let mut record = tokio::time::timeout(
        PAIRING_TIMEOUT + PAIRING_RETRY_INTERVAL,
        lockdown.pair(host_id, system_buid),
    )
    .await
    .map_err(|_| LinkError::Timeout)??;
    record.udid = Some(udid.to_string());

    host.usbmuxd
        .connect()
        .await?
        .save_pair_record(device_id, udid, &record)
        .await?;
    host.write_mirrored_pair_record_async(udid, &record).await?;
    info!("Paired with {udid}");
    Ok(record)
}

#[cfg(all(test, feature = "pair"))]
mod tests {
    use super::*;
    use crate::pairing_file::tests::minted_pairing_file;
    use rsa::pkcs1::EncodeRsaPublicKey;

    fn field<'a>(d: &'a plist::Dictionary, key: &str) -> Option<&'a str> {
        d.get(key).and_then(|v| v.as_string())
    }

    fn reply(entries: &[(&str, Value)]) -> Value {
        let mut d = plist::Dictionary::new();
        for (k, v) in entries {
            d.insert((*k).into(), v.clone());
        }
        Value::Dictionary(d)
    }

    fn pipe() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection::new(Box::new(a), "test"),
            Connection::new(Box::new(b), "device"),
        )
    }

    #[tokio::test]
    async fn unpaired_device_is_paired_then_sessioned_over_tls() {
        let (client, mut device) = pipe();
        let mut lockdown = LockdownClient::new(client);

        let device_task = tokio::spawn(async move {
            let req = device.read_plist().await.unwrap();
            assert_eq!(field(&req, "Request"), Some("StartSession"));
            device
                .send_plist(reply(&[
                    ("Request", "StartSession".into()),
                    ("Error", "InvalidHostID".into()),
                ]))
                .await
                .unwrap();

            let device_key = crate::ca::generate_rsa_key().unwrap();
            let device_pem = rsa::RsaPublicKey::from(&device_key)
                .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
                .unwrap();
            let req = device.read_plist().await.unwrap();
            assert_eq!(field(&req, "Key"), Some("DevicePublicKey"));
            device
                .send_plist(reply(&[("Value", Value::Data(device_pem.into_bytes()))]))
                .await
                .unwrap();
            let req = device.read_plist().await.unwrap();
            assert_eq!(field(&req, "Key"), Some("WiFiAddress"));
            device
                .send_plist(reply(&[("Value", "a0:b1:c2:d3:e4:f5".into())]))
                .await
                .unwrap();

            let req = device.read_plist().await.unwrap();
            assert_eq!(field(&req, "Request"), Some("Pair"));
            device
                .send_plist(reply(&[
                    ("Request", "Pair".into()),
                    ("Error", "PairingDialogResponsePending".into()),
                ]))
                .await
                .unwrap();
            let req = device.read_plist().await.unwrap();
            let record = req.get("PairRecord").and_then(|r| r.as_dictionary()).unwrap();
            let host_id = field(record, "HostID").unwrap().to_string();
            device
                .send_plist(reply(&[("EscrowBag", Value::Data(vec![7; 16]))]))
                .await
                .unwrap();

            let req = device.read_plist().await.unwrap();
            assert_eq!(field(&req, "HostID"), Some(host_id.as_str()));
            device
                .send_plist(reply(&[
                    ("EnableSessionSSL", true.into()),
                    ("SessionID", "F00D".into()),
                ]))
                .await
                .unwrap();
            device
                .enable_session_ssl_server_mode(&minted_pairing_file())
                .await
                .unwrap();

            let req = device.read_plist().await.unwrap();
            assert_eq!(field(&req, "Key"), Some("ProductVersion"));
            device
                .send_plist(reply(&[("Value", "17.4.1".into())]))
                .await
                .unwrap();
        });

        let stale = PairingFile {
            host_id: "UNKNOWN".into(),
            ..minted_pairing_file()
        };
        assert!(matches!(
            lockdown.start_session(&stale).await,
            Err(LinkError::InvalidHostID)
        ));

        let record = lockdown.pair("HOST-ID-1", "BUID-1").await.unwrap();
        assert_eq!(record.escrow_bag, vec![7; 16]);
        assert_eq!(record.wifi_mac_address, "a0:b1:c2:d3:e4:f5");

        let session = lockdown.start_session(&record).await.unwrap();
        assert!(session.ssl_enabled);
        assert!(!session.session_id.is_empty());
        assert_eq!(
            lockdown.connection.tls_state(),
            TlsState::Tls(crate::TlsRole::Client)
        );
        assert_eq!(
            lockdown.product_version().await.unwrap(),
            ProductVersion::new(17, 4, 1)
        );
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn skipping_tls_after_start_session_fails() {
        let (mut client, mut device) = pipe();

        let device_task = tokio::spawn(async move {
            device.read_plist().await.unwrap();
            device
                .send_plist(reply(&[
                    ("EnableSessionSSL", true.into()),
                    ("SessionID", "F00D".into()),
                ]))
                .await
                .unwrap();
            assert!(
                device
                    .enable_session_ssl_server_mode(&minted_pairing_file())
                    .await
                    .is_err()
            );
        });

        let mut req = plist::Dictionary::new();
        req.insert("Request".into(), "StartSession".into());
        client.send_plist(Value::Dictionary(req)).await.unwrap();
        client.read_plist().await.unwrap();

        let mut req = plist::Dictionary::new();
        req.insert("Request".into(), "GetValue".into());
        client.send_plist(Value::Dictionary(req)).await.unwrap();

        device_task.await.unwrap();
        assert!(matches!(
            client.read_plist().await,
            Err(LinkError::Socket(_))
        ));
    }

    #[tokio::test]
    async fn stop_session_resumes_plaintext() {
        let (client, mut device) = pipe();
        let mut lockdown = LockdownClient::new(client);
        let record = minted_pairing_file();

        let device_task = tokio::spawn(async move {
            device.read_plist().await.unwrap();
            device
                .send_plist(reply(&[
                    ("EnableSessionSSL", true.into()),
                    ("SessionID", "F00D".into()),
                ]))
                .await
                .unwrap();
            device
                .enable_session_ssl_server_mode(&minted_pairing_file())
                .await
                .unwrap();

            let req = device.read_plist().await.unwrap();
            assert_eq!(field(&req, "Request"), Some("StopSession"));
            assert_eq!(field(&req, "SessionID"), Some("F00D"));
            device
                .send_plist(reply(&[("Request", "StopSession".into())]))
                .await
                .unwrap();
            device.disable_session_ssl().await.unwrap();

            let req = device.read_plist().await.unwrap();
            assert_eq!(field(&req, "Request"), Some("QueryType"));
            device
                .send_plist(reply(&[("Type", "com.apple.mobile.lockdown".into())]))
                .await
                .unwrap();
        });

        lockdown.start_session(&record).await.unwrap();
        lockdown.stop_session().await.unwrap();
        assert_eq!(lockdown.connection.tls_state(), TlsState::Plaintext);
        assert!(lockdown.session().is_none());
        assert_eq!(
            lockdown.query_type().await.unwrap(),
            "com.apple.mobile.lockdown"
        );
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn start_service_reports_port_and_ssl() {
        let (client, mut device) = pipe();
        let mut lockdown = LockdownClient::new(client);

        let device_task = tokio::spawn(async move {
            let req = device.read_plist().await.unwrap();
            assert_eq!(
                field(&req, "Service"),
                Some("com.apple.instruments.remoteserver")
            );
            device
                .send_plist(reply(&[
                    ("Service", "com.apple.instruments.remoteserver".into()),
                    ("Port", 49152u64.into()),
                    ("EnableServiceSSL", true.into()),
                ]))
                .await
                .unwrap();

            device.read_plist().await.unwrap();
            device
                .send_plist(reply(&[
                    ("Request", "StartService".into()),
                    ("Service", "com.apple.nope".into()),
                    ("Error", "InvalidService".into()),
                ]))
                .await
                .unwrap();
        });

        let started = lockdown
            .start_service("com.apple.instruments.remoteserver")
            .await
            .unwrap();
        assert_eq!(started.port, 49152);
        assert!(started.enable_service_ssl);
        assert!(started.handshake_only());

        match lockdown.start_service("com.apple.nope").await {
            Err(LinkError::ServiceNotFound(s)) => assert_eq!(s, "com.apple.nope"),
            other => panic!("unexpected {other:?}"),
        }
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_only_services_continue_in_plaintext() {
        let (mut client, mut device) = pipe();
        let started = StartedService {
            service: "com.apple.testmanagerd.lockdown".into(),
            port: 1,
            enable_service_ssl: true,
        };

        let device_task = tokio::spawn(async move {
            device
                .enable_session_ssl_server_mode_handshake_only(&minted_pairing_file())
                .await
                .unwrap();
            device.send_raw(b"hello").await.unwrap();
        });

        upgrade_service_connection(&mut client, &started, &minted_pairing_file())
            .await
            .unwrap();
        assert_eq!(client.tls_state(), TlsState::Plaintext);
        assert_eq!(client.read_raw(5).await.unwrap(), b"hello");
        device_task.await.unwrap();
    }
}
