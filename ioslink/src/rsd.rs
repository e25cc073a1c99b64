//! Remote Service Discovery
//!
//! On iOS 17+ services are reached by port through the tunnel. RSD tells the
//! host which port serves which service, either in the RemoteXPC handshake on
//! [`RSD_PORT`] or as a JSON document.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{LinkError, ReadWrite, xpc::RemoteXpcClient};

pub use crate::xpc::RSD_PORT;

/// Describes an advertised service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RsdService {
    /// Entitlement the device requires from callers, empty if not advertised
    pub entitlement: String,
    pub port: u16,
    pub uses_remote_xpc: bool,
    pub features: Option<Vec<String>>,
    pub service_version: Option<i64>,
}

/// Service name to port lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RsdPortMap {
    pub services: HashMap<String, RsdService>,
}

#[derive(Deserialize)]
struct JsonDocument {
    #[serde(rename = "Services")]
    services: HashMap<String, JsonService>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JsonService {
    port: String,
    #[serde(default)]
    entitlement: String,
    #[serde(default)]
    properties: Option<JsonProperties>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct JsonProperties {
    #[serde(rename = "UsesRemoteXPC", default)]
    uses_remote_xpc: bool,
    #[serde(default)]
    features: Option<Vec<String>>,
    #[serde(default)]
    service_version: Option<i64>,
}

impl RsdPortMap {
    /// Parses `{"Services": {"<name>": {"Port": "<decimal>", ...}}}`
    pub fn from_json(input: &[u8]) -> Result<Self, LinkError> {
        let doc: JsonDocument = serde_json::from_slice(input)?;
        let mut services = HashMap::with_capacity(doc.services.len());
        for (name, s) in doc.services {
            let port = match s.port.parse::<u16>() {
                Ok(p) => p,
                Err(_) => {
                    warn!("Service {name} has an unparsable port {:?}", s.port);
                    continue;
                }
            };
            let props = s.properties.unwrap_or_default();
            services.insert(
                name,
                RsdService {
                    entitlement: s.entitlement,
                    port,
                    uses_remote_xpc: props.uses_remote_xpc,
                    features: props.features,
                    service_version: props.service_version,
                },
            );
        }
        Ok(Self { services })
    }

    /// Reads the `Services` dictionary of an RSD handshake
    pub fn from_plist(services: &plist::Dictionary) -> Self {
        let mut map = HashMap::new();
        for (name, service) in services {
            let Some(service) = service.as_dictionary() else {
                warn!("Service {name} is not a dictionary");
                continue;
            };
            let port = match service
                .get("Port")
                .and_then(|x| x.as_string())
                .and_then(|x| x.parse::<u16>().ok())
            {
                Some(p) => p,
                None => {
                    warn!("Service {name} did not contain a port string");
                    continue;
                }
            };
            let properties = service.get("Properties").and_then(|x| x.as_dictionary());

            map.insert(
                name.to_string(),
                RsdService {
                    entitlement: service
                        .get("Entitlement")
                        .and_then(|x| x.as_string())
                        .unwrap_or_default()
                        .to_string(),
                    port,
                    uses_remote_xpc: properties
                        .and_then(|x| x.get("UsesRemoteXPC"))
                        .and_then(|x| x.as_boolean())
                        .unwrap_or(false),
                    features: properties
                        .and_then(|x| x.get("Features"))
                        .and_then(|x| x.as_array())
                        .map(|f| {
                            f.iter()
                                .filter_map(|x| x.as_string())
                                .map(|x| x.to_string())
                                .collect()
                        }),
                    service_version: properties
                        .and_then(|x| x.get("ServiceVersion"))
                        .and_then(|x| x.as_signed_integer()),
                },
            );
        }
        Self { services: map }
    }

    pub fn get(&self, service: &str) -> Option<&RsdService> {
        self.services.get(service).or_else(|| {
            let shim = format!("{service}.shim.remote");
            let s = self.services.get(&shim);
            if s.is_some() {
                debug!("Using the port of {shim}");
            }
            s
        })
    }

    /// Port of `service`, falling back to `<service>.shim.remote`
    pub fn get_port(&self, service: &str) -> Option<u16> {
        self.get(service).map(|s| s.port)
    }

    /// Name of the service listening on `port`
    pub fn get_service(&self, port: u16) -> Option<&str> {
        self.services
            .iter()
            .find(|(_, s)| s.port == port)
            .map(|(name, _)| name.as_str())
    }

    /// Port of `service`, or [`LinkError::ServiceNotFound`]
    pub fn require_port(&self, service: &str) -> Result<u16, LinkError> {
        self.get_port(service)
            .ok_or_else(|| LinkError::ServiceNotFound(service.to_string()))
    }
}

/// Everything the device says in the RSD handshake
#[derive(Debug, Clone)]
pub struct RsdHandshake {
    pub services: RsdPortMap,
    pub protocol_version: usize,
    pub properties: HashMap<String, plist::Value>,
    pub uuid: String,
    /// `Properties.UniqueDeviceID`, when present
    pub udid: Option<String>,
}

impl RsdHandshake {
    /// Runs the RemoteXPC handshake on `socket` and reads the service
    /// directory the device sends right after it
    pub async fn new(socket: impl ReadWrite) -> Result<Self, LinkError> {
        let mut xpc_client = RemoteXpcClient::new(socket).await?;
        xpc_client.do_handshake().await?;
        let data = xpc_client.recv_root().await?;
        let data = data.as_dictionary().ok_or(LinkError::UnexpectedResponse)?;

        match data.get("MessageType").and_then(|x| x.as_string()) {
            None | Some("Handshake") => {}
            Some(t) => {
                warn!("Expected an RSD handshake, got {t}");
                return Err(LinkError::UnexpectedResponse);
            }
        }

        let services = match data.get("Services").and_then(|x| x.as_dictionary()) {
            Some(d) => RsdPortMap::from_plist(d),
            None => return Err(LinkError::UnexpectedResponse),
        };

        let protocol_version = match data
            .get("MessagingProtocolVersion")
            .and_then(|x| x.as_signed_integer())
        {
            Some(p) => p as usize,
            None => return Err(LinkError::UnexpectedResponse),
        };

        let uuid = match data.get("UUID").and_then(|x| x.as_string()) {
            Some(u) => u.to_string(),
            None => return Err(LinkError::UnexpectedResponse),
        };

        let properties = match data.get("Properties").and_then(|x| x.as_dictionary()) {
            Some(d) => d
                .into_iter()
                .map(|(name, prop)| (name.to_owned(), prop.to_owned()))
                .collect::<HashMap<String, plist::Value>>(),
            None => return Err(LinkError::UnexpectedResponse),
        };
        let udid = properties
            .get("UniqueDeviceID")
            .and_then(|x| x.as_string())
            .map(|x| x.to_string());

        debug!(
            "RSD advertises {} services for {}",
            services.services.len(),
            udid.as_deref().unwrap_or("an unknown device")
        );
        Ok(Self {
            services,
            protocol_version,
            properties,
            uuid,
            udid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xpc::{Dictionary, XpcObject, tests::FakeXpcDevice};

    #[test]
    fn json_lookup_with_shim_fallback() {
        let map = RsdPortMap::from_json(
            br#"{"Services": {
                "com.apple.dt.testmanagerd.remote": {"Port": "50340"},
                "com.apple.syslog_relay.shim.remote": {"Port": "50343", "Properties": {"UsesRemoteXPC": false}}
            }}"#,
        )
        .unwrap();

        assert_eq!(map.get_port("com.apple.dt.testmanagerd.remote"), Some(50340));
        assert_eq!(map.get_port("com.apple.syslog_relay"), Some(50343));
        assert_eq!(map.get_port("com.apple.afc"), None);
        assert_eq!(
            map.get_service(50343),
            Some("com.apple.syslog_relay.shim.remote")
        );
        assert!(matches!(
            map.require_port("com.apple.afc"),
            Err(LinkError::ServiceNotFound(s)) if s == "com.apple.afc"
        ));
    }

    fn service(port: &str, remote_xpc: bool) -> XpcObject {
        let mut props = Dictionary::new();
        props.insert("UsesRemoteXPC".into(), XpcObject::Bool(remote_xpc));
        props.insert(
            "Features".into(),
            XpcObject::Array(vec![XpcObject::String("com.apple.feature".into())]),
        );
        props.insert("ServiceVersion".into(), XpcObject::Int64(1));
        let mut d = Dictionary::new();
        d.insert(
            "Entitlement".into(),
            XpcObject::String("com.apple.private.test".into()),
        );
        d.insert("Port".into(), XpcObject::String(port.into()));
        d.insert("Properties".into(), XpcObject::Dictionary(props));
        XpcObject::Dictionary(d)
    }

    #[tokio::test]
    async fn handshake_reads_the_service_directory() {
        let (host, device) = tokio::io::duplex(1 << 16);
        let device_task = tokio::spawn(async move {
            let mut device = FakeXpcDevice::accept(device).await;
            device.expect_handshake().await;

            let mut services = Dictionary::new();
            services.insert(
                "com.apple.mobile.lockdown.remote.trusted".into(),
                service("49152", false),
            );
            services.insert(
                "com.apple.coredevice.appservice".into(),
                service("49153", true),
            );
            services.insert("broken".into(), XpcObject::String("no".into()));

            let mut properties = Dictionary::new();
            properties.insert(
                "UniqueDeviceID".into(),
                XpcObject::String("00008110-000A".into()),
            );
            let mut root = Dictionary::new();
            root.insert("MessageType".into(), XpcObject::String("Handshake".into()));
            root.insert("MessagingProtocolVersion".into(), XpcObject::UInt64(7));
            root.insert("Services".into(), XpcObject::Dictionary(services));
            root.insert("Properties".into(), XpcObject::Dictionary(properties));
            root.insert("UUID".into(), XpcObject::String("A-UUID".into()));
            device.send_root(XpcObject::Dictionary(root), 0).await;
        });

        let hs = RsdHandshake::new(host).await.unwrap();
        assert_eq!(hs.protocol_version, 7);
        assert_eq!(hs.uuid, "A-UUID");
        assert_eq!(hs.udid.as_deref(), Some("00008110-000A"));
        assert_eq!(hs.services.services.len(), 2);

        let app = hs.services.get("com.apple.coredevice.appservice").unwrap();
        assert_eq!(app.port, 49153);
        assert!(app.uses_remote_xpc);
        assert_eq!(app.entitlement, "com.apple.private.test");
        assert_eq!(app.features.as_deref(), Some(&["com.apple.feature".to_string()][..]));
        assert_eq!(app.service_version, Some(1));
        device_task.await.unwrap();
    }
}
