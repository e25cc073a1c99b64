//! Device activation through `com.apple.mobileactivationd`
//!
//! The daemon answers one command per connection, so every command opens a
//! fresh service connection. Activation relays two of its blobs to Apple's
//! activation servers and hands the answers back.

use std::{future::Future, pin::Pin, time::Duration};

use plist::{Dictionary, Value};
use tracing::{debug, info};

use crate::{Connection, LinkError, lockdown, provider::DeviceProvider, util};

pub const SERVICE_NAME: &str = "com.apple.mobileactivationd";
pub const DRM_HANDSHAKE_URL: &str = "https://albert.apple.com/deviceservices/drmHandshake";
pub const DEVICE_ACTIVATION_URL: &str = "https://albert.apple.com/deviceservices/deviceActivation";
const USER_AGENT: &str = "iOS Device Activator (MobileActivation-592.103.2)";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const BASEBAND_WAIT_COUNT: u64 = 90;

type OpenFuture<'a> = Pin<Box<dyn Future<Output = Result<Connection, LinkError>> + Send + 'a>>;
type Opener<'a> = Box<dyn Fn() -> OpenFuture<'a> + Send + Sync + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    AlreadyActivated,
    Activated,
}

pub struct ActivationClient<'a> {
    open: Opener<'a>,
    provider: Option<&'a dyn DeviceProvider>,
    http: reqwest::Client,
    handshake_url: String,
    activation_url: String,
}

impl std::fmt::Debug for ActivationClient<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationClient")
            .field("provider", &self.provider)
            .field("handshake_url", &self.handshake_url)
            .field("activation_url", &self.activation_url)
            .finish()
    }
}

impl<'a> ActivationClient<'a> {
    pub fn new(provider: &'a dyn DeviceProvider) -> Result<Self, LinkError> {
        let open: Opener<'a> = Box::new(move || -> OpenFuture<'a> {
            Box::pin(lockdown::start_service(provider, SERVICE_NAME))
        });
        Self::with_opener(open, Some(provider))
    }

    fn with_opener(
        open: Opener<'a>,
        provider: Option<&'a dyn DeviceProvider>,
    ) -> Result<Self, LinkError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            open,
            provider,
            http,
            handshake_url: DRM_HANDSHAKE_URL.to_string(),
            activation_url: DEVICE_ACTIVATION_URL.to_string(),
        })
    }

    /// Points the client at other activation servers
    pub fn with_endpoints(
        mut self,
        handshake_url: impl Into<String>,
        activation_url: impl Into<String>,
    ) -> Self {
        self.handshake_url = handshake_url.into();
        self.activation_url = activation_url.into();
        self
    }

    async fn command(&self, command: &str, mut extra: Dictionary) -> Result<Dictionary, LinkError> {
        let mut connection = (self.open)().await?;
        extra.insert("Command".into(), command.into());
        connection.send_plist(Value::Dictionary(extra)).await?;
        connection.read_plist().await
    }

    async fn command_value(&self, command: &str, extra: Dictionary) -> Result<Dictionary, LinkError> {
        let mut res = self.command(command, extra).await?;
        match res.remove("Value") {
            Some(Value::Dictionary(d)) => Ok(d),
            _ => Err(LinkError::ActivationFailed(format!(
                "{command} returned no value dictionary"
            ))),
        }
    }

    /// The device's `ActivationState`, read from Lockdown when the daemon
    /// does not answer
    pub async fn state(&self) -> Result<String, LinkError> {
        let res = self
            .command("GetActivationStateRequest", Dictionary::new())
            .await;
        if let Ok(res) = &res {
            if let Some(v) = res.get("Value").and_then(Value::as_string) {
                return Ok(v.to_string());
            }
        }
        let Some(provider) = self.provider else {
            return Err(res.err().unwrap_or(LinkError::UnexpectedResponse));
        };

        debug!("mobileactivationd gave no state, asking Lockdown");
        let mut lockdown = lockdown::connect_lockdown_with_session(provider).await?;
        lockdown
            .get_value(Some("ActivationState"), None)
            .await?
            .as_string()
            .map(str::to_string)
            .ok_or(LinkError::UnexpectedResponse)
    }

    pub async fn activated(&self) -> Result<bool, LinkError> {
        Ok(self.state().await? == "Activated")
    }

    /// The daemon does not report whether this worked
    pub async fn deactivate(&self) -> Result<(), LinkError> {
        self.command("DeactivateRequest", Dictionary::new()).await?;
        Ok(())
    }

    /// Runs the session activation flow unless the device is activated
    pub async fn activate(&self) -> Result<ActivationOutcome, LinkError> {
        let state = self.state().await?;
        if state == "Activated" {
            info!("Device is already activated");
            return Ok(ActivationOutcome::AlreadyActivated);
        }
        debug!("Activation state is {state}");

        let session_info = self
            .command_value("CreateTunnel1SessionInfoRequest", Dictionary::new())
            .await?;
        let handshake_response = self
            .http
            .post(&self.handshake_url)
            .header("Content-Type", "application/x-apple-plist")
            .header("Accept", "application/xml")
            .body(util::plist_to_xml_bytes(&Value::Dictionary(session_info))?)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        debug!("DRM handshake answered with {} bytes", handshake_response.len());

        let mut options = Dictionary::new();
        options.insert("BasebandWaitCount".into(), BASEBAND_WAIT_COUNT.into());
        let mut request = Dictionary::new();
        request.insert("Value".into(), Value::Data(handshake_response.to_vec()));
        request.insert("Options".into(), Value::Dictionary(options));
        let activation_info = self
            .command_value("CreateActivationInfoRequest", request)
            .await?;

        let info_xml = String::from_utf8(util::plist_to_xml_bytes(&Value::Dictionary(
            activation_info,
        ))?)?;
        let response = self
            .http
            .post(&self.activation_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "*/*")
            .body(form_body("activation-info", &info_xml)?)
            .send()
            .await?
            .error_for_status()?;

        let mut headers = Dictionary::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_string(), v.into());
            }
        }
        let record = response.bytes().await?;
        debug!("Activation server answered with {} bytes", record.len());

        let mut request = Dictionary::new();
        request.insert("Value".into(), Value::Data(record.to_vec()));
        request.insert("ActivationResponseHeaders".into(), Value::Dictionary(headers));
        self.command("HandleActivationInfoWithSessionRequest", request)
            .await?;

        info!("Device activated");
        Ok(ActivationOutcome::Activated)
    }
}

/// `key=value` with form encoding
fn form_body(key: &str, value: &str) -> Result<String, LinkError> {
    let mut url = reqwest::Url::parse("http://form.invalid/")
        .map_err(|e| LinkError::ActivationFailed(e.to_string()))?;
    url.query_pairs_mut().append_pair(key, value);
    Ok(url.query().unwrap_or_default().to_string())
}
