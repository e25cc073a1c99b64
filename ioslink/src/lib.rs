#![doc = include_str!("../README.md")]

#[cfg(feature = "mobileactivationd")]
pub mod activation;
#[cfg(feature = "pair")]
mod ca;
#[cfg(feature = "dvt")]
pub mod dvt;
pub mod host;
pub mod lockdown;
pub mod pairing_file;
pub mod provider;
#[cfg(feature = "remote_pairing")]
pub mod remote_pairing;
#[cfg(feature = "rsd")]
pub mod rsd;
mod sni;
#[cfg(feature = "tunnel")]
pub mod tcp;
#[cfg(feature = "tunnel")]
pub mod tunnel;
#[cfg(feature = "usbmuxd")]
pub mod usbmuxd;
mod util;
#[cfg(feature = "xpc")]
pub mod xpc;

pub use host::{Device, Host};
pub use util::{pretty_print_dictionary, pretty_print_plist};

use rustls::{crypto::CryptoProvider, pki_types::ServerName};
use std::{io, pin::Pin, sync::Arc, task::Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, error, trace, warn};

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream and UnixStream implement this trait, as do the TLS
/// wrappers and the userspace tunnel streams.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Type alias for boxed device connection sockets
pub type DeviceSocket = Box<dyn ReadWrite>;

type ClientTls = tokio_rustls::client::TlsStream<DeviceSocket>;
type ServerTls = tokio_rustls::server::TlsStream<DeviceSocket>;

/// The socket underneath a [`Connection`], in whichever TLS state it is in
#[derive(Debug)]
enum Socket {
    Plain(DeviceSocket),
    Client(Box<ClientTls>),
    Server(Box<ServerTls>),
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Socket::Client(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Socket::Server(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Socket::Client(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Socket::Server(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_flush(cx),
            Socket::Client(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Socket::Server(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Socket::Client(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Socket::Server(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Which side of a TLS session this host plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// The TLS state of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Plaintext,
    Tls(TlsRole),
}

/// A duplex byte channel to usbmuxd, a device port or a tunnel endpoint.
///
/// Carries the framed plist helpers every codec above it uses, and owns the
/// in-place TLS transitions: `Plaintext -> Tls` through one of the
/// `enable_session_ssl*` calls, and `Tls -> Plaintext` through
/// [`Connection::disable_session_ssl`].
pub struct Connection {
    socket: Option<Socket>,
    label: String,
    /// Framed messages written minus framed messages read. Zero when every
    /// request has its reply, in either role.
    in_flight: isize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label)
            .field("tls", &self.tls_state())
            .finish()
    }
}

impl Connection {
    /// Creates a new connection handle around an established socket
    pub fn new(socket: DeviceSocket, label: impl Into<String>) -> Self {
        Self {
            socket: Some(Socket::Plain(socket)),
            label: label.into(),
            in_flight: 0,
        }
    }

    /// The label sent with every request on this connection
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Reports whether the socket is currently wrapped in TLS
    pub fn tls_state(&self) -> TlsState {
        match &self.socket {
            Some(Socket::Client(_)) => TlsState::Tls(TlsRole::Client),
            Some(Socket::Server(_)) => TlsState::Tls(TlsRole::Server),
            _ => TlsState::Plaintext,
        }
    }

    fn socket(&mut self) -> Result<&mut Socket, LinkError> {
        self.socket.as_mut().ok_or(LinkError::NoEstablishedConnection)
    }

    /// Performs the RSD check-in that services reached over a tunnel expect
    /// before speaking lockdown framing
    pub async fn rsd_checkin(&mut self) -> Result<(), LinkError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("ProtocolVersion".into(), "2".into());
        req.insert("Request".into(), "RSDCheckin".into());
        self.send_plist(plist::Value::Dictionary(req)).await?;

        for expected in ["RSDCheckin", "StartService"] {
            let res = self.read_plist().await?;
            match res.get("Request").and_then(|x| x.as_string()) {
                Some(r) if r == expected => {}
                _ => return Err(LinkError::UnexpectedResponse),
            }
        }
        // Two replies to one request
        self.in_flight = 0;
        Ok(())
    }

    /// Sends a plist as `<u32 BE length><XML>`
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), LinkError> {
        debug!("Sending plist: {}", pretty_print_plist(&message));
        let message = util::plist_to_xml_bytes(&message)?;
        self.send_framed(&message).await
    }

    /// Sends a plist as `<u32 BE length><binary plist>`
    pub async fn send_bplist(&mut self, message: plist::Value) -> Result<(), LinkError> {
        debug!("Sending bplist: {}", pretty_print_plist(&message));
        let message = util::plist_to_binary_bytes(&message)?;
        self.send_framed(&message).await
    }

    async fn send_framed(&mut self, message: &[u8]) -> Result<(), LinkError> {
        let socket = self.socket()?;
        let len = message.len() as u32;
        socket.write_all(&len.to_be_bytes()).await?;
        socket.write_all(message).await?;
        socket.flush().await?;
        self.in_flight += 1;
        Ok(())
    }

    /// Sends raw bytes to the device
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), LinkError> {
        let socket = self.socket()?;
        for (i, part) in message.chunks(1024 * 64).enumerate() {
            trace!("Writing chunk {i} ({} bytes)", part.len());
            socket.write_all(part).await?;
        }
        socket.flush().await?;
        Ok(())
    }

    /// Reads exactly `len` bytes from the device
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, LinkError> {
        let socket = self.socket()?;
        let mut buf = vec![0; len];
        socket.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads whatever is available, up to `max_size` bytes
    pub async fn read_any(&mut self, max_size: u32) -> Result<Vec<u8>, LinkError> {
        let socket = self.socket()?;
        let mut buf = vec![0; max_size as usize];
        let len = socket.read(&mut buf).await?;
        Ok(buf[..len].to_vec())
    }

    /// Reads one framed plist without interpreting an `Error` key
    pub async fn read_plist_value(&mut self) -> Result<plist::Value, LinkError> {
        let socket = self.socket()?;
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await?;
        let len = u32::from_be_bytes(buf);
        let mut buf = vec![0; len as usize];
        socket.read_exact(&mut buf).await?;
        self.in_flight -= 1;
        let res: plist::Value = plist::from_bytes(&buf)?;
        debug!("Received plist: {}", pretty_print_plist(&res));
        Ok(res)
    }

    /// Reads one framed plist dictionary, mapping a device `Error` key to a
    /// typed error
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, LinkError> {
        let res = match self.read_plist_value().await? {
            plist::Value::Dictionary(d) => d,
            _ => return Err(LinkError::UnexpectedResponse),
        };

        if let Some(e) = res.get("Error").and_then(|e| e.as_string()) {
            return Err(LinkError::from_device_error_type(e, &res));
        }
        Ok(res)
    }

    /// Upgrades the connection to TLS as a client, presenting the host
    /// certificate from the pair record and accepting any peer certificate
    pub async fn enable_session_ssl(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), LinkError> {
        let tls = self.client_handshake(pairing_file).await?;
        self.socket = Some(Socket::Client(Box::new(tls)));
        Ok(())
    }

    /// Upgrades the connection to TLS acting as the server, using the host
    /// certificate and key from the pair record as its identity
    pub async fn enable_session_ssl_server_mode(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), LinkError> {
        let tls = self.server_handshake(pairing_file).await?;
        self.socket = Some(Socket::Server(Box::new(tls)));
        Ok(())
    }

    /// Runs a full client handshake, then keeps talking in plaintext
    pub async fn enable_session_ssl_handshake_only(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), LinkError> {
        let tls = self.client_handshake(pairing_file).await?;
        let (inner, _) = tls.into_inner();
        self.socket = Some(Socket::Plain(inner));
        Ok(())
    }

    /// Runs a full server handshake, then keeps talking in plaintext
    pub async fn enable_session_ssl_server_mode_handshake_only(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), LinkError> {
        let tls = self.server_handshake(pairing_file).await?;
        let (inner, _) = tls.into_inner();
        self.socket = Some(Socket::Plain(inner));
        Ok(())
    }

    /// Ends the TLS session and resumes plaintext on the same socket.
    ///
    /// As the client: sends close-notify, unwraps the original socket, then
    /// drains the one record (5 byte header plus encrypted body) the peer
    /// answers with. As the server: waits for the peer's close-notify and
    /// answers it before unwrapping. Refused while a framed request is still
    /// waiting for its reply.
    pub async fn disable_session_ssl(&mut self) -> Result<(), LinkError> {
        if self.in_flight != 0 {
            warn!(
                "Refusing to drop TLS with {} framed messages unanswered",
                self.in_flight
            );
            return Err(LinkError::HandshakeFailure(
                "cannot disable TLS with requests in flight".into(),
            ));
        }
        let mut inner = match self.socket.take() {
            Some(Socket::Client(mut tls)) => {
                tls.get_mut().1.send_close_notify();
                tls.flush().await?;
                tls.into_inner().0
            }
            Some(Socket::Server(mut tls)) => {
                let mut buf = [0u8; 64];
                loop {
                    let n = tls.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    warn!("Discarding {n} bytes sent before close-notify");
                }
                tls.get_mut().1.send_close_notify();
                tls.flush().await?;
                self.socket = Some(Socket::Plain(tls.into_inner().0));
                return Ok(());
            }
            Some(Socket::Plain(s)) => {
                self.socket = Some(Socket::Plain(s));
                return Ok(());
            }
            None => return Err(LinkError::NoEstablishedConnection),
        };

        let mut header = [0u8; 5];
        inner.read_exact(&mut header).await?;
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        let mut trailing = vec![0u8; len];
        inner.read_exact(&mut trailing).await?;
        trace!("Drained {} byte TLS record after close-notify", len + 5);

        self.socket = Some(Socket::Plain(inner));
        Ok(())
    }

    async fn client_handshake(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<ClientTls, LinkError> {
        ensure_crypto_provider();
        let config = sni::create_client_config(pairing_file)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let socket = self.take_plain()?;
        let server_name = ServerName::try_from("Device")
            .map_err(|e| LinkError::HandshakeFailure(e.to_string()))?;
        connector
            .connect(server_name, socket)
            .await
            .map_err(|e| LinkError::HandshakeFailure(e.to_string()))
    }

    async fn server_handshake(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<ServerTls, LinkError> {
        ensure_crypto_provider();
        let config = sni::create_server_config(pairing_file)?;
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
        let socket = self.take_plain()?;
        acceptor
            .accept(socket)
            .await
            .map_err(|e| LinkError::HandshakeFailure(e.to_string()))
    }

    fn take_plain(&mut self) -> Result<DeviceSocket, LinkError> {
        match self.socket.take() {
            Some(Socket::Plain(s)) => Ok(s),
            Some(other) => {
                self.socket = Some(other);
                Err(LinkError::HandshakeFailure("TLS is already enabled".into()))
            }
            None => Err(LinkError::NoEstablishedConnection),
        }
    }

    /// Hands back the underlying stream, TLS included if active, for codecs
    /// that take over the socket (DTX, port forwarding)
    pub fn into_inner(self) -> Result<DeviceSocket, LinkError> {
        match self.socket {
            Some(Socket::Plain(s)) => Ok(s),
            Some(Socket::Client(s)) => Ok(Box::new(*s)),
            Some(Socket::Server(s)) => Ok(Box::new(*s)),
            None => Err(LinkError::NoEstablishedConnection),
        }
    }

    /// Shuts the write half down and drops the socket
    pub async fn close(mut self) -> Result<(), LinkError> {
        if let Some(mut s) = self.socket.take() {
            s.shutdown().await?;
        }
        Ok(())
    }
}

/// Installs the compiled-in rustls crypto provider if none is installed yet
pub(crate) fn ensure_crypto_provider() {
    if CryptoProvider::get_default().is_some() {
        return;
    }
    #[cfg(any(feature = "aws-lc", feature = "ring"))]
    {
        #[cfg(feature = "aws-lc")]
        let provider = rustls::crypto::aws_lc_rs::default_provider();
        #[cfg(all(feature = "ring", not(feature = "aws-lc")))]
        let provider = rustls::crypto::ring::default_provider();

        // A concurrent install wins the race
        if let Err(e) = CryptoProvider::install_default(provider) {
            debug!("Crypto provider already installed: {e:?}");
        }
    }
    #[cfg(not(any(feature = "aws-lc", feature = "ring")))]
    warn!("No rustls crypto provider compiled in, install one before connecting");
}

/// Comprehensive error type for every layer of the stack
#[derive(Error, Debug)]
#[repr(i32)]
#[non_exhaustive]
pub enum LinkError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error) = -1,
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error) = -2,
    #[error("TLS error")]
    Rustls(#[from] rustls::Error) = -3,
    #[error("io on plist")]
    Plist(#[from] plist::Error) = -4,
    #[error("JSON serialization failed")]
    Json(#[from] serde_json::Error) = -5,
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error) = -6,
    #[error("unexpected response from device")]
    UnexpectedResponse = -7,
    #[error("no established connection")]
    NoEstablishedConnection = -8,
    #[error("operation timed out")]
    Timeout = -9,

    #[error("usbmuxd framing is malformed: {0}")]
    MuxProtocol(String) = -10,
    #[error("usbmuxd command failed with number {0}")]
    MuxCommandFailed(u64) = -11,
    #[error("bad command")]
    UsbBadCommand = -12,
    #[error("bad device")]
    UsbBadDevice = -13,
    #[error("device refused connection")]
    UsbConnectionRefused = -14,
    #[error("usb bad version")]
    UsbBadVersion = -15,
    #[error("device not found")]
    DeviceNotFound = -16,

    #[error("lockdown request `{request}` failed: {error}")]
    Lockdown { request: String, error: String } = -20,
    #[error("this request was prohibited")]
    GetProhibited = -21,
    #[error("no SSL session is active")]
    SessionInactive = -22,
    #[error("device does not know this host")]
    InvalidHostID = -23,
    #[error("device locked")]
    DeviceLocked = -24,
    #[error("device is passcode protected")]
    PasswordProtected = -25,
    #[error("user denied pairing trust")]
    UserDeniedPairing = -26,
    #[error("device internal error: {0}")]
    InternalError(String) = -27,
    #[error("pairing trust dialog pending")]
    PairingDialogPending = -28,
    #[error("service not found: {0}")]
    ServiceNotFound(String) = -29,

    #[error("pair verification was rejected by the device")]
    CertificateRejected = -30,
    #[error("handshake failed: {0}")]
    HandshakeFailure(String) = -31,
    #[error("no pair record for {0}, pair the device first")]
    NotPaired(String) = -32,
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String) = -33,
    #[error("pairing was rejected by the device: {0}")]
    PairingRejected(String) = -34,

    #[error("malformed payload: {0}")]
    Decode(String) = -40,
    #[error("incomplete frame, need {needed} bytes, have {got}")]
    IncompleteFrame { needed: usize, got: usize } = -41,
    #[error("bad magic {0:#x}")]
    BadMagic(u64) = -42,
    #[error("proclaimed packet size does not match actual size")]
    PacketSizeMismatch = -43,

    #[error("tunnel setup failed: {0}")]
    TunnelSetupFailed(String) = -50,
    #[error("tunnel closed by peer")]
    TunnelClosed = -51,
    #[error("local network configuration failed: {0}")]
    LinkFailure(String) = -52,
    #[error("cannot parse string as IpAddr")]
    AddrParseError(#[from] std::net::AddrParseError) = -53,
    #[cfg(feature = "tunnel")]
    #[error("QUIC dial failed")]
    QuicConnect(#[from] quinn::ConnectError) = -54,
    #[cfg(feature = "tunnel")]
    #[error("QUIC connection failed")]
    QuicConnection(#[from] quinn::ConnectionError) = -55,

    #[cfg(feature = "xpc")]
    #[error("unknown http frame type {0}")]
    UnknownFrame(u8) = -60,
    #[cfg(feature = "xpc")]
    #[error("unknown http setting type {0}")]
    UnknownHttpSetting(u16) = -61,
    #[cfg(feature = "xpc")]
    #[error("unknown XPC type {0:#x}")]
    UnknownXpcType(u32) = -62,
    #[cfg(feature = "xpc")]
    #[error("malformed XPC message")]
    MalformedXpc = -63,
    #[cfg(feature = "xpc")]
    #[error("unexpected XPC version")]
    UnexpectedXpcVersion = -64,
    #[cfg(feature = "xpc")]
    #[error("invalid C string")]
    InvalidCString = -65,
    #[cfg(feature = "xpc")]
    #[error("stream reset")]
    HttpStreamReset = -66,
    #[cfg(feature = "xpc")]
    #[error("go away packet received: {0}")]
    HttpGoAway(String) = -67,

    #[cfg(feature = "dvt")]
    #[error("NSKeyedArchive error")]
    NsKeyedArchiveError(#[from] ns_keyed_archive::ConverterError) = -70,
    #[cfg(feature = "dvt")]
    #[error("unknown aux value type {0:#x}")]
    UnknownAuxType(u32) = -71,
    #[cfg(feature = "dvt")]
    #[error("unknown DTX message type {0}")]
    UnknownDtxMessageType(u32) = -72,
    #[cfg(feature = "dvt")]
    #[error("unknown channel {0}")]
    UnknownChannel(i32) = -73,
    #[cfg(feature = "dvt")]
    #[error("DTX call `{selector}` failed: {error}")]
    DtxCallFailed { selector: String, error: String } = -75,
    #[error("connection closed")]
    ConnectionClosed = -74,

    #[cfg(feature = "mobileactivationd")]
    #[error("http reqwest error")]
    Reqwest(#[from] reqwest::Error) = -80,
    #[cfg(feature = "mobileactivationd")]
    #[error("activation failed: {0}")]
    ActivationFailed(String) = -81,
}

impl LinkError {
    /// Converts a device-reported error string to a typed error.
    ///
    /// Strings without a dedicated variant keep the request name and the
    /// device's original text.
    pub(crate) fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Self {
        match e {
            "GetProhibited" => Self::GetProhibited,
            "InvalidHostID" => Self::InvalidHostID,
            "SessionInactive" => Self::SessionInactive,
            "DeviceLocked" => Self::DeviceLocked,
            "PairingDialogResponsePending" => Self::PairingDialogPending,
            "UserDeniedPairing" => Self::UserDeniedPairing,
            "PasswordProtected" => Self::PasswordProtected,
            "InvalidService" => Self::ServiceNotFound(
                context
                    .get("Service")
                    .and_then(|s| s.as_string())
                    .unwrap_or("unknown")
                    .to_string(),
            ),
            "InternalError" => Self::InternalError(
                context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string(),
            ),
            _ => {
                let request = context
                    .get("Request")
                    .and_then(|r| r.as_string())
                    .unwrap_or("unknown")
                    .to_string();
                error!("Device returned `{e}` for `{request}`");
                Self::Lockdown {
                    request,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Reports whether retrying the same call later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PairingDialogPending | Self::IncompleteFrame { .. })
    }

    /// The stable numeric code of this error
    pub fn code(&self) -> i32 {
        match self {
            LinkError::Socket(_) => -1,
            LinkError::PemParseFailed(_) => -2,
            LinkError::Rustls(_) => -3,
            LinkError::Plist(_) => -4,
            LinkError::Json(_) => -5,
            LinkError::Utf8(_) => -6,
            LinkError::UnexpectedResponse => -7,
            LinkError::NoEstablishedConnection => -8,
            LinkError::Timeout => -9,

            LinkError::MuxProtocol(_) => -10,
            LinkError::MuxCommandFailed(_) => -11,
            LinkError::UsbBadCommand => -12,
            LinkError::UsbBadDevice => -13,
            LinkError::UsbConnectionRefused => -14,
            LinkError::UsbBadVersion => -15,
            LinkError::DeviceNotFound => -16,

            LinkError::Lockdown { .. } => -20,
            LinkError::GetProhibited => -21,
            LinkError::SessionInactive => -22,
            LinkError::InvalidHostID => -23,
            LinkError::DeviceLocked => -24,
            LinkError::PasswordProtected => -25,
            LinkError::UserDeniedPairing => -26,
            LinkError::InternalError(_) => -27,
            LinkError::PairingDialogPending => -28,
            LinkError::ServiceNotFound(_) => -29,

            LinkError::CertificateRejected => -30,
            LinkError::HandshakeFailure(_) => -31,
            LinkError::NotPaired(_) => -32,
            LinkError::CertificateGeneration(_) => -33,
            LinkError::PairingRejected(_) => -34,

            LinkError::Decode(_) => -40,
            LinkError::IncompleteFrame { .. } => -41,
            LinkError::BadMagic(_) => -42,
            LinkError::PacketSizeMismatch => -43,

            LinkError::TunnelSetupFailed(_) => -50,
            LinkError::TunnelClosed => -51,
            LinkError::LinkFailure(_) => -52,
            LinkError::AddrParseError(_) => -53,
            #[cfg(feature = "tunnel")]
            LinkError::QuicConnect(_) => -54,
            #[cfg(feature = "tunnel")]
            LinkError::QuicConnection(_) => -55,

            #[cfg(feature = "xpc")]
            LinkError::UnknownFrame(_) => -60,
            #[cfg(feature = "xpc")]
            LinkError::UnknownHttpSetting(_) => -61,
            #[cfg(feature = "xpc")]
            LinkError::UnknownXpcType(_) => -62,
            #[cfg(feature = "xpc")]
            LinkError::MalformedXpc => -63,
            #[cfg(feature = "xpc")]
            LinkError::UnexpectedXpcVersion => -64,
            #[cfg(feature = "xpc")]
            LinkError::InvalidCString => -65,
            #[cfg(feature = "xpc")]
            LinkError::HttpStreamReset => -66,
            #[cfg(feature = "xpc")]
            LinkError::HttpGoAway(_) => -67,

            #[cfg(feature = "dvt")]
            LinkError::NsKeyedArchiveError(_) => -70,
            #[cfg(feature = "dvt")]
            LinkError::UnknownAuxType(_) => -71,
            #[cfg(feature = "dvt")]
            LinkError::UnknownDtxMessageType(_) => -72,
            #[cfg(feature = "dvt")]
            LinkError::UnknownChannel(_) => -73,
            LinkError::ConnectionClosed => -74,
            #[cfg(feature = "dvt")]
            LinkError::DtxCallFailed { .. } => -75,

            #[cfg(feature = "mobileactivationd")]
            LinkError::Reqwest(_) => -80,
            #[cfg(feature = "mobileactivationd")]
            LinkError::ActivationFailed(_) => -81,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_plist_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = Connection::new(Box::new(client), "test");
        let mut server = Connection::new(Box::new(server), "device");

        let mut req = plist::Dictionary::new();
        req.insert("Request".into(), "QueryType".into());
        client
            .send_plist(plist::Value::Dictionary(req.clone()))
            .await
            .unwrap();

        let received = server.read_plist().await.unwrap();
        assert_eq!(received, req);
    }

    #[tokio::test]
    async fn error_key_maps_to_typed_error() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = Connection::new(Box::new(client), "test");
        let mut server = Connection::new(Box::new(server), "device");

        let mut res = plist::Dictionary::new();
        res.insert("Request".into(), "StartSession".into());
        res.insert("Error".into(), "InvalidHostID".into());
        server.send_plist(plist::Value::Dictionary(res)).await.unwrap();

        assert!(matches!(
            client.read_plist().await,
            Err(LinkError::InvalidHostID)
        ));
    }

    #[tokio::test]
    async fn unknown_device_error_keeps_original_string() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = Connection::new(Box::new(client), "test");
        let mut server = Connection::new(Box::new(server), "device");

        let mut res = plist::Dictionary::new();
        res.insert("Request".into(), "SetValue".into());
        res.insert("Error".into(), "MissingValue".into());
        server.send_plist(plist::Value::Dictionary(res)).await.unwrap();

        match client.read_plist().await {
            Err(LinkError::Lockdown { request, error }) => {
                assert_eq!(request, "SetValue");
                assert_eq!(error, "MissingValue");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabling_tls_on_plaintext_is_a_no_op() {
        let (client, _server) = tokio::io::duplex(64);
        let mut client = Connection::new(Box::new(client), "test");
        client.disable_session_ssl().await.unwrap();
        assert_eq!(client.tls_state(), TlsState::Plaintext);
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(LinkError::PairingDialogPending.code(), -28);
        assert_eq!(LinkError::ConnectionClosed.code(), -74);
        assert!(LinkError::PairingDialogPending.is_retryable());
        assert!(!LinkError::InvalidHostID.is_retryable());
    }
}
