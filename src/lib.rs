#![doc = include_str!("../README.md")]
#![warn(missing_debug_implementations)]
// Jackson Coxson

pub mod core_device_proxy;
pub mod discovery;
pub mod dvt;
pub mod pairing;
pub mod plist_codec;
pub mod provider;
pub mod rsd;
pub mod services;
pub mod tunnel_registry;
pub mod usbmuxd;
pub mod xpc;

pub use xpc::RemoteXpcClient;

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// A trait combining all required characteristics for a device communication socket
///
/// Any asynchronous read/write stream qualifies. Tokio's TcpStream and
/// UnixStream implement this trait, as do TLS-wrapped streams.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Type alias for boxed device connection sockets
pub type ServiceSocket = Box<dyn ReadWrite>;

/// A length-prefixed plist connection to a single device service
///
/// Every lockdown shim service speaks the same framing: a big-endian u32
/// length followed by an XML (or binary) plist. This handle owns the socket
/// and provides the send/receive primitives every service client builds on.
#[derive(Debug)]
pub struct ServiceConnection {
    /// The underlying connection socket, boxed for dynamic dispatch
    socket: Option<Box<dyn ReadWrite>>,
    /// Label identifying this connection to the device
    label: String,
}

impl ServiceConnection {
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Consumes the connection, returning the socket if still open
    pub fn into_socket(self) -> Option<Box<dyn ReadWrite>> {
        self.socket
    }

    /// Destroys the socket. All subsequent calls return `SessionClosed`.
    pub fn close(&mut self) {
        self.socket = None;
    }

    fn socket(&mut self) -> Result<&mut Box<dyn ReadWrite>, RemoteXpcError> {
        self.socket.as_mut().ok_or(RemoteXpcError::SessionClosed)
    }

    /// Performs the RSD check-in exchange all shim services expect
    ///
    /// The service answers with its own `RSDCheckin` echo followed by a
    /// `StartService` acknowledgement.
    pub async fn rsd_checkin(&mut self) -> Result<(), RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("ProtocolVersion".into(), "2".into());
        req.insert("Request".into(), "RSDCheckin".into());
        self.send_plist(plist::Value::Dictionary(req)).await?;

        let res = self.read_plist().await?;
        if res.get("Request").and_then(|x| x.as_string()) != Some("RSDCheckin") {
            return Err(RemoteXpcError::UnexpectedResponse);
        }

        let res = self.read_plist().await?;
        if res.get("Request").and_then(|x| x.as_string()) != Some("StartService") {
            return Err(RemoteXpcError::UnexpectedResponse);
        }

        Ok(())
    }

    /// Sends a plist-formatted message to the service
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), RemoteXpcError> {
        let body = plist_codec::to_xml_bytes(&message)?;
        debug!("Sending plist: {}", String::from_utf8_lossy(&body));
        let socket = self.socket()?;
        socket.write_all(&(body.len() as u32).to_be_bytes()).await?;
        socket.write_all(&body).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Sends raw binary data to the service
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), RemoteXpcError> {
        let socket = self.socket()?;
        socket.write_all(message).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Reads exactly `len` bytes
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, RemoteXpcError> {
        let socket = self.socket()?;
        let mut buf = vec![0; len];
        socket.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads up to `max_size` bytes, returning whatever arrived
    pub async fn read_any(&mut self, max_size: u32) -> Result<Vec<u8>, RemoteXpcError> {
        let socket = self.socket()?;
        let mut buf = vec![0; max_size as usize];
        let len = socket.read(&mut buf).await?;
        Ok(buf[..len].to_vec())
    }

    /// Accumulates bytes until `delimiter` is found, returning the line
    ///
    /// Returns `None` on a clean EOF with no pending data.
    pub async fn read_until_delim(
        &mut self,
        delimiter: &[u8],
    ) -> Result<Option<bytes::BytesMut>, RemoteXpcError> {
        let socket = self.socket()?;
        let mut buffer = bytes::BytesMut::with_capacity(1024);
        let mut temp = [0u8; 1024];

        loop {
            let n = socket.read(&mut temp).await?;
            if n == 0 {
                if buffer.is_empty() {
                    return Ok(None);
                } else {
                    return Ok(Some(buffer));
                }
            }

            buffer.extend_from_slice(&temp[..n]);

            if let Some(pos) = buffer.windows(delimiter.len()).position(|w| w == delimiter) {
                let mut line = buffer.split_to(pos + delimiter.len());
                line.truncate(line.len() - delimiter.len());
                return Ok(Some(line));
            }
        }
    }

    /// Reads one framed plist and parses it as a dictionary
    ///
    /// Device-reported errors in the `Error` key are surfaced as typed
    /// errors.
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, RemoteXpcError> {
        let res = self.read_plist_value().await?;
        let res: plist::Dictionary = plist::from_value(&res)?;

        if let Some(e) = res.get("Error") {
            let e = match e {
                plist::Value::String(e) => e.to_string(),
                plist::Value::Integer(e) => match res.get("ErrorString").and_then(|x| x.as_string())
                {
                    Some(s) => s.to_string(),
                    None => e.to_string(),
                },
                _ => {
                    tracing::error!("Error value is neither a string nor an integer: {e:?}");
                    return Err(RemoteXpcError::UnexpectedResponse);
                }
            };
            if let Some(e) = RemoteXpcError::from_device_error_type(e.as_str(), &res) {
                return Err(e);
            }
            let msg = match res.get("ErrorDescription").and_then(|x| x.as_string()) {
                Some(desc) => format!("{e} ({desc})"),
                None => e,
            };
            return Err(RemoteXpcError::UnknownErrorType(msg));
        }
        Ok(res)
    }

    /// Reads one framed plist without interpreting it
    pub async fn read_plist_value(&mut self) -> Result<plist::Value, RemoteXpcError> {
        let socket = self.socket()?;
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await?;
        let len = u32::from_be_bytes(buf);
        let mut buf = vec![0; len as usize];
        socket.read_exact(&mut buf).await?;
        let res = plist_codec::from_bytes_tolerant(&buf)?;
        debug!("Received plist: {res:?}");
        Ok(res)
    }

    /// Reads one framed plist with a deadline
    ///
    /// On expiry the socket is destroyed and `Timeout` returned; the
    /// connection is unusable afterwards.
    pub async fn recv_plist(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<plist::Dictionary, RemoteXpcError> {
        match timeout {
            Some(t) => {
                let res = tokio::time::timeout(t, self.read_plist()).await;
                match res {
                    Ok(res) => res,
                    Err(_) => {
                        self.socket = None;
                        Err(RemoteXpcError::Timeout)
                    }
                }
            }
            None => self.read_plist().await,
        }
    }

    /// One-request/one-response helper
    ///
    /// Strictly request-paired: holding `&mut self` serializes concurrent
    /// callers, so the next request cannot be issued before the prior
    /// response arrives or the call fails.
    pub async fn plist_request(
        &mut self,
        req: plist::Value,
        timeout: Option<Duration>,
    ) -> Result<plist::Dictionary, RemoteXpcError> {
        self.send_plist(req).await?;
        self.recv_plist(timeout).await
    }
}

/// Comprehensive error type for all host-device communication failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RemoteXpcError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("TLS error")]
    Rustls(#[from] rustls::Error),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("JSON serialization failed")]
    Json(#[from] serde_json::Error),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("cannot parse string as IpAddr")]
    AddrParseError(#[from] std::net::AddrParseError),
    #[error("base64 decode failed")]
    Base64(#[from] base64::DecodeError),

    #[error("deadline expired")]
    Timeout,
    #[error("session closed")]
    SessionClosed,
    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("not found")]
    NotFound,
    #[error("device not found")]
    DeviceNotFound,
    #[error("device locked")]
    DeviceLocked,
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("device does not have pairing record")]
    InvalidHostID,
    #[error("internal device error: {0}")]
    InternalError(String),
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),

    #[error("service `{0}` not found in RSD catalog")]
    ServiceNotFound(String),
    #[error("service `{service}` failed to start: {code} ({description})")]
    ServiceStartFailed {
        service: String,
        code: i64,
        description: String,
    },

    #[error("invalid RPPairing magic")]
    InvalidProtocolMagic,
    #[error("RPPairing body too large for a single frame")]
    OversizedFrame,
    #[error("CDTunnel packet too short")]
    CdtunnelPacketTooShort,
    #[error("CDTunnel packet invalid magic")]
    CdtunnelPacketInvalidMagic,
    #[error("proclaimed packet size does not match actual size")]
    PacketSizeMismatch,
    #[error("not enough bytes, expected {1}, got {0}")]
    NotEnoughBytes(usize, usize),

    #[error("malformed TLV")]
    MalformedTlv,

    #[error("invalid argument passed")]
    InvalidArgument,
    #[error("server public key is invalid")]
    InvalidServerKey,
    #[error("SRP proof mismatch")]
    SrpProofMismatch,
    #[error("SRP session key requested before proof computation")]
    SrpSessionNotReady,

    #[error("no pairing data in response")]
    NoPairingData,
    #[error("response is missing SRP data")]
    MissingSrpData,
    #[error("device rejected the PIN")]
    WrongPin,
    #[error("device reported pairing error {0}")]
    AppleTvError(u8),
    #[error("pairing rejected: {0}")]
    PairingRejected(String),
    #[error("PIN prompt timed out")]
    InputTimeout,
    #[error("PIN must be one or more digits")]
    InvalidPin,
    #[error("failed to decrypt M6 payload")]
    M6DecryptFailed,
    #[error("Pair verification failed: {0}")]
    PairVerifyFailed(String),
    #[error("failed to persist pair record")]
    SaveError,

    #[error("unknown http frame type")]
    UnknownFrame(u8),
    #[error("unknown http setting type")]
    UnknownHttpSetting(u16),
    #[error("stream reset")]
    HttpStreamReset,
    #[error("go away packet received: {0}")]
    HttpGoAway(String),
    #[error("unknown XPC type")]
    UnknownXpcType(u32),
    #[error("malformed XPC message")]
    MalformedXpc,
    #[error("invalid XPC magic")]
    InvalidXpcMagic,
    #[error("unexpected XPC version")]
    UnexpectedXpcVersion,
    #[error("invalid C string")]
    InvalidCString,

    #[error("archiver graph could not be decoded: {0}")]
    ArchiverDecodeError(String),
    #[error("malformed DTX message")]
    MalformedDtx,
    #[error("unknown aux value type")]
    UnknownAuxValueType(u32),
    #[error("unknown channel")]
    UnknownChannel(u32),

    #[error("tunnel bring-up failed: {0}")]
    TunnelBringUpFailed(String),
    #[error("no build manifest available")]
    MissingManifest,

    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("installation proxy operation failed: {0}")]
    InstallationFailed(String),
    #[error("crash report mover sent the wrong response")]
    CrashReportMoverBadResponse(Vec<u8>),
    #[error("image is not mounted")]
    ImageNotMounted,

    #[error("usb device refused connection")]
    UsbConnectionRefused,
    #[error("usb bad command")]
    UsbBadCommand,
    #[error("usb bad device")]
    UsbBadDevice,
    #[error("usb bad version")]
    UsbBadVersion,
}

impl RemoteXpcError {
    /// Converts a device-reported error string to a typed error
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Option<Self> {
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostID),
            "SessionInactive" => Some(Self::SessionInactive),
            "DeviceLocked" => Some(Self::DeviceLocked),
            "InternalError" => {
                let detailed = context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string();
                Some(Self::InternalError(detailed))
            }
            _ => None,
        }
    }
}
