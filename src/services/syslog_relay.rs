//! Syslog relay stream

use crate::services::DeviceService;
use crate::{RemoteXpcError, ServiceConnection};

/// Client for the device's syslog relay
///
/// The relay pushes a continuous stream of NUL-terminated log lines as
/// soon as the service starts.
#[derive(Debug)]
pub struct SyslogRelayClient {
    pub connection: ServiceConnection,
}

impl DeviceService for SyslogRelayClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        "com.apple.syslog_relay.shim.remote".into()
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        Ok(Self::new(connection))
    }
}

impl SyslogRelayClient {
    pub fn new(connection: ServiceConnection) -> Self {
        Self { connection }
    }

    /// Gets the next log line from the relay
    ///
    /// # Errors
    /// `UnexpectedResponse` if the service sends an EOF
    pub async fn next(&mut self) -> Result<String, RemoteXpcError> {
        let res = self.connection.read_until_delim(b"\n\x00").await?;
        match res {
            Some(res) => Ok(String::from_utf8_lossy(&res).to_string()),
            None => Err(RemoteXpcError::UnexpectedResponse),
        }
    }
}
