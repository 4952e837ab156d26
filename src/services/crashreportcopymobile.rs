//! Crash report transfer
//!
//! Two cooperating services: the mover flushes pending reports into the
//! copy area and answers with a raw `ping`, and the copy service exposes
//! the staged reports. The copy protocol itself is a file-transfer
//! conversation owned by the caller; this client provides the mover ack
//! and a raw passthrough.

use crate::services::DeviceService;
use crate::{RemoteXpcError, ServiceConnection};

/// Client for the crash report mover
#[derive(Debug)]
pub struct CrashReportMoverClient {
    pub connection: ServiceConnection,
}

impl DeviceService for CrashReportMoverClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        "com.apple.crashreportmover.shim.remote".into()
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        Ok(Self::new(connection))
    }
}

impl CrashReportMoverClient {
    pub fn new(connection: ServiceConnection) -> Self {
        Self { connection }
    }

    /// Waits for the mover to finish staging reports
    ///
    /// The mover writes the literal bytes `ping\0` once every pending
    /// report has been moved into the copy area.
    pub async fn ping(&mut self) -> Result<(), RemoteXpcError> {
        let res = self.connection.read_raw(5).await?;
        if res != b"ping\0" {
            return Err(RemoteXpcError::CrashReportMoverBadResponse(res));
        }
        Ok(())
    }
}

/// Client for the crash report copy service
#[derive(Debug)]
pub struct CrashReportCopyClient {
    pub connection: ServiceConnection,
}

impl DeviceService for CrashReportCopyClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        "com.apple.crashreportcopymobile.shim.remote".into()
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        Ok(Self::new(connection))
    }
}

impl CrashReportCopyClient {
    pub fn new(connection: ServiceConnection) -> Self {
        Self { connection }
    }

    /// The underlying connection, for the caller's transfer protocol
    pub fn connection(&mut self) -> &mut ServiceConnection {
        &mut self.connection
    }
}
