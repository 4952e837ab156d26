//! Installation proxy service
//!
//! Browses installed applications and drives install/uninstall flows.
//! Long-running operations carry hard ceilings so a stalled device cannot
//! wedge the caller.

use std::time::Duration;

use tracing::debug;

use crate::services::DeviceService;
use crate::{RemoteXpcError, ServiceConnection};

/// Hard ceiling on a Browse operation
pub const BROWSE_MAX: Duration = Duration::from_secs(120);
/// Hard ceiling on an Install operation
pub const INSTALL_MAX: Duration = Duration::from_secs(600);

/// Client for the installation proxy service
#[derive(Debug)]
pub struct InstallationProxyClient {
    pub connection: ServiceConnection,
}

impl DeviceService for InstallationProxyClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        "com.apple.mobile.installation_proxy.shim.remote".into()
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        Ok(Self::new(connection))
    }
}

impl InstallationProxyClient {
    pub fn new(connection: ServiceConnection) -> Self {
        Self { connection }
    }

    /// Gets information about installed applications
    ///
    /// `application_type` filters to "System", "User" or "Any".
    pub async fn browse(
        &mut self,
        application_type: Option<&str>,
    ) -> Result<Vec<plist::Value>, RemoteXpcError> {
        let mut options = plist::Dictionary::new();
        if let Some(t) = application_type {
            options.insert("ApplicationType".into(), t.into());
        }
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Browse".into());
        req.insert("ClientOptions".into(), options.into());
        self.connection.send_plist(req.into()).await?;

        let browse = async {
            let mut apps = Vec::new();
            loop {
                let mut res = self.connection.read_plist().await?;
                if let Some(plist::Value::Array(list)) = res.remove("CurrentList") {
                    apps.extend(list);
                }
                match res.get("Status").and_then(|x| x.as_string()) {
                    Some("Complete") => break,
                    Some(_) | None => continue,
                }
            }
            Ok(apps)
        };

        let res = tokio::time::timeout(BROWSE_MAX, browse).await;
        match res {
            Ok(res) => res,
            Err(_) => {
                self.connection.close();
                Err(RemoteXpcError::Timeout)
            }
        }
    }

    /// Looks applications up by bundle identifier
    pub async fn lookup(
        &mut self,
        bundle_identifiers: Vec<String>,
    ) -> Result<plist::Dictionary, RemoteXpcError> {
        let mut options = plist::Dictionary::new();
        options.insert(
            "BundleIDs".into(),
            plist::Value::Array(bundle_identifiers.into_iter().map(Into::into).collect()),
        );
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Lookup".into());
        req.insert("ClientOptions".into(), options.into());

        let mut res = self.connection.plist_request(req.into(), None).await?;
        match res.remove("LookupResult").and_then(|x| x.into_dictionary()) {
            Some(r) => Ok(r),
            None => Err(RemoteXpcError::UnexpectedResponse),
        }
    }

    /// Installs a staged package, reporting percent progress
    ///
    /// `package_path` is relative to the device's staging area; the
    /// package must already be there (e.g. via AFC upload).
    pub async fn install(
        &mut self,
        package_path: impl Into<String>,
        options: Option<plist::Dictionary>,
        callback: impl Fn(u64),
    ) -> Result<(), RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Install".into());
        req.insert("PackagePath".into(), package_path.into().into());
        req.insert("ClientOptions".into(), options.unwrap_or_default().into());
        self.connection.send_plist(req.into()).await?;

        let watch = async {
            loop {
                let res = self.connection.read_plist().await.map_err(|e| match e {
                    RemoteXpcError::UnknownErrorType(e) => RemoteXpcError::InstallationFailed(e),
                    e => e,
                })?;
                if let Some(percent) = res.get("PercentComplete").and_then(|x| x.as_unsigned_integer())
                {
                    debug!("Install progress: {percent}%");
                    callback(percent);
                }
                match res.get("Status").and_then(|x| x.as_string()) {
                    Some("Complete") => break Ok(()),
                    Some(_) | None => continue,
                }
            }
        };

        let res = tokio::time::timeout(INSTALL_MAX, watch).await;
        match res {
            Ok(res) => res,
            Err(_) => {
                self.connection.close();
                Err(RemoteXpcError::Timeout)
            }
        }
    }

    /// Uninstalls an application by bundle identifier
    pub async fn uninstall(
        &mut self,
        bundle_identifier: impl Into<String>,
    ) -> Result<(), RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Uninstall".into());
        req.insert("ApplicationIdentifier".into(), bundle_identifier.into().into());
        req.insert("ClientOptions".into(), plist::Dictionary::new().into());
        self.connection.send_plist(req.into()).await?;

        loop {
            let res = self.connection.read_plist().await.map_err(|e| match e {
                RemoteXpcError::UnknownErrorType(e) => RemoteXpcError::InstallationFailed(e),
                e => e,
            })?;
            match res.get("Status").and_then(|x| x.as_string()) {
                Some("Complete") => break Ok(()),
                Some(_) | None => continue,
            }
        }
    }
}
