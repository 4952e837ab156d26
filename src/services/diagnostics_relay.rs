//! Diagnostics relay

use crate::services::DeviceService;
use crate::{RemoteXpcError, ServiceConnection};

/// Client for the diagnostics relay service
#[derive(Debug)]
pub struct DiagnosticsRelayClient {
    pub connection: ServiceConnection,
}

impl DeviceService for DiagnosticsRelayClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        "com.apple.mobile.diagnostics_relay.shim.remote".into()
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        Ok(Self::new(connection))
    }
}

impl DiagnosticsRelayClient {
    pub fn new(connection: ServiceConnection) -> Self {
        Self { connection }
    }

    /// Requests a tree from the IO registry
    ///
    /// # Arguments
    /// * `current_plane` - The plane to request the tree as
    /// * `entry_name` - The entry to get
    /// * `entry_class` - The class to filter by
    pub async fn ioregistry(
        &mut self,
        current_plane: Option<&str>,
        entry_name: Option<&str>,
        entry_class: Option<&str>,
    ) -> Result<Option<plist::Dictionary>, RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Request".into(), "IORegistry".into());
        if let Some(plane) = current_plane {
            req.insert("CurrentPlane".into(), plane.into());
        }
        if let Some(name) = entry_name {
            req.insert("EntryName".into(), name.into());
        }
        if let Some(class) = entry_class {
            req.insert("EntryClass".into(), class.into());
        }
        self.connection.send_plist(req.into()).await?;
        let mut res = self.connection.read_plist().await?;

        if res.get("Status").and_then(|x| x.as_string()) != Some("Success") {
            return Err(RemoteXpcError::UnexpectedResponse);
        }

        let res = res
            .remove("Diagnostics")
            .and_then(|x| x.into_dictionary())
            .and_then(|mut x| x.remove("IORegistry"))
            .and_then(|x| x.into_dictionary());
        Ok(res)
    }

    /// Queries MobileGestalt keys
    pub async fn mobilegestalt(
        &mut self,
        keys: Vec<String>,
    ) -> Result<Option<plist::Dictionary>, RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Request".into(), "MobileGestalt".into());
        req.insert(
            "MobileGestaltKeys".into(),
            plist::Value::Array(keys.into_iter().map(Into::into).collect()),
        );
        self.connection.send_plist(req.into()).await?;
        let mut res = self.connection.read_plist().await?;

        if res.get("Status").and_then(|x| x.as_string()) != Some("Success") {
            return Err(RemoteXpcError::UnexpectedResponse);
        }

        Ok(res
            .remove("Diagnostics")
            .and_then(|x| x.into_dictionary())
            .and_then(|mut x| x.remove("MobileGestalt"))
            .and_then(|x| x.into_dictionary()))
    }

    /// Tells the relay we are done
    pub async fn goodbye(&mut self) -> Result<(), RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Request".into(), "Goodbye".into());
        self.connection.send_plist(req.into()).await?;
        let _ = self.connection.read_plist().await;
        Ok(())
    }
}
