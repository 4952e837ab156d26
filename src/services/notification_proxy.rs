//! Notification proxy service
//!
//! Observes and posts system notifications, e.g.
//! `com.apple.mobile.application_installed` or the itunes-mobdev sync
//! markers.

use crate::services::DeviceService;
use crate::{RemoteXpcError, ServiceConnection};

/// Client for the notification proxy service
#[derive(Debug)]
pub struct NotificationProxyClient {
    pub connection: ServiceConnection,
}

impl DeviceService for NotificationProxyClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        "com.apple.mobile.notification_proxy.shim.remote".into()
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        Ok(Self::new(connection))
    }
}

impl NotificationProxyClient {
    pub fn new(connection: ServiceConnection) -> Self {
        Self { connection }
    }

    /// Posts a notification to the device
    pub async fn post_notification(
        &mut self,
        notification_name: impl Into<String>,
    ) -> Result<(), RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "PostNotification".into());
        req.insert("Name".into(), notification_name.into().into());
        self.connection.send_plist(req.into()).await
    }

    /// Registers to observe a notification; pair with
    /// `receive_notification`
    pub async fn observe_notification(
        &mut self,
        notification_name: impl Into<String>,
    ) -> Result<(), RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "ObserveNotification".into());
        req.insert("Name".into(), notification_name.into().into());
        self.connection.send_plist(req.into()).await
    }

    /// Waits for the next observed notification
    pub async fn receive_notification(&mut self) -> Result<String, RemoteXpcError> {
        let response = self.connection.read_plist().await?;
        match response.get("Command").and_then(|c| c.as_string()) {
            Some("RelayNotification") => match response.get("Name").and_then(|n| n.as_string()) {
                Some(name) => Ok(name.to_string()),
                None => Err(RemoteXpcError::UnexpectedResponse),
            },
            _ => Err(RemoteXpcError::UnexpectedResponse),
        }
    }

    /// Shuts down the proxy connection
    pub async fn shutdown(&mut self) -> Result<(), RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "Shutdown".into());
        self.connection.send_plist(req.into()).await?;
        // best-effort: wait for the ProxyDeath ack
        let _ = self.connection.read_plist().await;
        Ok(())
    }
}
