//! Bonjour discovery for devices that pair over the network
//!
//! Apple TVs advertise their manual-pairing listener over mDNS; modern iOS
//! devices advertise `remoted`. Browsing yields add/remove events resolved
//! to concrete host/port pairs the pairing client can dial.

use std::collections::HashMap;
use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tracing::debug;

use crate::RemoteXpcError;

/// Service type Apple TVs advertise while waiting for a manual pairing
pub const REMOTE_PAIRING_SERVICE_TYPE: &str = "_remotepairing-manual-pairing._tcp.local.";

/// Service type advertised by remoted on modern devices
pub const REMOTED_SERVICE_TYPE: &str = "_remoted._tcp.local.";

/// A resolved Bonjour advertisement
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// The service instance's full name
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    /// TXT record key/values as advertised
    pub txt: HashMap<String, String>,
}

/// Add/remove notifications from the browser
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Added(DiscoveredDevice),
    Removed(String),
}

/// An active mDNS browse
pub struct DeviceBrowser {
    daemon: ServiceDaemon,
    receiver: mdns_sd::Receiver<ServiceEvent>,
}

impl std::fmt::Debug for DeviceBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBrowser").finish()
    }
}

impl DeviceBrowser {
    /// Starts browsing for `service_type`
    pub fn browse(service_type: &str) -> Result<Self, RemoteXpcError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| RemoteXpcError::DiscoveryFailed(format!("mdns daemon: {e}")))?;
        let receiver = daemon
            .browse(service_type)
            .map_err(|e| RemoteXpcError::DiscoveryFailed(format!("browse: {e}")))?;
        Ok(Self { daemon, receiver })
    }

    /// Waits for the next add/remove event
    ///
    /// Returns `None` when the browse has been shut down.
    pub async fn next_event(&self) -> Option<DiscoveryEvent> {
        loop {
            let event = self.receiver.recv_async().await.ok()?;
            match event {
                ServiceEvent::ServiceResolved(info) => {
                    debug!("Resolved {}", info.get_fullname());
                    let txt = info
                        .get_properties()
                        .iter()
                        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
                        .collect();
                    return Some(DiscoveryEvent::Added(DiscoveredDevice {
                        name: info.get_fullname().to_string(),
                        addresses: info.get_addresses().iter().copied().collect(),
                        port: info.get_port(),
                        txt,
                    }));
                }
                ServiceEvent::ServiceRemoved(_, fullname) => {
                    return Some(DiscoveryEvent::Removed(fullname));
                }
                _ => continue,
            }
        }
    }

    /// Stops the browse and shuts the daemon down
    pub fn shutdown(self) {
        let _ = self.daemon.shutdown();
    }
}
