//! Remote Service Discovery
//!
//! Consumes the service directory an RSD listener publishes after the XPC
//! handshake and answers port lookups by service name.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::warn;

use crate::{ReadWrite, RemoteXpcClient, RemoteXpcError};

/// One advertised service from the RSD catalog
#[derive(Debug, Clone, Deserialize)]
pub struct RsdService {
    /// Required entitlement to access this service
    pub entitlement: String,
    /// Port number where the service is available
    pub port: u16,
    /// Whether the service speaks RemoteXPC rather than plist framing
    pub uses_remote_xpc: bool,
    /// Optional list of supported features
    pub features: Option<Vec<String>>,
    /// Optional service version number
    pub service_version: Option<i64>,
}

/// A completed RSD handshake and its parsed catalog
pub struct RsdHandshake<R: ReadWrite> {
    inner: RemoteXpcClient<R>,
    pub services: HashMap<String, RsdService>,
}

impl<R: ReadWrite> std::fmt::Debug for RsdHandshake<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsdHandshake")
            .field("services", &self.services.len())
            .finish()
    }
}

impl<R: ReadWrite> RsdHandshake<R> {
    /// Performs the XPC handshake and parses the published catalog
    pub async fn new(socket: R) -> Result<Self, RemoteXpcError> {
        let mut inner = RemoteXpcClient::new(socket).await?;
        let data = inner.do_handshake().await?;

        let data = match data
            .as_dictionary()
            .and_then(|x| x.get("Services"))
            .and_then(|x| x.as_dictionary())
        {
            Some(d) => d,
            None => return Err(RemoteXpcError::UnexpectedResponse),
        };

        let mut services = HashMap::new();
        for (name, service) in data {
            let Some(service) = service.as_dictionary() else {
                warn!("Service {name} is not a dictionary");
                continue;
            };

            let entitlement = match service.get("Entitlement").and_then(|x| x.as_string()) {
                Some(e) => e.to_string(),
                None => {
                    warn!("Service {name} did not contain an entitlement string");
                    continue;
                }
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
            let uses_remote_xpc = properties
                .and_then(|x| x.get("UsesRemoteXPC"))
                .and_then(|x| x.as_boolean())
                .unwrap_or(false);
            let features = properties
                .and_then(|x| x.get("Features"))
                .and_then(|x| x.as_array())
                .map(|f| {
                    f.iter()
                        .filter_map(|x| x.as_string())
                        .map(|x| x.to_string())
                        .collect::<Vec<String>>()
                });
            let service_version = properties
                .and_then(|x| x.get("ServiceVersion"))
                .and_then(|x| x.as_signed_integer());

            services.insert(
                name.to_string(),
                RsdService {
                    entitlement,
                    port,
                    uses_remote_xpc,
                    features,
                    service_version,
                },
            );
        }

        Ok(Self { inner, services })
    }

    /// Looks a service up by name
    pub fn find_service(&self, name: &str) -> Result<&RsdService, RemoteXpcError> {
        self.services
            .get(name)
            .ok_or_else(|| RemoteXpcError::ServiceNotFound(name.to_string()))
    }

    /// The underlying XPC client, for services carried on this session
    pub fn xpc_client(&mut self) -> &mut RemoteXpcClient<R> {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xpc::http2::frame::{DataFrame, HttpFrame};
    use crate::xpc::{Dictionary, ROOT_CHANNEL, XpcMessage, XpcObject};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn service_entry(port: &str) -> XpcObject {
        let mut properties = Dictionary::new();
        properties.insert("UsesRemoteXPC".into(), XpcObject::Bool(false));
        properties.insert("ServiceVersion".into(), XpcObject::Int64(2));

        let mut entry = Dictionary::new();
        entry.insert(
            "Entitlement".into(),
            XpcObject::String("com.apple.private.entitlement".into()),
        );
        entry.insert("Port".into(), XpcObject::String(port.into()));
        entry.insert("Properties".into(), XpcObject::Dictionary(properties));
        XpcObject::Dictionary(entry)
    }

    #[tokio::test]
    async fn catalog_is_extracted_from_the_handshake() {
        let (host, mut device) = tokio::io::duplex(1 << 18);

        let device_task = tokio::spawn(async move {
            let mut preface = [0u8; 24];
            device.read_exact(&mut preface).await.unwrap();
            assert_eq!(&preface, b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n");

            let mut services = Dictionary::new();
            services.insert(
                "com.apple.mobile.installation_proxy.shim.remote".into(),
                service_entry("62314"),
            );
            services.insert(
                "com.apple.os_trace_relay.shim.remote".into(),
                service_entry("50412"),
            );
            let mut body = Dictionary::new();
            body.insert("MessageType".into(), XpcObject::String("Handshake".into()));
            body.insert("Services".into(), XpcObject::Dictionary(services));

            let msg = XpcMessage::new(None, Some(XpcObject::Dictionary(body)), None).encode(0);
            device
                .write_all(
                    &DataFrame {
                        stream_id: ROOT_CHANNEL,
                        payload: msg,
                    }
                    .serialize(),
                )
                .await
                .unwrap();

            // drain whatever the client writes so the duplex never stalls
            let mut sink = vec![0u8; 4096];
            while device.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        let handshake = RsdHandshake::new(host).await.unwrap();
        assert_eq!(handshake.services.len(), 2);

        let service = handshake
            .find_service("com.apple.mobile.installation_proxy.shim.remote")
            .unwrap();
        assert_eq!(service.port, 62314);
        assert_eq!(service.service_version, Some(2));
        assert!(!service.uses_remote_xpc);

        assert!(matches!(
            handshake.find_service("com.apple.absent"),
            Err(RemoteXpcError::ServiceNotFound(_))
        ));

        drop(handshake);
        device_task.await.unwrap();
    }
}
