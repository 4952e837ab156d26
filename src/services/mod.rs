//! Service acquisition over an established tunnel
//!
//! Given a tunnel endpoint and the RSD catalog behind it, the dispatcher
//! opens a TCP stream to a named service's port, runs the check-in ack
//! exchange and hands back a plist-framed connection.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;
use tracing::debug;

use crate::core_device_proxy::Tunnel;
use crate::rsd::{RsdHandshake, RsdService};
use crate::{ReadWrite, RemoteXpcError, ServiceConnection};

pub mod crashreportcopymobile;
pub mod diagnostics_relay;
pub mod installation_proxy;
pub mod mobile_image_mounter;
pub mod notification_proxy;
pub mod syslog_relay;

/// A service reachable through the RSD catalog
pub trait DeviceService: Sized {
    /// The service name as advertised in the catalog
    fn service_name() -> std::borrow::Cow<'static, str>;

    #[allow(async_fn_in_trait)]
    async fn from_connection(connection: ServiceConnection) -> Result<Self, RemoteXpcError>;

    /// Dispatches to this service through the tunnel
    #[allow(async_fn_in_trait)]
    async fn connect<R: ReadWrite>(
        tunnel: &Tunnel,
        handshake: &RsdHandshake<R>,
    ) -> Result<Self, RemoteXpcError> {
        let connection = start_service(
            tunnel,
            &handshake.services,
            Self::service_name().as_ref(),
            "remotexpc",
        )
        .await?;
        Self::from_connection(connection).await
    }
}

/// Parses a tunnel address, honoring an IPv6 scope suffix (`fdxx::1%5`)
pub(crate) fn parse_tunnel_addr(address: &str, port: u16) -> Result<SocketAddr, RemoteXpcError> {
    match address.split_once('%') {
        Some((addr, scope)) => {
            let addr: std::net::Ipv6Addr = addr.parse()?;
            let scope = scope.parse::<u32>().unwrap_or(0);
            Ok(SocketAddr::V6(std::net::SocketAddrV6::new(
                addr, port, 0, scope,
            )))
        }
        None => {
            let addr: IpAddr = address.parse()?;
            Ok(SocketAddr::new(addr, port))
        }
    }
}

/// Opens a named service and completes the check-in exchange
///
/// Fails with `ServiceNotFound` when the catalog has no such service and
/// `ServiceStartFailed` when the device refuses the check-in.
pub async fn start_service(
    tunnel: &Tunnel,
    services: &HashMap<String, RsdService>,
    name: &str,
    label: &str,
) -> Result<ServiceConnection, RemoteXpcError> {
    let service = services
        .get(name)
        .ok_or_else(|| RemoteXpcError::ServiceNotFound(name.to_string()))?;

    debug!("Starting {name} on port {}", service.port);
    let addr = parse_tunnel_addr(&tunnel.address, service.port)?;
    let stream = TcpStream::connect(addr).await?;

    let mut connection = ServiceConnection::new(Box::new(stream), label);
    match connection.rsd_checkin().await {
        Ok(()) => Ok(connection),
        Err(RemoteXpcError::UnknownErrorType(e)) => Err(RemoteXpcError::ServiceStartFailed {
            service: name.to_string(),
            code: -1,
            description: e,
        }),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn catalog(name: &str, port: u16) -> HashMap<String, RsdService> {
        let mut services = HashMap::new();
        services.insert(
            name.to_string(),
            RsdService {
                entitlement: "none".to_string(),
                port,
                uses_remote_xpc: false,
                features: None,
                service_version: None,
            },
        );
        services
    }

    async fn read_framed_plist(stream: &mut tokio::net::TcpStream) -> plist::Dictionary {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        plist::from_bytes(&body).unwrap()
    }

    async fn write_framed_plist(stream: &mut tokio::net::TcpStream, dict: plist::Dictionary) {
        let mut body = Vec::new();
        plist::to_writer_xml(&mut body, &dict).unwrap();
        stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&body).await.unwrap();
    }

    #[tokio::test]
    async fn dispatcher_completes_the_checkin() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req = read_framed_plist(&mut stream).await;
            assert_eq!(
                req.get("Request").and_then(|x| x.as_string()),
                Some("RSDCheckin")
            );

            let mut res = plist::Dictionary::new();
            res.insert("Request".into(), "RSDCheckin".into());
            write_framed_plist(&mut stream, res).await;

            let mut res = plist::Dictionary::new();
            res.insert("Request".into(), "StartService".into());
            write_framed_plist(&mut stream, res).await;

            // keep the socket open until the client is done
            let mut sink = [0u8; 64];
            let _ = stream.read(&mut sink).await;
        });

        let tunnel = Tunnel {
            address: "127.0.0.1".to_string(),
            rsd_port: 0,
        };
        let services = catalog("com.apple.syslog_relay.shim.remote", port);
        let connection = start_service(
            &tunnel,
            &services,
            "com.apple.syslog_relay.shim.remote",
            "test",
        )
        .await
        .unwrap();
        drop(connection);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_service_is_reported() {
        let tunnel = Tunnel {
            address: "127.0.0.1".to_string(),
            rsd_port: 0,
        };
        let services = catalog("com.apple.syslog_relay.shim.remote", 1);
        let res = start_service(&tunnel, &services, "com.apple.absent", "test").await;
        assert!(matches!(res, Err(RemoteXpcError::ServiceNotFound(_))));
    }

    #[test]
    fn scoped_ipv6_addresses_parse() {
        let addr = parse_tunnel_addr("fd12:3456::1%7", 1234).unwrap();
        match addr {
            SocketAddr::V6(v6) => {
                assert_eq!(v6.scope_id(), 7);
                assert_eq!(v6.port(), 1234);
            }
            _ => panic!("expected a v6 address"),
        }

        let addr = parse_tunnel_addr("10.0.0.1", 80).unwrap();
        assert!(matches!(addr, SocketAddr::V4(_)));
    }
}
