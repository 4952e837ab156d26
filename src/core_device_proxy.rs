//! CoreDeviceProxy tunnel bring-up
//!
//! The CoreDeviceProxy service is started through the lockdown dispatch and
//! speaks CDTunnel packets: the ASCII magic, a big-endian u16 length and a
//! JSON body. Its handshake hands back the tunnel endpoint — the address
//! and RSD port every other service is reached through. The socket must
//! stay open for the tunnel's lifetime; closing it invalidates the port.

use byteorder::{BigEndian, WriteBytesExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::sync::Arc;
use tracing::debug;

use crate::{ReadWrite, RemoteXpcError, ServiceConnection};

/// The service name advertised in the RSD catalog
pub const SERVICE_NAME: &str = "com.apple.internal.devicecompute.CoreDeviceProxy.shim.remote";

/// A tunnel endpoint produced by the bring-up
///
/// Bound to exactly one device and usable only while the originating
/// socket is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub address: String,
    pub rsd_port: u16,
}

/// One CDTunnel control packet
#[derive(Debug, PartialEq)]
pub struct CdTunnelPacket {
    body: Vec<u8>,
}

impl CdTunnelPacket {
    const MAGIC: &'static [u8] = b"CDTunnel";

    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn parse(input: &[u8]) -> Result<Self, RemoteXpcError> {
        if input.len() < Self::MAGIC.len() + 2 {
            return Err(RemoteXpcError::CdtunnelPacketTooShort);
        }
        if &input[0..Self::MAGIC.len()] != Self::MAGIC {
            return Err(RemoteXpcError::CdtunnelPacketInvalidMagic);
        }

        let length_offset = Self::MAGIC.len();
        let body_length =
            u16::from_be_bytes([input[length_offset], input[length_offset + 1]]) as usize;
        if input.len() < length_offset + 2 + body_length {
            return Err(RemoteXpcError::PacketSizeMismatch);
        }

        let body_start = length_offset + 2;
        Ok(Self {
            body: input[body_start..body_start + body_length].to_vec(),
        })
    }

    pub fn serialize(&self) -> io::Result<Vec<u8>> {
        let mut output = Vec::new();
        output.write_all(Self::MAGIC)?;
        output.write_u16::<BigEndian>(self.body.len() as u16)?;
        output.write_all(&self.body)?;
        Ok(output)
    }
}

#[derive(Serialize)]
struct HandshakeRequest {
    #[serde(rename = "type")]
    packet_type: String,
    mtu: u32,
}

/// Parameters assigned to this client by the proxy
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientParameters {
    pub mtu: u16,
    pub address: String,
    pub netmask: String,
}

/// The proxy's handshake response carrying the tunnel endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(rename = "clientParameters")]
    pub client_parameters: ClientParameters,
    #[serde(rename = "serverAddress")]
    pub server_address: String,
    #[serde(rename = "type")]
    pub response_type: String,
    #[serde(rename = "serverRSDPort")]
    pub server_rsd_port: u16,
}

/// Client for the CoreDeviceProxy service
#[derive(Debug)]
pub struct CoreDeviceProxy {
    pub connection: ServiceConnection,
    pub handshake: HandshakeResponse,
    pub mtu: u32,
}

impl crate::services::DeviceService for CoreDeviceProxy {
    fn service_name() -> std::borrow::Cow<'static, str> {
        SERVICE_NAME.into()
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        Self::new(connection).await
    }
}

impl CoreDeviceProxy {
    const DEFAULT_MTU: u32 = 16000;

    /// Upgrades the service socket to TLS, then runs the CDTunnel
    /// handshake over it
    pub async fn new_with_tls(connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        let label = connection.label().to_string();
        let socket = connection
            .into_socket()
            .ok_or(RemoteXpcError::SessionClosed)?;
        let socket = upgrade_tls(socket).await?;
        Self::new(ServiceConnection::new(socket, label)).await
    }

    /// Runs the CDTunnel handshake on an established service connection
    pub async fn new(mut connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        let req = HandshakeRequest {
            packet_type: "clientHandshakeRequest".to_string(),
            mtu: Self::DEFAULT_MTU,
        };
        let req = CdTunnelPacket::new(serde_json::to_vec(&req)?).serialize()?;
        connection.send_raw(&req).await?;

        let recv = connection.read_raw(CdTunnelPacket::MAGIC.len() + 2).await?;
        if recv.len() < CdTunnelPacket::MAGIC.len() + 2 {
            return Err(RemoteXpcError::CdtunnelPacketTooShort);
        }
        if &recv[0..CdTunnelPacket::MAGIC.len()] != CdTunnelPacket::MAGIC {
            return Err(RemoteXpcError::CdtunnelPacketInvalidMagic);
        }
        let len = u16::from_be_bytes([
            recv[CdTunnelPacket::MAGIC.len()],
            recv[CdTunnelPacket::MAGIC.len() + 1],
        ]) as usize;

        let recv = connection.read_raw(len).await?;
        let res = serde_json::from_slice::<HandshakeResponse>(&recv)
            .map_err(|e| RemoteXpcError::TunnelBringUpFailed(e.to_string()))?;
        debug!("CoreDeviceProxy handshake: {res:?}");

        Ok(Self {
            connection,
            handshake: res,
            mtu: Self::DEFAULT_MTU,
        })
    }

    /// The tunnel endpoint this proxy exposes
    pub fn tunnel(&self) -> Tunnel {
        Tunnel {
            address: self.handshake.server_address.clone(),
            rsd_port: self.handshake.server_rsd_port,
        }
    }

    /// Sends a raw packet through the tunnel
    pub async fn send(&mut self, data: &[u8]) -> Result<(), RemoteXpcError> {
        self.connection.send_raw(data).await
    }

    /// Receives up to `mtu` bytes from the tunnel
    pub async fn recv(&mut self) -> Result<Vec<u8>, RemoteXpcError> {
        self.connection.read_any(self.mtu).await
    }
}

/// Certificate verifier for device-side endpoints
///
/// Tunnel endpoints present certificates no WebPKI root anchors; trust is
/// established by Pair-Verify, not the TLS layer.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn install_crypto_provider() {
    if CryptoProvider::get_default().is_some() {
        return;
    }
    let crypto_provider: CryptoProvider = {
        #[cfg(all(feature = "ring", not(feature = "aws-lc")))]
        {
            debug!("Using ring crypto backend");
            rustls::crypto::ring::default_provider()
        }

        #[cfg(all(feature = "aws-lc", not(feature = "ring")))]
        {
            debug!("Using aws-lc crypto backend");
            rustls::crypto::aws_lc_rs::default_provider()
        }

        #[cfg(not(any(feature = "ring", feature = "aws-lc")))]
        {
            compile_error!(
                "No crypto backend was selected! Enable the aws-lc or ring feature"
            );
        }

        #[cfg(all(feature = "ring", feature = "aws-lc"))]
        {
            tracing::warn!("Both ring && aws-lc are selected as crypto backends!");
            rustls::crypto::ring::default_provider()
        }
    };
    if let Err(e) = CryptoProvider::install_default(crypto_provider) {
        // Installing twice errors; the first install won the race.
        tracing::error!("Failed to set crypto provider: {e:?}");
    }
}

/// Upgrades a tunnel socket to TLS without server verification
///
/// TLS 1.2 is the floor; the peer's certificate is accepted as-is.
pub async fn upgrade_tls(socket: Box<dyn ReadWrite>) -> Result<Box<dyn ReadWrite>, RemoteXpcError> {
    install_crypto_provider();
    let provider =
        CryptoProvider::get_default().expect("crypto provider was just installed");

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification {
            provider: provider.clone(),
        }))
        .with_no_client_auth();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let socket = connector
        .connect(
            ServerName::try_from("Device").expect("static server name is valid"),
            socket,
        )
        .await?;
    Ok(Box::new(socket))
}
