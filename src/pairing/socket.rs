// Jackson Coxson

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::{ReadWrite, RemoteXpcError};

pub const RPPAIRING_MAGIC: &[u8] = b"RPPairing";

/// Framed JSON socket for the RPPairing control protocol
///
/// Each frame is the 9-byte ASCII magic, a big-endian u16 body length and a
/// UTF-8 JSON body. Bodies sent by the host nest under
/// `message.plain._0` and carry `originatedBy` plus a sequence number
/// managed by the caller.
#[derive(Debug)]
pub struct RpPairingSocket<R: ReadWrite> {
    inner: R,
}

impl<R: ReadWrite> RpPairingSocket<R> {
    pub fn new(socket: R) -> Self {
        Self { inner: socket }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Wraps `value` in the control-channel envelope and sends it
    pub async fn send_plain(&mut self, value: Value, seq: usize) -> Result<(), RemoteXpcError> {
        let envelope = json!({
            "message": {"plain": {"_0": value}},
            "originatedBy": "host",
            "sequenceNumber": seq,
        });
        self.send_frame(&envelope).await
    }

    /// Receives one envelope and unwraps `message.plain._0`
    pub async fn recv_plain(&mut self) -> Result<Value, RemoteXpcError> {
        let envelope = self.read_frame().await?;
        match envelope
            .get("message")
            .and_then(|x| x.get("plain"))
            .and_then(|x| x.get("_0"))
        {
            Some(v) => Ok(v.to_owned()),
            None => Err(RemoteXpcError::UnexpectedResponse),
        }
    }

    /// Sends one raw RPPairing frame
    pub async fn send_frame(&mut self, value: &Value) -> Result<(), RemoteXpcError> {
        let body = serde_json::to_vec(value)?;
        if body.len() > u16::MAX as usize {
            return Err(RemoteXpcError::OversizedFrame);
        }
        debug!("Sending RPPairing frame: {value}");

        self.inner.write_all(RPPAIRING_MAGIC).await?;
        self.inner
            .write_all(&(body.len() as u16).to_be_bytes())
            .await?;
        self.inner.write_all(&body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Reads one raw RPPairing frame, validating the magic
    pub async fn read_frame(&mut self) -> Result<Value, RemoteXpcError> {
        let mut magic_buf = [0u8; RPPAIRING_MAGIC.len()];
        self.inner.read_exact(&mut magic_buf).await?;
        if magic_buf != RPPAIRING_MAGIC {
            return Err(RemoteXpcError::InvalidProtocolMagic);
        }

        let len = self.inner.read_u16().await?;
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).await?;

        let value: Value = serde_json::from_slice(&buf)?;
        debug!("Received RPPairing frame: {value}");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_roundtrip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = RpPairingSocket::new(a);
        let mut rx = RpPairingSocket::new(b);

        let body = json!({"request": {"_0": {"handshake": {"_0": {"wireProtocolVersion": 19}}}}});
        tx.send_frame(&body).await.unwrap();
        let got = rx.read_frame().await.unwrap();
        assert_eq!(got, body);
    }

    #[tokio::test]
    async fn plain_envelope_is_unwrapped() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = RpPairingSocket::new(a);
        let mut rx = RpPairingSocket::new(b);

        tx.send_plain(json!({"event": {"_0": {}}}), 1).await.unwrap();
        let got = rx.read_frame().await.unwrap();
        assert_eq!(got.get("originatedBy").and_then(|x| x.as_str()), Some("host"));
        assert_eq!(
            got.get("sequenceNumber").and_then(|x| x.as_u64()),
            Some(1)
        );

        tx.send_plain(json!({"reply": true}), 2).await.unwrap();
        let unwrapped = rx.recv_plain().await.unwrap();
        assert_eq!(unwrapped, json!({"reply": true}));
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let mut rx = RpPairingSocket::new(b);

        let mut a = a;
        a.write_all(b"NOTMAGIC!\x00\x02{}").await.unwrap();
        assert!(matches!(
            rx.read_frame().await,
            Err(RemoteXpcError::InvalidProtocolMagic)
        ));
    }
}
