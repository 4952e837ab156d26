//! DTX wire format
//!
//! Every instruments packet is a little-endian frame: a 32-byte routing
//! header, a 16-byte section header giving the auxiliary and payload
//! sizes, an optional auxiliary section of typed call arguments, and a
//! payload that is an NSKeyedArchiver graph (for method calls, the
//! selector string). Large packets arrive split into fragments that share
//! one routing header; the first fragment of a multipart packet carries
//! no body at all.
//!
//! All length fields come off the wire untrusted. Any header whose sizes
//! disagree with the bytes actually received fails with `MalformedDtx`
//! instead of being sliced on faith.

use plist::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::RemoteXpcError;
use crate::dvt::archiver;

const DTX_MAGIC: u32 = 0x1F3D5B79;
const ROUTING_HEADER_LEN: u32 = 32;

/// Flag marking a payload as an Objective-C method invocation
const FLAG_METHOD_INVOCATION: u32 = 0x2;

/// Capacity hint the aux section always advertises
const AUX_CAPACITY_HINT: u32 = 496;

/// One typed argument in the auxiliary section
#[derive(Clone, PartialEq)]
pub enum AuxValue {
    /// UTF-8 text (wire type 0x01)
    String(String),
    /// Raw bytes, usually an archived object (wire type 0x02)
    Bytes(Vec<u8>),
    /// 32-bit unsigned integer (wire type 0x03)
    U32(u32),
    /// 64-bit signed integer (wire type 0x06)
    I64(i64),
}

impl AuxValue {
    /// Wraps a value as an NSKeyedArchived argument
    pub fn archived(v: impl Into<Value>) -> Result<Self, RemoteXpcError> {
        Ok(Self::Bytes(archiver::to_bytes(v.into())?))
    }
}

impl std::fmt::Debug for AuxValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.debug_tuple("String").field(s).finish(),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::U32(n) => f.debug_tuple("U32").field(n).finish(),
            Self::I64(n) => f.debug_tuple("I64").field(n).finish(),
        }
    }
}

/// One decoded DTX packet
///
/// The wire headers are folded into plain fields; encoding rebuilds them
/// with correct sizes, so messages cannot be constructed with lying
/// lengths.
#[derive(Debug, PartialEq)]
pub struct DtxMessage {
    pub channel: u32,
    pub identifier: u32,
    pub conversation_index: u32,
    pub expects_reply: bool,
    pub flags: u32,
    pub aux: Vec<AuxValue>,
    pub payload: Option<Value>,
}

impl DtxMessage {
    /// A method invocation: the selector travels archived in the payload,
    /// arguments in the auxiliary section
    pub fn method_call(
        channel: u32,
        identifier: u32,
        selector: &str,
        aux: Vec<AuxValue>,
        expects_reply: bool,
    ) -> Self {
        Self {
            channel,
            identifier,
            conversation_index: 0,
            expects_reply,
            flags: FLAG_METHOD_INVOCATION,
            aux,
            payload: Some(Value::String(selector.to_string())),
        }
    }

    /// Serializes as a single-fragment packet
    pub fn encode(&self) -> Result<Vec<u8>, RemoteXpcError> {
        let aux = encode_aux(&self.aux);
        let payload = match &self.payload {
            Some(v) => archiver::to_bytes(v.to_owned())?,
            None => Vec::new(),
        };
        let body_len = 16 + aux.len() + payload.len();

        let mut out = Vec::with_capacity(32 + body_len);
        out.extend_from_slice(&DTX_MAGIC.to_le_bytes());
        out.extend_from_slice(&ROUTING_HEADER_LEN.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // fragment 0 of 1
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.extend_from_slice(&self.identifier.to_le_bytes());
        out.extend_from_slice(&self.conversation_index.to_le_bytes());
        out.extend_from_slice(&self.channel.to_le_bytes());
        out.extend_from_slice(&u32::from(self.expects_reply).to_le_bytes());

        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&(aux.len() as u32).to_le_bytes());
        out.extend_from_slice(&((aux.len() + payload.len()) as u64).to_le_bytes());
        out.extend_from_slice(&aux);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Reads one packet, reassembling fragments
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, RemoteXpcError> {
        let mut body: Vec<u8> = Vec::new();
        let route = loop {
            let mut head = [0u8; 32];
            reader.read_exact(&mut head).await?;
            let route = RoutingHeader::parse(&head)?;

            if route.fragment_count > 1 && route.fragment_id == 0 {
                // bare announcement header, the body starts with the next
                // fragment
                continue;
            }
            let mut chunk = vec![0u8; route.body_len as usize];
            reader.read_exact(&mut chunk).await?;
            body.extend(chunk);
            if route.fragment_id == route.fragment_count - 1 {
                break route;
            }
        };

        if body.len() < 16 {
            return Err(RemoteXpcError::NotEnoughBytes(body.len(), 16));
        }
        let flags = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let aux_len = u32::from_le_bytes(body[4..8].try_into().unwrap()) as u64;
        let total_len = u64::from_le_bytes(body[8..16].try_into().unwrap());

        // the section sizes must agree with each other and with the bytes
        // actually on hand
        let payload_len = total_len
            .checked_sub(aux_len)
            .ok_or(RemoteXpcError::MalformedDtx)?;
        if total_len > (body.len() - 16) as u64 {
            return Err(RemoteXpcError::MalformedDtx);
        }

        let aux_end = 16 + aux_len as usize;
        let aux = if aux_len > 0 {
            parse_aux(&body[16..aux_end])?
        } else {
            Vec::new()
        };

        let payload_bytes = &body[aux_end..aux_end + payload_len as usize];
        let payload = if payload_bytes.is_empty() {
            None
        } else {
            Some(archiver::from_bytes(payload_bytes)?)
        };

        Ok(Self {
            channel: route.channel,
            identifier: route.identifier,
            conversation_index: route.conversation_index,
            expects_reply: route.expects_reply,
            flags,
            aux,
            payload,
        })
    }
}

/// The fixed 32-byte routing header, kept internal to the codec
struct RoutingHeader {
    fragment_id: u16,
    fragment_count: u16,
    body_len: u32,
    identifier: u32,
    conversation_index: u32,
    channel: u32,
    expects_reply: bool,
}

impl RoutingHeader {
    fn parse(buf: &[u8; 32]) -> Result<Self, RemoteXpcError> {
        if u32::from_le_bytes(buf[0..4].try_into().unwrap()) != DTX_MAGIC {
            return Err(RemoteXpcError::MalformedDtx);
        }
        let fragment_count = u16::from_le_bytes(buf[10..12].try_into().unwrap());
        if fragment_count == 0 {
            return Err(RemoteXpcError::MalformedDtx);
        }
        Ok(Self {
            fragment_id: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
            fragment_count,
            body_len: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            identifier: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            conversation_index: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            channel: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            expects_reply: u32::from_le_bytes(buf[28..32].try_into().unwrap()) == 1,
        })
    }
}

/// Parses the auxiliary section (capacity header plus tagged values)
fn parse_aux(buf: &[u8]) -> Result<Vec<AuxValue>, RemoteXpcError> {
    if buf.len() < 16 {
        return Err(RemoteXpcError::NotEnoughBytes(buf.len(), 16));
    }

    let mut values = Vec::new();
    let mut pos = 16;
    while pos + 4 <= buf.len() {
        let tag = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        pos += 4;
        match tag {
            // empty marker written before every value
            0x0a => {}
            0x01 | 0x02 => {
                if pos + 4 > buf.len() {
                    return Err(RemoteXpcError::MalformedDtx);
                }
                let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
                pos += 4;
                if len > buf.len() - pos {
                    return Err(RemoteXpcError::MalformedDtx);
                }
                let data = buf[pos..pos + len].to_vec();
                pos += len;
                values.push(if tag == 0x01 {
                    AuxValue::String(String::from_utf8(data)?)
                } else {
                    AuxValue::Bytes(data)
                });
            }
            0x03 => {
                if pos + 4 > buf.len() {
                    return Err(RemoteXpcError::MalformedDtx);
                }
                values.push(AuxValue::U32(u32::from_le_bytes(
                    buf[pos..pos + 4].try_into().unwrap(),
                )));
                pos += 4;
            }
            0x06 => {
                if pos + 8 > buf.len() {
                    return Err(RemoteXpcError::MalformedDtx);
                }
                values.push(AuxValue::I64(i64::from_le_bytes(
                    buf[pos..pos + 8].try_into().unwrap(),
                )));
                pos += 8;
            }
            other => return Err(RemoteXpcError::UnknownAuxValueType(other)),
        }
    }
    Ok(values)
}

fn encode_aux(values: &[AuxValue]) -> Vec<u8> {
    if values.is_empty() {
        return Vec::new();
    }

    let mut body = Vec::new();
    for v in values {
        body.extend_from_slice(&0x0a_u32.to_le_bytes());
        match v {
            AuxValue::String(s) => {
                body.extend_from_slice(&0x01_u32.to_le_bytes());
                body.extend_from_slice(&(s.len() as u32).to_le_bytes());
                body.extend_from_slice(s.as_bytes());
            }
            AuxValue::Bytes(b) => {
                body.extend_from_slice(&0x02_u32.to_le_bytes());
                body.extend_from_slice(&(b.len() as u32).to_le_bytes());
                body.extend_from_slice(b);
            }
            AuxValue::U32(n) => {
                body.extend_from_slice(&0x03_u32.to_le_bytes());
                body.extend_from_slice(&n.to_le_bytes());
            }
            AuxValue::I64(n) => {
                body.extend_from_slice(&0x06_u32.to_le_bytes());
                body.extend_from_slice(&n.to_le_bytes());
            }
        }
    }

    let mut out = Vec::with_capacity(16 + body.len());
    out.extend_from_slice(&AUX_CAPACITY_HINT.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn method_calls_roundtrip() {
        let msg = DtxMessage::method_call(
            3,
            7,
            "runningProcesses",
            vec![AuxValue::U32(42), AuxValue::String("filter".into())],
            true,
        );

        let bytes = msg.encode().unwrap();
        let mut reader = &bytes[..];
        let decoded = DtxMessage::read(&mut reader).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn bodiless_message_roundtrips() {
        let msg = DtxMessage {
            channel: 0,
            identifier: 1,
            conversation_index: 1,
            expects_reply: false,
            flags: 0,
            aux: Vec::new(),
            payload: None,
        };
        let bytes = msg.encode().unwrap();
        let mut reader = &bytes[..];
        let decoded = DtxMessage::read(&mut reader).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn archived_arguments_decode() {
        let aux = AuxValue::archived(Value::String("com.apple.instruments".into())).unwrap();
        match &aux {
            AuxValue::Bytes(bytes) => {
                let decoded = archiver::from_bytes(bytes).unwrap();
                assert_eq!(decoded.as_string(), Some("com.apple.instruments"));
            }
            other => panic!("expected bytes, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn aux_length_larger_than_total_is_malformed() {
        // routing header for a 16-byte body whose section header claims
        // aux_len 32 > total_len 16
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&DTX_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&ROUTING_HEADER_LEN.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 12]); // identifier, conversation, channel
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // flags
        bytes.extend_from_slice(&32u32.to_le_bytes()); // aux_len
        bytes.extend_from_slice(&16u64.to_le_bytes()); // total_len

        let mut reader = &bytes[..];
        assert!(matches!(
            DtxMessage::read(&mut reader).await,
            Err(RemoteXpcError::MalformedDtx)
        ));
    }

    #[tokio::test]
    async fn total_length_beyond_body_is_malformed() {
        // section header promises more bytes than the fragment delivered
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&DTX_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&ROUTING_HEADER_LEN.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 12]);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // flags
        bytes.extend_from_slice(&0u32.to_le_bytes()); // aux_len
        bytes.extend_from_slice(&4096u64.to_le_bytes()); // total_len

        let mut reader = &bytes[..];
        assert!(matches!(
            DtxMessage::read(&mut reader).await,
            Err(RemoteXpcError::MalformedDtx)
        ));
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let bytes = vec![0u8; 64];
        let mut reader = &bytes[..];
        assert!(matches!(
            DtxMessage::read(&mut reader).await,
            Err(RemoteXpcError::MalformedDtx)
        ));
    }

    #[tokio::test]
    async fn zero_fragment_count_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&DTX_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&ROUTING_HEADER_LEN.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&0u16.to_le_bytes()); // fragment count 0
        bytes.extend_from_slice(&[0u8; 20]);

        let mut reader = &bytes[..];
        assert!(matches!(
            DtxMessage::read(&mut reader).await,
            Err(RemoteXpcError::MalformedDtx)
        ));
    }

    #[tokio::test]
    async fn fragments_are_reassembled() {
        // split one encoded message body across two fragments that share
        // the routing metadata, preceded by the bare announcement header
        let msg = DtxMessage::method_call(1, 9, "selector", vec![AuxValue::I64(-1)], false);
        let encoded = msg.encode().unwrap();
        let body = &encoded[32..];
        let mid = body.len() / 2;

        let header = |fragment_id: u16, body_len: u32| {
            let mut h = Vec::new();
            h.extend_from_slice(&DTX_MAGIC.to_le_bytes());
            h.extend_from_slice(&ROUTING_HEADER_LEN.to_le_bytes());
            h.extend_from_slice(&fragment_id.to_le_bytes());
            h.extend_from_slice(&3u16.to_le_bytes());
            h.extend_from_slice(&body_len.to_le_bytes());
            h.extend_from_slice(&9u32.to_le_bytes());
            h.extend_from_slice(&0u32.to_le_bytes());
            h.extend_from_slice(&1u32.to_le_bytes());
            h.extend_from_slice(&0u32.to_le_bytes());
            h
        };

        let mut wire = Vec::new();
        wire.extend(header(0, 0));
        wire.extend(header(1, mid as u32));
        wire.extend_from_slice(&body[..mid]);
        wire.extend(header(2, (body.len() - mid) as u32));
        wire.extend_from_slice(&body[mid..]);

        let mut reader = &wire[..];
        let decoded = DtxMessage::read(&mut reader).await.unwrap();
        assert_eq!(decoded.aux, msg.aux);
        assert_eq!(decoded.payload, msg.payload);
        assert_eq!(decoded.identifier, 9);
    }
}
