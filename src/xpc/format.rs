//! XPC wire object and message envelope encoding
//!
//! Objects are framed as a little-endian type tag followed by the payload,
//! with strings and raw data padded to 4-byte boundaries. The envelope adds
//! the `0x29B00B92` magic, flags, body length and message id. Layout must
//! match the device byte-for-byte.

use std::ffi::CString;
use std::io::{BufRead, Cursor, Read};
use std::ops::{BitOr, BitOrAssign};

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::RemoteXpcError;

const OBJECT_MAGIC: u32 = 0x42133742;
const OBJECT_VERSION: u32 = 0x00000005;
const MESSAGE_MAGIC: u32 = 0x29B00B92;

#[derive(Clone, Copy, Debug)]
pub enum XpcFlag {
    AlwaysSet,
    DataFlag,
    WantingReply,
    InitHandshake,
    FileTxStreamRequest,
    FileTxStreamResponse,
    Custom(u32),
}

impl From<XpcFlag> for u32 {
    fn from(value: XpcFlag) -> Self {
        match value {
            XpcFlag::AlwaysSet => 0x00000001,
            XpcFlag::DataFlag => 0x00000100,
            XpcFlag::WantingReply => 0x00010000,
            XpcFlag::FileTxStreamRequest => 0x00100000,
            XpcFlag::FileTxStreamResponse => 0x00200000,
            XpcFlag::InitHandshake => 0x00400000,
            XpcFlag::Custom(inner) => inner,
        }
    }
}

impl BitOr for XpcFlag {
    type Output = XpcFlag;

    fn bitor(self, rhs: Self) -> Self::Output {
        XpcFlag::Custom(u32::from(self) | u32::from(rhs))
    }
}

impl BitOrAssign for XpcFlag {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.bitor(rhs);
    }
}

#[repr(u32)]
enum XpcType {
    Null = 0x00001000,
    Bool = 0x00002000,
    Int64 = 0x00003000,
    UInt64 = 0x00004000,
    Double = 0x00005000,
    Date = 0x00007000,
    Data = 0x00008000,
    String = 0x00009000,
    Uuid = 0x0000a000,
    Array = 0x0000e000,
    Dictionary = 0x0000f000,
    FileTransfer = 0x0001a000,
}

impl TryFrom<u32> for XpcType {
    type Error = RemoteXpcError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x00001000 => Ok(Self::Null),
            0x00002000 => Ok(Self::Bool),
            0x00003000 => Ok(Self::Int64),
            0x00004000 => Ok(Self::UInt64),
            0x00005000 => Ok(Self::Double),
            0x00007000 => Ok(Self::Date),
            0x00008000 => Ok(Self::Data),
            0x00009000 => Ok(Self::String),
            0x0000a000 => Ok(Self::Uuid),
            0x0000e000 => Ok(Self::Array),
            0x0000f000 => Ok(Self::Dictionary),
            0x0001a000 => Ok(Self::FileTransfer),
            _ => Err(RemoteXpcError::UnknownXpcType(value)),
        }
    }
}

pub type Dictionary = IndexMap<String, XpcObject>;

/// A dynamically-typed XPC value
#[derive(Debug, Clone, PartialEq)]
pub enum XpcObject {
    Null,
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Date(std::time::SystemTime),
    Data(Vec<u8>),
    String(String),
    Uuid(uuid::Uuid),
    Array(Vec<XpcObject>),
    Dictionary(Dictionary),
    /// The fd-bearing transfer marker; carries no payload of its own
    FileTransfer {
        msg_id: u64,
        data: Box<XpcObject>,
    },
}

impl XpcObject {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&OBJECT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&OBJECT_VERSION.to_le_bytes());
        self.encode_object(&mut buf);
        buf
    }

    fn encode_object(&self, buf: &mut Vec<u8>) {
        match self {
            XpcObject::Null => {
                buf.extend_from_slice(&(XpcType::Null as u32).to_le_bytes());
            }
            XpcObject::Bool(val) => {
                buf.extend_from_slice(&(XpcType::Bool as u32).to_le_bytes());
                buf.push(u8::from(*val));
                buf.extend_from_slice(&[0, 0, 0]);
            }
            XpcObject::Int64(num) => {
                buf.extend_from_slice(&(XpcType::Int64 as u32).to_le_bytes());
                buf.extend_from_slice(&num.to_le_bytes());
            }
            XpcObject::UInt64(num) => {
                buf.extend_from_slice(&(XpcType::UInt64 as u32).to_le_bytes());
                buf.extend_from_slice(&num.to_le_bytes());
            }
            XpcObject::Double(f) => {
                buf.extend_from_slice(&(XpcType::Double as u32).to_le_bytes());
                buf.extend_from_slice(&f.to_le_bytes());
            }
            XpcObject::Date(date) => {
                let nanos = date
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos() as u64;
                buf.extend_from_slice(&(XpcType::Date as u32).to_le_bytes());
                buf.extend_from_slice(&nanos.to_le_bytes());
            }
            XpcObject::Data(data) => {
                buf.extend_from_slice(&(XpcType::Data as u32).to_le_bytes());
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(&vec![0; padding(data.len())]);
            }
            XpcObject::String(item) => {
                let l = item.len() + 1;
                buf.extend_from_slice(&(XpcType::String as u32).to_le_bytes());
                buf.extend_from_slice(&(l as u32).to_le_bytes());
                buf.extend_from_slice(item.as_bytes());
                buf.push(0);
                buf.extend_from_slice(&vec![0; padding(l)]);
            }
            XpcObject::Uuid(uuid) => {
                buf.extend_from_slice(&(XpcType::Uuid as u32).to_le_bytes());
                buf.extend_from_slice(uuid.as_bytes());
            }
            XpcObject::Array(items) => {
                buf.extend_from_slice(&(XpcType::Array as u32).to_le_bytes());
                let mut content = Vec::new();
                content.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    item.encode_object(&mut content);
                }
                buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
                buf.extend_from_slice(&content);
            }
            XpcObject::Dictionary(dict) => {
                buf.extend_from_slice(&(XpcType::Dictionary as u32).to_le_bytes());
                let mut content = Vec::new();
                content.extend_from_slice(&(dict.len() as u32).to_le_bytes());
                for (k, v) in dict {
                    content.extend_from_slice(k.as_bytes());
                    content.push(0);
                    content.extend_from_slice(&vec![0; padding(k.len() + 1)]);
                    v.encode_object(&mut content);
                }
                buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
                buf.extend_from_slice(&content);
            }
            XpcObject::FileTransfer { msg_id, data } => {
                buf.extend_from_slice(&(XpcType::FileTransfer as u32).to_le_bytes());
                buf.extend_from_slice(&msg_id.to_le_bytes());
                data.encode_object(buf);
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RemoteXpcError> {
        if buf.len() < 8 {
            return Err(RemoteXpcError::NotEnoughBytes(buf.len(), 8));
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != OBJECT_MAGIC {
            warn!("Invalid magic for XpcObject");
            return Err(RemoteXpcError::InvalidXpcMagic);
        }
        let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version != OBJECT_VERSION {
            warn!("Unexpected version for XpcObject");
            return Err(RemoteXpcError::UnexpectedXpcVersion);
        }
        Self::decode_object(&mut Cursor::new(&buf[8..]))
    }

    fn decode_object(cursor: &mut Cursor<&[u8]>) -> Result<Self, RemoteXpcError> {
        let mut buf_32 = [0u8; 4];
        cursor.read_exact(&mut buf_32)?;
        let xpc_type: XpcType = u32::from_le_bytes(buf_32).try_into()?;
        match xpc_type {
            XpcType::Null => Ok(XpcObject::Null),
            XpcType::Bool => {
                let mut buf = [0u8; 4];
                cursor.read_exact(&mut buf)?;
                Ok(XpcObject::Bool(buf[0] != 0))
            }
            XpcType::Int64 => {
                let mut buf = [0u8; 8];
                cursor.read_exact(&mut buf)?;
                Ok(XpcObject::Int64(i64::from_le_bytes(buf)))
            }
            XpcType::UInt64 => {
                let mut buf = [0u8; 8];
                cursor.read_exact(&mut buf)?;
                Ok(XpcObject::UInt64(u64::from_le_bytes(buf)))
            }
            XpcType::Double => {
                let mut buf = [0u8; 8];
                cursor.read_exact(&mut buf)?;
                Ok(XpcObject::Double(f64::from_le_bytes(buf)))
            }
            XpcType::Date => {
                let mut buf = [0u8; 8];
                cursor.read_exact(&mut buf)?;
                Ok(XpcObject::Date(
                    std::time::UNIX_EPOCH
                        + std::time::Duration::from_nanos(u64::from_le_bytes(buf)),
                ))
            }
            XpcType::Data => {
                cursor.read_exact(&mut buf_32)?;
                let l = u32::from_le_bytes(buf_32) as usize;
                let mut data = vec![0; l];
                cursor.read_exact(&mut data)?;
                BufRead::consume(cursor, padding(l));
                Ok(XpcObject::Data(data))
            }
            XpcType::String => {
                cursor.read_exact(&mut buf_32)?;
                let l = u32::from_le_bytes(buf_32) as usize;
                let mut str_buf = vec![0; l];
                cursor.read_exact(&mut str_buf)?;
                let s = CString::from_vec_with_nul(str_buf)
                    .ok()
                    .and_then(|x| x.to_str().ok().map(|x| x.to_string()))
                    .ok_or(RemoteXpcError::InvalidCString)?;
                BufRead::consume(cursor, padding(l));
                Ok(XpcObject::String(s))
            }
            XpcType::Uuid => {
                let mut data = [0u8; 16];
                cursor.read_exact(&mut data)?;
                Ok(XpcObject::Uuid(uuid::Builder::from_bytes(data).into_uuid()))
            }
            XpcType::Array => {
                cursor.read_exact(&mut buf_32)?;
                let _l = u32::from_le_bytes(buf_32);
                cursor.read_exact(&mut buf_32)?;
                let num_entries = u32::from_le_bytes(buf_32);
                let mut ret = Vec::new();
                for _ in 0..num_entries {
                    ret.push(Self::decode_object(cursor)?);
                }
                Ok(XpcObject::Array(ret))
            }
            XpcType::Dictionary => {
                cursor.read_exact(&mut buf_32)?;
                let _l = u32::from_le_bytes(buf_32);
                cursor.read_exact(&mut buf_32)?;
                let num_entries = u32::from_le_bytes(buf_32);

                let mut ret = IndexMap::new();
                for _ in 0..num_entries {
                    let mut key_buf = Vec::new();
                    BufRead::read_until(cursor, 0, &mut key_buf)?;
                    let key = CString::from_vec_with_nul(key_buf)
                        .ok()
                        .and_then(|x| x.to_str().ok().map(|x| x.to_string()))
                        .ok_or(RemoteXpcError::InvalidCString)?;
                    BufRead::consume(cursor, padding(key.len() + 1));
                    ret.insert(key, Self::decode_object(cursor)?);
                }
                Ok(XpcObject::Dictionary(ret))
            }
            XpcType::FileTransfer => {
                let mut id_buf = [0u8; 8];
                cursor.read_exact(&mut id_buf)?;
                let msg_id = u64::from_le_bytes(id_buf);
                let inner = Self::decode_object(cursor)?;
                Ok(XpcObject::FileTransfer {
                    msg_id,
                    data: Box::new(inner),
                })
            }
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            XpcObject::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Self>> {
        match self {
            XpcObject::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            XpcObject::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            XpcObject::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_signed_integer(&self) -> Option<i64> {
        match self {
            XpcObject::String(s) => s.parse().ok(),
            XpcObject::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_unsigned_integer(&self) -> Option<u64> {
        match self {
            XpcObject::String(s) => s.parse().ok(),
            XpcObject::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    /// Converts to a plist value for the service layer
    pub fn to_plist(&self) -> plist::Value {
        match self {
            Self::Null => plist::Value::String(String::new()),
            Self::Bool(v) => plist::Value::Boolean(*v),
            Self::Int64(v) => plist::Value::Integer((*v).into()),
            Self::UInt64(v) => plist::Value::Integer((*v).into()),
            Self::Double(f) => plist::Value::Real(*f),
            Self::Date(d) => plist::Value::Date(plist::Date::from(*d)),
            Self::Data(v) => plist::Value::Data(v.clone()),
            Self::String(v) => plist::Value::String(v.clone()),
            Self::Uuid(uuid) => plist::Value::String(uuid.to_string()),
            Self::Array(v) => plist::Value::Array(v.iter().map(|item| item.to_plist()).collect()),
            Self::Dictionary(v) => {
                let mut dict = plist::Dictionary::new();
                for (k, v) in v {
                    dict.insert(k.clone(), v.to_plist());
                }
                plist::Value::Dictionary(dict)
            }
            Self::FileTransfer { msg_id, data } => {
                let mut dict = plist::Dictionary::new();
                dict.insert("msg_id".into(), (*msg_id).into());
                dict.insert("data".into(), data.to_plist());
                plist::Value::Dictionary(dict)
            }
        }
    }
}

impl From<plist::Value> for XpcObject {
    fn from(value: plist::Value) -> Self {
        match value {
            plist::Value::Array(v) => XpcObject::Array(v.into_iter().map(XpcObject::from).collect()),
            plist::Value::Dictionary(v) => {
                let mut dict = Dictionary::new();
                for (k, v) in v {
                    dict.insert(k, XpcObject::from(v));
                }
                XpcObject::Dictionary(dict)
            }
            plist::Value::Boolean(v) => XpcObject::Bool(v),
            plist::Value::Data(v) => XpcObject::Data(v),
            plist::Value::Date(d) => XpcObject::Date(d.into()),
            plist::Value::Real(f) => XpcObject::Double(f),
            plist::Value::Integer(v) => match v.as_signed() {
                Some(i) => XpcObject::Int64(i),
                None => XpcObject::UInt64(v.as_unsigned().unwrap_or_default()),
            },
            plist::Value::String(v) => XpcObject::String(v),
            _ => XpcObject::Null,
        }
    }
}

impl From<Dictionary> for XpcObject {
    fn from(value: Dictionary) -> Self {
        XpcObject::Dictionary(value)
    }
}

fn padding(len: usize) -> usize {
    len.next_multiple_of(4) - len
}

/// The framed message envelope carried inside HTTP/2 DATA frames
pub struct XpcMessage {
    pub flags: u32,
    pub message: Option<XpcObject>,
    pub message_id: Option<u64>,
}

impl XpcMessage {
    pub fn new(flags: Option<XpcFlag>, message: Option<XpcObject>, message_id: Option<u64>) -> Self {
        Self {
            flags: flags.unwrap_or(XpcFlag::AlwaysSet).into(),
            message,
            message_id,
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, RemoteXpcError> {
        if data.len() < 24 {
            return Err(RemoteXpcError::NotEnoughBytes(data.len(), 24));
        }

        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != MESSAGE_MAGIC {
            warn!("XpcMessage magic is invalid");
            return Err(RemoteXpcError::MalformedXpc);
        }

        let flags = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let body_len = u64::from_le_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        let message_id = u64::from_le_bytes([
            data[16], data[17], data[18], data[19], data[20], data[21], data[22], data[23],
        ]);
        if body_len + 24 > data.len() as u64 {
            debug!(
                "Body length is {body_len}, but only {} bytes received",
                data.len()
            );
            return Err(RemoteXpcError::PacketSizeMismatch);
        }

        Ok(Self {
            flags,
            message: if body_len > 0 {
                Some(XpcObject::decode(&data[24..24 + body_len as usize])?)
            } else {
                None
            },
            message_id: Some(message_id),
        })
    }

    pub fn encode(self, message_id: u64) -> Vec<u8> {
        let mut out = MESSAGE_MAGIC.to_le_bytes().to_vec();
        out.extend_from_slice(&self.flags.to_le_bytes());
        match self.message {
            Some(message) => {
                let body = message.encode();
                out.extend_from_slice(&(body.len() as u64).to_le_bytes());
                out.extend_from_slice(&message_id.to_le_bytes());
                out.extend_from_slice(&body);
            }
            None => {
                out.extend_from_slice(&0_u64.to_le_bytes());
                out.extend_from_slice(&message_id.to_le_bytes());
            }
        }
        out
    }
}

impl std::fmt::Debug for XpcMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        for (bit, name) in [
            (0x00000001, "AlwaysSet"),
            (0x00000100, "DataFlag"),
            (0x00010000, "WantingReply"),
            (0x00400000, "InitHandshake"),
        ] {
            if self.flags & bit != 0 {
                parts.push(name.to_string());
            }
        }
        let known = 0x00000001 | 0x00000100 | 0x00010000 | 0x00400000;
        let custom = self.flags & !known;
        if custom != 0 {
            parts.push(format!("Custom(0x{custom:08X})"));
        }
        write!(
            f,
            "XpcMessage {{ flags: [{}], message_id: {:?}, message: {:?} }}",
            parts.join(" | "),
            self.message_id,
            self.message
        )
    }
}
