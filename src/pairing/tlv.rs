// Jackson Coxson

use crate::RemoteXpcError;

/// TLV types used by the HomeKit-derived pairing protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PairingDataComponentType {
    Method = 0x00,
    Identifier = 0x01,
    Salt = 0x02,
    PublicKey = 0x03,
    Proof = 0x04,
    EncryptedData = 0x05,
    State = 0x06,
    ErrorResponse = 0x07,
    RetryDelay = 0x08,
    Certificate = 0x09,
    Signature = 0x0a,
    Permissions = 0x0b,
    FragmentData = 0x0c,
    FragmentLast = 0x0d,
    SessionId = 0x0e,
    Ttl = 0x0f,
    ExtraData = 0x10,
    Info = 0x11,
    Acl = 0x12,
    Flags = 0x13,
    ValidationData = 0x14,
    Separator = 0xff,
}

/// Error codes carried in an `ErrorResponse` item
pub mod error_codes {
    pub const UNKNOWN: u8 = 0x01;
    pub const AUTHENTICATION: u8 = 0x02;
    pub const BACKOFF: u8 = 0x03;
    pub const MAX_PEERS: u8 = 0x04;
    pub const MAX_TRIES: u8 = 0x05;
    pub const UNAVAILABLE: u8 = 0x06;
    pub const BUSY: u8 = 0x07;

    /// Human mapping for Pair-Verify STATE=4 failures
    pub fn describe(code: u8) -> &'static str {
        match code {
            AUTHENTICATION => "Authentication failed - invalid pair record",
            BACKOFF => "Device requested a backoff before retrying",
            MAX_PEERS => "Device has reached its maximum number of paired peers",
            MAX_TRIES => "Maximum pairing attempts exceeded",
            UNAVAILABLE => "Pairing is unavailable",
            BUSY => "Device is busy with another pairing attempt",
            _ => "Unknown pairing error",
        }
    }
}

/// A single decoded TLV item
///
/// `kind` is the raw type byte so unrecognized types pass through intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv8Entry {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl Tlv8Entry {
    pub fn new(kind: PairingDataComponentType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind as u8,
            data: data.into(),
        }
    }

    /// Pairing state marker (M1..M6, verify states 1..4)
    pub fn state(stage: u8) -> Self {
        Self::new(PairingDataComponentType::State, vec![stage])
    }

    pub fn is(&self, kind: PairingDataComponentType) -> bool {
        self.kind == kind as u8
    }
}

/// Serializes entries, fragmenting values longer than 255 bytes into
/// consecutive items of the same type
pub fn serialize_tlv8(entries: &[Tlv8Entry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        if entry.data.is_empty() {
            out.push(entry.kind);
            out.push(0);
            continue;
        }
        for chunk in entry.data.chunks(255) {
            out.push(entry.kind);
            out.push(chunk.len() as u8);
            out.extend_from_slice(chunk);
        }
    }
    out
}

/// Deserializes a TLV8 byte stream
///
/// Adjacent items of the same type are concatenated in order, making
/// fragmentation invisible to callers. Truncated input fails with
/// `MalformedTlv`.
pub fn deserialize_tlv8(input: &[u8]) -> Result<Vec<Tlv8Entry>, RemoteXpcError> {
    let mut index = 0;
    let mut result: Vec<Tlv8Entry> = Vec::new();

    while index < input.len() {
        if index + 2 > input.len() {
            return Err(RemoteXpcError::MalformedTlv);
        }
        let kind = input[index];
        let length = input[index + 1] as usize;
        index += 2;

        if index + length > input.len() {
            return Err(RemoteXpcError::MalformedTlv);
        }
        let data = &input[index..index + length];
        index += length;

        match result.last_mut() {
            // adjacent same-type items are fragments of one value
            Some(prev) if prev.kind == kind && !prev.data.is_empty() => {
                prev.data.extend_from_slice(data);
            }
            _ => result.push(Tlv8Entry {
                kind,
                data: data.to_vec(),
            }),
        }
    }

    Ok(result)
}

/// Last-wins dictionary view over a decoded entry list
#[derive(Debug)]
pub struct Tlv8Dict {
    entries: Vec<Tlv8Entry>,
}

impl Tlv8Dict {
    pub fn decode(input: &[u8]) -> Result<Self, RemoteXpcError> {
        Ok(Self {
            entries: deserialize_tlv8(input)?,
        })
    }

    pub fn from_entries(entries: Vec<Tlv8Entry>) -> Self {
        Self { entries }
    }

    pub fn get(&self, kind: PairingDataComponentType) -> Option<&[u8]> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.is(kind))
            .map(|e| e.data.as_slice())
    }

    pub fn error(&self) -> Option<u8> {
        self.get(PairingDataComponentType::ErrorResponse)
            .and_then(|v| v.first().copied())
    }

    pub fn state(&self) -> Option<u8> {
        self.get(PairingDataComponentType::State)
            .and_then(|v| v.first().copied())
    }
}
