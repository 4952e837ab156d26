// Jackson Coxson

/// The 16-byte little-endian usbmuxd packet header plus an XML plist body
pub struct RawPacket {
    pub size: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
    pub plist: plist::Dictionary,
}

impl RawPacket {
    pub fn new(plist: plist::Dictionary, version: u32, message: u32, tag: u32) -> Self {
        Self {
            size: 0,
            version,
            message,
            tag,
            plist,
        }
    }
}

impl From<RawPacket> for Vec<u8> {
    fn from(packet: RawPacket) -> Self {
        let mut body = Vec::new();
        plist::to_writer_xml(&mut body, &packet.plist).expect("dictionary serializes");

        let size = (16 + body.len()) as u32;
        let mut res = Vec::with_capacity(size as usize);
        res.extend_from_slice(&size.to_le_bytes());
        res.extend_from_slice(&packet.version.to_le_bytes());
        res.extend_from_slice(&packet.message.to_le_bytes());
        res.extend_from_slice(&packet.tag.to_le_bytes());
        res.extend_from_slice(&body);
        res
    }
}
