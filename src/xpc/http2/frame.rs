// Jackson Coxson

use crate::{ReadWrite, RemoteXpcError};
use tokio::io::AsyncReadExt;

pub trait HttpFrame {
    fn serialize(&self) -> Vec<u8>;
}

/// Frames the client cares about; everything else is surfaced as an error
/// or handled inline by the reader
#[derive(Debug)]
pub enum Frame {
    Settings(SettingsFrame),
    WindowUpdate(WindowUpdateFrame),
    Headers(HeadersFrame),
    Data(DataFrame),
    Ping(PingFrame),
}

impl Frame {
    pub async fn next(socket: &mut impl ReadWrite) -> Result<Self, RemoteXpcError> {
        // 24-bit length, then type, flags and stream id
        let mut buf = [0u8; 3];
        socket.read_exact(&mut buf).await?;
        let frame_len = u32::from_be_bytes([0x00, buf[0], buf[1], buf[2]]);

        let frame_type = socket.read_u8().await?;
        let flags = socket.read_u8().await?;
        let stream_id = socket.read_u32().await? & 0x7FFF_FFFF;

        let mut body = vec![0; frame_len as usize];
        socket.read_exact(&mut body).await?;

        Ok(match frame_type {
            0x00 => Self::Data(DataFrame {
                stream_id,
                payload: body,
            }),
            0x01 => Self::Headers(HeadersFrame { stream_id, flags }),
            0x03 => return Err(RemoteXpcError::HttpStreamReset),
            0x04 => {
                let mut settings = Vec::new();
                let mut idx = 0;
                while idx + 6 <= body.len() {
                    let setting_type = u16::from_be_bytes([body[idx], body[idx + 1]]);
                    let value = u32::from_be_bytes([
                        body[idx + 2],
                        body[idx + 3],
                        body[idx + 4],
                        body[idx + 5],
                    ]);
                    idx += 6;
                    settings.push(match setting_type {
                        0x01 => Setting::HeaderTableSize(value),
                        0x02 => Setting::EnablePush(value),
                        0x03 => Setting::MaxConcurrentStreams(value),
                        0x04 => Setting::InitialWindowSize(value),
                        0x05 => Setting::MaxFrameSize(value),
                        0x06 => Setting::MaxHeaderListSize(value),
                        0x08 => Setting::EnableConnectProtocol(value),
                        _ => return Err(RemoteXpcError::UnknownHttpSetting(setting_type)),
                    });
                }
                Self::Settings(SettingsFrame {
                    settings,
                    stream_id,
                    flags,
                })
            }
            0x06 => {
                if body.len() != 8 {
                    return Err(RemoteXpcError::UnexpectedResponse);
                }
                let mut payload = [0u8; 8];
                payload.copy_from_slice(&body);
                Self::Ping(PingFrame { flags, payload })
            }
            0x07 => {
                let msg = if body.len() < 8 {
                    "<MISSING>".to_string()
                } else {
                    String::from_utf8_lossy(&body[8..]).to_string()
                };
                return Err(RemoteXpcError::HttpGoAway(msg));
            }
            0x08 => {
                if body.len() != 4 {
                    return Err(RemoteXpcError::UnexpectedResponse);
                }
                let window = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                Self::WindowUpdate(WindowUpdateFrame {
                    increment_size: window,
                    stream_id,
                })
            }
            _ => return Err(RemoteXpcError::UnknownFrame(frame_type)),
        })
    }
}

fn header(body_len: usize, frame_type: u8, flags: u8, stream_id: u32) -> Vec<u8> {
    let len = (body_len as u32).to_be_bytes();
    let mut res = vec![len[1], len[2], len[3], frame_type, flags];
    res.extend(stream_id.to_be_bytes());
    res
}

#[derive(Debug, Clone)]
pub struct SettingsFrame {
    pub settings: Vec<Setting>,
    pub stream_id: u32,
    pub flags: u8,
}

impl SettingsFrame {
    pub const ACK: u8 = 0x01;

    pub fn ack() -> Self {
        Self {
            settings: Vec::new(),
            stream_id: 0,
            flags: Self::ACK,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Setting {
    HeaderTableSize(u32),
    EnablePush(u32),
    MaxConcurrentStreams(u32),
    InitialWindowSize(u32),
    MaxFrameSize(u32),
    MaxHeaderListSize(u32),
    EnableConnectProtocol(u32),
}

impl Setting {
    fn id_and_value(&self) -> (u16, u32) {
        match *self {
            Setting::HeaderTableSize(v) => (0x01, v),
            Setting::EnablePush(v) => (0x02, v),
            Setting::MaxConcurrentStreams(v) => (0x03, v),
            Setting::InitialWindowSize(v) => (0x04, v),
            Setting::MaxFrameSize(v) => (0x05, v),
            Setting::MaxHeaderListSize(v) => (0x06, v),
            Setting::EnableConnectProtocol(v) => (0x08, v),
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let (id, value) = self.id_and_value();
        let mut res = id.to_be_bytes().to_vec();
        res.extend(value.to_be_bytes());
        res
    }
}

impl HttpFrame for SettingsFrame {
    fn serialize(&self) -> Vec<u8> {
        let settings = self
            .settings
            .iter()
            .map(|x| x.serialize())
            .collect::<Vec<Vec<u8>>>()
            .concat();
        let mut res = header(settings.len(), 0x04, self.flags, self.stream_id);
        res.extend(settings);
        res
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    pub increment_size: u32,
    pub stream_id: u32,
}

impl HttpFrame for WindowUpdateFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut res = header(4, 0x08, 0x00, self.stream_id);
        res.extend(self.increment_size.to_be_bytes());
        res
    }
}

/// Opens a stream. RemoteXPC headers are always empty and uncompressed, so
/// the body is omitted and END_HEADERS is set.
#[derive(Debug, Clone, Copy)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub flags: u8,
}

impl HeadersFrame {
    pub const END_HEADERS: u8 = 0x04;
}

impl HttpFrame for HeadersFrame {
    fn serialize(&self) -> Vec<u8> {
        header(0, 0x01, self.flags, self.stream_id)
    }
}

#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl HttpFrame for DataFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut res = header(self.payload.len(), 0x00, 0x00, self.stream_id);
        res.extend(&self.payload);
        res
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    pub flags: u8,
    pub payload: [u8; 8],
}

impl PingFrame {
    pub const ACK: u8 = 0x01;

    pub fn ack(payload: [u8; 8]) -> Self {
        Self {
            flags: Self::ACK,
            payload,
        }
    }
}

impl HttpFrame for PingFrame {
    fn serialize(&self) -> Vec<u8> {
        let mut res = header(8, 0x06, self.flags, 0);
        res.extend(self.payload);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn settings_frame_bytes() {
        let frame = SettingsFrame {
            settings: vec![
                Setting::MaxConcurrentStreams(100),
                Setting::InitialWindowSize(1048576),
            ],
            stream_id: 0,
            flags: 0,
        };
        let bytes = frame.serialize();
        assert_eq!(
            bytes,
            vec![
                0x00, 0x00, 0x0C, // length 12
                0x04, 0x00, // type, flags
                0x00, 0x00, 0x00, 0x00, // stream 0
                0x00, 0x03, 0x00, 0x00, 0x00, 0x64, // max streams 100
                0x00, 0x04, 0x00, 0x10, 0x00, 0x00, // window 1048576
            ]
        );
    }

    #[test]
    fn window_update_frame_bytes() {
        let bytes = WindowUpdateFrame {
            increment_size: 983041,
            stream_id: 0,
        }
        .serialize();
        assert_eq!(
            bytes,
            vec![0x00, 0x00, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0F, 0x00, 0x01]
        );
    }

    #[test]
    fn headers_frame_is_empty_with_end_headers() {
        let bytes = HeadersFrame {
            stream_id: 1,
            flags: HeadersFrame::END_HEADERS,
        }
        .serialize();
        assert_eq!(
            bytes,
            vec![0x00, 0x00, 0x00, 0x01, 0x04, 0x00, 0x00, 0x00, 0x01]
        );
    }

    #[tokio::test]
    async fn frames_roundtrip_over_a_socket() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        a.write_all(
            &DataFrame {
                stream_id: 3,
                payload: vec![0xAB; 5],
            }
            .serialize(),
        )
        .await
        .unwrap();
        match Frame::next(&mut b).await.unwrap() {
            Frame::Data(d) => {
                assert_eq!(d.stream_id, 3);
                assert_eq!(d.payload, vec![0xAB; 5]);
            }
            other => panic!("expected data frame, got {other:?}"),
        }

        a.write_all(&SettingsFrame::ack().serialize()).await.unwrap();
        match Frame::next(&mut b).await.unwrap() {
            Frame::Settings(s) => assert_eq!(s.flags, SettingsFrame::ACK),
            other => panic!("expected settings frame, got {other:?}"),
        }

        a.write_all(&PingFrame::ack([1, 2, 3, 4, 5, 6, 7, 8]).serialize())
            .await
            .unwrap();
        match Frame::next(&mut b).await.unwrap() {
            Frame::Ping(p) => {
                assert_eq!(p.flags, PingFrame::ACK);
                assert_eq!(p.payload, [1, 2, 3, 4, 5, 6, 7, 8]);
            }
            other => panic!("expected ping frame, got {other:?}"),
        }

        // a single-byte DATA frame is legal
        a.write_all(
            &DataFrame {
                stream_id: 1,
                payload: vec![0x01],
            }
            .serialize(),
        )
        .await
        .unwrap();
        match Frame::next(&mut b).await.unwrap() {
            Frame::Data(d) => assert_eq!(d.payload.len(), 1),
            other => panic!("expected data frame, got {other:?}"),
        }
    }
}
