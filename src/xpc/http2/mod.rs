// Jackson Coxson

use frame::HttpFrame;
use std::collections::{HashMap, VecDeque};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{ReadWrite, RemoteXpcError};

pub mod frame;
pub use frame::Setting;

const HTTP2_MAGIC: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// RFC 7540 defaults until the peer's SETTINGS arrive
const DEFAULT_WINDOW: i64 = 65535;
const DEFAULT_MAX_FRAME_SIZE: usize = 16384;

/// Minimal HTTP/2 client for the RemoteXPC subset
///
/// One socket, uncompressed empty headers, and DATA frames multiplexed by
/// stream id. Received payloads for streams other than the one being read
/// are parked in per-stream queues. Flow control is honored on the send
/// side: DATA is fragmented at the peer's max frame size and the client
/// blocks on the peer's window before writing.
pub struct Http2Client<R: ReadWrite> {
    inner: R,
    cache: HashMap<u32, VecDeque<Vec<u8>>>,
    connection_window: i64,
    stream_windows: HashMap<u32, i64>,
    initial_window: i64,
    max_frame_size: usize,
}

impl<R: ReadWrite> std::fmt::Debug for Http2Client<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Client")
            .field("connection_window", &self.connection_window)
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

impl<R: ReadWrite> Http2Client<R> {
    /// Writes the connection preface
    ///
    /// The device side drops the preface if it arrives too soon after the
    /// TCP handshake; the 100 ms settle delay is required.
    pub async fn new(mut inner: R) -> Result<Self, RemoteXpcError> {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        inner.write_all(HTTP2_MAGIC).await?;
        inner.flush().await?;
        Ok(Self {
            inner,
            cache: HashMap::new(),
            connection_window: DEFAULT_WINDOW,
            stream_windows: HashMap::new(),
            initial_window: DEFAULT_WINDOW,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        })
    }

    pub async fn set_settings(
        &mut self,
        settings: Vec<Setting>,
        stream_id: u32,
    ) -> Result<(), RemoteXpcError> {
        let frame = frame::SettingsFrame {
            settings,
            stream_id,
            flags: 0,
        }
        .serialize();
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Acknowledges the peer's SETTINGS
    pub async fn settings_ack(&mut self) -> Result<(), RemoteXpcError> {
        let frame = frame::SettingsFrame::ack().serialize();
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn window_update(
        &mut self,
        increment_size: u32,
        stream_id: u32,
    ) -> Result<(), RemoteXpcError> {
        let frame = frame::WindowUpdateFrame {
            increment_size,
            stream_id,
        }
        .serialize();
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Opens a stream by sending an empty HEADERS frame
    pub async fn open_stream(&mut self, stream_id: u32) -> Result<(), RemoteXpcError> {
        self.cache.entry(stream_id).or_default();
        self.stream_windows
            .entry(stream_id)
            .or_insert(self.initial_window);
        let frame = frame::HeadersFrame {
            stream_id,
            flags: frame::HeadersFrame::END_HEADERS,
        }
        .serialize();
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Sends a payload as one or more DATA frames
    ///
    /// Fragments at the peer's max frame size and waits for window credit
    /// when the peer's flow-control window is exhausted.
    pub async fn send(&mut self, payload: Vec<u8>, stream_id: u32) -> Result<(), RemoteXpcError> {
        self.stream_windows
            .entry(stream_id)
            .or_insert(self.initial_window);

        let mut offset = 0;
        while offset < payload.len() {
            let chunk_len = (payload.len() - offset).min(self.max_frame_size);

            while self.connection_window < chunk_len as i64
                || self.stream_windows[&stream_id] < chunk_len as i64
            {
                debug!("Send window exhausted, waiting for WINDOW_UPDATE");
                let frame = frame::Frame::next(&mut self.inner).await?;
                if let Some((id, data)) = self.process_frame(frame).await? {
                    self.cache.entry(id).or_default().push_back(data);
                }
            }

            let frame = frame::DataFrame {
                stream_id,
                payload: payload[offset..offset + chunk_len].to_vec(),
            }
            .serialize();
            self.inner.write_all(&frame).await?;
            self.inner.flush().await?;

            self.connection_window -= chunk_len as i64;
            if let Some(w) = self.stream_windows.get_mut(&stream_id) {
                *w -= chunk_len as i64;
            }
            offset += chunk_len;
        }
        if payload.is_empty() {
            let frame = frame::DataFrame {
                stream_id,
                payload: Vec::new(),
            }
            .serialize();
            self.inner.write_all(&frame).await?;
            self.inner.flush().await?;
        }
        Ok(())
    }

    /// Returns the next DATA payload for `stream_id`
    ///
    /// Frames for other streams are parked; control frames are handled
    /// inline.
    pub async fn read(&mut self, stream_id: u32) -> Result<Vec<u8>, RemoteXpcError> {
        if let Some(c) = self.cache.get_mut(&stream_id)
            && let Some(d) = c.pop_front()
        {
            return Ok(d);
        }
        self.cache.entry(stream_id).or_default();

        loop {
            let frame = frame::Frame::next(&mut self.inner).await?;
            if let Some(payload) = self.process_frame(frame).await? {
                let (id, data) = payload;
                if id == stream_id {
                    return Ok(data);
                }
                match self.cache.get_mut(&id) {
                    Some(c) => c.push_back(data),
                    None => {
                        // data can arrive before the stream is opened
                        warn!("Received message for stream {id} not in cache");
                        self.cache.insert(id, VecDeque::from([data]));
                    }
                }
            }
        }
    }

    /// Handles one incoming frame, returning a DATA payload if any
    async fn process_frame(
        &mut self,
        frame: frame::Frame,
    ) -> Result<Option<(u32, Vec<u8>)>, RemoteXpcError> {
        match frame {
            frame::Frame::Settings(settings_frame) => {
                if settings_frame.flags & frame::SettingsFrame::ACK == 0 {
                    for setting in &settings_frame.settings {
                        match *setting {
                            Setting::InitialWindowSize(w) => {
                                self.initial_window = w as i64;
                            }
                            Setting::MaxFrameSize(m) => {
                                self.max_frame_size = m as usize;
                            }
                            _ => {}
                        }
                    }
                    self.settings_ack().await?;
                }
                Ok(None)
            }
            frame::Frame::Ping(ping) => {
                if ping.flags & frame::PingFrame::ACK == 0 {
                    let frame = frame::PingFrame::ack(ping.payload).serialize();
                    self.inner.write_all(&frame).await?;
                    self.inner.flush().await?;
                }
                Ok(None)
            }
            frame::Frame::WindowUpdate(update) => {
                if update.stream_id == 0 {
                    self.connection_window += update.increment_size as i64;
                } else if let Some(w) = self.stream_windows.get_mut(&update.stream_id) {
                    *w += update.increment_size as i64;
                }
                Ok(None)
            }
            frame::Frame::Data(data_frame) => {
                debug!(
                    "Got data frame for {} with {} bytes",
                    data_frame.stream_id,
                    data_frame.payload.len()
                );
                if data_frame.stream_id % 2 == 0 && !data_frame.payload.is_empty() {
                    self.window_update(data_frame.payload.len() as u32, 0)
                        .await?;
                    self.window_update(data_frame.payload.len() as u32, data_frame.stream_id)
                        .await?;
                }
                Ok(Some((data_frame.stream_id, data_frame.payload)))
            }
            frame::Frame::Headers(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xpc::http2::frame::Frame;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn preface_is_written_first() {
        let (a, mut b) = tokio::io::duplex(1 << 16);
        let _client = Http2Client::new(a).await.unwrap();
        let mut buf = vec![0u8; HTTP2_MAGIC.len()];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, HTTP2_MAGIC);
    }

    #[tokio::test]
    async fn large_payload_fragments_at_max_frame_size() {
        let (a, mut b) = tokio::io::duplex(1 << 20);
        let mut client = Http2Client::new(a).await.unwrap();

        let mut magic = vec![0u8; HTTP2_MAGIC.len()];
        b.read_exact(&mut magic).await.unwrap();

        client.open_stream(1).await.unwrap();
        match Frame::next(&mut b).await.unwrap() {
            Frame::Headers(h) => assert_eq!(h.stream_id, 1),
            other => panic!("expected headers, got {other:?}"),
        }

        // 40000 bytes spans three 16384-byte frames
        client.send(vec![0x55; 40000], 1).await.unwrap();
        let mut total = 0;
        let mut frames = 0;
        while total < 40000 {
            match Frame::next(&mut b).await.unwrap() {
                Frame::Data(d) => {
                    assert!(d.payload.len() <= DEFAULT_MAX_FRAME_SIZE);
                    total += d.payload.len();
                    frames += 1;
                }
                other => panic!("expected data, got {other:?}"),
            }
        }
        assert_eq!(total, 40000);
        assert_eq!(frames, 3);
    }

    #[tokio::test]
    async fn reads_are_demultiplexed_by_stream() {
        let (a, mut b) = tokio::io::duplex(1 << 16);
        let mut client = Http2Client::new(a).await.unwrap();
        let mut magic = vec![0u8; HTTP2_MAGIC.len()];
        b.read_exact(&mut magic).await.unwrap();

        client.open_stream(1).await.unwrap();
        client.open_stream(3).await.unwrap();
        let _ = Frame::next(&mut b).await.unwrap();
        let _ = Frame::next(&mut b).await.unwrap();

        use tokio::io::AsyncWriteExt;
        b.write_all(
            &frame::DataFrame {
                stream_id: 3,
                payload: vec![0x03],
            }
            .serialize(),
        )
        .await
        .unwrap();
        b.write_all(
            &frame::DataFrame {
                stream_id: 1,
                payload: vec![0x01],
            }
            .serialize(),
        )
        .await
        .unwrap();

        // reading stream 1 first parks the stream 3 payload
        assert_eq!(client.read(1).await.unwrap(), vec![0x01]);
        assert_eq!(client.read(3).await.unwrap(), vec![0x03]);
    }
}
