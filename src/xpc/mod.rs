// Jackson Coxson

use tracing::debug;

use crate::{ReadWrite, RemoteXpcError};

pub mod format;
pub mod http2;

pub use format::{Dictionary, XpcMessage, XpcObject};
use format::XpcFlag;
use http2::Setting;

pub const ROOT_CHANNEL: u32 = 1;
pub const REPLY_CHANNEL: u32 = 3;

/// An XPC session multiplexed over HTTP/2
///
/// The root channel (stream 1) carries requests and the service directory;
/// the reply channel (stream 3) carries responses to `WantingReply`
/// messages.
#[derive(Debug)]
pub struct RemoteXpcClient<R: ReadWrite> {
    h2_client: http2::Http2Client<R>,
    root_id: u64,
}

impl<R: ReadWrite> RemoteXpcClient<R> {
    pub async fn new(socket: R) -> Result<Self, RemoteXpcError> {
        Ok(Self {
            h2_client: http2::Http2Client::new(socket).await?,
            root_id: 1,
        })
    }

    /// Brings up the root and reply channels and returns the first
    /// non-empty message the device sends on the root channel
    ///
    /// For an RSD listener that message is the service directory.
    pub async fn do_handshake(&mut self) -> Result<plist::Value, RemoteXpcError> {
        self.h2_client
            .set_settings(
                vec![
                    Setting::MaxConcurrentStreams(100),
                    Setting::InitialWindowSize(1048576),
                ],
                0,
            )
            .await?;
        self.h2_client.window_update(983041, 0).await?;

        debug!("Opening root channel");
        self.h2_client.open_stream(ROOT_CHANNEL).await?;
        self.send_root(XpcMessage::new(
            Some(XpcFlag::AlwaysSet),
            Some(XpcObject::Dictionary(Default::default())),
            None,
        ))
        .await?;
        self.send_root(XpcMessage::new(Some(XpcFlag::Custom(0x0201)), None, None))
            .await?;

        debug!("Opening reply channel");
        self.h2_client.open_stream(REPLY_CHANNEL).await?;
        self.send_reply(XpcMessage::new(
            Some(XpcFlag::InitHandshake | XpcFlag::AlwaysSet),
            None,
            None,
        ))
        .await?;

        self.h2_client.settings_ack().await?;

        self.recv_root().await
    }

    /// Sends a dictionary on the root channel
    pub async fn send_object(
        &mut self,
        msg: impl Into<XpcObject>,
        expect_reply: bool,
    ) -> Result<(), RemoteXpcError> {
        let msg: XpcObject = msg.into();

        let mut flag = XpcFlag::DataFlag | XpcFlag::AlwaysSet;
        if expect_reply {
            flag |= XpcFlag::WantingReply;
        }

        let msg = XpcMessage::new(Some(flag), Some(msg), Some(self.root_id));
        self.send_root(msg).await
    }

    /// Receives the next message from the reply channel
    pub async fn recv(&mut self) -> Result<plist::Value, RemoteXpcError> {
        self.recv_from_channel(REPLY_CHANNEL).await
    }

    /// Receives the next message from the root channel
    pub async fn recv_root(&mut self) -> Result<plist::Value, RemoteXpcError> {
        self.recv_from_channel(ROOT_CHANNEL).await
    }

    /// Accumulates DATA payloads until a full XPC message decodes
    ///
    /// Empty dictionaries and bodiless control messages are skipped.
    async fn recv_from_channel(&mut self, channel: u32) -> Result<plist::Value, RemoteXpcError> {
        let mut msg_buffer = Vec::new();
        loop {
            msg_buffer.extend(self.h2_client.read(channel).await?);
            let msg = match XpcMessage::decode(&msg_buffer) {
                Ok(m) => m,
                Err(RemoteXpcError::PacketSizeMismatch) => continue,
                Err(e) => break Err(e),
            };

            match msg.message {
                Some(msg) => {
                    if let Some(d) = msg.as_dictionary()
                        && d.is_empty()
                    {
                        msg_buffer.clear();
                        continue;
                    }
                    break Ok(msg.to_plist());
                }
                None => {
                    msg_buffer.clear();
                    continue;
                }
            }
        }
    }

    async fn send_root(&mut self, msg: XpcMessage) -> Result<(), RemoteXpcError> {
        self.h2_client
            .send(msg.encode(self.root_id), ROOT_CHANNEL)
            .await
    }

    async fn send_reply(&mut self, msg: XpcMessage) -> Result<(), RemoteXpcError> {
        self.h2_client
            .send(msg.encode(self.root_id), REPLY_CHANNEL)
            .await
    }
}
