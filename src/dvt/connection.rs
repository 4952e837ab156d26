//! DTX channel multiplexing
//!
//! One transport to the DVT service hub carries many instruments
//! channels. Channels are addressed by the code negotiated at open time;
//! the connection keeps a per-channel inbox so interleaved traffic for
//! other channels is parked rather than lost. Message identifiers are
//! monotonic across the whole connection.

use std::collections::{HashMap, VecDeque};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::dvt::message::{AuxValue, DtxMessage};
use crate::services::DeviceService;
use crate::{ReadWrite, RemoteXpcError, ServiceConnection};

/// Address of one multiplexed channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelCode(u32);

impl ChannelCode {
    /// The control channel every session starts with
    pub const ROOT: ChannelCode = ChannelCode(0);

    pub fn code(&self) -> u32 {
        self.0
    }
}

/// A DTX session to the instruments service hub
pub struct DtxConnection<R: ReadWrite> {
    socket: R,
    next_message_id: u32,
    next_channel_code: u32,
    inbox: HashMap<u32, VecDeque<DtxMessage>>,
}

impl<R: ReadWrite> std::fmt::Debug for DtxConnection<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtxConnection")
            .field("next_message_id", &self.next_message_id)
            .field("channels", &self.inbox.len())
            .finish()
    }
}

impl DeviceService for DtxConnection<Box<dyn ReadWrite>> {
    fn service_name() -> std::borrow::Cow<'static, str> {
        "com.apple.instruments.dtservicehub.shim.remote".into()
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        match connection.into_socket() {
            Some(socket) => Ok(Self::new(socket)),
            None => Err(RemoteXpcError::SessionClosed),
        }
    }
}

impl<R: ReadWrite> DtxConnection<R> {
    pub fn new(socket: R) -> Self {
        Self {
            socket,
            next_message_id: 0,
            next_channel_code: 1,
            inbox: HashMap::from([(ChannelCode::ROOT.0, VecDeque::new())]),
        }
    }

    pub fn into_inner(self) -> R {
        self.socket
    }

    /// Negotiates a channel to a named instruments service
    ///
    /// The hub acknowledges `_requestChannelWithCode:identifier:` with a
    /// payload-free reply on the control channel.
    pub async fn open_channel(
        &mut self,
        identifier: &str,
    ) -> Result<ChannelCode, RemoteXpcError> {
        let code = self.next_channel_code;
        self.next_channel_code += 1;

        let args = vec![
            AuxValue::U32(code),
            AuxValue::archived(plist::Value::String(identifier.to_string()))?,
        ];
        self.call_method(
            ChannelCode::ROOT,
            "_requestChannelWithCode:identifier:",
            args,
            true,
        )
        .await?;

        let ack = self.recv_on(ChannelCode::ROOT).await?;
        if ack.payload.is_some() {
            return Err(RemoteXpcError::UnexpectedResponse);
        }

        self.inbox.insert(code, VecDeque::new());
        Ok(ChannelCode(code))
    }

    /// Invokes a selector on a channel
    pub async fn call_method(
        &mut self,
        channel: ChannelCode,
        selector: &str,
        args: Vec<AuxValue>,
        expects_reply: bool,
    ) -> Result<(), RemoteXpcError> {
        self.next_message_id += 1;
        let msg =
            DtxMessage::method_call(channel.0, self.next_message_id, selector, args, expects_reply);
        debug!("Sending DTX message: {msg:?}");
        self.socket.write_all(&msg.encode()?).await?;
        self.socket.flush().await?;
        Ok(())
    }

    /// Returns the next message addressed to `channel`
    ///
    /// Traffic for other open channels is parked in their inboxes;
    /// messages for channels never opened are dropped with a warning.
    pub async fn recv_on(&mut self, channel: ChannelCode) -> Result<DtxMessage, RemoteXpcError> {
        let queue = self
            .inbox
            .get_mut(&channel.0)
            .ok_or(RemoteXpcError::UnknownChannel(channel.0))?;
        if let Some(msg) = queue.pop_front() {
            return Ok(msg);
        }

        loop {
            let msg = DtxMessage::read(&mut self.socket).await?;
            debug!("Read DTX message: {msg:?}");

            if msg.channel == channel.0 {
                return Ok(msg);
            }
            match self.inbox.get_mut(&msg.channel) {
                Some(queue) => queue.push_back(msg),
                None => warn!("Dropping DTX message for unknown channel {}", msg.channel),
            }
        }
    }
}
