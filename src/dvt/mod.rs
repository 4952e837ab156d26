//! DVT instruments support
//!
//! The DVT service hub multiplexes instruments services over DTX
//! channels; payloads travel as NSKeyedArchiver graphs.

pub mod archiver;
pub mod connection;
pub mod message;

pub use connection::{ChannelCode, DtxConnection};
pub use message::{AuxValue, DtxMessage};
