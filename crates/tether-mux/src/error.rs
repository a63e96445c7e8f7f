//! Error types for the multiplexer.

use tether_transport::ConnectionError;

/// Errors that can occur while creating or decoding channels.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Channel ids must be below `0xFFFE`; `0xFFFF` addresses control frames.
    #[error("channel id {0:#06x} is out of range")]
    InvalidChannelId(u16),

    /// The id is live (or being negotiated) on this side, or the peer
    /// rejected it.
    #[error("channel id {0} already in use")]
    ChannelIdInUse(u16),

    /// Every one of the 65534 channel ids is live.
    #[error("out of channel slots")]
    OutOfChannelSlots,

    /// A frame carried the magic word but could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The shared transport failed or closed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
