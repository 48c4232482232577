use thiserror::Error;

/// Everything that can go wrong while decoding bytes received from the network. None of these
///  are fatal for a session: the offending datagram is dropped and logged.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum WireError {
    #[error("buffer underrun: {needed} bytes needed, {remaining} remaining")]
    BufferUnderrun { needed: usize, remaining: usize },
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("offline message without valid magic")]
    InvalidMagic,
    #[error("unsupported address version {0}")]
    UnsupportedAddressVersion(u8),
    #[error("unknown message id {0:#04x}")]
    UnknownMessageId(u8),
}

impl WireError {
    pub fn malformed(msg: impl Into<String>) -> WireError {
        WireError::MalformedMessage(msg.into())
    }
}

pub type WireResult<T> = Result<T, WireError>;

/// Rejection of an application's send request. A rejected send has no effect on the network.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SendError {
    #[error("message of {len} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
    #[error("order channel {0} is out of range")]
    InvalidChannel(u8),
    #[error("session is not connected")]
    NotConnected,
}
