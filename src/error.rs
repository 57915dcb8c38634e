use crate::connect::ChannelOpenFailureReason;

/// The error types which can occur when manipulating a channel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The peer violated the channel protocol; the connection layer is
    /// expected to tear down the transport with `SSH_DISCONNECT_PROTOCOL_ERROR`.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// The peer or a local session factory refused a channel open.
    #[error(transparent)]
    Open(#[from] OpenFailure),

    /// The channel is not open for sending.
    #[error("channel not open for sending")]
    NotOpen,

    /// The channel was already open when an open was initiated.
    #[error("channel already open")]
    AlreadyOpen,

    /// The extended data type is not valid for this channel in this direction.
    #[error("invalid extended data type")]
    InvalidDatatype,

    /// The terminal mode opcode lies outside of the encodable range.
    #[error("invalid pty mode opcode: {0}")]
    InvalidPtyMode(u8),

    /// A string which must be ASCII on the wire contained other characters.
    #[error("{0} must be ASCII")]
    NotAscii(&'static str),

    /// The write buffer limits were out of order.
    #[error("write buffer limits out of order: low {low} > high {high}")]
    InvalidBufferLimits {
        /// Rejected high-water mark.
        high: usize,

        /// Rejected low-water mark.
        low: usize,
    },

    /// The underlying SSH connection went away.
    #[error("SSH connection closed")]
    ConnectionLost,
}

/// A `Result` whose error type defaults to [`enum@Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A typed channel open failure, either received from the peer in a
/// `SSH_MSG_CHANNEL_OPEN_FAILURE` message or raised locally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("channel open failed: {reason}")]
pub struct OpenFailure {
    /// Machine-readable reason code.
    pub code: ChannelOpenFailureReason,

    /// Human-readable description of the failure.
    pub reason: String,

    /// Language tag of the description.
    pub lang: String,
}

impl OpenFailure {
    /// Create an [`OpenFailure`] with the default language tag.
    pub fn new(code: ChannelOpenFailureReason, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            lang: crate::DEFAULT_LANG.into(),
        }
    }
}
