//! Messages involved in the SSH's **connect** (`SSH-CONNECT`) part of the protocol,
//! as defined in the [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254).

use std::num::NonZeroU32;

use binrw::binrw;

use super::{arch, binary::Packet};

impl Packet for ChannelOpen<'_> {}
impl Packet for ChannelOpenConfirmation {}
impl Packet for ChannelOpenFailure<'_> {}
impl Packet for ChannelWindowAdjust {}
impl Packet for ChannelData<'_> {}
impl Packet for ChannelExtendedData<'_> {}
impl Packet for ChannelEof {}
impl Packet for ChannelClose {}
impl Packet for ChannelRequest<'_> {}
impl Packet for ChannelSuccess {}
impl Packet for ChannelFailure {}
impl Packet for ChannelMessage<'_> {}

impl Packet for PtyRequest<'_> {}
impl Packet for EnvRequest<'_> {}
impl Packet for ExecRequest<'_> {}
impl Packet for SubsystemRequest<'_> {}
impl Packet for WindowChangeRequest {}
impl Packet for XonXoffRequest {}
impl Packet for SignalRequest<'_> {}
impl Packet for BreakRequest {}
impl Packet for ExitStatusRequest {}
impl Packet for ExitSignalRequest<'_> {}

/// The `SSH_MSG_CHANNEL_OPEN` message.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4254#section-5.1>.
#[binrw]
#[derive(Debug, Clone)]
#[brw(big, magic = 90_u8)]
pub struct ChannelOpen<'b> {
    #[bw(calc = context.as_ascii())]
    kind: arch::Ascii<'b>,

    /// Sender channel.
    pub sender_channel: u32,

    /// Initial window size, in bytes.
    pub initial_window_size: u32,

    /// Maximum packet size, in bytes.
    pub maximum_packet_size: u32,

    /// The context of the open request.
    #[br(args(kind))]
    pub context: ChannelOpenContext<'b>,
}

/// The `context` in the `SSH_MSG_CHANNEL_OPEN` message.
#[binrw]
#[derive(Debug, Clone)]
#[brw(big)]
#[br(import(kind: arch::Ascii<'_>))]
pub enum ChannelOpenContext<'b> {
    /// A channel of type `session`,
    /// as defined in [RFC4254 section 6.1](https://datatracker.ietf.org/doc/html/rfc4254#section-6.1).
    #[br(pre_assert(kind == ChannelOpenContext::SESSION))]
    Session,

    /// A channel of type `direct-tcpip`,
    /// as defined in [RFC4254 section 7.2](https://datatracker.ietf.org/doc/html/rfc4254#section-7.2).
    #[br(pre_assert(kind == ChannelOpenContext::DIRECT_TCPIP))]
    DirectTcpip {
        /// Address to connect to.
        address: arch::Utf8<'b>,

        /// Port to connect to.
        port: u32,

        /// Originator address.
        originator_address: arch::Utf8<'b>,

        /// Originator port.
        originator_port: u32,
    },

    /// A channel of type `forwarded-tcpip`,
    /// as defined in [RFC4254 section 7.2](https://datatracker.ietf.org/doc/html/rfc4254#section-7.2).
    #[br(pre_assert(kind == ChannelOpenContext::FORWARDED_TCPIP))]
    ForwardedTcpip {
        /// Address that was connected on the remote.
        address: arch::Utf8<'b>,

        /// Port that was connected on the remote.
        port: u32,

        /// Originator address.
        originator_address: arch::Utf8<'b>,

        /// Originator port.
        originator_port: u32,
    },
}

impl ChannelOpenContext<'_> {
    const SESSION: arch::Ascii<'static> = arch::Ascii::from_static("session");
    const DIRECT_TCPIP: arch::Ascii<'static> = arch::Ascii::from_static("direct-tcpip");
    const FORWARDED_TCPIP: arch::Ascii<'static> = arch::Ascii::from_static("forwarded-tcpip");

    /// Get the [`ChannelOpenContext`]'s SSH identifier.
    pub fn as_ascii(&self) -> arch::Ascii<'static> {
        match self {
            Self::Session { .. } => Self::SESSION,
            Self::DirectTcpip { .. } => Self::DIRECT_TCPIP,
            Self::ForwardedTcpip { .. } => Self::FORWARDED_TCPIP,
        }
    }
}

/// The `SSH_MSG_CHANNEL_OPEN_CONFIRMATION` message.
///
/// Channel types may append extra payload after the fixed fields,
/// decode with [`Packet::from_bytes_prefix`] to collect it.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4254#section-5.1>.
#[binrw]
#[derive(Debug, Clone)]
#[brw(big, magic = 91_u8)]
pub struct ChannelOpenConfirmation {
    /// Recipient channel.
    pub recipient_channel: u32,

    /// Sender channel.
    pub sender_channel: u32,

    /// Initial window size, in bytes.
    pub initial_window_size: u32,

    /// Maximum packet size, in bytes.
    pub maximum_packet_size: u32,
}

/// The `SSH_MSG_CHANNEL_OPEN_FAILURE` message.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4254#section-5.1>.
#[binrw]
#[derive(Debug, Clone)]
#[brw(big, magic = 92_u8)]
pub struct ChannelOpenFailure<'b> {
    /// Recipient channel.
    pub recipient_channel: u32,

    /// Reason for the channel opening failure.
    pub reason: ChannelOpenFailureReason,

    /// Description of the reason.
    pub description: arch::Utf8<'b>,

    /// Language tag.
    pub language: arch::Ascii<'b>,
}

/// The `reason` for failure in the `SSH_MSG_CHANNEL_OPEN_FAILURE` message.
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[brw(big)]
pub enum ChannelOpenFailureReason {
    /// `SSH_OPEN_ADMINISTRATIVELY_PROHIBITED`.
    #[brw(magic = 1_u32)]
    AdministrativelyProhibited,

    /// `SSH_OPEN_CONNECT_FAILED`.
    #[brw(magic = 2_u32)]
    ConnectFailed,

    /// `SSH_OPEN_UNKNOWN_CHANNEL_TYPE`.
    #[brw(magic = 3_u32)]
    UnknownChannelType,

    /// `SSH_OPEN_RESOURCE_SHORTAGE`.
    #[brw(magic = 4_u32)]
    ResourceShortage,

    /// Any other failure reason, may be non-standard.
    ///
    /// The 'reason' values in the range of `0xFE000000`
    /// through `0xFFFFFFFF` are reserved for PRIVATE USE.
    Other(u32),
}

impl ChannelOpenFailureReason {
    /// A `pty-req` request was refused while establishing a session.
    pub const REQUEST_PTY_FAILED: Self = Self::Other(0xFE00_0001);

    /// A `shell`, `exec` or `subsystem` request was refused while establishing a session.
    pub const REQUEST_SESSION_FAILED: Self = Self::Other(0xFE00_0002);
}

/// The `SSH_MSG_CHANNEL_WINDOW_ADJUST` message.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4254#section-5.2>.
#[binrw]
#[derive(Debug, Clone)]
#[brw(big, magic = 93_u8)]
pub struct ChannelWindowAdjust {
    /// Recipient channel.
    pub recipient_channel: u32,

    /// Bytes to add to the window.
    pub bytes_to_add: u32,
}

/// The `SSH_MSG_CHANNEL_DATA` message.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4254#section-5.2>.
#[binrw]
#[derive(Debug, Clone)]
#[brw(big, magic = 94_u8)]
pub struct ChannelData<'b> {
    /// Recipient channel.
    pub recipient_channel: u32,

    /// Data bytes to transport.
    pub data: arch::Bytes<'b>,
}

/// The `SSH_MSG_CHANNEL_EXTENDED_DATA` message.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4254#section-5.2>.
#[binrw]
#[derive(Debug, Clone)]
#[brw(big, magic = 95_u8)]
pub struct ChannelExtendedData<'b> {
    /// Recipient channel.
    pub recipient_channel: u32,

    /// Type of the transmitted data, the value `1` is reserved for **stderr**.
    pub data_type: NonZeroU32,

    /// Data bytes to transport.
    pub data: arch::Bytes<'b>,
}

/// The `SSH_MSG_CHANNEL_EOF` message.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4254#section-5.3>.
#[binrw]
#[derive(Debug, Clone)]
#[brw(big, magic = 96_u8)]
pub struct ChannelEof {
    /// Recipient channel.
    pub recipient_channel: u32,
}

/// The `SSH_MSG_CHANNEL_CLOSE` message.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4254#section-5.3>.
#[binrw]
#[derive(Debug, Clone)]
#[brw(big, magic = 97_u8)]
pub struct ChannelClose {
    /// Recipient channel.
    pub recipient_channel: u32,
}

/// The `SSH_MSG_CHANNEL_REQUEST` message, up to the request-specific arguments.
///
/// The arguments directly follow the fixed fields on the wire; decode them
/// from the remainder of the buffer after [`Packet::from_bytes_prefix`], and
/// append their bytes after [`Packet::to_bytes`] when encoding.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4254#section-5.4>.
#[binrw]
#[derive(Debug, Clone)]
#[brw(big, magic = 98_u8)]
pub struct ChannelRequest<'b> {
    /// Recipient channel.
    pub recipient_channel: u32,

    /// The request type identifier, e.g. `pty-req` or `exec`.
    pub kind: arch::Ascii<'b>,

    /// Whether the sender wants a reply.
    pub want_reply: arch::Bool,
}

/// The arguments of a `pty-req` channel request,
/// as defined in [RFC4254 section 6.2](https://datatracker.ietf.org/doc/html/rfc4254#section-6.2).
#[binrw]
#[derive(Debug, Clone)]
#[brw(big)]
pub struct PtyRequest<'b> {
    /// Peer's `$TERM` environment variable value.
    pub term: arch::Ascii<'b>,

    /// Terminal width, in columns.
    pub width_chars: u32,

    /// Terminal height, in rows.
    pub height_chars: u32,

    /// Terminal width, in pixels.
    pub width_pixels: u32,

    /// Terminal height, in pixels.
    pub height_pixels: u32,

    /// Encoded terminal modes, see [`crate::pty::Modes`].
    pub modes: arch::Bytes<'b>,
}

/// The arguments of an `env` channel request,
/// as defined in [RFC4254 section 6.4](https://datatracker.ietf.org/doc/html/rfc4254#section-6.4).
#[binrw]
#[derive(Debug, Clone)]
#[brw(big)]
pub struct EnvRequest<'b> {
    /// Environment variable name.
    pub name: arch::Bytes<'b>,

    /// Environment variable value.
    pub value: arch::Bytes<'b>,
}

/// The arguments of an `exec` channel request,
/// as defined in [RFC4254 section 6.5](https://datatracker.ietf.org/doc/html/rfc4254#section-6.5).
#[binrw]
#[derive(Debug, Clone)]
#[brw(big)]
pub struct ExecRequest<'b> {
    /// Command to be executed.
    pub command: arch::Bytes<'b>,
}

/// The arguments of a `subsystem` channel request,
/// as defined in [RFC4254 section 6.5](https://datatracker.ietf.org/doc/html/rfc4254#section-6.5).
#[binrw]
#[derive(Debug, Clone)]
#[brw(big)]
pub struct SubsystemRequest<'b> {
    /// Name of the requested subsystem.
    pub name: arch::Bytes<'b>,
}

/// The arguments of a `window-change` channel request,
/// as defined in [RFC4254 section 6.7](https://datatracker.ietf.org/doc/html/rfc4254#section-6.7).
#[binrw]
#[derive(Debug, Clone)]
#[brw(big)]
pub struct WindowChangeRequest {
    /// Terminal width, in columns.
    pub width_chars: u32,

    /// Terminal height, in rows.
    pub height_chars: u32,

    /// Terminal width, in pixels.
    pub width_pixels: u32,

    /// Terminal height, in pixels.
    pub height_pixels: u32,
}

/// The arguments of an `xon-xoff` channel request,
/// as defined in [RFC4254 section 6.8](https://datatracker.ietf.org/doc/html/rfc4254#section-6.8).
#[binrw]
#[derive(Debug, Clone)]
#[brw(big)]
pub struct XonXoffRequest {
    /// Whether the client is allowed to do flow control using `<CTRL>-<S>` and `<CTRL>-<Q>`.
    pub client_can_do: arch::Bool,
}

/// The arguments of a `signal` channel request,
/// as defined in [RFC4254 section 6.9](https://datatracker.ietf.org/doc/html/rfc4254#section-6.9).
#[binrw]
#[derive(Debug, Clone)]
#[brw(big)]
pub struct SignalRequest<'b> {
    /// Signal name (without the "SIG" prefix).
    pub name: arch::Bytes<'b>,
}

/// The arguments of a `break` channel request,
/// as defined in [RFC4335 section 3](https://datatracker.ietf.org/doc/html/rfc4335#section-3).
#[binrw]
#[derive(Debug, Clone)]
#[brw(big)]
pub struct BreakRequest {
    /// Requested duration of the break, in milliseconds.
    pub break_length: u32,
}

/// The arguments of an `exit-status` channel request,
/// as defined in [RFC4254 section 6.10](https://datatracker.ietf.org/doc/html/rfc4254#section-6.10).
#[binrw]
#[derive(Debug, Clone)]
#[brw(big)]
pub struct ExitStatusRequest {
    /// Exit status, non-zero means failure.
    pub code: u32,
}

/// The arguments of an `exit-signal` channel request,
/// as defined in [RFC4254 section 6.10](https://datatracker.ietf.org/doc/html/rfc4254#section-6.10).
#[binrw]
#[derive(Debug, Clone)]
#[brw(big)]
pub struct ExitSignalRequest<'b> {
    /// Signal name (without the "SIG" prefix).
    pub name: arch::Ascii<'b>,

    /// Whether a core dump is triggering the signal.
    pub core_dumped: arch::Bool,

    /// The error message for the signal.
    pub error_message: arch::Utf8<'b>,

    /// Language tag.
    pub language: arch::Ascii<'b>,
}

/// The `SSH_MSG_CHANNEL_SUCCESS` message.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4254#section-5.4>.
#[binrw]
#[derive(Debug, Clone)]
#[brw(big, magic = 99_u8)]
pub struct ChannelSuccess {
    /// Recipient channel.
    pub recipient_channel: u32,
}

/// The `SSH_MSG_CHANNEL_FAILURE` message.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4254#section-5.4>.
#[binrw]
#[derive(Debug, Clone)]
#[brw(big, magic = 100_u8)]
pub struct ChannelFailure {
    /// Recipient channel.
    pub recipient_channel: u32,
}

/// Any channel-scoped message, routed to a channel by its recipient number.
///
/// [`ChannelRequest`] carries request-specific arguments past its fixed
/// fields, so this enum has to be decoded with [`Packet::from_bytes_prefix`].
#[binrw]
#[derive(Debug, Clone)]
#[brw(big)]
pub enum ChannelMessage<'b> {
    /// `SSH_MSG_CHANNEL_WINDOW_ADJUST`.
    WindowAdjust(ChannelWindowAdjust),

    /// `SSH_MSG_CHANNEL_DATA`.
    Data(ChannelData<'b>),

    /// `SSH_MSG_CHANNEL_EXTENDED_DATA`.
    ExtendedData(ChannelExtendedData<'b>),

    /// `SSH_MSG_CHANNEL_EOF`.
    Eof(ChannelEof),

    /// `SSH_MSG_CHANNEL_CLOSE`.
    Close(ChannelClose),

    /// `SSH_MSG_CHANNEL_REQUEST`.
    Request(ChannelRequest<'b>),

    /// `SSH_MSG_CHANNEL_SUCCESS`.
    Success(ChannelSuccess),

    /// `SSH_MSG_CHANNEL_FAILURE`.
    Failure(ChannelFailure),
}

impl ChannelMessage<'_> {
    /// The channel number this message is addressed to.
    pub fn recipient_channel(&self) -> u32 {
        match self {
            Self::WindowAdjust(message) => message.recipient_channel,
            Self::Data(message) => message.recipient_channel,
            Self::ExtendedData(message) => message.recipient_channel,
            Self::Eof(message) => message.recipient_channel,
            Self::Close(message) => message.recipient_channel,
            Self::Request(message) => message.recipient_channel,
            Self::Success(message) => message.recipient_channel,
            Self::Failure(message) => message.recipient_channel,
        }
    }
}
