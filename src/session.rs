//! Application-facing callback objects bound to channels.
//!
//! A *session* receives whatever a channel demultiplexes for it: stream
//! data, end-of-file, lifecycle transitions and variant-specific requests.
//! Methods take `&self`; sessions needing state use interior mutability,
//! in keeping with the single-threaded cooperative model of the crate.

use std::num::NonZeroU32;
use std::rc::Rc;

use crate::channel::{Channel, Client, Server, Tcp};
use crate::pty::Modes;
use crate::Error;

/// A chunk of channel payload, as presented to a session.
///
/// Channels with [`Encoding::Utf8`](crate::Encoding) deliver [`Data::Text`],
/// decoded across packet boundaries; binary channels deliver [`Data::Bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Data<'a> {
    /// Raw bytes, from a channel without a text encoding.
    Bytes(&'a [u8]),

    /// Decoded text, from a channel with a text encoding.
    Text(&'a str),
}

impl Data<'_> {
    /// View the chunk as raw bytes, whatever its form.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }
}

/// Dimensions of a terminal, in characters and optionally in pixels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    /// Terminal width, in columns.
    pub width_chars: u32,

    /// Terminal height, in rows.
    pub height_chars: u32,

    /// Terminal width, in pixels.
    pub width_pixels: u32,

    /// Terminal height, in pixels.
    pub height_pixels: u32,
}

impl TermSize {
    /// Create a [`TermSize`] from character dimensions, leaving pixel
    /// dimensions to `0`.
    pub fn new(width_chars: u32, height_chars: u32) -> Self {
        Self {
            width_chars,
            height_chars,
            ..Default::default()
        }
    }
}

/// An exit signal reported by the remote process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Signal name (without the "SIG" prefix).
    pub signal: String,

    /// Whether a core dump is triggering the signal.
    pub core_dumped: bool,

    /// The error message for the signal.
    pub message: String,

    /// Language tag of the message.
    pub lang: String,
}

/// Callbacks common to every channel variant.
pub trait Session {
    /// The channel went away, after an error if one is provided.
    ///
    /// This is the last callback invoked on a session.
    fn connection_lost(&self, error: Option<&Error>) {
        let _ = error;
    }

    /// The session handshake completed and data may now flow.
    fn session_started(&self) {}

    /// A chunk of data arrived, tagged with its extended data type if any.
    fn data_received(&self, data: Data<'_>, datatype: Option<NonZeroU32>) {
        let _ = (data, datatype);
    }

    /// The peer will send no more data.
    ///
    /// Return `true` to keep the channel half-open for sending,
    /// `false` to close it.
    fn eof_received(&self) -> bool {
        false
    }

    /// The channel's send buffer crossed its high-water mark;
    /// stop producing until [`Session::resume_writing`].
    fn pause_writing(&self) {}

    /// The channel's send buffer drained to its low-water mark.
    fn resume_writing(&self) {}
}

/// Callbacks of a session bound to a client channel.
pub trait ClientSession: Session {
    /// The channel open handshake completed.
    fn connection_made(&self, channel: &Channel<Client>) {
        let _ = channel;
    }

    /// The server asked the client to enable or disable XON/XOFF flow control.
    fn xon_xoff_requested(&self, client_can_do: bool) {
        let _ = client_can_do;
    }

    /// The remote process exited with a status code.
    fn exit_status_received(&self, status: u32) {
        let _ = status;
    }

    /// The remote process was terminated by a signal.
    fn exit_signal_received(&self, signal: &ExitSignal) {
        let _ = signal;
    }
}

/// Callbacks of a session bound to a server channel.
///
/// The request callbacks return the boolean forwarded to the peer as
/// `SSH_MSG_CHANNEL_SUCCESS` or `SSH_MSG_CHANNEL_FAILURE`; the defaults
/// refuse everything.
pub trait ServerSession: Session {
    /// The channel open handshake completed.
    fn connection_made(&self, channel: &Channel<Server>) {
        let _ = channel;
    }

    /// The client requested a pseudo-terminal.
    fn pty_requested(&self, term: &str, size: TermSize, modes: &Modes) -> bool {
        let _ = (term, size, modes);
        false
    }

    /// The client requested an interactive shell.
    fn shell_requested(&self) -> bool {
        false
    }

    /// The client requested execution of a command.
    fn exec_requested(&self, command: &str) -> bool {
        let _ = command;
        false
    }

    /// The client requested a subsystem.
    fn subsystem_requested(&self, subsystem: &str) -> bool {
        let _ = subsystem;
        false
    }

    /// The client reported a change of its terminal dimensions.
    fn terminal_size_changed(&self, size: TermSize) {
        let _ = size;
    }

    /// The client delivered a signal to the remote process.
    fn signal_received(&self, signal: &str) {
        let _ = signal;
    }

    /// The client requested a break operation.
    fn break_received(&self, break_length: u32) -> bool {
        let _ = break_length;
        false
    }
}

/// Callbacks of a session bound to a forwarded TCP channel.
pub trait TcpSession: Session {
    /// The channel open handshake completed.
    fn connection_made(&self, channel: &Channel<Tcp>) {
        let _ = channel;
    }
}

/// Convenience alias for the base-trait view of a session.
pub(crate) type SessionRef = Rc<dyn Session>;
