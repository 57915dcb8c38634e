#![doc = include_str!("../README.md")]
//!

#![warn(
    missing_docs,
    clippy::todo,
    clippy::unwrap_used,
    clippy::unimplemented,
    clippy::undocumented_unsafe_blocks
)]
#![forbid(unsafe_code)]

use std::num::NonZeroU32;

/// The `stderr` extended data type code.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4254#section-5.2>.
pub const EXTENDED_DATA_STDERR: NonZeroU32 = NonZeroU32::MIN;

/// Default initial receive window for a new channel,
/// coincidentally the value used by OpenSSH.
pub const DEFAULT_RECV_WINDOW: u32 = 2 * 1024 * 1024;

/// Default maximum packet size for a new channel,
/// coincidentally the value used by OpenSSH.
pub const DEFAULT_MAX_PKTSIZE: u32 = 32768;

/// Default language tag attached to outbound messages carrying one.
pub const DEFAULT_LANG: &str = "en-US";

mod error;
pub use error::{Error, OpenFailure, Result};

pub mod arch;
pub mod binary;
pub mod connect;
pub mod pty;

mod connection;
pub use connection::{ChannelHandler, Connection};

mod session;
pub use session::{
    ClientSession, Data, ExitSignal, ServerSession, Session, TcpSession, TermSize,
};

pub mod channel;
pub use channel::{Channel, Client, Encoding, Server, Tcp, TermRequest, Variant};
