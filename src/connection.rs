//! The contract between channels and the connection which multiplexes them.

use std::rc::Rc;

use crate::binary::Packet;
use crate::connect::{ChannelOpenConfirmation, ChannelOpenFailure};
use crate::error::{OpenFailure, Result};

/// The connection collaborator consumed by channels.
///
/// The implementation owns the encrypted transport and the channel table;
/// channels only ever reach it through this trait. Methods must not
/// re-enter the calling channel synchronously: [`Connection::send_packet`]
/// is expected to frame and queue the payload, not to dispatch inbound
/// traffic from within the call.
pub trait Connection {
    /// Register a channel, assigning it a fresh local channel number.
    fn add_channel(&self, channel: Rc<dyn ChannelHandler>) -> u32;

    /// Drop the channel registered under the given local channel number.
    fn remove_channel(&self, number: u32);

    /// Encrypt and transmit a framed SSH message payload.
    fn send_packet(&self, payload: Vec<u8>);

    /// Transmit a `SSH_MSG_CHANNEL_OPEN_CONFIRMATION` for an inbound open.
    fn send_open_confirmation(
        &self,
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) {
        self.send_packet(
            ChannelOpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            }
            .to_bytes(),
        );
    }

    /// Transmit a `SSH_MSG_CHANNEL_OPEN_FAILURE` for an inbound open.
    fn send_open_failure(&self, recipient_channel: u32, failure: &OpenFailure) {
        self.send_packet(
            ChannelOpenFailure {
                recipient_channel,
                reason: failure.code,
                description: failure.reason.as_str().into(),
                language: failure.lang.as_str().try_into().unwrap_or_default(),
            }
            .to_bytes(),
        );
    }

    /// Additional information about the connection, by well-known name.
    fn get_extra_info(&self, name: &str) -> Option<String> {
        let _ = name;
        None
    }

    /// A single-valued authorized-key option, such as `command`.
    fn get_key_option(&self, name: &str) -> Option<String> {
        let _ = name;
        None
    }

    /// A single-valued certificate option, such as `force-command`.
    fn get_certificate_option(&self, name: &str) -> Option<String> {
        let _ = name;
        None
    }

    /// Whether the authorized-key options grant the named permission.
    fn check_key_permission(&self, name: &str) -> bool {
        let _ = name;
        true
    }

    /// Whether the certificate options grant the named permission.
    fn check_certificate_permission(&self, name: &str) -> bool {
        let _ = name;
        true
    }

    /// Environment variables seeded from the authorized-key options.
    fn key_environment(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// The connection-facing surface of a channel.
///
/// The connection demultiplexes inbound messages by recipient channel
/// number and routes them here; any returned [`enum@crate::Error`] is fatal
/// for the whole transport.
pub trait ChannelHandler {
    /// Dispatch an inbound channel-scoped message payload.
    fn process_packet(&self, payload: &[u8]) -> Result<()>;

    /// Complete an initiated open with the peer's channel parameters and
    /// any type-specific extra payload from the confirmation.
    fn process_open_confirmation(
        &self,
        send_chan: u32,
        send_window: u32,
        send_pktsize: u32,
        extra: Vec<u8>,
    ) -> Result<()>;

    /// Fail an initiated open.
    fn process_open_failure(&self, failure: OpenFailure) -> Result<()>;

    /// The SSH connection is going away; tear the channel down.
    fn process_connection_close(&self, error: Option<&crate::Error>);
}
