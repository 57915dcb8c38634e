//! The initiating, `session`-type side of a channel.

use std::num::NonZeroU32;
use std::rc::Rc;

use tracing::debug;

use crate::binary::Packet;
use crate::connect::{
    BreakRequest, ChannelOpenContext, ChannelOpenFailureReason, EnvRequest, ExecRequest,
    ExitSignalRequest, ExitStatusRequest, PtyRequest, SignalRequest, SubsystemRequest,
    WindowChangeRequest, XonXoffRequest,
};
use crate::connection::Connection;
use crate::error::{Error, OpenFailure, Result};
use crate::pty::Modes;
use crate::session::{ClientSession, ExitSignal, SessionRef, TermSize};

use super::{Channel, Encoding, Variant};

/// A request for a pseudo-terminal on the session being established.
#[derive(Debug, Clone)]
pub struct TermRequest {
    /// Value for the peer's `$TERM` environment variable, e.g. `xterm-256color`.
    pub term_type: String,

    /// Initial dimensions of the terminal.
    pub size: TermSize,

    /// POSIX terminal modes to establish.
    pub modes: Modes,
}

/// The [`Variant`] of channels which initiate `session` opens:
/// remote command execution, interactive shells and subsystems.
#[derive(Default)]
pub struct Client {
    session: Option<Rc<dyn ClientSession>>,
    exit_status: Option<u32>,
    exit_signal: Option<ExitSignal>,
}

impl Variant for Client {
    const READ_DATATYPES: &'static [NonZeroU32] = &[crate::EXTENDED_DATA_STDERR];

    fn session(&self) -> Option<SessionRef> {
        self.session.clone().map(|session| session as SessionRef)
    }

    fn take_session(&mut self) -> Option<SessionRef> {
        self.session.take().map(|session| session as SessionRef)
    }

    fn handle_request(
        channel: &Channel<Self>,
        kind: &str,
        args: &[u8],
        want_reply: bool,
    ) -> Result<()> {
        let result = match kind {
            "xon-xoff" => channel.handle_xon_xoff(args)?,
            "exit-status" => channel.handle_exit_status(args)?,
            "exit-signal" => channel.handle_exit_signal(args)?,
            _ => false,
        };

        channel.send_reply(result, want_reply);

        Ok(())
    }
}

impl Channel<Client> {
    /// Create an unopened client channel, registered to the connection.
    pub fn new(
        conn: Rc<dyn Connection>,
        encoding: Encoding,
        window: u32,
        max_pktsize: u32,
    ) -> Self {
        Self::new_with(conn, encoding, window, max_pktsize, Client::default())
    }

    /// Open the channel and establish a session on it, running a command,
    /// a subsystem, or an interactive shell.
    ///
    /// `command` takes precedence over `subsystem`; with neither, a shell
    /// is requested. Environment variables are pushed first, then the
    /// terminal request if any, then the session request. Refusals surface
    /// as a typed [`OpenFailure`] and close the channel.
    pub async fn create(
        &self,
        session_factory: impl FnOnce() -> Rc<dyn ClientSession>,
        command: Option<&str>,
        subsystem: Option<&str>,
        env: &[(String, String)],
        term: Option<TermRequest>,
    ) -> Result<Rc<dyn ClientSession>> {
        let extra = self.open(ChannelOpenContext::Session).await?;

        // Session confirmations carry no extra payload.
        if !extra.is_empty() {
            return Err(Error::Protocol("Invalid channel open confirmation"));
        }

        let session = session_factory();
        self.inner.borrow_mut().variant.session = Some(Rc::clone(&session));
        session.connection_made(self);

        for (name, value) in env {
            self.send_request(
                "env",
                &EnvRequest {
                    name: name.as_bytes().into(),
                    value: value.as_bytes().into(),
                }
                .to_bytes(),
                false,
            )?;
        }

        if let Some(term) = term {
            let args = PtyRequest {
                term: term
                    .term_type
                    .as_str()
                    .try_into()
                    .map_err(|_| Error::NotAscii("terminal type"))?,
                width_chars: term.size.width_chars,
                height_chars: term.size.height_chars,
                width_pixels: term.size.width_pixels,
                height_pixels: term.size.height_pixels,
                modes: term.modes.encode().into(),
            }
            .to_bytes();

            if !self.make_request("pty-req", &args).await? {
                self.close();
                return Err(OpenFailure::new(
                    ChannelOpenFailureReason::REQUEST_PTY_FAILED,
                    "PTY request failed",
                )
                .into());
            }
        }

        let result = if let Some(command) = command {
            debug!(command, "requesting command execution");
            self.make_request(
                "exec",
                &ExecRequest {
                    command: command.as_bytes().into(),
                }
                .to_bytes(),
            )
            .await?
        } else if let Some(subsystem) = subsystem {
            debug!(subsystem, "requesting subsystem");
            self.make_request(
                "subsystem",
                &SubsystemRequest {
                    name: subsystem.as_bytes().into(),
                }
                .to_bytes(),
            )
            .await?
        } else {
            debug!("requesting shell");
            self.make_request("shell", &[]).await?
        };

        if !result {
            self.close();
            return Err(OpenFailure::new(
                ChannelOpenFailureReason::REQUEST_SESSION_FAILED,
                "Session request failed",
            )
            .into());
        }

        if self.inner.borrow().variant.session.is_none() {
            return Err(OpenFailure::new(
                ChannelOpenFailureReason::REQUEST_SESSION_FAILED,
                "Channel closed during session startup",
            )
            .into());
        }

        session.session_started();
        self.resume_reading()?;

        Ok(session)
    }

    /// Report a change of the local terminal dimensions to the server.
    pub fn change_terminal_size(&self, size: TermSize) -> Result<()> {
        self.send_request(
            "window-change",
            &WindowChangeRequest {
                width_chars: size.width_chars,
                height_chars: size.height_chars,
                width_pixels: size.width_pixels,
                height_pixels: size.height_pixels,
            }
            .to_bytes(),
            false,
        )
    }

    /// Ask the server to perform a break operation on the remote process,
    /// as described in [RFC 4335](https://datatracker.ietf.org/doc/html/rfc4335).
    pub fn send_break(&self, break_length: u32) -> Result<()> {
        self.send_request("break", &BreakRequest { break_length }.to_bytes(), false)
    }

    /// Deliver a signal to the remote process. Signal names follow
    /// [RFC4254 section 6.10](https://datatracker.ietf.org/doc/html/rfc4254#section-6.10),
    /// without the "SIG" prefix.
    pub fn send_signal(&self, signal: &str) -> Result<()> {
        if !signal.is_ascii() {
            return Err(Error::NotAscii("signal name"));
        }

        self.send_request(
            "signal",
            &SignalRequest {
                name: signal.as_bytes().into(),
            }
            .to_bytes(),
            false,
        )
    }

    /// Terminate the remote process with a `TERM` signal.
    pub fn terminate(&self) -> Result<()> {
        self.send_signal("TERM")
    }

    /// Forcibly stop the remote process with a `KILL` signal.
    pub fn kill(&self) -> Result<()> {
        self.send_signal("KILL")
    }

    /// The exit status of the remote process, if one was reported;
    /// `-1` if the process was terminated by a signal instead, see
    /// [`Channel::exit_signal`].
    pub fn exit_status(&self) -> Option<i32> {
        let inner = self.inner.borrow();

        match (&inner.variant.exit_status, &inner.variant.exit_signal) {
            (Some(status), _) => Some(*status as i32),
            (None, Some(_)) => Some(-1),
            (None, None) => None,
        }
    }

    /// The exit signal of the remote process, if one was reported.
    pub fn exit_signal(&self) -> Option<ExitSignal> {
        self.inner.borrow().variant.exit_signal.clone()
    }

    fn typed_session(&self) -> Option<Rc<dyn ClientSession>> {
        self.inner.borrow().variant.session.clone()
    }

    fn handle_xon_xoff(&self, args: &[u8]) -> Result<bool> {
        let request = XonXoffRequest::from_bytes(args)
            .map_err(|_| Error::Protocol("Invalid channel request"))?;

        let Some(session) = self.typed_session() else {
            return Ok(false);
        };
        session.xon_xoff_requested(request.client_can_do.into());

        Ok(true)
    }

    fn handle_exit_status(&self, args: &[u8]) -> Result<bool> {
        let request = ExitStatusRequest::from_bytes(args)
            .map_err(|_| Error::Protocol("Invalid channel request"))?;
        let status = request.code & 0xff;

        self.inner.borrow_mut().variant.exit_status = Some(status);

        let Some(session) = self.typed_session() else {
            return Ok(false);
        };
        session.exit_status_received(status);

        Ok(true)
    }

    fn handle_exit_signal(&self, args: &[u8]) -> Result<bool> {
        let request = ExitSignalRequest::from_bytes(args)
            .map_err(|_| Error::Protocol("Invalid exit signal request"))?;

        let signal = ExitSignal {
            signal: request.name.into_string(),
            core_dumped: request.core_dumped.into(),
            message: request.error_message.into_string(),
            lang: request.language.into_string(),
        };

        self.inner.borrow_mut().variant.exit_signal = Some(signal.clone());

        let Some(session) = self.typed_session() else {
            return Ok(false);
        };
        session.exit_signal_received(&signal);

        Ok(true)
    }
}
