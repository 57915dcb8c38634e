//! The responding, `session`-type side of a channel.

use std::future::Future;
use std::num::NonZeroU32;
use std::rc::Rc;

use tracing::debug;

use crate::binary::Packet;
use crate::connect::{
    BreakRequest, EnvRequest, ExecRequest, ExitSignalRequest, ExitStatusRequest, PtyRequest,
    SignalRequest, SubsystemRequest, WindowChangeRequest, XonXoffRequest,
};
use crate::connection::Connection;
use crate::error::{Error, OpenFailure, Result};
use crate::pty::Modes;
use crate::session::{ServerSession, SessionRef, TermSize};

use super::{Channel, Encoding, SendState, Variant};

/// The [`Variant`] of channels which accept `session` opens and serve
/// shell, exec and subsystem requests to a user session.
#[derive(Default)]
pub struct Server {
    session: Option<Rc<dyn ServerSession>>,
    env: Vec<(String, String)>,
    command: Option<String>,
    subsystem: Option<String>,
    term_type: Option<String>,
    term_size: TermSize,
    term_modes: Modes,
}

impl Variant for Server {
    const WRITE_DATATYPES: &'static [NonZeroU32] = &[crate::EXTENDED_DATA_STDERR];

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
            "pty-req" => channel.handle_pty_request(args)?,
            "env" => channel.handle_env_request(args)?,
            "shell" => {
                if !args.is_empty() {
                    return Err(Error::Protocol("Invalid channel request"));
                }

                channel.start_session(None, None)?
            }
            "exec" => channel.handle_exec_request(args)?,
            "subsystem" => channel.handle_subsystem_request(args)?,
            "window-change" => channel.handle_window_change_request(args)?,
            "signal" => channel.handle_signal_request(args)?,
            "break" => channel.handle_break_request(args)?,
            _ => false,
        };

        channel.send_reply(result, want_reply);

        // Data starts flowing once the session type is settled.
        if result && matches!(kind, "shell" | "exec" | "subsystem") {
            if let Some(session) = channel.typed_session() {
                session.session_started();
            }
            channel.resume_reading()?;
        }

        Ok(())
    }
}

impl Channel<Server> {
    /// Create an unopened server channel, registered to the connection,
    /// with its environment seeded from the authorized-key options.
    pub fn new(
        conn: Rc<dyn Connection>,
        encoding: Encoding,
        window: u32,
        max_pktsize: u32,
    ) -> Self {
        let env = conn.key_environment();

        Self::new_with(
            conn,
            encoding,
            window,
            max_pktsize,
            Server {
                env,
                ..Default::default()
            },
        )
    }

    /// Accept an inbound `session` open.
    ///
    /// The peer's parameters are recorded immediately; the returned future
    /// awaits the session factory, then either confirms the open and wires
    /// the session up, or reports the factory's [`OpenFailure`] to the peer
    /// and tears the channel down. The future must be driven by the
    /// connection.
    pub fn process_open<F>(
        &self,
        send_chan: u32,
        send_window: u32,
        send_pktsize: u32,
        session: F,
    ) -> Result<impl Future<Output = ()> + use<F>>
    where
        F: Future<Output = Result<Rc<dyn ServerSession>, OpenFailure>>,
    {
        self.begin_process_open(send_chan, send_window, send_pktsize)?;

        let channel = self.clone();
        Ok(async move {
            match session.await {
                Ok(session) => {
                    channel.inner.borrow_mut().variant.session = Some(Rc::clone(&session));
                    channel.confirm_open();
                    session.connection_made(&channel);
                }
                Err(failure) => channel.fail_open(&failure),
            }
        })
    }

    /// Replace the current session with an SFTP server session built by
    /// `factory`, resetting the encoding to binary for the transfer.
    ///
    /// Meant to be called from `session_started` before any data is read
    /// or written; no further calls are made on the original session, not
    /// even `connection_lost`.
    pub fn start_sftp_server(
        &self,
        factory: impl FnOnce(Rc<dyn Connection>) -> Rc<dyn ServerSession>,
    ) -> Result<()> {
        let conn = self.connection().ok_or(Error::ConnectionLost)?;

        {
            let mut inner = self.inner.borrow_mut();
            inner.core.encoding = Encoding::Binary;
            inner.core.recv_partial.clear();
        }

        let session = factory(conn);
        self.inner.borrow_mut().variant.session = Some(Rc::clone(&session));

        debug!("swapped in an sftp server session");

        session.connection_made(self);
        session.session_started();

        Ok(())
    }

    /// Tell the client whether to enable XON/XOFF flow control.
    pub fn set_xon_xoff(&self, client_can_do: bool) -> Result<()> {
        self.send_request(
            "xon-xoff",
            &XonXoffRequest {
                client_can_do: client_can_do.into(),
            }
            .to_bytes(),
            false,
        )
    }

    /// Write data to the client's `stderr` stream.
    pub fn write_stderr(&self, data: &[u8]) -> Result<()> {
        self.write(data, Some(crate::EXTENDED_DATA_STDERR))
    }

    /// Write several chunks of data to the client's `stderr` stream.
    pub fn writelines_stderr(&self, chunks: &[&[u8]]) -> Result<()> {
        self.writelines(chunks, Some(crate::EXTENDED_DATA_STDERR))
    }

    /// Report the exit status of the process back to the client,
    /// then close the channel.
    pub fn exit(&self, status: u32) -> Result<()> {
        self.check_open_for_exit()?;

        self.send_request(
            "exit-status",
            &ExitStatusRequest {
                code: status & 0xff,
            }
            .to_bytes(),
            false,
        )?;
        self.close();

        Ok(())
    }

    /// Report that the process was terminated by a signal,
    /// then close the channel.
    pub fn exit_with_signal(
        &self,
        signal: &str,
        core_dumped: bool,
        message: &str,
        lang: &str,
    ) -> Result<()> {
        self.check_open_for_exit()?;

        let request = ExitSignalRequest {
            name: signal
                .try_into()
                .map_err(|_| Error::NotAscii("signal name"))?,
            core_dumped: core_dumped.into(),
            error_message: message.into(),
            language: lang.try_into().map_err(|_| Error::NotAscii("language tag"))?,
        };

        self.send_request("exit-signal", &request.to_bytes(), false)?;
        self.close();

        Ok(())
    }

    /// The environment set by the client (and the authorized-key options)
    /// for this session.
    pub fn environment(&self) -> Vec<(String, String)> {
        self.inner.borrow().variant.env.clone()
    }

    /// The command the client requested to execute, if any.
    pub fn command(&self) -> Option<String> {
        self.inner.borrow().variant.command.clone()
    }

    /// The subsystem the client requested to open, if any.
    pub fn subsystem(&self) -> Option<String> {
        self.inner.borrow().variant.subsystem.clone()
    }

    /// The terminal type set by the client, if it requested a pseudo-terminal.
    pub fn terminal_type(&self) -> Option<String> {
        self.inner.borrow().variant.term_type.clone()
    }

    /// The latest terminal dimensions reported by the client.
    pub fn terminal_size(&self) -> TermSize {
        self.inner.borrow().variant.term_size
    }

    /// The value of a POSIX terminal mode set by the client, if any.
    pub fn terminal_mode(&self, opcode: u8) -> Option<u32> {
        self.inner.borrow().variant.term_modes.get(opcode)
    }

    fn check_open_for_exit(&self) -> Result<()> {
        if !matches!(
            self.inner.borrow().core.send_state,
            SendState::Open | SendState::EofPending | SendState::EofSent
        ) {
            return Err(Error::NotOpen);
        }

        Ok(())
    }

    fn typed_session(&self) -> Option<Rc<dyn ServerSession>> {
        self.inner.borrow().variant.session.clone()
    }

    fn handle_pty_request(&self, args: &[u8]) -> Result<bool> {
        let request =
            PtyRequest::from_bytes(args).map_err(|_| Error::Protocol("Invalid pty request"))?;
        let term = request.term.into_string();

        self.inner.borrow_mut().variant.term_type = Some(term.clone());

        let Some(conn) = self.connection() else {
            return Ok(false);
        };
        if !conn.check_key_permission("pty") || !conn.check_certificate_permission("pty") {
            debug!("pty refused by key or certificate options");
            return Ok(false);
        }

        let size = TermSize {
            width_chars: request.width_chars,
            height_chars: request.height_chars,
            width_pixels: request.width_pixels,
            height_pixels: request.height_pixels,
        };
        let modes = Modes::decode(request.modes.as_ref())?;

        {
            let mut inner = self.inner.borrow_mut();
            inner.variant.term_size = size;
            inner.variant.term_modes = modes.clone();
        }

        let Some(session) = self.typed_session() else {
            return Ok(false);
        };

        Ok(session.pty_requested(&term, size, &modes))
    }

    fn handle_env_request(&self, args: &[u8]) -> Result<bool> {
        let request = EnvRequest::from_bytes(args)
            .map_err(|_| Error::Protocol("Invalid channel request"))?;

        let (Ok(name), Ok(value)) = (
            String::from_utf8(request.name.into_vec()),
            String::from_utf8(request.value.into_vec()),
        ) else {
            return Ok(false);
        };

        self.inner.borrow_mut().variant.env.push((name, value));

        Ok(true)
    }

    fn handle_exec_request(&self, args: &[u8]) -> Result<bool> {
        let request = ExecRequest::from_bytes(args)
            .map_err(|_| Error::Protocol("Invalid channel request"))?;

        let Ok(command) = String::from_utf8(request.command.into_vec()) else {
            return Ok(false);
        };

        self.start_session(Some(command), None)
    }

    fn handle_subsystem_request(&self, args: &[u8]) -> Result<bool> {
        let request = SubsystemRequest::from_bytes(args)
            .map_err(|_| Error::Protocol("Invalid channel request"))?;

        let Ok(subsystem) = String::from_utf8(request.name.into_vec()) else {
            return Ok(false);
        };
        if !subsystem.is_ascii() {
            return Ok(false);
        }

        self.start_session(None, Some(subsystem))
    }

    /// Route a `shell`, `exec` or `subsystem` request to the session,
    /// substituting any forced command from the certificate or
    /// authorized-key options.
    fn start_session(&self, command: Option<String>, subsystem: Option<String>) -> Result<bool> {
        let forced = self.connection().and_then(|conn| {
            conn.get_certificate_option("force-command")
                .or_else(|| conn.get_key_option("command"))
        });
        let command = forced.or(command);

        let Some(session) = self.typed_session() else {
            return Ok(false);
        };

        Ok(match (command, subsystem) {
            (Some(command), _) => {
                debug!(%command, "session requested command execution");
                self.inner.borrow_mut().variant.command = Some(command.clone());
                session.exec_requested(&command)
            }
            (None, Some(subsystem)) => {
                debug!(%subsystem, "session requested subsystem");
                self.inner.borrow_mut().variant.subsystem = Some(subsystem.clone());
                session.subsystem_requested(&subsystem)
            }
            (None, None) => {
                debug!("session requested shell");
                session.shell_requested()
            }
        })
    }

    fn handle_window_change_request(&self, args: &[u8]) -> Result<bool> {
        let request = WindowChangeRequest::from_bytes(args)
            .map_err(|_| Error::Protocol("Invalid channel request"))?;

        let size = TermSize {
            width_chars: request.width_chars,
            height_chars: request.height_chars,
            width_pixels: request.width_pixels,
            height_pixels: request.height_pixels,
        };
        self.inner.borrow_mut().variant.term_size = size;

        let Some(session) = self.typed_session() else {
            return Ok(false);
        };
        session.terminal_size_changed(size);

        Ok(true)
    }

    fn handle_signal_request(&self, args: &[u8]) -> Result<bool> {
        let request = SignalRequest::from_bytes(args)
            .map_err(|_| Error::Protocol("Invalid channel request"))?;

        let Ok(signal) = String::from_utf8(request.name.into_vec()) else {
            return Ok(false);
        };
        if !signal.is_ascii() {
            return Ok(false);
        }

        let Some(session) = self.typed_session() else {
            return Ok(false);
        };
        session.signal_received(&signal);

        Ok(true)
    }

    fn handle_break_request(&self, args: &[u8]) -> Result<bool> {
        let request = BreakRequest::from_bytes(args)
            .map_err(|_| Error::Protocol("Invalid channel request"))?;

        let Some(session) = self.typed_session() else {
            return Ok(false);
        };

        Ok(session.break_received(request.break_length))
    }
}
