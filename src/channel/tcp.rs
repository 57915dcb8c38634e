//! Channels carrying forwarded or direct TCP streams.

use std::future::Future;
use std::rc::Rc;

use crate::connect::ChannelOpenContext;
use crate::connection::Connection;
use crate::error::{Error, OpenFailure, Result};
use crate::session::{SessionRef, TcpSession};

use super::{Channel, Encoding, Variant};

/// The [`Variant`] of channels which tunnel a TCP byte stream,
/// either `direct-tcpip` or `forwarded-tcpip`.
#[derive(Default)]
pub struct Tcp {
    session: Option<Rc<dyn TcpSession>>,
}

impl Variant for Tcp {
    fn session(&self) -> Option<SessionRef> {
        self.session.clone().map(|session| session as SessionRef)
    }

    fn take_session(&mut self) -> Option<SessionRef> {
        self.session.take().map(|session| session as SessionRef)
    }

    fn handle_request(
        channel: &Channel<Self>,
        _kind: &str,
        _args: &[u8],
        want_reply: bool,
    ) -> Result<()> {
        // TCP channels know no requests.
        channel.send_reply(false, want_reply);

        Ok(())
    }
}

impl Channel<Tcp> {
    /// Create an unopened TCP channel, registered to the connection.
    pub fn new(conn: Rc<dyn Connection>, window: u32, max_pktsize: u32) -> Self {
        Self::new_with(conn, Encoding::Binary, window, max_pktsize, Tcp::default())
    }

    /// Open a `direct-tcpip` channel towards `host:port`, on behalf of the
    /// originator `orig_host:orig_port`.
    pub async fn connect(
        &self,
        session_factory: impl FnOnce() -> Rc<dyn TcpSession>,
        host: &str,
        port: u32,
        orig_host: &str,
        orig_port: u32,
    ) -> Result<Rc<dyn TcpSession>> {
        let context = ChannelOpenContext::DirectTcpip {
            address: host.into(),
            port,
            originator_address: orig_host.into(),
            originator_port: orig_port,
        };

        self.open_tcp(context, host, port, orig_host, orig_port, session_factory)
            .await
    }

    /// Open a `forwarded-tcpip` channel reporting a connection accepted on
    /// `host:port` from the originator `orig_host:orig_port`.
    pub async fn accept(
        &self,
        session_factory: impl FnOnce() -> Rc<dyn TcpSession>,
        host: &str,
        port: u32,
        orig_host: &str,
        orig_port: u32,
    ) -> Result<Rc<dyn TcpSession>> {
        let context = ChannelOpenContext::ForwardedTcpip {
            address: host.into(),
            port,
            originator_address: orig_host.into(),
            originator_port: orig_port,
        };

        self.open_tcp(context, host, port, orig_host, orig_port, session_factory)
            .await
    }

    /// Accept an inbound TCP open.
    ///
    /// The returned future completes the handshake like
    /// [`Channel::<Server>::process_open`] does, then additionally starts
    /// the session and resumes reading, since a TCP stream has no further
    /// setup subprotocol.
    pub fn process_open<F>(
        &self,
        send_chan: u32,
        send_window: u32,
        send_pktsize: u32,
        session: F,
    ) -> Result<impl Future<Output = ()> + use<F>>
    where
        F: Future<Output = Result<Rc<dyn TcpSession>, OpenFailure>>,
    {
        self.begin_process_open(send_chan, send_window, send_pktsize)?;

        let channel = self.clone();
        Ok(async move {
            match session.await {
                Ok(session) => {
                    channel.inner.borrow_mut().variant.session = Some(Rc::clone(&session));
                    channel.confirm_open();
                    session.connection_made(&channel);
                    session.session_started();
                    let _ = channel.resume_reading();
                }
                Err(failure) => channel.fail_open(&failure),
            }
        })
    }

    /// Record the tunneled endpoints of an inbound connection.
    pub fn set_inbound_peer_names(
        &self,
        dest_host: &str,
        dest_port: u32,
        orig_host: &str,
        orig_port: u32,
    ) {
        self.set_peernames(
            (dest_host.into(), dest_port),
            (orig_host.into(), orig_port),
        );
    }

    /// The local endpoint of the tunneled TCP connection, as `(host, port)`.
    pub fn local_peername(&self) -> Option<(String, u32)> {
        self.peernames().0
    }

    /// The remote endpoint of the tunneled TCP connection, as `(host, port)`.
    pub fn remote_peername(&self) -> Option<(String, u32)> {
        self.peernames().1
    }

    async fn open_tcp(
        &self,
        context: ChannelOpenContext<'_>,
        host: &str,
        port: u32,
        orig_host: &str,
        orig_port: u32,
        session_factory: impl FnOnce() -> Rc<dyn TcpSession>,
    ) -> Result<Rc<dyn TcpSession>> {
        self.set_peernames((orig_host.into(), orig_port), (host.into(), port));

        let extra = self.open(context).await?;

        // TCP confirmations carry no extra payload.
        if !extra.is_empty() {
            return Err(Error::Protocol("Invalid channel open confirmation"));
        }

        let session = session_factory();
        self.inner.borrow_mut().variant.session = Some(Rc::clone(&session));

        session.connection_made(self);
        session.session_started();
        self.resume_reading()?;

        Ok(session)
    }
}
