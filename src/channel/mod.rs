//! Multiplexed channels and their flow control,
//! as defined in the [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254).
//!
//! A [`Channel`] is one bidirectional byte stream inside an SSH connection,
//! made of two loosely coupled half-duplex state machines: the *send* half
//! owns a windowed, buffered write path, the *receive* half delivers inbound
//! data to the channel's [`Session`]. The concrete behavior of a channel is
//! picked by its [`Variant`] parameter: [`Client`], [`Server`] or [`Tcp`].

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::rc::Rc;

use futures::channel::oneshot;
use tracing::{debug, trace};

use crate::binary::Packet;
use crate::connect::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelMessage,
    ChannelOpen, ChannelOpenContext, ChannelRequest, ChannelSuccess, ChannelWindowAdjust,
};
use crate::connection::{ChannelHandler, Connection};
use crate::error::{Error, OpenFailure, Result};
use crate::session::{Data, SessionRef};

mod client;
pub use client::{Client, TermRequest};

mod server;
pub use server::Server;

mod tcp;
pub use tcp::Tcp;

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::Client {}
    impl Sealed for super::Server {}
    impl Sealed for super::Tcp {}
}

/// The role a [`Channel`] plays inside the connection.
///
/// Implemented by [`Client`], [`Server`] and [`Tcp`] only; the methods are
/// plumbing between the shared channel base and the variant behaviors.
pub trait Variant: sealed::Sealed + Sized + 'static {
    /// Extended data types this variant accepts from the peer.
    #[doc(hidden)]
    const READ_DATATYPES: &'static [NonZeroU32] = &[];

    /// Extended data types this variant may send to the peer.
    #[doc(hidden)]
    const WRITE_DATATYPES: &'static [NonZeroU32] = &[];

    #[doc(hidden)]
    fn session(&self) -> Option<SessionRef>;

    #[doc(hidden)]
    fn take_session(&mut self) -> Option<SessionRef>;

    #[doc(hidden)]
    fn handle_request(
        channel: &Channel<Self>,
        kind: &str,
        args: &[u8],
        want_reply: bool,
    ) -> Result<()>;
}

/// How channel payload bytes are presented to and accepted from the session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Raw bytes, delivered as [`Data::Bytes`].
    #[default]
    Binary,

    /// UTF-8 text, delivered as [`Data::Text`] with incomplete codepoints
    /// buffered across packet boundaries, per data type.
    Utf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Closed,
    OpenSent,
    OpenReceived,
    Open,
    EofPending,
    EofSent,
    ClosePending,
    CloseSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    Closed,
    Open,
    EofReceived,
}

/// Inbound traffic held back while the session has paused reading.
enum RecvItem {
    Data(Vec<u8>, Option<NonZeroU32>),
    Eof,
}

/// A decoded piece of inbound payload, ready for delivery.
enum Chunk {
    Bytes(Vec<u8>),
    Text(String),
}

impl Chunk {
    fn as_data(&self) -> Data<'_> {
        match self {
            Self::Bytes(bytes) => Data::Bytes(bytes),
            Self::Text(text) => Data::Text(text),
        }
    }
}

/// State shared by every channel variant.
pub(crate) struct Core {
    conn: Option<Rc<dyn Connection>>,
    recv_chan: Option<u32>,
    send_chan: Option<u32>,
    encoding: Encoding,

    send_state: SendState,
    send_window: u32,
    send_pktsize: u32,
    send_paused: bool,
    send_buf: VecDeque<(Vec<u8>, Option<NonZeroU32>)>,
    send_buf_len: usize,
    send_high_water: usize,
    send_low_water: usize,

    recv_state: RecvState,
    init_recv_window: u32,
    recv_window: u32,
    recv_pktsize: u32,
    recv_paused: bool,
    recv_buf: VecDeque<RecvItem>,
    recv_partial: HashMap<Option<NonZeroU32>, Vec<u8>>,

    open_waiter: Option<oneshot::Sender<Result<Vec<u8>>>>,
    request_waiters: VecDeque<oneshot::Sender<Result<bool>>>,
    close_waiters: Vec<oneshot::Sender<()>>,

    local_peername: Option<(String, u32)>,
    remote_peername: Option<(String, u32)>,

    done: bool,
}

impl Core {
    fn new(conn: Rc<dyn Connection>, encoding: Encoding, window: u32, max_pktsize: u32) -> Self {
        let mut core = Self {
            conn: Some(conn),
            recv_chan: None,
            send_chan: None,
            encoding,

            send_state: SendState::Closed,
            send_window: 0,
            send_pktsize: 0,
            send_paused: false,
            send_buf: VecDeque::new(),
            send_buf_len: 0,
            send_high_water: 0,
            send_low_water: 0,

            recv_state: RecvState::Closed,
            init_recv_window: window,
            recv_window: window,
            recv_pktsize: max_pktsize,
            recv_paused: true,
            recv_buf: VecDeque::new(),
            recv_partial: HashMap::new(),

            open_waiter: None,
            request_waiters: VecDeque::new(),
            close_waiters: Vec::new(),

            local_peername: None,
            remote_peername: None,

            done: false,
        };

        let _ = core.set_write_buffer_limits(None, None);

        core
    }

    fn send_msg<P: Packet>(&self, packet: &P) {
        if let Some(conn) = &self.conn {
            conn.send_packet(packet.to_bytes());
        }
    }

    fn peer_channel(&self) -> Result<u32> {
        self.send_chan.ok_or(Error::NotOpen)
    }

    fn send_request(&self, kind: &'static str, args: &[u8], want_reply: bool) -> Result<()> {
        let recipient_channel = self.peer_channel()?;

        let mut payload = ChannelRequest {
            recipient_channel,
            kind: crate::arch::Ascii::from_static(kind),
            want_reply: want_reply.into(),
        }
        .to_bytes();
        payload.extend_from_slice(args);

        if let Some(conn) = &self.conn {
            conn.send_packet(payload);
        }

        Ok(())
    }

    fn is_send_closing(&self) -> bool {
        matches!(
            self.send_state,
            SendState::ClosePending | SendState::CloseSent | SendState::Closed
        )
    }

    /// Re-evaluate the write-side hysteresis; `Some(true)` asks the session
    /// to pause writing, `Some(false)` to resume.
    fn pause_resume_writing(&mut self) -> Option<bool> {
        if self.send_paused {
            if self.send_buf_len <= self.send_low_water {
                self.send_paused = false;
                return Some(false);
            }
        } else if self.send_buf_len > self.send_high_water {
            self.send_paused = true;
            return Some(true);
        }

        None
    }

    fn set_write_buffer_limits(
        &mut self,
        high: Option<usize>,
        low: Option<usize>,
    ) -> Result<Option<bool>> {
        let high = high.unwrap_or_else(|| low.map_or(65536, |low| 4 * low));
        let low = low.unwrap_or(high / 4);

        if low > high {
            return Err(Error::InvalidBufferLimits { high, low });
        }

        self.send_high_water = high;
        self.send_low_water = low;

        Ok(self.pause_resume_writing())
    }

    /// Emit as much buffered data as the send window allows, fragmented to
    /// the peer's maximum packet size, then the pending `EOF`/`CLOSE` if the
    /// buffer drained.
    fn flush_send_buf(&mut self) -> Option<bool> {
        if let Some(recipient_channel) = self.send_chan {
            while self.send_window > 0 && !self.send_buf.is_empty() {
                let pktsize = self.send_window.min(self.send_pktsize) as usize;
                if pktsize == 0 {
                    break;
                }

                let head_len = match self.send_buf.front() {
                    Some((buf, _)) => buf.len(),
                    None => break,
                };
                let (data, datatype) = if head_len > pktsize {
                    match self.send_buf.front_mut() {
                        Some((buf, datatype)) => {
                            (buf.drain(..pktsize).collect::<Vec<_>>(), *datatype)
                        }
                        None => break,
                    }
                } else {
                    match self.send_buf.pop_front() {
                        Some(entry) => entry,
                        None => break,
                    }
                };

                self.send_buf_len -= data.len();
                self.send_window -= data.len() as u32;

                trace!(
                    channel = recipient_channel,
                    amount = data.len(),
                    window = self.send_window,
                    "sending channel data"
                );

                match datatype {
                    None => self.send_msg(&ChannelData {
                        recipient_channel,
                        data: data.into(),
                    }),
                    Some(data_type) => self.send_msg(&ChannelExtendedData {
                        recipient_channel,
                        data_type,
                        data: data.into(),
                    }),
                }
            }

            let change = self.pause_resume_writing();

            if self.send_buf.is_empty() {
                match self.send_state {
                    SendState::EofPending => {
                        self.send_msg(&ChannelEof { recipient_channel });
                        self.send_state = SendState::EofSent;
                    }
                    SendState::ClosePending => {
                        self.send_msg(&ChannelClose { recipient_channel });
                        self.send_state = SendState::CloseSent;
                        debug!(channel = recipient_channel, "sent channel close");
                    }
                    _ => {}
                }
            }

            change
        } else {
            self.pause_resume_writing()
        }
    }

    /// Debit the receive window for delivered data, topping the peer up
    /// once more than half of the window has been consumed.
    ///
    /// Data buffered during a read pause is only debited here, so this is
    /// where a slow overrun across several packets gets caught.
    fn debit_recv_window(&mut self, amount: usize) -> Result<()> {
        self.recv_window = self
            .recv_window
            .checked_sub(amount as u32)
            .ok_or(Error::Protocol("Window exceeded"))?;

        if self.recv_window < self.init_recv_window / 2 {
            let bytes_to_add = self.init_recv_window - self.recv_window;

            if let Ok(recipient_channel) = self.peer_channel() {
                trace!(
                    channel = recipient_channel,
                    bytes_to_add, "topping up the receive window"
                );

                self.send_msg(&ChannelWindowAdjust {
                    recipient_channel,
                    bytes_to_add,
                });
            }

            self.recv_window = self.init_recv_window;
        }

        Ok(())
    }

    /// Decode an inbound payload into deliverable chunks, buffering any
    /// trailing incomplete codepoint and splitting the stream at a
    /// mid-buffer fault.
    fn decode_chunks(
        &mut self,
        data: Vec<u8>,
        datatype: Option<NonZeroU32>,
    ) -> (Vec<Chunk>, Option<Error>) {
        match self.encoding {
            Encoding::Binary => (vec![Chunk::Bytes(data)], None),
            Encoding::Utf8 => {
                let mut input = match self.recv_partial.remove(&datatype) {
                    Some(mut tail) => {
                        tail.extend_from_slice(&data);
                        tail
                    }
                    None => data,
                };

                enum Decoded {
                    Complete,
                    Split(usize),
                    Truncated,
                    Fault,
                }

                let mut chunks = Vec::new();
                loop {
                    let decoded = match std::str::from_utf8(&input) {
                        Ok(_) => Decoded::Complete,
                        Err(err) if err.valid_up_to() > 0 => Decoded::Split(err.valid_up_to()),
                        Err(err) if err.error_len().is_none() => Decoded::Truncated,
                        Err(_) => Decoded::Fault,
                    };

                    match decoded {
                        Decoded::Complete => {
                            if !input.is_empty() {
                                if let Ok(text) = String::from_utf8(std::mem::take(&mut input)) {
                                    chunks.push(Chunk::Text(text));
                                }
                            }
                            break (chunks, None);
                        }
                        Decoded::Split(valid) => {
                            let rest = input.split_off(valid);
                            if let Ok(text) = String::from_utf8(std::mem::replace(&mut input, rest))
                            {
                                chunks.push(Chunk::Text(text));
                            }
                        }
                        Decoded::Truncated => {
                            self.recv_partial.insert(datatype, input);
                            break (chunks, None);
                        }
                        Decoded::Fault => {
                            break (chunks, Some(Error::Protocol("Unicode decode error")));
                        }
                    }
                }
            }
        }
    }
}

pub(crate) struct Inner<V: Variant> {
    pub(crate) core: Core,
    pub(crate) variant: V,
}

/// One multiplexed bidirectional byte stream inside an SSH connection.
///
/// Handles are cheap to clone and all refer to the same underlying channel;
/// synchronous methods never suspend, `async` methods suspend until the
/// peer answers. The channel registers itself with its [`Connection`] at
/// construction and deregisters during teardown.
pub struct Channel<V: Variant> {
    pub(crate) inner: Rc<RefCell<Inner<V>>>,
}

impl<V: Variant> Clone for Channel<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<V: Variant> Channel<V> {
    pub(crate) fn new_with(
        conn: Rc<dyn Connection>,
        encoding: Encoding,
        window: u32,
        max_pktsize: u32,
        variant: V,
    ) -> Self {
        let channel = Self {
            inner: Rc::new(RefCell::new(Inner {
                core: Core::new(Rc::clone(&conn), encoding, window, max_pktsize),
                variant,
            })),
        };

        let recv_chan = conn.add_channel(Rc::new(channel.clone()));
        channel.inner.borrow_mut().core.recv_chan = Some(recv_chan);

        debug!(channel = recv_chan, "registered channel");

        channel
    }

    /// The encoding in use on this channel.
    pub fn encoding(&self) -> Encoding {
        self.inner.borrow().core.encoding
    }

    /// The configured initial receive window of this channel.
    pub fn recv_window(&self) -> u32 {
        self.inner.borrow().core.init_recv_window
    }

    /// Additional information about the channel, by well-known name,
    /// falling back to the underlying connection.
    pub fn get_extra_info(&self, name: &str) -> Option<String> {
        let inner = self.inner.borrow();

        inner
            .core
            .conn
            .as_ref()
            .and_then(|conn| conn.get_extra_info(name))
    }

    /// How many bytes currently sit in the channel's output buffer,
    /// waiting for send window to open up.
    pub fn write_buffer_size(&self) -> usize {
        self.inner.borrow().core.send_buf_len
    }

    /// Whether the channel supports [`Channel::write_eof`]; always true.
    pub fn can_write_eof(&self) -> bool {
        true
    }

    /// Set the high- and low-water marks steering `pause_writing` /
    /// `resume_writing` on the session.
    ///
    /// Omitted marks default to `high = 64 KiB`, `high = 4 * low` or
    /// `low = high / 4`; `low` must not exceed `high`.
    pub fn set_write_buffer_limits(&self, high: Option<usize>, low: Option<usize>) -> Result<()> {
        let change = self
            .inner
            .borrow_mut()
            .core
            .set_write_buffer_limits(high, low)?;
        self.apply_pause_change(change);

        Ok(())
    }

    /// Write data on the channel, tagged with an extended data type if any.
    ///
    /// Data is buffered and emitted as the peer's window allows, fragmented
    /// to its maximum packet size. Text channels expect the bytes to be
    /// valid in the channel's encoding. Empty writes are no-ops.
    pub fn write(&self, data: &[u8], datatype: Option<NonZeroU32>) -> Result<()> {
        let change = {
            let mut inner = self.inner.borrow_mut();

            if inner.core.send_state != SendState::Open {
                return Err(Error::NotOpen);
            }
            if let Some(datatype) = datatype {
                if !V::WRITE_DATATYPES.contains(&datatype) {
                    return Err(Error::InvalidDatatype);
                }
            }
            if data.is_empty() {
                return Ok(());
            }

            inner.core.send_buf.push_back((data.to_vec(), datatype));
            inner.core.send_buf_len += data.len();

            inner.core.flush_send_buf()
        };
        self.apply_pause_change(change);

        Ok(())
    }

    /// Write several chunks of data on the channel, equivalent to
    /// consecutive [`Channel::write`] calls.
    pub fn writelines(&self, chunks: &[&[u8]], datatype: Option<NonZeroU32>) -> Result<()> {
        self.write(&chunks.concat(), datatype)
    }

    /// Send an end-of-file indication once the send buffer drains;
    /// no more data can be written afterwards, while the receive side
    /// stays usable.
    pub fn write_eof(&self) -> Result<()> {
        let change = {
            let mut inner = self.inner.borrow_mut();

            if inner.core.send_state != SendState::Open {
                return Err(Error::NotOpen);
            }

            inner.core.send_state = SendState::EofPending;
            inner.core.flush_send_buf()
        };
        self.apply_pause_change(change);

        Ok(())
    }

    /// Cleanly close the channel; buffered data is flushed before the
    /// `CLOSE` goes out. Idempotent.
    pub fn close(&self) {
        let change = {
            let mut inner = self.inner.borrow_mut();

            if inner.core.is_send_closing() {
                return;
            }

            inner.core.send_state = SendState::ClosePending;
            inner.core.flush_send_buf()
        };
        self.apply_pause_change(change);
    }

    /// Forcibly close the channel, discarding any unsent buffered data.
    pub fn abort(&self) {
        let mut inner = self.inner.borrow_mut();

        if matches!(
            inner.core.send_state,
            SendState::CloseSent | SendState::Closed
        ) {
            return;
        }

        inner.core.send_buf.clear();
        inner.core.send_buf_len = 0;

        if let Ok(recipient_channel) = inner.core.peer_channel() {
            inner.core.send_msg(&ChannelClose { recipient_channel });
        }
        inner.core.send_state = SendState::CloseSent;
    }

    /// Suspend delivery of incoming data to the session.
    ///
    /// Inbound traffic is buffered locally up to the advertised window;
    /// window top-ups stop going out, eventually exerting backpressure on
    /// the peer. Close notifications are not suspended.
    pub fn pause_reading(&self) {
        self.inner.borrow_mut().core.recv_paused = true;
    }

    /// Resume delivery of incoming data, draining anything buffered while
    /// reading was paused. The drain stops early if the session pauses
    /// reading again from one of its callbacks.
    pub fn resume_reading(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.core.recv_paused {
                return Ok(());
            }
            inner.core.recv_paused = false;
        }

        loop {
            let item = {
                let mut inner = self.inner.borrow_mut();
                if inner.core.recv_paused {
                    break;
                }
                inner.core.recv_buf.pop_front()
            };

            match item {
                Some(RecvItem::Data(data, datatype)) => self.deliver_data(data, datatype)?,
                Some(RecvItem::Eof) => self.deliver_eof()?,
                None => break,
            }
        }

        Ok(())
    }

    /// Emit a channel request expecting a reply, suspending until the peer
    /// answers with `SSH_MSG_CHANNEL_SUCCESS` or `SSH_MSG_CHANNEL_FAILURE`.
    ///
    /// `args` carries the request-specific arguments, already serialized
    /// with [`Packet::to_bytes`]. Several requests may be in flight; the
    /// peer answers them in order.
    pub async fn make_request(&self, kind: &'static str, args: &[u8]) -> Result<bool> {
        let receiver = {
            let mut inner = self.inner.borrow_mut();

            let (sender, receiver) = oneshot::channel();
            inner.core.request_waiters.push_back(sender);

            if let Err(err) = inner.core.send_request(kind, args, true) {
                inner.core.request_waiters.pop_back();
                return Err(err);
            }

            receiver
        };

        receiver.await.unwrap_or(Err(Error::ConnectionLost))
    }

    /// Suspend until the channel has finished closing.
    ///
    /// Returns immediately if the channel is already closed.
    pub async fn wait_closed(&self) {
        let receiver = {
            let mut inner = self.inner.borrow_mut();

            if inner.core.send_state == SendState::Closed
                && inner.core.recv_state == RecvState::Closed
            {
                None
            } else {
                let (sender, receiver) = oneshot::channel();
                inner.core.close_waiters.push(sender);
                Some(receiver)
            }
        };

        if let Some(receiver) = receiver {
            let _ = receiver.await;
        }
    }

    pub(crate) fn connection(&self) -> Option<Rc<dyn Connection>> {
        self.inner.borrow().core.conn.clone()
    }

    pub(crate) fn base_session(&self) -> Option<SessionRef> {
        self.inner.borrow().variant.session()
    }

    pub(crate) fn send_request(
        &self,
        kind: &'static str,
        args: &[u8],
        want_reply: bool,
    ) -> Result<()> {
        self.inner.borrow().core.send_request(kind, args, want_reply)
    }

    /// Answer a channel request when the peer asked for a reply.
    pub(crate) fn send_reply(&self, result: bool, want_reply: bool) {
        if !want_reply {
            return;
        }

        let inner = self.inner.borrow();
        if let Ok(recipient_channel) = inner.core.peer_channel() {
            if result {
                inner.core.send_msg(&ChannelSuccess { recipient_channel });
            } else {
                inner.core.send_msg(&ChannelFailure { recipient_channel });
            }
        }
    }

    pub(crate) fn set_peernames(
        &self,
        local_peername: (String, u32),
        remote_peername: (String, u32),
    ) {
        let mut inner = self.inner.borrow_mut();
        inner.core.local_peername = Some(local_peername);
        inner.core.remote_peername = Some(remote_peername);
    }

    pub(crate) fn peernames(&self) -> (Option<(String, u32)>, Option<(String, u32)>) {
        let inner = self.inner.borrow();
        (
            inner.core.local_peername.clone(),
            inner.core.remote_peername.clone(),
        )
    }

    /// Initiate the open handshake, suspending until the peer confirms or
    /// refuses it; on confirmation, the type-specific extra payload is
    /// returned.
    pub(crate) async fn open(&self, context: ChannelOpenContext<'_>) -> Result<Vec<u8>> {
        let receiver = {
            let mut inner = self.inner.borrow_mut();

            if inner.core.send_state != SendState::Closed {
                return Err(Error::AlreadyOpen);
            }
            let Some(sender_channel) = inner.core.recv_chan else {
                return Err(Error::ConnectionLost);
            };

            let (sender, receiver) = oneshot::channel();
            inner.core.open_waiter = Some(sender);

            debug!(channel = sender_channel, kind = %context.as_ascii(), "opening channel");

            inner.core.send_msg(&ChannelOpen {
                sender_channel,
                initial_window_size: inner.core.recv_window,
                maximum_packet_size: inner.core.recv_pktsize,
                context,
            });
            inner.core.send_state = SendState::OpenSent;

            receiver
        };

        receiver.await.unwrap_or(Err(Error::ConnectionLost))
    }

    /// Record the peer's parameters for an inbound open. The variant is
    /// expected to install a session and [`Channel::confirm_open`] or
    /// [`Channel::fail_open`] afterwards.
    pub(crate) fn begin_process_open(
        &self,
        send_chan: u32,
        send_window: u32,
        send_pktsize: u32,
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();

        if inner.core.recv_state != RecvState::Closed {
            return Err(Error::Protocol("Channel already open"));
        }

        inner.core.send_state = SendState::OpenReceived;
        inner.core.send_chan = Some(send_chan);
        inner.core.send_window = send_window;
        inner.core.send_pktsize = send_pktsize;

        Ok(())
    }

    pub(crate) fn confirm_open(&self) {
        let mut inner = self.inner.borrow_mut();

        if let (Some(conn), Some(send_chan), Some(recv_chan)) = (
            inner.core.conn.clone(),
            inner.core.send_chan,
            inner.core.recv_chan,
        ) {
            conn.send_open_confirmation(
                send_chan,
                recv_chan,
                inner.core.recv_window,
                inner.core.recv_pktsize,
            );

            debug!(channel = recv_chan, "accepted inbound channel open");
        }

        inner.core.send_state = SendState::Open;
        inner.core.recv_state = RecvState::Open;
    }

    pub(crate) fn fail_open(&self, failure: &OpenFailure) {
        {
            let inner = self.inner.borrow();
            if let (Some(conn), Some(send_chan)) =
                (inner.core.conn.as_ref(), inner.core.send_chan)
            {
                conn.send_open_failure(send_chan, failure);
            }
        }

        self.cleanup(None);
    }

    fn apply_pause_change(&self, change: Option<bool>) {
        if let Some(pause) = change {
            if let Some(session) = self.base_session() {
                if pause {
                    session.pause_writing();
                } else {
                    session.resume_writing();
                }
            }
        }
    }

    /// Accept one inbound data packet: enforce the window, drop it if the
    /// send side already started closing, buffer it while reading is
    /// paused, deliver it otherwise.
    fn accept_data(&self, data: Vec<u8>, datatype: Option<NonZeroU32>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        {
            let mut inner = self.inner.borrow_mut();

            if data.len() > inner.core.recv_window as usize {
                return Err(Error::Protocol("Window exceeded"));
            }

            if inner.core.is_send_closing() {
                // The session is gone, but the bytes still count against the
                // advertised window or a later overrun would go unnoticed.
                inner.core.recv_window -= data.len() as u32;
                return Ok(());
            }

            if inner.core.recv_paused {
                inner.core.recv_buf.push_back(RecvItem::Data(data, datatype));
                return Ok(());
            }
        }

        self.deliver_data(data, datatype)
    }

    fn deliver_data(&self, data: Vec<u8>, datatype: Option<NonZeroU32>) -> Result<()> {
        let (chunks, session, error) = {
            let mut inner = self.inner.borrow_mut();

            inner.core.debit_recv_window(data.len())?;
            let (chunks, error) = inner.core.decode_chunks(data, datatype);

            (chunks, inner.variant.session(), error)
        };

        if let Some(session) = session {
            for chunk in &chunks {
                session.data_received(chunk.as_data(), datatype);
            }
        }

        error.map_or(Ok(()), Err)
    }

    fn deliver_eof(&self) -> Result<()> {
        let session = {
            let inner = self.inner.borrow();

            if !inner.core.recv_partial.is_empty() {
                return Err(Error::Protocol("Unicode decode error"));
            }

            inner.variant.session()
        };

        if !session.is_some_and(|session| session.eof_received()) {
            self.close();
        }

        Ok(())
    }

    /// Tear the channel down. Runs exactly once: settles every pending
    /// waiter, notifies the session, deregisters from the connection and
    /// drops the references both ways.
    pub(crate) fn cleanup(&self, error: Option<&Error>) {
        let (open_waiter, request_waiters, close_waiters, session, conn, recv_chan) = {
            let mut inner = self.inner.borrow_mut();

            if inner.core.done {
                return;
            }
            inner.core.done = true;

            inner.core.send_state = SendState::Closed;
            inner.core.recv_state = RecvState::Closed;

            (
                inner.core.open_waiter.take(),
                std::mem::take(&mut inner.core.request_waiters),
                std::mem::take(&mut inner.core.close_waiters),
                inner.variant.take_session(),
                inner.core.conn.take(),
                inner.core.recv_chan.take(),
            )
        };

        if let Some(waiter) = open_waiter {
            let _ = waiter.send(Err(OpenFailure::new(
                crate::connect::ChannelOpenFailureReason::ConnectFailed,
                "SSH connection closed",
            )
            .into()));
        }

        for waiter in request_waiters {
            let _ = waiter.send(Err(error.cloned().unwrap_or(Error::ConnectionLost)));
        }

        for waiter in close_waiters {
            let _ = waiter.send(());
        }

        if let Some(session) = session {
            session.connection_lost(error);
        }

        if let (Some(conn), Some(recv_chan)) = (conn, recv_chan) {
            conn.remove_channel(recv_chan);
            debug!(channel = recv_chan, "deregistered channel");
        }
    }

    fn handle_window_adjust(&self, message: ChannelWindowAdjust) -> Result<()> {
        let change = {
            let mut inner = self.inner.borrow_mut();

            if !matches!(
                inner.core.recv_state,
                RecvState::Open | RecvState::EofReceived
            ) {
                return Err(Error::Protocol("Channel not open"));
            }

            inner.core.send_window = inner
                .core
                .send_window
                .checked_add(message.bytes_to_add)
                .ok_or(Error::Protocol("Invalid window adjustment"))?;

            trace!(
                channel = message.recipient_channel,
                window = inner.core.send_window,
                "peer opened up its window"
            );

            inner.core.flush_send_buf()
        };
        self.apply_pause_change(change);

        Ok(())
    }

    fn handle_data(&self, message: ChannelData<'_>) -> Result<()> {
        if self.inner.borrow().core.recv_state != RecvState::Open {
            return Err(Error::Protocol("Channel not open for sending"));
        }

        self.accept_data(message.data.into_vec(), None)
    }

    fn handle_extended_data(&self, message: ChannelExtendedData<'_>) -> Result<()> {
        if self.inner.borrow().core.recv_state != RecvState::Open {
            return Err(Error::Protocol("Channel not open for sending"));
        }
        if !V::READ_DATATYPES.contains(&message.data_type) {
            return Err(Error::Protocol("Invalid extended data type"));
        }

        self.accept_data(message.data.into_vec(), Some(message.data_type))
    }

    fn handle_eof(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();

            if inner.core.recv_state != RecvState::Open {
                return Err(Error::Protocol("Channel not open for sending"));
            }
            inner.core.recv_state = RecvState::EofReceived;

            if inner.core.is_send_closing() {
                return Ok(());
            }
            if inner.core.recv_paused {
                inner.core.recv_buf.push_back(RecvItem::Eof);
                return Ok(());
            }
        }

        self.deliver_eof()
    }

    fn handle_close(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();

            if !matches!(
                inner.core.recv_state,
                RecvState::Open | RecvState::EofReceived
            ) {
                return Err(Error::Protocol("Channel not open"));
            }

            // Unsent data has nowhere to go anymore.
            inner.core.send_buf.clear();
            inner.core.send_buf_len = 0;

            if !matches!(
                inner.core.send_state,
                SendState::CloseSent | SendState::Closed
            ) {
                if let Ok(recipient_channel) = inner.core.peer_channel() {
                    inner.core.send_msg(&ChannelClose { recipient_channel });
                }
                inner.core.send_state = SendState::CloseSent;
            }

            debug!(channel = ?inner.core.recv_chan, "peer closed channel");
        }

        self.cleanup(None);

        Ok(())
    }

    fn handle_request_msg(&self, request: ChannelRequest<'_>, args: &[u8]) -> Result<()> {
        {
            let inner = self.inner.borrow();

            if !matches!(
                inner.core.recv_state,
                RecvState::Open | RecvState::EofReceived
            ) {
                return Err(Error::Protocol("Channel not open"));
            }
            if inner.core.is_send_closing() {
                return Ok(());
            }
        }

        V::handle_request(
            self,
            request.kind.as_ref(),
            args,
            request.want_reply.into(),
        )
    }

    fn handle_response(&self, success: bool) -> Result<()> {
        let waiter = {
            let mut inner = self.inner.borrow_mut();

            if !matches!(
                inner.core.send_state,
                SendState::Open
                    | SendState::EofPending
                    | SendState::EofSent
                    | SendState::ClosePending
                    | SendState::CloseSent
            ) {
                return Err(Error::Protocol("Channel not open"));
            }

            inner
                .core
                .request_waiters
                .pop_front()
                .ok_or(Error::Protocol("Unexpected channel response"))?
        };

        let _ = waiter.send(Ok(success));

        Ok(())
    }
}

impl<V: Variant> ChannelHandler for Channel<V> {
    fn process_packet(&self, payload: &[u8]) -> Result<()> {
        let (message, size) = ChannelMessage::from_bytes_prefix(payload).map_err(|err| {
            debug!(%err, "undecodable channel message");
            Error::Protocol("Invalid channel message")
        })?;
        let rest = &payload[size..];

        match message {
            ChannelMessage::Request(request) => self.handle_request_msg(request, rest),
            _ if !rest.is_empty() => Err(Error::Protocol("Invalid channel message")),
            ChannelMessage::WindowAdjust(message) => self.handle_window_adjust(message),
            ChannelMessage::Data(message) => self.handle_data(message),
            ChannelMessage::ExtendedData(message) => self.handle_extended_data(message),
            ChannelMessage::Eof(_) => self.handle_eof(),
            ChannelMessage::Close(_) => self.handle_close(),
            ChannelMessage::Success(_) => self.handle_response(true),
            ChannelMessage::Failure(_) => self.handle_response(false),
        }
    }

    fn process_open_confirmation(
        &self,
        send_chan: u32,
        send_window: u32,
        send_pktsize: u32,
        extra: Vec<u8>,
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();

        let Some(waiter) = inner.core.open_waiter.take() else {
            return Err(Error::Protocol("Channel not being opened"));
        };

        inner.core.send_chan = Some(send_chan);
        inner.core.send_window = send_window;
        inner.core.send_pktsize = send_pktsize;

        inner.core.send_state = SendState::Open;
        inner.core.recv_state = RecvState::Open;

        debug!(
            channel = ?inner.core.recv_chan,
            peer = send_chan,
            window = send_window,
            "channel open confirmed"
        );

        let _ = waiter.send(Ok(extra));

        Ok(())
    }

    fn process_open_failure(&self, failure: OpenFailure) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();

            let Some(waiter) = inner.core.open_waiter.take() else {
                return Err(Error::Protocol("Channel not being opened"));
            };

            debug!(channel = ?inner.core.recv_chan, code = ?failure.code, "channel open refused");

            let _ = waiter.send(Err(failure.into()));
        }

        self.cleanup(None);

        Ok(())
    }

    fn process_connection_close(&self, error: Option<&Error>) {
        self.cleanup(error);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use rstest::rstest;

    use super::*;

    struct NullConnection;

    impl Connection for NullConnection {
        fn add_channel(&self, _channel: Rc<dyn ChannelHandler>) -> u32 {
            0
        }

        fn remove_channel(&self, _number: u32) {}

        fn send_packet(&self, _payload: Vec<u8>) {}
    }

    fn core(encoding: Encoding) -> Core {
        Core::new(Rc::new(NullConnection), encoding, 128, 32)
    }

    #[rstest]
    #[case(None, None, 65536, 16384)]
    #[case(None, Some(100), 400, 100)]
    #[case(Some(100), None, 100, 25)]
    #[case(Some(100), Some(80), 100, 80)]
    #[case(Some(0), Some(0), 0, 0)]
    fn it_defaults_write_buffer_limits(
        #[case] high: Option<usize>,
        #[case] low: Option<usize>,
        #[case] expected_high: usize,
        #[case] expected_low: usize,
    ) {
        let mut core = core(Encoding::Binary);

        core.set_write_buffer_limits(high, low).unwrap();
        assert_eq!(core.send_high_water, expected_high);
        assert_eq!(core.send_low_water, expected_low);
    }

    #[test]
    fn it_rejects_out_of_order_write_buffer_limits() {
        core(Encoding::Binary)
            .set_write_buffer_limits(Some(10), Some(20))
            .unwrap_err();
    }

    #[test]
    fn it_buffers_a_trailing_partial_codepoint() {
        let mut core = core(Encoding::Utf8);

        let (chunks, error) = core.decode_chunks(b"a\xe2\x98".to_vec(), None);
        assert!(error.is_none());
        assert!(matches!(&chunks[..], [Chunk::Text(text)] if text == "a"));
        assert_eq!(core.recv_partial.get(&None).map(Vec::as_slice), Some(&b"\xe2\x98"[..]));

        let (chunks, error) = core.decode_chunks(b"\x83x".to_vec(), None);
        assert!(error.is_none());
        assert!(matches!(&chunks[..], [Chunk::Text(text)] if text == "☃x"));
        assert!(core.recv_partial.is_empty());
    }

    #[test]
    fn it_splits_at_a_mid_buffer_fault() {
        let mut core = core(Encoding::Utf8);

        let (chunks, error) = core.decode_chunks(b"ok\xffrest".to_vec(), None);
        assert!(matches!(error, Some(Error::Protocol(_))));
        assert!(matches!(&chunks[..], [Chunk::Text(text)] if text == "ok"));
    }

    #[test]
    fn it_keeps_partial_tails_per_datatype() {
        let mut core = core(Encoding::Utf8);

        let stderr = Some(crate::EXTENDED_DATA_STDERR);
        let (_, error) = core.decode_chunks(b"\xc3".to_vec(), stderr);
        assert!(error.is_none());

        let (chunks, error) = core.decode_chunks(b"plain".to_vec(), None);
        assert!(error.is_none());
        assert!(matches!(&chunks[..], [Chunk::Text(text)] if text == "plain"));

        let (chunks, error) = core.decode_chunks(b"\xa9".to_vec(), stderr);
        assert!(error.is_none());
        assert!(matches!(&chunks[..], [Chunk::Text(text)] if text == "é"));
    }
}
