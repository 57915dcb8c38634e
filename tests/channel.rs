//! End-to-end channel scenarios against a recording mock connection.

#![allow(clippy::unwrap_used)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::rc::Rc;

use futures::executor::{LocalPool, block_on};
use futures::task::LocalSpawnExt;

use ssh_mux::arch::Ascii;
use ssh_mux::binary::Packet;
use ssh_mux::connect::{
    ChannelClose, ChannelData, ChannelEof, ChannelFailure, ChannelOpen, ChannelOpenContext,
    ChannelOpenFailureReason, ChannelRequest, ChannelSuccess, ChannelWindowAdjust,
    ExitStatusRequest, PtyRequest, WindowChangeRequest,
};
use ssh_mux::pty::Modes;
use ssh_mux::{
    Channel, ChannelHandler, Client, ClientSession, Connection, Data, EXTENDED_DATA_STDERR,
    Encoding, Error, ExitSignal, Server, ServerSession, Session, Tcp, TcpSession, TermRequest,
    TermSize,
};

const MSG_CHANNEL_OPEN: u8 = 90;
const MSG_CHANNEL_OPEN_CONFIRMATION: u8 = 91;
const MSG_CHANNEL_WINDOW_ADJUST: u8 = 93;
const MSG_CHANNEL_DATA: u8 = 94;
const MSG_CHANNEL_EOF: u8 = 96;
const MSG_CHANNEL_CLOSE: u8 = 97;
const MSG_CHANNEL_REQUEST: u8 = 98;
const MSG_CHANNEL_SUCCESS: u8 = 99;
const MSG_CHANNEL_FAILURE: u8 = 100;

/// If a test fails, add this to the test to get logs.
#[allow(dead_code)]
fn init_test_log() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

#[derive(Default)]
struct MockConnection {
    sent: RefCell<Vec<Vec<u8>>>,
    channels: RefCell<HashMap<u32, Rc<dyn ChannelHandler>>>,
    next_channel: Cell<u32>,
    pty_allowed: Cell<bool>,
    forced_command: RefCell<Option<String>>,
}

impl MockConnection {
    fn new() -> Rc<Self> {
        let conn = Self::default();
        conn.pty_allowed.set(true);

        Rc::new(conn)
    }

    fn drain(&self) -> Vec<Vec<u8>> {
        self.sent.borrow_mut().drain(..).collect()
    }

    fn drain_types(&self) -> Vec<u8> {
        self.drain()
            .iter()
            .filter_map(|packet| packet.first().copied())
            .collect()
    }
}

impl Connection for MockConnection {
    fn add_channel(&self, channel: Rc<dyn ChannelHandler>) -> u32 {
        let number = self.next_channel.get();
        self.next_channel.set(number + 1);
        self.channels.borrow_mut().insert(number, channel);

        number
    }

    fn remove_channel(&self, number: u32) {
        self.channels.borrow_mut().remove(&number);
    }

    fn send_packet(&self, payload: Vec<u8>) {
        self.sent.borrow_mut().push(payload);
    }

    fn get_key_option(&self, name: &str) -> Option<String> {
        (name == "command")
            .then(|| self.forced_command.borrow().clone())
            .flatten()
    }

    fn check_key_permission(&self, name: &str) -> bool {
        name != "pty" || self.pty_allowed.get()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Event {
    ConnectionMade,
    SessionStarted,
    Data(Vec<u8>, Option<NonZeroU32>),
    Text(String, Option<NonZeroU32>),
    Eof,
    PauseWriting,
    ResumeWriting,
    ExitStatus(u32),
    ExitSignal(String),
    Pty(String, Vec<(u8, u32)>),
    Shell,
    Exec(String),
    Subsystem(String),
    TerminalSize(u32, u32),
    Signal(String),
    Break(u32),
    ConnectionLost(bool),
}

#[derive(Default)]
struct Recorder {
    events: RefCell<Vec<Event>>,
    keep_open_on_eof: Cell<bool>,
    refuse_requests: Cell<bool>,
}

impl Recorder {
    fn push(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    fn take(&self) -> Vec<Event> {
        self.events.borrow_mut().drain(..).collect()
    }
}

impl Session for Recorder {
    fn connection_lost(&self, error: Option<&Error>) {
        self.push(Event::ConnectionLost(error.is_some()));
    }

    fn session_started(&self) {
        self.push(Event::SessionStarted);
    }

    fn data_received(&self, data: Data<'_>, datatype: Option<NonZeroU32>) {
        self.push(match data {
            Data::Bytes(bytes) => Event::Data(bytes.to_vec(), datatype),
            Data::Text(text) => Event::Text(text.into(), datatype),
        });
    }

    fn eof_received(&self) -> bool {
        self.push(Event::Eof);
        self.keep_open_on_eof.get()
    }

    fn pause_writing(&self) {
        self.push(Event::PauseWriting);
    }

    fn resume_writing(&self) {
        self.push(Event::ResumeWriting);
    }
}

impl ClientSession for Recorder {
    fn connection_made(&self, _channel: &Channel<Client>) {
        self.push(Event::ConnectionMade);
    }

    fn exit_status_received(&self, status: u32) {
        self.push(Event::ExitStatus(status));
    }

    fn exit_signal_received(&self, signal: &ExitSignal) {
        self.push(Event::ExitSignal(signal.signal.clone()));
    }
}

impl ServerSession for Recorder {
    fn connection_made(&self, _channel: &Channel<Server>) {
        self.push(Event::ConnectionMade);
    }

    fn pty_requested(&self, term: &str, _size: TermSize, modes: &Modes) -> bool {
        self.push(Event::Pty(term.into(), modes.iter().collect()));
        !self.refuse_requests.get()
    }

    fn shell_requested(&self) -> bool {
        self.push(Event::Shell);
        !self.refuse_requests.get()
    }

    fn exec_requested(&self, command: &str) -> bool {
        self.push(Event::Exec(command.into()));
        !self.refuse_requests.get()
    }

    fn subsystem_requested(&self, subsystem: &str) -> bool {
        self.push(Event::Subsystem(subsystem.into()));
        !self.refuse_requests.get()
    }

    fn terminal_size_changed(&self, size: TermSize) {
        self.push(Event::TerminalSize(size.width_chars, size.height_chars));
    }

    fn signal_received(&self, signal: &str) {
        self.push(Event::Signal(signal.into()));
    }

    fn break_received(&self, break_length: u32) -> bool {
        self.push(Event::Break(break_length));
        !self.refuse_requests.get()
    }
}

impl TcpSession for Recorder {
    fn connection_made(&self, _channel: &Channel<Tcp>) {
        self.push(Event::ConnectionMade);
    }
}

fn request_bytes(kind: Ascii<'static>, args: &[u8], want_reply: bool) -> Vec<u8> {
    let mut bytes = ChannelRequest {
        recipient_channel: 0,
        kind,
        want_reply: want_reply.into(),
    }
    .to_bytes();
    bytes.extend_from_slice(args);

    bytes
}

fn data_bytes(data: &[u8]) -> Vec<u8> {
    ChannelData {
        recipient_channel: 0,
        data: data.into(),
    }
    .to_bytes()
}

struct ClientFixture {
    conn: Rc<MockConnection>,
    channel: Channel<Client>,
    session: Rc<Recorder>,
}

/// Run the whole client `create` handshake against the mock, with an
/// established `exec` session at the end.
fn open_client_session(
    encoding: Encoding,
    window: u32,
    send_window: u32,
    send_pktsize: u32,
) -> ClientFixture {
    let conn = MockConnection::new();
    let channel = Channel::<Client>::new(
        Rc::clone(&conn) as Rc<dyn Connection>,
        encoding,
        window,
        1024,
    );
    let session = Rc::new(Recorder::default());

    let mut pool = LocalPool::new();
    let handle = {
        let channel = channel.clone();
        let session = Rc::clone(&session);
        pool.spawner()
            .spawn_local_with_handle(async move {
                channel
                    .create(
                        move || session as Rc<dyn ClientSession>,
                        Some("echo hi"),
                        None,
                        &[],
                        None,
                    )
                    .await
            })
            .unwrap()
    };

    pool.run_until_stalled();
    assert_eq!(conn.drain_types(), [MSG_CHANNEL_OPEN]);

    channel
        .process_open_confirmation(7, send_window, send_pktsize, Vec::new())
        .unwrap();
    pool.run_until_stalled();
    assert_eq!(conn.drain_types(), [MSG_CHANNEL_REQUEST]);

    channel
        .process_packet(&ChannelSuccess {
            recipient_channel: 0,
        }
        .to_bytes())
        .unwrap();
    pool.run_until(handle).expect("session establishment failed");

    assert_eq!(
        session.take(),
        [Event::ConnectionMade, Event::SessionStarted]
    );

    ClientFixture {
        conn,
        channel,
        session,
    }
}

fn open_server_session(encoding: Encoding, window: u32) -> (Rc<MockConnection>, Channel<Server>, Rc<Recorder>) {
    let conn = MockConnection::new();
    let channel = Channel::<Server>::new(
        Rc::clone(&conn) as Rc<dyn Connection>,
        encoding,
        window,
        1024,
    );
    let session = Rc::new(Recorder::default());

    let open = channel
        .process_open(5, 4096, 512, {
            let session = Rc::clone(&session);
            async move { Ok(session as Rc<dyn ServerSession>) }
        })
        .unwrap();
    block_on(open);

    assert_eq!(conn.drain_types(), [MSG_CHANNEL_OPEN_CONFIRMATION]);
    assert_eq!(session.take(), [Event::ConnectionMade]);

    (conn, channel, session)
}

#[test]
fn exec_session_runs_to_exit() {
    let ClientFixture {
        conn,
        channel,
        session,
    } = open_client_session(Encoding::Binary, 1024, 4096, 512);

    channel.process_packet(&data_bytes(b"hi\n")).unwrap();
    channel
        .process_packet(&request_bytes(
            Ascii::from_static("exit-status"),
            &ExitStatusRequest { code: 0 }.to_bytes(),
            false,
        ))
        .unwrap();
    channel
        .process_packet(&ChannelClose {
            recipient_channel: 0,
        }
        .to_bytes())
        .unwrap();

    assert_eq!(
        session.take(),
        [
            Event::Data(b"hi\n".to_vec(), None),
            Event::ExitStatus(0),
            Event::ConnectionLost(false),
        ]
    );
    assert_eq!(channel.exit_status(), Some(0));

    // The close is answered in kind, and the channel deregisters.
    assert_eq!(conn.drain_types(), [MSG_CHANNEL_CLOSE]);
    assert!(conn.channels.borrow().is_empty());
}

#[test]
fn receive_window_tops_up_past_the_halfway_mark() {
    let ClientFixture { conn, channel, .. } =
        open_client_session(Encoding::Binary, 100, 4096, 512);

    channel.process_packet(&data_bytes(&[0; 30])).unwrap();
    assert!(conn.drain_types().is_empty());

    channel.process_packet(&data_bytes(&[0; 30])).unwrap();
    let sent = conn.drain();
    assert_eq!(sent.len(), 1);
    let adjust = ChannelWindowAdjust::from_bytes(&sent[0]).unwrap();
    assert_eq!(adjust.bytes_to_add, 60);

    channel.process_packet(&data_bytes(&[0; 30])).unwrap();
    assert!(conn.drain_types().is_empty());

    channel.process_packet(&data_bytes(&[0; 30])).unwrap();
    let sent = conn.drain();
    assert_eq!(sent.len(), 1);
    let adjust = ChannelWindowAdjust::from_bytes(&sent[0]).unwrap();
    assert_eq!(adjust.bytes_to_add, 60);
}

#[test]
fn oversized_data_is_a_protocol_error() {
    let ClientFixture { channel, .. } = open_client_session(Encoding::Binary, 100, 4096, 512);

    let error = channel.process_packet(&data_bytes(&[0; 120])).unwrap_err();
    assert!(matches!(error, Error::Protocol("Window exceeded")));
}

#[test]
fn paused_reading_buffers_data_and_eof() {
    let ClientFixture {
        conn,
        channel,
        session,
    } = open_client_session(Encoding::Binary, 1024, 4096, 512);

    channel.pause_reading();
    channel.process_packet(&data_bytes(b"abc")).unwrap();
    channel
        .process_packet(&ChannelEof {
            recipient_channel: 0,
        }
        .to_bytes())
        .unwrap();

    // Nothing reaches the session while paused, data past EOF is refused.
    assert!(session.take().is_empty());
    let error = channel.process_packet(&data_bytes(b"d")).unwrap_err();
    assert!(matches!(error, Error::Protocol(_)));

    conn.drain();
    channel.resume_reading().unwrap();

    assert_eq!(
        session.take(),
        [Event::Data(b"abc".to_vec(), None), Event::Eof]
    );

    // The session refused to stay half-open, so the channel closed.
    assert_eq!(conn.drain_types(), [MSG_CHANNEL_CLOSE]);
}

#[test]
fn partial_codepoints_are_buffered_across_packets() {
    let ClientFixture {
        channel, session, ..
    } = open_client_session(Encoding::Utf8, 1024, 4096, 512);

    channel.process_packet(&data_bytes(b"\xe2\x98")).unwrap();
    assert!(session.take().is_empty());

    channel.process_packet(&data_bytes(b"\x83x")).unwrap();
    assert_eq!(session.take(), [Event::Text("☃x".into(), None)]);
}

#[test]
fn truncated_codepoint_at_eof_is_a_protocol_error() {
    let ClientFixture { channel, .. } = open_client_session(Encoding::Utf8, 1024, 4096, 512);

    channel.process_packet(&data_bytes(b"\xe2\x98")).unwrap();
    let error = channel
        .process_packet(&ChannelEof {
            recipient_channel: 0,
        }
        .to_bytes())
        .unwrap_err();
    assert!(matches!(error, Error::Protocol("Unicode decode error")));
}

#[test]
fn refused_pty_request_fails_the_session() {
    let conn = MockConnection::new();
    let channel = Channel::<Client>::new(
        Rc::clone(&conn) as Rc<dyn Connection>,
        Encoding::Binary,
        1024,
        1024,
    );

    let mut pool = LocalPool::new();
    let handle = {
        let channel = channel.clone();
        pool.spawner()
            .spawn_local_with_handle(async move {
                let mut modes = Modes::new();
                modes.set(53, 1).unwrap();

                channel
                    .create(
                        || Rc::new(Recorder::default()) as Rc<dyn ClientSession>,
                        None,
                        None,
                        &[],
                        Some(TermRequest {
                            term_type: "xterm".into(),
                            size: TermSize::new(80, 24),
                            modes,
                        }),
                    )
                    .await
            })
            .unwrap()
    };

    pool.run_until_stalled();
    conn.drain();
    channel
        .process_open_confirmation(7, 4096, 512, Vec::new())
        .unwrap();
    pool.run_until_stalled();

    // The pty-req goes out with a reply requested.
    let sent = conn.drain();
    let (request, size) = ChannelRequest::from_bytes_prefix(&sent[0]).unwrap();
    assert_eq!(request.kind.as_ref(), "pty-req");
    assert!(bool::from(request.want_reply));
    let args = PtyRequest::from_bytes(&sent[0][size..]).unwrap();
    assert_eq!(args.term.as_ref(), "xterm");
    assert_eq!(args.width_chars, 80);

    channel
        .process_packet(&ChannelFailure {
            recipient_channel: 0,
        }
        .to_bytes())
        .unwrap();

    let error = pool.run_until(handle).err().unwrap();
    let Error::Open(failure) = error else {
        panic!("expected an open failure, got {error:?}");
    };
    assert_eq!(failure.code, ChannelOpenFailureReason::REQUEST_PTY_FAILED);

    assert_eq!(conn.drain_types(), [MSG_CHANNEL_CLOSE]);
}

#[test]
fn abort_discards_buffered_data() {
    let ClientFixture { conn, channel, .. } = open_client_session(Encoding::Binary, 1024, 16, 16);

    channel.write(&[0; 65536], None).unwrap();
    // Only one packet fit in the peer's window; the rest is buffered.
    assert_eq!(conn.drain_types(), [MSG_CHANNEL_DATA]);
    assert_eq!(channel.write_buffer_size(), 65536 - 16);

    channel.abort();
    channel.abort();
    assert_eq!(conn.drain_types(), [MSG_CHANNEL_CLOSE]);
    assert_eq!(channel.write_buffer_size(), 0);

    // Window opening up afterwards must not leak any data out.
    channel
        .process_packet(&ChannelWindowAdjust {
            recipient_channel: 0,
            bytes_to_add: 1 << 20,
        }
        .to_bytes())
        .unwrap();
    assert!(conn.drain_types().is_empty());
}

#[test]
fn writes_fragment_to_window_and_packet_size() {
    let ClientFixture { conn, channel, .. } = open_client_session(Encoding::Binary, 1024, 100, 30);

    channel.write(&[7; 150], None).unwrap();

    let sizes: Vec<usize> = conn
        .drain()
        .iter()
        .map(|packet| {
            ChannelData::from_bytes(packet)
                .unwrap()
                .data
                .into_vec()
                .len()
        })
        .collect();
    assert_eq!(sizes, [30, 30, 30, 10]);
    assert_eq!(channel.write_buffer_size(), 50);

    channel
        .process_packet(&ChannelWindowAdjust {
            recipient_channel: 0,
            bytes_to_add: 50,
        }
        .to_bytes())
        .unwrap();

    let sizes: Vec<usize> = conn
        .drain()
        .iter()
        .map(|packet| {
            ChannelData::from_bytes(packet)
                .unwrap()
                .data
                .into_vec()
                .len()
        })
        .collect();
    assert_eq!(sizes, [30, 20]);
    assert_eq!(channel.write_buffer_size(), 0);
}

#[test]
fn write_buffer_hysteresis_pauses_and_resumes() {
    let ClientFixture {
        conn,
        channel,
        session,
    } = open_client_session(Encoding::Binary, 1024, 0, 512);

    channel.set_write_buffer_limits(Some(100), Some(20)).unwrap();

    // No window at all: everything buffers, crossing the high-water mark.
    channel.write(&[0; 150], None).unwrap();
    assert_eq!(session.take(), [Event::PauseWriting]);

    channel.write(&[0; 10], None).unwrap();
    assert!(session.take().is_empty());

    channel
        .process_packet(&ChannelWindowAdjust {
            recipient_channel: 0,
            bytes_to_add: 150,
        }
        .to_bytes())
        .unwrap();

    assert_eq!(channel.write_buffer_size(), 10);
    assert_eq!(session.take(), [Event::ResumeWriting]);
    assert!(!conn.drain().is_empty());
}

#[test]
fn responses_complete_requests_in_fifo_order() {
    let ClientFixture { conn, channel, .. } = open_client_session(Encoding::Binary, 1024, 4096, 512);

    let mut pool = LocalPool::new();
    let first = {
        let channel = channel.clone();
        pool.spawner()
            .spawn_local_with_handle(
                async move { channel.make_request("keepalive@openssh.com", &[]).await },
            )
            .unwrap()
    };
    let second = {
        let channel = channel.clone();
        pool.spawner()
            .spawn_local_with_handle(
                async move { channel.make_request("keepalive@openssh.com", &[]).await },
            )
            .unwrap()
    };

    pool.run_until_stalled();
    assert_eq!(
        conn.drain_types(),
        [MSG_CHANNEL_REQUEST, MSG_CHANNEL_REQUEST]
    );

    channel
        .process_packet(&ChannelFailure {
            recipient_channel: 0,
        }
        .to_bytes())
        .unwrap();
    channel
        .process_packet(&ChannelSuccess {
            recipient_channel: 0,
        }
        .to_bytes())
        .unwrap();

    assert!(!pool.run_until(first).unwrap());
    assert!(pool.run_until(second).unwrap());
}

#[test]
fn close_is_idempotent() {
    let ClientFixture { conn, channel, .. } = open_client_session(Encoding::Binary, 1024, 4096, 512);

    channel.close();
    channel.close();

    assert_eq!(conn.drain_types(), [MSG_CHANNEL_CLOSE]);
}

#[test]
fn unmatched_response_is_a_protocol_error() {
    let ClientFixture { channel, .. } = open_client_session(Encoding::Binary, 1024, 4096, 512);

    let error = channel
        .process_packet(&ChannelSuccess {
            recipient_channel: 0,
        }
        .to_bytes())
        .unwrap_err();
    assert!(matches!(error, Error::Protocol("Unexpected channel response")));
}

#[test]
fn unknown_request_yields_a_failure() {
    let ClientFixture { conn, channel, .. } = open_client_session(Encoding::Binary, 1024, 4096, 512);

    channel
        .process_packet(&request_bytes(
            Ascii::from_static("no-such-request@example.com"),
            &[],
            true,
        ))
        .unwrap();

    assert_eq!(conn.drain_types(), [MSG_CHANNEL_FAILURE]);
}

#[test]
fn wait_closed_completes_on_teardown() {
    let ClientFixture { channel, .. } = open_client_session(Encoding::Binary, 1024, 4096, 512);

    let mut pool = LocalPool::new();
    let waiter = {
        let channel = channel.clone();
        pool.spawner()
            .spawn_local_with_handle(async move { channel.wait_closed().await })
            .unwrap()
    };
    pool.run_until_stalled();

    channel.process_connection_close(None);
    pool.run_until(waiter);

    // Closed channels no longer suspend.
    block_on(channel.wait_closed());
}

#[test]
fn connection_loss_fails_pending_requests() {
    let ClientFixture {
        channel, session, ..
    } = open_client_session(Encoding::Binary, 1024, 4096, 512);

    let mut pool = LocalPool::new();
    let request = {
        let channel = channel.clone();
        pool.spawner()
            .spawn_local_with_handle(
                async move { channel.make_request("keepalive@openssh.com", &[]).await },
            )
            .unwrap()
    };
    pool.run_until_stalled();

    channel.process_connection_close(None);

    let error = pool.run_until(request).unwrap_err();
    assert!(matches!(error, Error::ConnectionLost));
    assert_eq!(session.take(), [Event::ConnectionLost(false)]);
}

#[test]
fn server_session_serves_exec_and_reports_exit() {
    let (conn, channel, session) = open_server_session(Encoding::Binary, 1024);

    channel
        .process_packet(&request_bytes(
            Ascii::from_static("exec"),
            &ssh_mux::connect::ExecRequest {
                command: b"echo hi".as_slice().into(),
            }
            .to_bytes(),
            true,
        ))
        .unwrap();

    assert_eq!(conn.drain_types(), [MSG_CHANNEL_SUCCESS]);
    assert_eq!(
        session.take(),
        [Event::Exec("echo hi".into()), Event::SessionStarted]
    );
    assert_eq!(channel.command(), Some("echo hi".into()));

    channel.write(b"hi\n", None).unwrap();
    channel.exit(0).unwrap();

    assert_eq!(
        conn.drain_types(),
        [MSG_CHANNEL_DATA, MSG_CHANNEL_REQUEST, MSG_CHANNEL_CLOSE]
    );

    // Reporting an exit twice is a local misuse.
    assert!(matches!(channel.exit(1), Err(Error::NotOpen)));
}

#[test]
fn server_delivers_stderr_as_extended_data() {
    let (conn, channel, session) = open_server_session(Encoding::Binary, 1024);

    channel
        .process_packet(&request_bytes(Ascii::from_static("shell"), &[], true))
        .unwrap();
    conn.drain();
    session.take();

    channel.write_stderr(b"oops\n").unwrap();

    let sent = conn.drain();
    let message = ssh_mux::connect::ChannelExtendedData::from_bytes(&sent[0]).unwrap();
    assert_eq!(message.data_type, EXTENDED_DATA_STDERR);
    assert_eq!(message.data.as_ref(), b"oops\n");

    // Extended data is not legal towards a server channel.
    let error = channel
        .process_packet(
            &ssh_mux::connect::ChannelExtendedData {
                recipient_channel: 0,
                data_type: EXTENDED_DATA_STDERR,
                data: b"nope".as_slice().into(),
            }
            .to_bytes(),
        )
        .unwrap_err();
    assert!(matches!(error, Error::Protocol("Invalid extended data type")));
}

#[test]
fn server_pty_request_reaches_the_session() {
    let (conn, channel, session) = open_server_session(Encoding::Binary, 1024);

    let mut modes = Modes::new();
    modes.set(53, 1).unwrap();
    modes.set(93, 19200).unwrap();

    channel
        .process_packet(&request_bytes(
            Ascii::from_static("pty-req"),
            &PtyRequest {
                term: Ascii::from_static("xterm"),
                width_chars: 80,
                height_chars: 24,
                width_pixels: 0,
                height_pixels: 0,
                modes: modes.encode().into(),
            }
            .to_bytes(),
            true,
        ))
        .unwrap();

    assert_eq!(conn.drain_types(), [MSG_CHANNEL_SUCCESS]);
    assert_eq!(
        session.take(),
        [Event::Pty("xterm".into(), vec![(53, 1), (93, 19200)])]
    );
    assert_eq!(channel.terminal_type(), Some("xterm".into()));
    assert_eq!(channel.terminal_size(), TermSize::new(80, 24));
    assert_eq!(channel.terminal_mode(93), Some(19200));
}

#[test]
fn server_pty_denied_by_key_options() {
    let (conn, channel, session) = open_server_session(Encoding::Binary, 1024);
    conn.pty_allowed.set(false);

    channel
        .process_packet(&request_bytes(
            Ascii::from_static("pty-req"),
            &PtyRequest {
                term: Ascii::from_static("xterm"),
                width_chars: 80,
                height_chars: 24,
                width_pixels: 0,
                height_pixels: 0,
                modes: Modes::new().encode().into(),
            }
            .to_bytes(),
            true,
        ))
        .unwrap();

    // Refused before the session is ever consulted.
    assert_eq!(conn.drain_types(), [MSG_CHANNEL_FAILURE]);
    assert!(session.take().is_empty());
}

#[test]
fn server_forced_command_overrides_exec() {
    let (conn, channel, session) = open_server_session(Encoding::Binary, 1024);
    *conn.forced_command.borrow_mut() = Some("forced".into());

    channel
        .process_packet(&request_bytes(
            Ascii::from_static("exec"),
            &ssh_mux::connect::ExecRequest {
                command: b"user-command".as_slice().into(),
            }
            .to_bytes(),
            true,
        ))
        .unwrap();

    assert_eq!(conn.drain_types(), [MSG_CHANNEL_SUCCESS]);
    assert_eq!(
        session.take(),
        [Event::Exec("forced".into()), Event::SessionStarted]
    );
    assert_eq!(channel.command(), Some("forced".into()));
}

#[test]
fn server_stores_environment_and_forwards_control_requests() {
    let (conn, channel, session) = open_server_session(Encoding::Binary, 1024);

    channel
        .process_packet(&request_bytes(
            Ascii::from_static("env"),
            &ssh_mux::connect::EnvRequest {
                name: b"LANG".as_slice().into(),
                value: b"C.UTF-8".as_slice().into(),
            }
            .to_bytes(),
            false,
        ))
        .unwrap();
    assert_eq!(
        channel.environment(),
        [("LANG".to_string(), "C.UTF-8".to_string())]
    );

    channel
        .process_packet(&request_bytes(Ascii::from_static("shell"), &[], true))
        .unwrap();
    conn.drain();
    session.take();

    channel
        .process_packet(&request_bytes(
            Ascii::from_static("window-change"),
            &WindowChangeRequest {
                width_chars: 132,
                height_chars: 43,
                width_pixels: 0,
                height_pixels: 0,
            }
            .to_bytes(),
            false,
        ))
        .unwrap();
    channel
        .process_packet(&request_bytes(
            Ascii::from_static("signal"),
            &ssh_mux::connect::SignalRequest {
                name: b"INT".as_slice().into(),
            }
            .to_bytes(),
            false,
        ))
        .unwrap();
    channel
        .process_packet(&request_bytes(
            Ascii::from_static("break"),
            &ssh_mux::connect::BreakRequest { break_length: 500 }.to_bytes(),
            true,
        ))
        .unwrap();

    assert_eq!(
        session.take(),
        [
            Event::TerminalSize(132, 43),
            Event::Signal("INT".into()),
            Event::Break(500),
        ]
    );
    assert_eq!(conn.drain_types(), [MSG_CHANNEL_SUCCESS]);
    assert_eq!(channel.terminal_size(), TermSize::new(132, 43));
}

#[test]
fn server_refusal_leaves_reading_paused() {
    let (conn, channel, session) = open_server_session(Encoding::Binary, 1024);
    session.refuse_requests.set(true);

    channel
        .process_packet(&request_bytes(Ascii::from_static("shell"), &[], true))
        .unwrap();

    assert_eq!(conn.drain_types(), [MSG_CHANNEL_FAILURE]);
    assert_eq!(session.take(), [Event::Shell]);

    // Reading stays paused until a session type is settled.
    channel.process_packet(&data_bytes(b"early")).unwrap();
    assert!(session.take().is_empty());
}

#[test]
fn sftp_session_swap_silences_the_original_session() {
    let (conn, channel, session) = open_server_session(Encoding::Utf8, 1024);

    channel
        .process_packet(&request_bytes(
            Ascii::from_static("subsystem"),
            &ssh_mux::connect::SubsystemRequest {
                name: b"sftp".as_slice().into(),
            }
            .to_bytes(),
            true,
        ))
        .unwrap();
    assert_eq!(
        session.take(),
        [Event::Subsystem("sftp".into()), Event::SessionStarted]
    );
    conn.drain();

    let sftp = Rc::new(Recorder::default());
    channel
        .start_sftp_server({
            let sftp = Rc::clone(&sftp);
            move |_conn| sftp as Rc<dyn ServerSession>
        })
        .unwrap();

    assert_eq!(
        sftp.take(),
        [Event::ConnectionMade, Event::SessionStarted]
    );
    assert_eq!(channel.encoding(), Encoding::Binary);

    channel.process_connection_close(None);

    // Only the replacement session hears about the teardown.
    assert_eq!(sftp.take(), [Event::ConnectionLost(false)]);
    assert!(session.take().is_empty());
}

#[test]
fn tcp_connect_establishes_a_tunnel() {
    let conn = MockConnection::new();
    let channel = Channel::<Tcp>::new(Rc::clone(&conn) as Rc<dyn Connection>, 1024, 1024);
    let session = Rc::new(Recorder::default());

    let mut pool = LocalPool::new();
    let handle = {
        let channel = channel.clone();
        let session = Rc::clone(&session);
        pool.spawner()
            .spawn_local_with_handle(async move {
                channel
                    .connect(
                        move || session as Rc<dyn TcpSession>,
                        "localhost",
                        8080,
                        "10.0.0.1",
                        49152,
                    )
                    .await
            })
            .unwrap()
    };

    pool.run_until_stalled();
    let sent = conn.drain();
    let open = ChannelOpen::from_bytes(&sent[0]).unwrap();
    let ChannelOpenContext::DirectTcpip {
        address,
        port,
        originator_address,
        originator_port,
    } = open.context
    else {
        panic!("expected a direct-tcpip open, got {:?}", open.context);
    };
    assert_eq!((address.as_ref(), port), ("localhost", 8080));
    assert_eq!((originator_address.as_ref(), originator_port), ("10.0.0.1", 49152));

    channel
        .process_open_confirmation(9, 4096, 512, Vec::new())
        .unwrap();
    pool.run_until(handle).expect("tunnel establishment failed");

    assert_eq!(
        session.take(),
        [Event::ConnectionMade, Event::SessionStarted]
    );
    assert_eq!(
        channel.local_peername(),
        Some(("10.0.0.1".to_string(), 49152))
    );
    assert_eq!(
        channel.remote_peername(),
        Some(("localhost".to_string(), 8080))
    );

    // The tunnel is immediately readable and writable.
    channel.process_packet(&data_bytes(b"ping")).unwrap();
    assert_eq!(session.take(), [Event::Data(b"ping".to_vec(), None)]);
    channel.write(b"pong", None).unwrap();
    assert_eq!(conn.drain_types(), [MSG_CHANNEL_DATA]);
}

#[test]
fn tcp_inbound_open_starts_the_session() {
    let conn = MockConnection::new();
    let channel = Channel::<Tcp>::new(Rc::clone(&conn) as Rc<dyn Connection>, 1024, 1024);
    let session = Rc::new(Recorder::default());

    channel.set_inbound_peer_names("localhost", 8080, "192.0.2.7", 50000);
    let open = channel
        .process_open(3, 4096, 512, {
            let session = Rc::clone(&session);
            async move { Ok(session as Rc<dyn TcpSession>) }
        })
        .unwrap();
    block_on(open);

    assert_eq!(conn.drain_types(), [MSG_CHANNEL_OPEN_CONFIRMATION]);
    assert_eq!(
        session.take(),
        [Event::ConnectionMade, Event::SessionStarted]
    );
    assert_eq!(
        channel.local_peername(),
        Some(("localhost".to_string(), 8080))
    );

    channel.process_packet(&data_bytes(b"hello")).unwrap();
    assert_eq!(session.take(), [Event::Data(b"hello".to_vec(), None)]);
}

#[test]
fn duplicate_open_is_a_protocol_error() {
    let (_conn, channel, _session) = open_server_session(Encoding::Binary, 1024);

    let error = channel
        .process_open(6, 4096, 512, async {
            Err::<Rc<dyn ServerSession>, _>(ssh_mux::OpenFailure::new(
                ChannelOpenFailureReason::AdministrativelyProhibited,
                "unused",
            ))
        })
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(error, Error::Protocol("Channel already open")));
}
