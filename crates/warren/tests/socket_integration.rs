// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket integration: framed echo over real TCP, frame ceiling, delimited
//! reads, one-shot accept, connect errors, WebSocket end to end.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{Duration, Instant};

use warren::buffer::FLAG_FRAMING;
use warren::message::{PTYPE_ERROR, PTYPE_SOCKET, PTYPE_SOCKET_WS, PTYPE_TEXT};
use warren::net::{SOCKET_ACCEPT, SOCKET_CLOSE, SOCKET_DATA, SOCKET_ERROR};
use warren::{
    Buffer, Message, NetConfig, ReadDelim, Result, Server, Service, ServiceContext, SocketKind,
};

const WAIT: Duration = Duration::from_secs(5);

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn client(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(3)))
        .unwrap();
    stream
}

fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();
    let len = u16::from_be_bytes(header) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    payload
}

fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
    let mut wire = (payload.len() as u16).to_be_bytes().to_vec();
    wire.extend_from_slice(payload);
    stream.write_all(&wire).unwrap();
}

/// Event record forwarded to the test thread:
/// (ptype, subtype, session, payload).
type Event = (u8, u8, i32, Vec<u8>);

/// Listens on a port and echoes framed payloads back to the peer.
struct Gate {
    tx: Sender<Event>,
    port: u16,
    kind: SocketKind,
    echo: bool,
}

impl Service for Gate {
    fn init(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, ctx: &mut ServiceContext<'_>) {
        let listen_fd = ctx.listen("127.0.0.1", self.port, self.kind);
        assert_ne!(listen_fd, 0, "listen failed");
        ctx.accept(listen_fd, 0, 0);
    }

    fn dispatch(&mut self, ctx: &mut ServiceContext<'_>, msg: Message) {
        let _ = self.tx.send((
            msg.ptype(),
            msg.subtype(),
            msg.session(),
            msg.data().to_vec(),
        ));
        if self.echo && msg.subtype() == SOCKET_DATA {
            match self.kind {
                SocketKind::Frame => {
                    ctx.write_with_flag(msg.sender(), Buffer::from_slice(msg.data()), FLAG_FRAMING);
                }
                _ => {
                    ctx.write(msg.sender(), Buffer::from_slice(msg.data()));
                }
            }
        }
    }
}

fn spawn_gate(
    server: &Server,
    port: u16,
    kind: SocketKind,
    echo: bool,
) -> Receiver<Event> {
    let (tx, rx) = channel();
    server.register("gate", move |_cfg| {
        Box::new(Gate {
            tx: tx.clone(),
            port,
            kind,
            echo,
        })
    });
    server.new_service(1, "gate", r#"{"name":"gate"}"#, 0, 0);
    let router = server.router().clone();
    wait_until(|| router.service_count() == 1);
    rx
}

#[test]
fn test_frame_echo_roundtrip() {
    let server = Server::init(1, None).unwrap();
    let port = free_port();
    let rx = spawn_gate(&server, port, SocketKind::Frame, true);

    let mut stream = client(port);

    // accept notice arrives at the owning service
    let (ptype, subtype, _, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_SOCKET);
    assert_eq!(subtype, SOCKET_ACCEPT);

    write_frame(&mut stream, b"ping");
    let (ptype, subtype, session, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_SOCKET);
    assert_eq!(subtype, SOCKET_DATA);
    assert_eq!(session, 0);
    assert_eq!(data, b"ping");

    assert_eq!(read_frame(&mut stream), b"ping");

    // several frames in one write still arrive one by one
    let mut burst = Vec::new();
    for payload in [&b"a"[..], b"bb", b"ccc"] {
        burst.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        burst.extend_from_slice(payload);
    }
    stream.write_all(&burst).unwrap();
    for expected in [&b"a"[..], b"bb", b"ccc"] {
        assert_eq!(read_frame(&mut stream), expected);
    }
}

#[test]
fn test_frame_over_ceiling_closes_with_error() {
    let cfg = NetConfig::default().with_max_frame_size(1024);
    let server = Server::init_with_config(1, None, cfg).unwrap();
    let port = free_port();
    let rx = spawn_gate(&server, port, SocketKind::Frame, false);

    let mut stream = client(port);
    let (_, subtype, _, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(subtype, SOCKET_ACCEPT);

    // declared length 0xFFFF against a 1024-byte ceiling
    stream.write_all(&[0xFF, 0xFF, 0x01, 0x02]).unwrap();

    let (ptype, subtype, _, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_SOCKET);
    assert_eq!(subtype, SOCKET_ERROR);
    let err: serde_json::Value = serde_json::from_slice(&data).unwrap();
    assert_eq!(err["logic_errcode"], 1);
    assert!(err["errmsg"].as_str().unwrap().contains("frame too large"));
    assert!(err["addr"].as_str().unwrap().contains("127.0.0.1"));

    // exactly one close follows the error
    let (_, subtype, _, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(subtype, SOCKET_CLOSE);

    // the peer observes the shutdown
    let mut tail = Vec::new();
    let _ = stream.read_to_end(&mut tail);
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

/// Accepts one connection with a session, then reads lines from it.
struct LineReader {
    tx: Sender<Event>,
    port: u16,
    conn_fd: u32,
}

impl Service for LineReader {
    fn init(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, ctx: &mut ServiceContext<'_>) {
        let listen_fd = ctx.listen("127.0.0.1", self.port, SocketKind::Text);
        assert_ne!(listen_fd, 0);
        ctx.accept(listen_fd, 6, 0);
    }

    fn dispatch(&mut self, ctx: &mut ServiceContext<'_>, msg: Message) {
        let _ = self.tx.send((
            msg.ptype(),
            msg.subtype(),
            msg.session(),
            msg.data().to_vec(),
        ));
        if msg.session() == -6 && msg.ptype() == PTYPE_TEXT {
            // the one-shot accept answered with the new fd
            self.conn_fd = msg.text_data().parse().unwrap();
            ctx.read(self.conn_fd, 0, ReadDelim::Crlf, 8);
        } else if msg.session() == 8 {
            // line received; echo it and read a fixed-size chunk next
            let mut reply = msg.data().to_vec();
            reply.extend_from_slice(b"\r\n");
            ctx.write(self.conn_fd, Buffer::from_slice(&reply));
            ctx.read(self.conn_fd, 4, ReadDelim::Exact, 9);
        } else if msg.session() == 9 {
            ctx.write(self.conn_fd, Buffer::from_slice(msg.data()));
        }
    }
}

#[test]
fn test_text_line_and_exact_reads() {
    let server = Server::init(1, None).unwrap();
    let port = free_port();
    let (tx, rx) = channel();
    server.register("line-reader", move |_cfg| {
        Box::new(LineReader {
            tx: tx.clone(),
            port,
            conn_fd: 0,
        })
    });
    server.new_service(1, "line-reader", r#"{"name":"lines"}"#, 0, 0);
    let router = server.router().clone();
    wait_until(|| router.service_count() == 1);

    let mut stream = client(port);

    // fd response for the one-shot accept (session negated)
    let (ptype, _, session, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_TEXT);
    assert_eq!(session, -6);
    let fd: u32 = String::from_utf8(data).unwrap().parse().unwrap();
    assert_eq!(warren::worker_of(fd), 1);

    stream.write_all(b"hello line\r\nrest").unwrap();

    // the delimited read completes with the delimiter stripped
    let (_, subtype, session, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(subtype, SOCKET_DATA);
    assert_eq!(session, 8);
    assert_eq!(data, b"hello line");

    // echoed back with the delimiter restored
    let mut line = [0u8; 12];
    stream.read_exact(&mut line).unwrap();
    assert_eq!(&line, b"hello line\r\n");

    // exact-size read takes the 4 buffered bytes
    let (_, _, session, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(session, 9);
    assert_eq!(data, b"rest");

    let mut rest = [0u8; 4];
    stream.read_exact(&mut rest).unwrap();
    assert_eq!(&rest, b"rest");
}

/// Connects out with a session and reports what comes back.
struct Dialer {
    tx: Sender<Event>,
    target_port: u16,
}

impl Service for Dialer {
    fn init(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, ctx: &mut ServiceContext<'_>) {
        // unroutable address: either refused fast or cancelled by the
        // watchdog, both surface as an error on the session
        ctx.connect("10.255.255.1", self.target_port, SocketKind::Frame, 9, 100);
    }

    fn dispatch(&mut self, _ctx: &mut ServiceContext<'_>, msg: Message) {
        let _ = self.tx.send((
            msg.ptype(),
            msg.subtype(),
            msg.session(),
            msg.data().to_vec(),
        ));
    }
}

#[test]
fn test_connect_failure_reports_on_session() {
    let server = Server::init(1, None).unwrap();
    let (tx, rx) = channel();
    server.register("dialer", move |_cfg| {
        Box::new(Dialer {
            tx: tx.clone(),
            target_port: 81,
        })
    });
    server.new_service(1, "dialer", r#"{"name":"dialer"}"#, 0, 0);

    let (ptype, _, session, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_ERROR);
    assert_eq!(session, -9);
    let text = String::from_utf8(data).unwrap();
    assert!(
        text.contains("connect 10.255.255.1:81"),
        "payload: {}",
        text
    );
}

#[test]
fn test_connect_session_response_carries_fd() {
    let server = Server::init(1, None).unwrap();
    let port = free_port();
    let rx = spawn_gate(&server, port, SocketKind::Frame, true);

    // second service dials the gate's listener
    let (dtx, drx) = channel();
    server.register("dialer2", move |_cfg| {
        Box::new(Dialer2 {
            tx: dtx.clone(),
            port,
        })
    });
    server.new_service(1, "dialer2", r#"{"name":"dialer2"}"#, 0, 0);

    // gate sees the accepted connection
    let (_, subtype, _, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(subtype, SOCKET_ACCEPT);

    // the dialer learns its fd through the session response
    let (ptype, _, session, data) = drx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_TEXT);
    assert_eq!(session, -11);
    let got_fd: u32 = String::from_utf8(data).unwrap().parse().unwrap();
    assert_ne!(got_fd, 0);
    assert_eq!(warren::worker_of(got_fd), 1);
}

struct Dialer2 {
    tx: Sender<Event>,
    port: u16,
}

impl Service for Dialer2 {
    fn init(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<()> {
        Ok(())
    }

    fn start(&mut self, ctx: &mut ServiceContext<'_>) {
        ctx.connect("127.0.0.1", self.port, SocketKind::Frame, 11, 2000);
    }

    fn dispatch(&mut self, _ctx: &mut ServiceContext<'_>, msg: Message) {
        let _ = self.tx.send((
            msg.ptype(),
            msg.subtype(),
            msg.session(),
            msg.data().to_vec(),
        ));
    }
}

// ============================================================================
// WebSocket
// ============================================================================

fn ws_handshake(stream: &mut TcpStream) {
    stream
        .write_all(
            b"GET /chat HTTP/1.1\r\n\
              Host: 127.0.0.1\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        response.push(byte[0]);
    }
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 101"), "response: {}", text);
    assert!(text.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
}

fn ws_send_masked(stream: &mut TcpStream, opcode: u8, payload: &[u8]) {
    assert!(payload.len() < 126);
    let key = [0x12u8, 0x34, 0x56, 0x78];
    let mut wire = vec![0x80 | opcode, 0x80 | payload.len() as u8];
    wire.extend_from_slice(&key);
    wire.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    stream.write_all(&wire).unwrap();
}

fn ws_read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).unwrap();
    assert_eq!(header[1] & 0x80, 0, "server frames are unmasked");
    let len = match header[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as usize
        }
        n => n as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (header[0] & 0x0F, payload)
}

#[test]
fn test_websocket_end_to_end() {
    let server = Server::init(1, None).unwrap();
    let port = free_port();
    let rx = spawn_gate(&server, port, SocketKind::Ws, true);

    let mut stream = client(port);
    ws_handshake(&mut stream);

    // the accept notice follows the completed handshake
    let (ptype, subtype, _, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_SOCKET_WS);
    assert_eq!(subtype, SOCKET_ACCEPT);

    // text frame surfaces as data and echoes back as a binary frame
    ws_send_masked(&mut stream, 0x1, b"hello ws");
    let (ptype, subtype, _, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(ptype, PTYPE_SOCKET_WS);
    assert_eq!(subtype, SOCKET_DATA);
    assert_eq!(data, b"hello ws");

    let (opcode, payload) = ws_read_frame(&mut stream);
    assert_eq!(opcode, 0x2);
    assert_eq!(payload, b"hello ws");

    // ping answered automatically, without involving the service
    ws_send_masked(&mut stream, 0x9, b"king");
    let (opcode, payload) = ws_read_frame(&mut stream);
    assert_eq!(opcode, 0xA);
    assert_eq!(payload, b"king");

    // close is echoed, then the connection shuts down
    ws_send_masked(&mut stream, 0x8, b"");
    let (opcode, _) = ws_read_frame(&mut stream);
    assert_eq!(opcode, 0x8);
    let mut tail = Vec::new();
    let _ = stream.read_to_end(&mut tail);

    // the owning service hears about the close
    let (_, subtype, _, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(subtype, SOCKET_CLOSE);
}

#[test]
fn test_peer_disconnect_emits_single_close() {
    let server = Server::init(1, None).unwrap();
    let port = free_port();
    let rx = spawn_gate(&server, port, SocketKind::Frame, false);

    let stream = client(port);
    let (_, subtype, _, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(subtype, SOCKET_ACCEPT);

    drop(stream);

    let (_, subtype, _, data) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(subtype, SOCKET_CLOSE);
    assert!(String::from_utf8(data).unwrap().contains("127.0.0.1"));
    // clean EOF produces no error message and nothing after the close
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}
