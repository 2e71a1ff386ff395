// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-worker network reactor.
//!
//! Owns the acceptor and connection tables keyed by process-unique fd ids,
//! allocates those ids (worker index in the high 16 bits, counter in the
//! low 16, guarded against wrap-around reuse by a watcher set), and drives
//! connection state machines off the worker's `mio::Poll` events.
//!
//! The reactor never calls into services directly: everything it has to say
//! becomes a [`Message`] routed back through the worker, and connections
//! accepted on behalf of a service living on another worker are handed over
//! as [`Adoption`] records.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

use crate::buffer::Buffer;
use crate::config::NetConfig;
use crate::message::{worker_of, Message, PTYPE_ERROR, PTYPE_TEXT, WORKER_SHIFT};
use crate::net::connection::{
    ConnPhase, Connection, PendingConnect, RecvItem, SendProgress, SendVerdict,
};
use crate::net::{
    ws, FrameFlag, LogicError, ReadDelim, ReadRequest, SocketKind, SOCKET_ACCEPT, SOCKET_CLOSE,
    SOCKET_CONNECT, SOCKET_DATA, SOCKET_ERROR,
};

/// Size of the per-worker fd space (low 16 bits of an fd id).
const MAX_SOCKET_NUM: u32 = 0xFFFF;

/// An accepted stream bound for a service on another worker.
///
/// The connection record must live on the worker that owns the service, so
/// the raw stream travels there and gets its fd from that worker's reactor.
#[derive(Debug)]
pub(crate) struct Adoption {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub owner: u32,
    pub kind: SocketKind,
    pub session: i32,
    /// Service that issued the accept and awaits the session response.
    pub respond_to: u32,
}

#[derive(Debug)]
struct Acceptor {
    listener: TcpListener,
    kind: SocketKind,
    owner: u32,
    /// Accept continuously on behalf of this service.
    auto_owner: Option<u32>,
    /// One-shot accepts: (session, connection owner).
    pending: VecDeque<(i32, u32)>,
}

/// Per-worker socket module.
#[derive(Debug)]
pub(crate) struct Reactor {
    worker_id: u32,
    registry: Registry,
    cfg: NetConfig,
    acceptors: HashMap<u32, Acceptor>,
    conns: HashMap<u32, Connection>,
    watcher: HashSet<u32>,
    uuid: AtomicU32,
    out: VecDeque<Message>,
    adoptions: Vec<(u32, Adoption)>,
    connecting: usize,
    last_sweep_ms: i64,
}

impl Reactor {
    pub(crate) fn new(worker_id: u32, registry: Registry, cfg: NetConfig, now_ms: i64) -> Self {
        Self {
            worker_id,
            registry,
            cfg,
            acceptors: HashMap::new(),
            conns: HashMap::new(),
            watcher: HashSet::new(),
            uuid: AtomicU32::new(0),
            out: VecDeque::new(),
            adoptions: Vec::new(),
            connecting: 0,
            last_sweep_ms: now_ms,
        }
    }

    /// Messages produced since the last drain, for the worker to route.
    pub(crate) fn take_messages(&mut self, into: &mut Vec<Message>) {
        into.extend(self.out.drain(..));
    }

    /// Cross-worker stream handoffs produced since the last drain.
    pub(crate) fn take_adoptions(&mut self) -> Vec<(u32, Adoption)> {
        std::mem::take(&mut self.adoptions)
    }

    /// Dispatch one poll event.
    pub(crate) fn handle_event(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        now_ms: i64,
    ) {
        let fd = token.0 as u32;
        if self.acceptors.contains_key(&fd) {
            if readable {
                self.drain_accepts(fd, now_ms);
            }
            return;
        }
        if writable {
            self.on_writable(fd, now_ms);
        }
        if readable {
            self.on_readable(fd, now_ms);
        }
    }

    // ========================================================================
    // Listen / accept
    // ========================================================================

    /// Open a listener. Returns the listen fd, or 0 on failure (logged).
    pub(crate) fn listen(&mut self, host: &str, port: u16, owner: u32, kind: SocketKind) -> u32 {
        let mut listener = match self.bind_listener(host, port) {
            Ok(l) => l,
            Err(e) => {
                log::error!("listen {}:{} failed: {}", host, port, e);
                return 0;
            }
        };

        let fd = self.alloc_fd();
        if let Err(e) = self
            .registry
            .register(&mut listener, Token(fd as usize), Interest::READABLE)
        {
            log::error!("listen {}:{} register failed: {}", host, port, e);
            self.watcher.remove(&fd);
            return 0;
        }

        log::info!("listen {}:{} fd {:08X}", host, port, fd);
        self.acceptors.insert(
            fd,
            Acceptor {
                listener,
                kind,
                owner,
                auto_owner: None,
                pending: VecDeque::new(),
            },
        );
        fd
    }

    fn bind_listener(&self, host: &str, port: u16) -> io::Result<TcpListener> {
        let addr = Self::resolve(host, port)?;
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        #[cfg(not(windows))]
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.cfg.listen_backlog)?;
        socket.set_nonblocking(true)?;
        Ok(TcpListener::from_std(socket.into()))
    }

    fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing"))
    }

    /// Arm the acceptor.
    ///
    /// `session == 0` starts an auto-accept loop delivering every new
    /// connection to `owner`; a positive session accepts exactly one and
    /// answers the caller through the response path.
    pub(crate) fn accept(&mut self, listen_fd: u32, session: i32, owner: u32, now_ms: i64) {
        {
            let Some(acc) = self.acceptors.get_mut(&listen_fd) else {
                log::warn!("accept on unknown listener {:08X}", listen_fd);
                return;
            };
            if session == 0 {
                acc.auto_owner = Some(owner);
            } else {
                acc.pending.push_back((session, owner));
            }
        }
        self.drain_accepts(listen_fd, now_ms);
    }

    fn drain_accepts(&mut self, listen_fd: u32, now_ms: i64) {
        loop {
            let (result, session, conn_owner, kind, respond_to) = {
                let Some(acc) = self.acceptors.get_mut(&listen_fd) else {
                    return;
                };
                let (session, conn_owner) = match acc.pending.pop_front() {
                    Some(d) => d,
                    None => match acc.auto_owner {
                        Some(owner) => (0, owner),
                        None => return,
                    },
                };
                (
                    acc.listener.accept(),
                    session,
                    conn_owner,
                    acc.kind,
                    acc.owner,
                )
            };

            match result {
                Ok((stream, peer)) => {
                    let target = worker_of(conn_owner);
                    if target == self.worker_id {
                        // session flows answer on the session; the
                        // auto-accept loop announces via the accept event
                        let notify = session == 0;
                        match self.add_stream(stream, peer, conn_owner, kind, true, notify, now_ms)
                        {
                            Ok(fd) => {
                                self.respond(respond_to, "", &fd.to_string(), session, PTYPE_TEXT);
                            }
                            Err(e) => {
                                log::warn!("accept on {:08X} failed: {}", listen_fd, e);
                                self.respond(
                                    respond_to,
                                    "error",
                                    &format!("accept failed: {}", e),
                                    session,
                                    PTYPE_ERROR,
                                );
                            }
                        }
                    } else {
                        self.adoptions.push((
                            target,
                            Adoption {
                                stream,
                                peer,
                                owner: conn_owner,
                                kind,
                                session,
                                respond_to,
                            },
                        ));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if session != 0 {
                        if let Some(acc) = self.acceptors.get_mut(&listen_fd) {
                            acc.pending.push_front((session, conn_owner));
                        }
                    }
                    return;
                }
                Err(e) => {
                    if session != 0 {
                        self.respond(
                            respond_to,
                            "error",
                            &format!("accept failed: {}", e),
                            session,
                            PTYPE_ERROR,
                        );
                    } else {
                        log::warn!("accept on {:08X} failed: {}", listen_fd, e);
                        self.close(listen_fd);
                    }
                    return;
                }
            }
        }
    }

    /// Take ownership of a stream accepted on another worker.
    pub(crate) fn adopt(&mut self, a: Adoption, now_ms: i64) {
        let notify = a.session == 0;
        match self.add_stream(a.stream, a.peer, a.owner, a.kind, true, notify, now_ms) {
            Ok(fd) => self.respond(a.respond_to, "", &fd.to_string(), a.session, PTYPE_TEXT),
            Err(e) => self.respond(
                a.respond_to,
                "error",
                &format!("accept failed: {}", e),
                a.session,
                PTYPE_ERROR,
            ),
        }
    }

    // ========================================================================
    // Connect
    // ========================================================================

    /// Connect to a remote endpoint.
    ///
    /// `session == 0` blocks until established and returns the fd (0 on
    /// failure, logged). Otherwise the connect proceeds in the background,
    /// the fd travels back via the session response, and `timeout_ms > 0`
    /// arms a watchdog that cancels the socket and reports a timeout.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn connect(
        &mut self,
        host: &str,
        port: u16,
        service: u32,
        owner: u32,
        kind: SocketKind,
        session: i32,
        timeout_ms: i64,
        now_ms: i64,
    ) -> u32 {
        let addr = match Self::resolve(host, port) {
            Ok(a) => a,
            Err(e) => {
                self.connect_failed(service, host, port, session, &e);
                return 0;
            }
        };

        if session == 0 {
            let stream = match std::net::TcpStream::connect(addr)
                .and_then(|s| s.set_nonblocking(true).map(|_| s))
            {
                Ok(s) => TcpStream::from_std(s),
                Err(e) => {
                    log::warn!("connect {}:{} failed: {}", host, port, e);
                    return 0;
                }
            };
            return match self.add_stream(stream, addr, owner, kind, false, true, now_ms) {
                Ok(fd) => fd,
                Err(e) => {
                    log::warn!("connect {}:{} failed: {}", host, port, e);
                    0
                }
            };
        }

        let mut stream = match TcpStream::connect(addr) {
            Ok(s) => s,
            Err(e) => {
                self.connect_failed(service, host, port, session, &e);
                return 0;
            }
        };

        let fd = self.alloc_fd();
        if let Err(e) = self.registry.register(
            &mut stream,
            Token(fd as usize),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.watcher.remove(&fd);
            self.connect_failed(service, host, port, session, &e);
            return 0;
        }

        let pending = PendingConnect {
            service,
            session,
            deadline_ms: (timeout_ms > 0).then_some(now_ms + timeout_ms),
            host: host.to_string(),
            port,
        };
        self.conns.insert(
            fd,
            Connection::connecting(fd, owner, kind, stream, pending, &self.cfg, now_ms),
        );
        self.connecting += 1;
        0
    }

    fn connect_failed(&mut self, service: u32, host: &str, port: u16, session: i32, e: &io::Error) {
        if session == 0 {
            log::warn!("connect {}:{} failed: {}", host, port, e);
        } else {
            self.respond(
                service,
                "error",
                &format!("connect {}:{} failed: {}", host, port, e),
                session,
                PTYPE_ERROR,
            );
        }
    }

    // ========================================================================
    // Per-fd operations
    // ========================================================================

    /// Issue a read on a delimited/counted connection.
    ///
    /// Unknown or closed fds answer with an error on the next loop pass,
    /// never synchronously.
    pub(crate) fn read(
        &mut self,
        fd: u32,
        owner: u32,
        size: usize,
        delim: ReadDelim,
        session: i32,
        now_ms: i64,
    ) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            self.respond(owner, "closed", "read an invalid socket", session, PTYPE_ERROR);
            return;
        };
        if !conn.is_open() || conn.kind != SocketKind::Text {
            self.respond(owner, "closed", "read an invalid socket", session, PTYPE_ERROR);
            return;
        }
        if let Err(msg) = conn.set_read_request(ReadRequest {
            delim,
            size,
            session,
        }) {
            self.respond(owner, "error", msg, session, PTYPE_ERROR);
            return;
        }
        // data may already be buffered
        self.pump(fd, now_ms);
    }

    /// Queue a buffer on a connection.
    ///
    /// Returns `true` when the connection exists, is open, and the queue
    /// stayed under the hard watermark.
    pub(crate) fn write(&mut self, fd: u32, buf: Buffer, now_ms: i64) -> bool {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return false;
        };
        let sending = conn.is_sending();
        match conn.send(buf) {
            SendVerdict::Accepted => {
                if !sending {
                    self.flush(fd, now_ms);
                }
                true
            }
            SendVerdict::Warn(depth) => {
                log::warn!("fd {:08X} send queue too long, size: {}", fd, depth);
                if !sending {
                    self.flush(fd, now_ms);
                }
                true
            }
            SendVerdict::Overflow => {
                log::error!("fd {:08X} send queue overflow", fd);
                self.close_with_error(fd, None, now_ms);
                false
            }
            SendVerdict::TooLarge => {
                self.close_with_error(fd, None, now_ms);
                false
            }
            SendVerdict::NotOpen => false,
        }
    }

    /// Close a connection or listener. Open connections emit their close
    /// notice; connecting ones vanish silently.
    pub(crate) fn close(&mut self, fd: u32) -> bool {
        if let Some(conn) = self.conns.get(&fd) {
            if conn.is_open() {
                self.close_with_error(fd, None, 0);
            } else {
                self.remove_silent(fd);
            }
            return true;
        }
        if let Some(mut acc) = self.acceptors.remove(&fd) {
            let _ = self.registry.deregister(&mut acc.listener);
            self.watcher.remove(&fd);
            return true;
        }
        false
    }

    /// Set the idle timeout, in seconds (0 disables).
    pub(crate) fn settimeout(&mut self, fd: u32, secs: i64) -> bool {
        match self.conns.get_mut(&fd) {
            Some(conn) => {
                conn.timeout_secs = secs;
                true
            }
            None => false,
        }
    }

    /// Enable TCP_NODELAY.
    pub(crate) fn setnodelay(&mut self, fd: u32) -> bool {
        match self.conns.get(&fd) {
            Some(conn) => conn.stream.set_nodelay(true).is_ok(),
            None => false,
        }
    }

    /// Change the per-direction framing flag of a length-prefixed connection.
    pub(crate) fn set_enable_frame(&mut self, fd: u32, flag: FrameFlag) -> bool {
        match self.conns.get_mut(&fd) {
            Some(conn) if conn.kind == SocketKind::Frame => {
                conn.frame_flag = flag;
                true
            }
            _ => false,
        }
    }

    // ========================================================================
    // Periodic work
    // ========================================================================

    /// Connect watchdogs every pass; idle sweep on its own cadence.
    pub(crate) fn tick(&mut self, now_ms: i64) {
        if self.connecting > 0 {
            let expired: Vec<u32> = self
                .conns
                .iter()
                .filter(|(_, c)| {
                    c.phase == ConnPhase::Connecting
                        && c.pending_connect
                            .as_ref()
                            .and_then(|p| p.deadline_ms)
                            .is_some_and(|d| now_ms >= d)
                })
                .map(|(fd, _)| *fd)
                .collect();
            for fd in expired {
                if let Some(mut conn) = self.conns.remove(&fd) {
                    let _ = self.registry.deregister(&mut conn.stream);
                    self.watcher.remove(&fd);
                    conn.shutdown();
                    self.connecting -= 1;
                    if let Some(p) = conn.pending_connect.take() {
                        log::warn!("connect {}:{} timeout", p.host, p.port);
                        self.respond(
                            p.service,
                            "error",
                            &format!("connect {}:{} timeout", p.host, p.port),
                            p.session,
                            PTYPE_ERROR,
                        );
                    }
                }
            }
        }

        if now_ms - self.last_sweep_ms >= self.cfg.sweep_interval_ms {
            self.last_sweep_ms = now_ms;
            let idle: Vec<u32> = self
                .conns
                .iter()
                .filter(|(_, c)| c.timed_out(now_ms))
                .map(|(fd, _)| *fd)
                .collect();
            for fd in idle {
                if let Some(conn) = self.conns.get_mut(&fd) {
                    conn.logic_error = LogicError::RecvTimeout;
                }
                self.close_with_error(fd, None, now_ms);
            }
        }
    }

    /// Drop every connection and listener without emitting events.
    pub(crate) fn close_all(&mut self) {
        let fds: Vec<u32> = self.conns.keys().copied().collect();
        for fd in fds {
            self.remove_silent(fd);
        }
        let listeners: Vec<u32> = self.acceptors.keys().copied().collect();
        for fd in listeners {
            if let Some(mut acc) = self.acceptors.remove(&fd) {
                let _ = self.registry.deregister(&mut acc.listener);
                self.watcher.remove(&fd);
            }
        }
    }

    // ========================================================================
    // Event handling internals
    // ========================================================================

    fn on_readable(&mut self, fd: u32, now_ms: i64) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        if !conn.is_open() {
            return;
        }
        match conn.fill(now_ms) {
            Ok(false) => self.pump(fd, now_ms),
            Ok(true) => {
                // drain what arrived before the EOF, then close cleanly
                self.pump(fd, now_ms);
                if self.conns.contains_key(&fd) {
                    self.close_with_error(fd, None, now_ms);
                }
            }
            Err(e) => self.close_with_error(fd, Some(e), now_ms),
        }
    }

    fn on_writable(&mut self, fd: u32, now_ms: i64) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };

        if conn.phase == ConnPhase::Connecting {
            match Self::check_connect(conn) {
                ConnectStatus::Pending => return,
                ConnectStatus::Established(peer) => {
                    conn.phase = ConnPhase::Open;
                    conn.addr = peer.to_string();
                    conn.last_recv_ms = now_ms;
                    self.connecting -= 1;
                    let pending = conn.pending_connect.take();
                    if let Some(p) = pending {
                        self.respond(p.service, "", &fd.to_string(), p.session, PTYPE_TEXT);
                    }
                    self.on_readable(fd, now_ms);
                }
                ConnectStatus::Failed(e) => {
                    self.connecting -= 1;
                    let pending = conn.pending_connect.take();
                    self.remove_silent_no_count(fd);
                    if let Some(p) = pending {
                        self.connect_failed(p.service, &p.host, p.port, p.session, &e);
                    }
                    return;
                }
            }
        }

        self.flush(fd, now_ms);
    }

    fn check_connect(conn: &mut Connection) -> ConnectStatus {
        match conn.stream.take_error() {
            Ok(Some(e)) => ConnectStatus::Failed(e),
            Err(e) => ConnectStatus::Failed(e),
            Ok(None) => match conn.stream.peer_addr() {
                Ok(peer) => ConnectStatus::Established(peer),
                Err(e)
                    if e.kind() == io::ErrorKind::NotConnected
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    ConnectStatus::Pending
                }
                Err(e) => ConnectStatus::Failed(e),
            },
        }
    }

    /// Turn buffered bytes into messages and control replies.
    fn pump(&mut self, fd: u32, now_ms: i64) {
        loop {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return;
            };
            match conn.next_item() {
                Ok(Some(RecvItem::Data { payload, session })) => {
                    let owner = conn.owner;
                    let ptype = conn.kind.ptype();
                    let mut msg = Message::with_buffer(Buffer::from_slice(&payload));
                    msg.set_sender(fd);
                    msg.set_receiver(owner);
                    msg.set_session(session);
                    msg.set_ptype(ptype);
                    msg.set_subtype(SOCKET_DATA);
                    self.out.push_back(msg);
                }
                Ok(Some(RecvItem::HandshakeDone { response })) => {
                    conn.queue_control(response, false);
                    let owner = conn.owner;
                    let ptype = conn.kind.ptype();
                    let addr = conn.addr.clone();
                    self.flush(fd, now_ms);
                    self.emit_event(fd, owner, ptype, SOCKET_ACCEPT, addr.as_bytes());
                }
                Ok(Some(RecvItem::Ping(payload))) => {
                    conn.queue_control(ws::encode_frame(ws::Opcode::Pong, &payload), false);
                    self.flush(fd, now_ms);
                }
                Ok(Some(RecvItem::CloseFrame(payload))) => {
                    conn.queue_control(ws::encode_frame(ws::Opcode::Close, &payload), true);
                    self.flush(fd, now_ms);
                }
                Ok(None) => return,
                Err(logic) => {
                    conn.logic_error = logic;
                    self.close_with_error(fd, None, now_ms);
                    return;
                }
            }
        }
    }

    fn flush(&mut self, fd: u32, now_ms: i64) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        if !conn.is_open() {
            return;
        }
        match conn.try_flush() {
            Ok(SendProgress::Drained) | Ok(SendProgress::Blocked) => {}
            Ok(SendProgress::CloseRequested) => self.close_with_error(fd, None, now_ms),
            Err(e) => self.close_with_error(fd, Some(e), now_ms),
        }
    }

    /// Tear a connection down and notify the owner: an error message when
    /// one applies, then exactly one close message.
    fn close_with_error(&mut self, fd: u32, io_err: Option<io::Error>, _now_ms: i64) {
        let Some(mut conn) = self.conns.remove(&fd) else {
            return;
        };
        let _ = self.registry.deregister(&mut conn.stream);
        self.watcher.remove(&fd);
        conn.shutdown();

        if !conn.is_open() {
            if conn.phase == ConnPhase::Connecting {
                self.connecting -= 1;
            }
            return;
        }

        let owner = conn.owner;
        let ptype = conn.kind.ptype();

        if conn.logic_error != LogicError::None {
            let payload = serde_json::json!({
                "addr": conn.addr,
                "logic_errcode": conn.logic_error.code(),
                "errmsg": conn.logic_error.errmsg(),
            })
            .to_string();
            log::warn!("fd {:08X} {}: {}", fd, conn.addr, conn.logic_error.errmsg());
            self.emit_event(fd, owner, ptype, SOCKET_ERROR, payload.as_bytes());
        } else if let Some(e) = io_err {
            let payload = serde_json::json!({
                "addr": conn.addr,
                "errcode": e.raw_os_error().unwrap_or(-1),
                "errmsg": e.to_string(),
            })
            .to_string();
            log::debug!("fd {:08X} {} transport error: {}", fd, conn.addr, e);
            self.emit_event(fd, owner, ptype, SOCKET_ERROR, payload.as_bytes());
        }

        self.emit_event(fd, owner, ptype, SOCKET_CLOSE, conn.addr.as_bytes());
    }

    fn remove_silent(&mut self, fd: u32) {
        if let Some(mut conn) = self.conns.remove(&fd) {
            let _ = self.registry.deregister(&mut conn.stream);
            self.watcher.remove(&fd);
            conn.shutdown();
            if conn.phase == ConnPhase::Connecting {
                self.connecting -= 1;
            }
        }
    }

    fn remove_silent_no_count(&mut self, fd: u32) {
        if let Some(mut conn) = self.conns.remove(&fd) {
            let _ = self.registry.deregister(&mut conn.stream);
            self.watcher.remove(&fd);
            conn.shutdown();
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn add_stream(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
        owner: u32,
        kind: SocketKind,
        accepted: bool,
        notify: bool,
        now_ms: i64,
    ) -> io::Result<u32> {
        let fd = self.alloc_fd();
        if let Err(e) = self.registry.register(
            &mut stream,
            Token(fd as usize),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.watcher.remove(&fd);
            return Err(e);
        }

        let conn = Connection::open(fd, owner, kind, stream, peer.to_string(), &self.cfg, now_ms);
        self.conns.insert(fd, conn);

        // WebSocket connections announce themselves after the handshake.
        if notify && kind != SocketKind::Ws {
            let subtype = if accepted {
                SOCKET_ACCEPT
            } else {
                SOCKET_CONNECT
            };
            self.emit_event(fd, owner, kind.ptype(), subtype, peer.to_string().as_bytes());
        }

        // catch bytes that raced ahead of the registration
        self.on_readable(fd, now_ms);
        Ok(fd)
    }

    fn alloc_fd(&mut self) -> u32 {
        loop {
            let v = self.uuid.fetch_add(1, Ordering::Relaxed);
            let fd = ((v % MAX_SOCKET_NUM) + 1) | (self.worker_id << WORKER_SHIFT);
            if self.watcher.insert(fd) {
                return fd;
            }
        }
    }

    fn emit_event(&mut self, fd: u32, owner: u32, ptype: u8, subtype: u8, payload: &[u8]) {
        let mut msg = Message::with_buffer(Buffer::from_slice(payload));
        msg.set_sender(fd);
        msg.set_receiver(owner);
        msg.set_ptype(ptype);
        msg.set_subtype(subtype);
        self.out.push_back(msg);
    }

    /// Session-guarded reply to a requesting service; no-op for session 0.
    fn respond(&mut self, receiver: u32, header: &str, data: &str, session: i32, ptype: u8) {
        if session == 0 {
            if ptype == PTYPE_ERROR {
                log::warn!("{}", data);
            }
            return;
        }
        let mut msg = Message::text(data);
        msg.set_sender(0);
        msg.set_receiver(receiver);
        msg.set_header(header);
        msg.set_session(-session);
        msg.set_ptype(ptype);
        self.out.push_back(msg);
    }
}

#[derive(Debug)]
enum ConnectStatus {
    Pending,
    Established(SocketAddr),
    Failed(io::Error),
}
