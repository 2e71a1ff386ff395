// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed TCP connection state machine.
//!
//! A connection couples a non-blocking stream with:
//! - [`RecvState`]: an accumulation buffer plus the protocol decoder
//!   (length-prefix frames, delimited/counted reads, or WebSocket)
//! - [`SendQueue`]: buffered writes with warn/overflow watermarks,
//!   vectored draining of up to 50 buffers, and close-after-send
//! - timeout bookkeeping (`last_recv` vs. the configured idle window)
//!
//! The reactor drives the state machine and turns the produced
//! [`RecvItem`]s into messages for the owning service.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};

use mio::net::TcpStream;

use crate::buffer::{Buffer, FLAG_CLOSE, FLAG_FRAMING};
use crate::config::NetConfig;
use crate::net::{frame, ws, FrameFlag, LogicError, ReadDelim, ReadRequest, SocketKind};

/// Max buffers coalesced into one vectored write.
const SEND_BATCH: usize = 50;

/// Scratch read size per `read` call.
const READ_CHUNK: usize = 16 * 1024;

// ============================================================================
// Receive state
// ============================================================================

/// One unit produced by the protocol decoder.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RecvItem {
    /// A complete payload for the owning service.
    Data { payload: Vec<u8>, session: i32 },
    /// WebSocket handshake finished; send `response` back to the peer.
    HandshakeDone { response: Vec<u8> },
    /// WebSocket ping; reply with a pong echoing the payload.
    Ping(Vec<u8>),
    /// WebSocket close; echo it back and close after sending.
    CloseFrame(Vec<u8>),
}

/// Protocol decoder over an accumulation buffer.
#[derive(Debug)]
pub(crate) struct RecvState {
    kind: SocketKind,
    max_size: usize,
    handshake_limit: usize,
    buf: Vec<u8>,
    pos: usize,
    read_req: Option<ReadRequest>,
    ws_open: bool,
    ws_closed: bool,
    frag_opcode: Option<ws::Opcode>,
    frag: Vec<u8>,
}

impl RecvState {
    pub(crate) fn new(kind: SocketKind, cfg: &NetConfig) -> Self {
        Self {
            kind,
            max_size: cfg.max_frame_size,
            handshake_limit: cfg.handshake_limit,
            buf: Vec::new(),
            pos: 0,
            read_req: None,
            ws_open: false,
            ws_closed: false,
            frag_opcode: None,
            frag: Vec::new(),
        }
    }

    /// Append raw bytes from the socket.
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        // Compact once the consumed prefix dominates the buffer.
        if self.pos > 0 && self.pos >= self.buf.len() / 2 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Install the outstanding read request for delimited/counted kinds.
    pub(crate) fn set_request(&mut self, req: ReadRequest) -> Result<(), &'static str> {
        if self.read_req.is_some() {
            return Err("a read is already pending");
        }
        self.read_req = Some(req);
        Ok(())
    }

    /// Pull the next decoded unit, if a complete one is buffered.
    pub(crate) fn next(&mut self) -> Result<Option<RecvItem>, LogicError> {
        match self.kind {
            SocketKind::Frame => self.next_frame(),
            SocketKind::Text => self.next_text(),
            SocketKind::Ws => self.next_ws(),
        }
    }

    fn available(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn next_frame(&mut self) -> Result<Option<RecvItem>, LogicError> {
        match frame::peek(self.available(), self.max_size) {
            frame::ParseResult::Complete(len, total) => {
                let start = self.pos + frame::FRAME_HEADER_SIZE;
                let payload = self.buf[start..start + len].to_vec();
                self.pos += total;
                Ok(Some(RecvItem::Data {
                    payload,
                    session: 0,
                }))
            }
            frame::ParseResult::Incomplete(_) => Ok(None),
            frame::ParseResult::TooLarge(_) => Err(LogicError::FrameTooLarge),
        }
    }

    fn next_text(&mut self) -> Result<Option<RecvItem>, LogicError> {
        let Some(req) = self.read_req else {
            // bound the accumulator even while no read is pending
            if self.buf.len() - self.pos > self.max_size {
                return Err(LogicError::FrameTooLarge);
            }
            return Ok(None);
        };
        let avail = self.available();

        let take = match req.delim {
            ReadDelim::Exact => {
                if req.size == 0 || avail.len() >= req.size {
                    Some((req.size, req.size))
                } else {
                    None
                }
            }
            ReadDelim::Available => {
                if avail.is_empty() {
                    None
                } else {
                    let n = if req.size == 0 {
                        avail.len()
                    } else {
                        avail.len().min(req.size)
                    };
                    Some((n, n))
                }
            }
            ReadDelim::Crlf => avail
                .windows(2)
                .position(|w| w == b"\r\n")
                .map(|p| (p, p + 2)),
            ReadDelim::Lf => avail.iter().position(|&b| b == b'\n').map(|p| (p, p + 1)),
            ReadDelim::Byte(delim) => {
                avail.iter().position(|&b| b == delim).map(|p| (p, p + 1))
            }
        };

        match take {
            Some((data_len, consumed)) => {
                let payload = self.buf[self.pos..self.pos + data_len].to_vec();
                self.pos += consumed;
                self.read_req = None;
                Ok(Some(RecvItem::Data {
                    payload,
                    session: req.session,
                }))
            }
            None => {
                // a delimiter that never arrives must not buffer forever
                if avail.len() > self.max_size {
                    return Err(LogicError::FrameTooLarge);
                }
                Ok(None)
            }
        }
    }

    fn next_ws(&mut self) -> Result<Option<RecvItem>, LogicError> {
        if self.ws_closed {
            return Ok(None);
        }

        if !self.ws_open {
            match ws::parse_handshake(self.available(), self.handshake_limit) {
                Ok(Some((hs, consumed))) => {
                    self.pos += consumed;
                    self.ws_open = true;
                    return Ok(Some(RecvItem::HandshakeDone {
                        response: ws::handshake_response(&hs.key),
                    }));
                }
                Ok(None) => return Ok(None),
                Err(_) => return Err(LogicError::Handshake),
            }
        }

        loop {
            let decoded = ws::decode_frame(self.available(), self.max_size, true);
            let (frame, consumed) = match decoded {
                Ok(Some(pair)) => pair,
                Ok(None) => return Ok(None),
                Err(ws::WsError::TooLarge) => return Err(LogicError::FrameTooLarge),
                Err(_) => return Err(LogicError::WsProtocol),
            };
            self.pos += consumed;

            match frame.opcode {
                ws::Opcode::Text | ws::Opcode::Binary => {
                    if frame.fin {
                        return Ok(Some(RecvItem::Data {
                            payload: frame.payload,
                            session: 0,
                        }));
                    }
                    if self.frag_opcode.is_some() {
                        return Err(LogicError::WsProtocol);
                    }
                    self.frag_opcode = Some(frame.opcode);
                    self.frag = frame.payload;
                }
                ws::Opcode::Continuation => {
                    if self.frag_opcode.is_none() {
                        return Err(LogicError::WsProtocol);
                    }
                    if self.frag.len() + frame.payload.len() > self.max_size {
                        return Err(LogicError::FrameTooLarge);
                    }
                    self.frag.extend_from_slice(&frame.payload);
                    if frame.fin {
                        self.frag_opcode = None;
                        return Ok(Some(RecvItem::Data {
                            payload: std::mem::take(&mut self.frag),
                            session: 0,
                        }));
                    }
                }
                ws::Opcode::Ping => return Ok(Some(RecvItem::Ping(frame.payload))),
                ws::Opcode::Pong => continue,
                ws::Opcode::Close => {
                    self.ws_closed = true;
                    return Ok(Some(RecvItem::CloseFrame(frame.payload)));
                }
            }
        }
    }
}

// ============================================================================
// Send queue
// ============================================================================

/// Result of enqueueing a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Ok,
    /// Queue depth crossed the warn watermark.
    Warn(usize),
    /// Queue depth reached the hard watermark; the connection must close.
    Overflow,
}

/// Progress of a flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendProgress {
    /// Everything queued has been written.
    Drained,
    /// The socket would block; wait for the next writable event.
    Blocked,
    /// A close-after-send buffer finished draining.
    CloseRequested,
}

/// Buffered writes with watermarks and vectored draining.
#[derive(Debug)]
pub(crate) struct SendQueue {
    queue: VecDeque<Buffer>,
    offset: usize,
    warn: usize,
    max: usize,
}

impl SendQueue {
    pub(crate) fn new(cfg: &NetConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            offset: 0,
            warn: cfg.warn_send_queue,
            max: cfg.max_send_queue,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn push(&mut self, buf: Buffer) -> PushOutcome {
        self.queue.push_back(buf);
        let depth = self.queue.len();
        if depth >= self.max {
            PushOutcome::Overflow
        } else if depth >= self.warn {
            PushOutcome::Warn(depth)
        } else {
            PushOutcome::Ok
        }
    }

    /// Write as much queued data as the socket accepts.
    pub(crate) fn write_to<W: Write>(&mut self, stream: &mut W) -> io::Result<SendProgress> {
        loop {
            if self.queue.is_empty() {
                return Ok(SendProgress::Drained);
            }

            let written = {
                let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(SEND_BATCH.min(16));
                for (i, buf) in self.queue.iter().enumerate().take(SEND_BATCH) {
                    let data = if i == 0 {
                        &buf.data()[self.offset..]
                    } else {
                        buf.data()
                    };
                    slices.push(IoSlice::new(data));
                    // bytes queued after a close marker must never hit the wire
                    if buf.has_flag(FLAG_CLOSE) {
                        break;
                    }
                }

                match stream.write_vectored(&slices) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "connection closed",
                        ))
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(SendProgress::Blocked)
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };

            if self.advance(written) {
                return Ok(SendProgress::CloseRequested);
            }
        }
    }

    fn advance(&mut self, mut n: usize) -> bool {
        while n > 0 {
            let front_remaining = match self.queue.front() {
                Some(buf) => buf.len() - self.offset,
                None => return false,
            };
            if n >= front_remaining {
                n -= front_remaining;
                self.offset = 0;
                let done = self
                    .queue
                    .pop_front()
                    .map(|b| b.has_flag(FLAG_CLOSE))
                    .unwrap_or(false);
                if done {
                    self.queue.clear();
                    return true;
                }
            } else {
                self.offset += n;
                n = 0;
            }
        }
        false
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Verdict of a send attempt, reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendVerdict {
    Accepted,
    Warn(usize),
    Overflow,
    TooLarge,
    NotOpen,
}

/// Async connect in progress.
#[derive(Debug)]
pub(crate) struct PendingConnect {
    /// Service awaiting the session response.
    pub service: u32,
    pub session: i32,
    pub deadline_ms: Option<i64>,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnPhase {
    Connecting,
    Open,
}

/// One live connection, owned by a worker's reactor.
#[derive(Debug)]
pub(crate) struct Connection {
    pub fd: u32,
    pub owner: u32,
    pub kind: SocketKind,
    pub stream: TcpStream,
    pub addr: String,
    pub phase: ConnPhase,
    pub frame_flag: FrameFlag,
    pub timeout_secs: i64,
    pub last_recv_ms: i64,
    pub logic_error: LogicError,
    pub pending_connect: Option<PendingConnect>,
    recv: RecvState,
    send: SendQueue,
    sending: bool,
}

impl Connection {
    pub(crate) fn open(
        fd: u32,
        owner: u32,
        kind: SocketKind,
        stream: TcpStream,
        addr: String,
        cfg: &NetConfig,
        now_ms: i64,
    ) -> Self {
        Self {
            fd,
            owner,
            kind,
            stream,
            addr,
            phase: ConnPhase::Open,
            frame_flag: FrameFlag::None,
            timeout_secs: 0,
            last_recv_ms: now_ms,
            logic_error: LogicError::None,
            pending_connect: None,
            recv: RecvState::new(kind, cfg),
            send: SendQueue::new(cfg),
            sending: false,
        }
    }

    pub(crate) fn connecting(
        fd: u32,
        owner: u32,
        kind: SocketKind,
        stream: TcpStream,
        pending: PendingConnect,
        cfg: &NetConfig,
        now_ms: i64,
    ) -> Self {
        let addr = format!("{}:{}", pending.host, pending.port);
        let mut conn = Self::open(fd, owner, kind, stream, addr, cfg, now_ms);
        conn.phase = ConnPhase::Connecting;
        conn.pending_connect = Some(pending);
        conn
    }

    pub(crate) fn is_open(&self) -> bool {
        self.phase == ConnPhase::Open
    }

    /// Read everything the socket has. Returns `true` on EOF.
    pub(crate) fn fill(&mut self, now_ms: i64) -> io::Result<bool> {
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.recv.feed(&scratch[..n]);
                    self.last_recv_ms = now_ms;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn next_item(&mut self) -> Result<Option<RecvItem>, LogicError> {
        self.recv.next()
    }

    pub(crate) fn set_read_request(&mut self, req: ReadRequest) -> Result<(), &'static str> {
        self.recv.set_request(req)
    }

    /// Queue raw bytes (handshake responses, pong/close replies).
    pub(crate) fn queue_control(&mut self, bytes: Vec<u8>, close_after: bool) -> PushOutcome {
        let mut buf = Buffer::from_slice(&bytes);
        if close_after {
            buf.set_flag(FLAG_CLOSE);
        }
        self.send.push(buf)
    }

    /// Queue an application buffer, applying the protocol's send transform.
    pub(crate) fn send(&mut self, mut buf: Buffer) -> SendVerdict {
        if !self.is_open() || buf.is_empty() {
            return SendVerdict::NotOpen;
        }

        match self.kind {
            SocketKind::Frame => {
                if self.frame_flag.sends() || buf.has_flag(FLAG_FRAMING) {
                    if !frame::prepend_header(&mut buf) {
                        log::warn!(
                            "fd {:08X} payload of {} bytes exceeds the frame length prefix",
                            self.fd,
                            buf.len()
                        );
                        self.logic_error = LogicError::SendTooLarge;
                        return SendVerdict::TooLarge;
                    }
                }
            }
            SocketKind::Ws => {
                let (header, header_len) = ws::frame_header(ws::Opcode::Binary, buf.len());
                if !buf.write_front(&header[..header_len]) {
                    // head reserve already spent; rebuild with the header inline
                    let mut rebuilt = Buffer::with_capacity(header_len + buf.len());
                    rebuilt.write_back(&header[..header_len]);
                    rebuilt.write_back(buf.data());
                    if buf.has_flag(FLAG_CLOSE) {
                        rebuilt.set_flag(FLAG_CLOSE);
                    }
                    buf = rebuilt;
                }
            }
            SocketKind::Text => {}
        }

        match self.send.push(buf) {
            PushOutcome::Ok => SendVerdict::Accepted,
            PushOutcome::Warn(depth) => SendVerdict::Warn(depth),
            PushOutcome::Overflow => {
                self.logic_error = LogicError::SendQueueOverflow;
                SendVerdict::Overflow
            }
        }
    }

    /// Drain the send queue onto the socket.
    pub(crate) fn try_flush(&mut self) -> io::Result<SendProgress> {
        if self.send.is_empty() {
            self.sending = false;
            return Ok(SendProgress::Drained);
        }
        let progress = self.send.write_to(&mut self.stream)?;
        self.sending = progress == SendProgress::Blocked;
        Ok(progress)
    }

    /// A write is in flight; the next writable event resumes it.
    pub(crate) fn is_sending(&self) -> bool {
        self.sending
    }

    pub(crate) fn timed_out(&self, now_ms: i64) -> bool {
        self.is_open()
            && self.timeout_secs > 0
            && now_ms - self.last_recv_ms > self.timeout_secs * 1000
    }

    pub(crate) fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

// ============================================================================
// Tests
// ============================================================================
