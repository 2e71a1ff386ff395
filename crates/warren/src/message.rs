// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed message record exchanged between services.
//!
//! A message carries sender and receiver ids, a session for request/response
//! correlation, a one-byte type, a one-byte subtype (used by networking for
//! data/accept/connect/close/error events), a short header string and a
//! payload buffer. Messages move by ownership transfer: once handed to the
//! router the producer must treat them as gone.

use std::sync::Arc;

use crate::buffer::Buffer;

/// High bits of a service or fd id name the owning worker (1-based).
pub const WORKER_SHIFT: u32 = 16;

/// Decode the owning worker index from a service or fd id.
pub fn worker_of(id: u32) -> u32 {
    id >> WORKER_SHIFT
}

/// Unclassified message.
pub const PTYPE_UNKNOWN: u8 = 0;
/// Runtime control traffic (shutdown notices, admin results).
pub const PTYPE_SYSTEM: u8 = 1;
/// Plain text payload.
pub const PTYPE_TEXT: u8 = 2;
/// Error notification; the payload describes the failure.
pub const PTYPE_ERROR: u8 = 3;
/// Binary socket traffic (length-prefixed and raw TCP connections).
pub const PTYPE_SOCKET: u8 = 4;
/// WebSocket traffic.
pub const PTYPE_SOCKET_WS: u8 = 5;
/// Timer expiry event.
pub const PTYPE_TIMER: u8 = 6;
/// Server is stopping; services should wind down.
pub const PTYPE_SHUTDOWN: u8 = 7;

#[derive(Debug)]
enum Payload {
    Inline(Buffer),
    Shared(Arc<Buffer>),
}

/// A message owned by exactly one holder at a time.
#[derive(Debug)]
pub struct Message {
    sender: u32,
    receiver: u32,
    session: i32,
    ptype: u8,
    subtype: u8,
    header: String,
    payload: Payload,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Self {
            sender: 0,
            receiver: 0,
            session: 0,
            ptype: PTYPE_UNKNOWN,
            subtype: 0,
            header: String::new(),
            payload: Payload::Inline(Buffer::new()),
        }
    }

    /// Create a message around an existing buffer.
    pub fn with_buffer(buf: Buffer) -> Self {
        let mut msg = Self::new();
        msg.payload = Payload::Inline(buf);
        msg
    }

    /// Create a message whose payload is a UTF-8 string.
    pub fn text(content: &str) -> Self {
        Self::with_buffer(Buffer::from_slice(content.as_bytes()))
    }

    /// Create a message sharing a prefab payload.
    pub(crate) fn with_shared(buf: Arc<Buffer>) -> Self {
        let mut msg = Self::new();
        msg.payload = Payload::Shared(buf);
        msg
    }

    /// Sender service id (or fd for socket events).
    pub fn sender(&self) -> u32 {
        self.sender
    }

    /// Receiver service id; 0 designates a broadcast.
    pub fn receiver(&self) -> u32 {
        self.receiver
    }

    /// Session correlation token. Positive on requests, negated on
    /// responses, 0 when no reply is expected.
    pub fn session(&self) -> i32 {
        self.session
    }

    /// Message type (one of the `PTYPE_*` constants).
    pub fn ptype(&self) -> u8 {
        self.ptype
    }

    /// Message subtype (socket event kind for network traffic).
    pub fn subtype(&self) -> u8 {
        self.subtype
    }

    /// Short header string.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Readable payload bytes.
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            Payload::Inline(buf) => buf.data(),
            Payload::Shared(buf) => buf.data(),
        }
    }

    /// Payload interpreted as UTF-8 (lossy).
    pub fn text_data(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.data())
    }

    pub fn set_sender(&mut self, sender: u32) {
        self.sender = sender;
    }

    pub fn set_receiver(&mut self, receiver: u32) {
        self.receiver = receiver;
    }

    pub fn set_session(&mut self, session: i32) {
        self.session = session;
    }

    pub fn set_ptype(&mut self, ptype: u8) {
        self.ptype = ptype;
    }

    pub fn set_subtype(&mut self, subtype: u8) {
        self.subtype = subtype;
    }

    pub fn set_header(&mut self, header: &str) {
        self.header.clear();
        self.header.push_str(header);
    }

    /// Take the payload out as an owned buffer.
    ///
    /// Shared (prefab) payloads are copied; inline payloads move.
    pub fn take_buffer(&mut self) -> Buffer {
        match std::mem::replace(&mut self.payload, Payload::Inline(Buffer::new())) {
            Payload::Inline(buf) => buf,
            Payload::Shared(buf) => Buffer::from_slice(buf.data()),
        }
    }

    /// Duplicate metadata for broadcast fan-out, sharing the payload.
    ///
    /// Inline payloads are copied once; shared payloads only bump the
    /// refcount.
    pub(crate) fn fork(&self) -> Self {
        let payload = match &self.payload {
            Payload::Inline(buf) => Payload::Shared(Arc::new(Buffer::from_slice(buf.data()))),
            Payload::Shared(buf) => Payload::Shared(Arc::clone(buf)),
        };
        Self {
            sender: self.sender,
            receiver: self.receiver,
            session: self.session,
            ptype: self.ptype,
            subtype: self.subtype,
            header: self.header.clone(),
            payload,
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_of() {
        assert_eq!(worker_of(0x0001_0001), 1);
        assert_eq!(worker_of(0x0002_0099), 2);
        assert_eq!(worker_of(0x00FF_FFFF), 0xFF);
        assert_eq!(worker_of(0), 0);
    }

    #[test]
    fn test_text_message() {
        let mut msg = Message::text("hi");
        msg.set_sender(0x0001_0001);
        msg.set_receiver(0x0002_0001);
        msg.set_session(7);
        msg.set_ptype(PTYPE_TEXT);
        assert_eq!(msg.data(), b"hi");
        assert_eq!(msg.text_data(), "hi");
        assert_eq!(msg.session(), 7);
        assert_eq!(worker_of(msg.receiver()), 2);
    }

    #[test]
    fn test_take_buffer_moves_inline() {
        let mut msg = Message::text("payload");
        let buf = msg.take_buffer();
        assert_eq!(buf.data(), b"payload");
        assert!(msg.data().is_empty());
    }

    #[test]
    fn test_shared_payload() {
        let arc = Arc::new(Buffer::from_slice(b"prefab"));
        let mut msg = Message::with_shared(Arc::clone(&arc));
        assert_eq!(msg.data(), b"prefab");
        // taking copies, leaving the prefab intact
        let buf = msg.take_buffer();
        assert_eq!(buf.data(), b"prefab");
        assert_eq!(arc.data(), b"prefab");
    }

    #[test]
    fn test_fork_shares_payload() {
        let arc = Arc::new(Buffer::from_slice(b"cast"));
        let msg = Message::with_shared(Arc::clone(&arc));
        let copy = msg.fork();
        assert_eq!(copy.data(), b"cast");
        assert_eq!(Arc::strong_count(&arc), 3);
    }
}
