// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Network reactor and framed-TCP connection machinery.
//!
//! Each worker owns one [`reactor::Reactor`]: listener and connection tables
//! keyed by process-unique fd ids, driven by the worker's `mio::Poll`. Four
//! protocol variants share the connection base:
//!
//! 1. Length-prefixed frames (`u16` big-endian length before the payload)
//! 2. Line-delimited text (CRLF, LF, or a configurable byte)
//! 3. Byte-count reads (return whatever arrived, up to N)
//! 4. WebSocket server (RFC 6455, automatic ping/pong and close replies)
//!
//! Connection events surface to the owning service as ordinary messages
//! whose subtype distinguishes connect/accept/data/close/error.

pub mod connection;
pub mod frame;
pub mod reactor;
pub mod ws;

/// Outbound connection established.
pub const SOCKET_CONNECT: u8 = 1;
/// Inbound connection accepted.
pub const SOCKET_ACCEPT: u8 = 2;
/// Payload data.
pub const SOCKET_DATA: u8 = 3;
/// Connection closed; payload is the peer address.
pub const SOCKET_CLOSE: u8 = 4;
/// Transport or logic error; payload is a JSON description.
pub const SOCKET_ERROR: u8 = 5;

/// Protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// Length-prefixed binary frames.
    Frame,
    /// Delimited or counted text reads.
    Text,
    /// WebSocket server.
    Ws,
}

impl SocketKind {
    /// Message type used for traffic on this kind of connection.
    pub fn ptype(self) -> u8 {
        match self {
            SocketKind::Frame => crate::message::PTYPE_SOCKET,
            SocketKind::Text => crate::message::PTYPE_TEXT,
            SocketKind::Ws => crate::message::PTYPE_SOCKET_WS,
        }
    }
}

/// Read completion condition for delimited/counted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDelim {
    /// Read until CRLF; the delimiter is stripped.
    Crlf,
    /// Read until LF; the delimiter is stripped.
    Lf,
    /// Read until the given byte; the delimiter is stripped.
    Byte(u8),
    /// Read exactly `size` bytes.
    Exact,
    /// Return whatever has arrived, up to `size` bytes.
    Available,
}

/// One outstanding read on a connection.
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    pub delim: ReadDelim,
    pub size: usize,
    pub session: i32,
}

/// Per-direction length-prefix framing enable flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FrameFlag {
    /// No automatic framing.
    #[default]
    None,
    /// Frame incoming data only.
    Receive,
    /// Frame outgoing data only.
    Send,
    /// Frame both directions.
    Both,
}

impl FrameFlag {
    /// Parse the wire spelling: `none`, `r`, `w`, `wr`, `rw`.
    pub fn parse(flag: &str) -> Option<Self> {
        match flag.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "r" => Some(Self::Receive),
            "w" => Some(Self::Send),
            "wr" | "rw" => Some(Self::Both),
            _ => None,
        }
    }

    /// True when outgoing buffers get a length prefix.
    pub fn sends(self) -> bool {
        matches!(self, Self::Send | Self::Both)
    }

    /// True when incoming frames are length-decoded.
    pub fn receives(self) -> bool {
        matches!(self, Self::Receive | Self::Both)
    }
}

/// Core-detected connection failures, reported as `logic_errcode` in the
/// error JSON sent to the owning service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogicError {
    /// No logic error; the close was clean or transport-level.
    #[default]
    None,
    /// Incoming frame or line exceeded the configured ceiling.
    FrameTooLarge,
    /// Outgoing payload cannot fit the 2-byte length prefix.
    SendTooLarge,
    /// No bytes received within the connection's timeout window.
    RecvTimeout,
    /// Send queue reached the hard watermark.
    SendQueueOverflow,
    /// WebSocket upgrade request was malformed.
    Handshake,
    /// WebSocket framing violated the protocol.
    WsProtocol,
}

impl LogicError {
    /// Numeric code carried in error payloads.
    pub fn code(self) -> i32 {
        match self {
            Self::None => 0,
            Self::FrameTooLarge => 1,
            Self::SendTooLarge => 2,
            Self::RecvTimeout => 3,
            Self::SendQueueOverflow => 4,
            Self::Handshake => 5,
            Self::WsProtocol => 6,
        }
    }

    /// Human-readable description.
    pub fn errmsg(self) -> &'static str {
        match self {
            Self::None => "ok",
            Self::FrameTooLarge => "frame too large",
            Self::SendTooLarge => "send payload too large",
            Self::RecvTimeout => "recv timeout",
            Self::SendQueueOverflow => "send queue overflow",
            Self::Handshake => "websocket handshake failed",
            Self::WsProtocol => "websocket protocol violation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_flag_parse() {
        assert_eq!(FrameFlag::parse("none"), Some(FrameFlag::None));
        assert_eq!(FrameFlag::parse("r"), Some(FrameFlag::Receive));
        assert_eq!(FrameFlag::parse("w"), Some(FrameFlag::Send));
        assert_eq!(FrameFlag::parse("wr"), Some(FrameFlag::Both));
        assert_eq!(FrameFlag::parse("RW"), Some(FrameFlag::Both));
        assert_eq!(FrameFlag::parse("x"), None);

        assert!(FrameFlag::Both.sends());
        assert!(FrameFlag::Both.receives());
        assert!(!FrameFlag::Receive.sends());
        assert!(!FrameFlag::Send.receives());
    }

    #[test]
    fn test_logic_error_codes_distinct() {
        let all = [
            LogicError::None,
            LogicError::FrameTooLarge,
            LogicError::SendTooLarge,
            LogicError::RecvTimeout,
            LogicError::SendQueueOverflow,
            LogicError::Handshake,
            LogicError::WsProtocol,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
        assert_eq!(LogicError::FrameTooLarge.errmsg(), "frame too large");
    }

    #[test]
    fn test_kind_ptype() {
        assert_eq!(SocketKind::Frame.ptype(), crate::message::PTYPE_SOCKET);
        assert_eq!(SocketKind::Text.ptype(), crate::message::PTYPE_TEXT);
        assert_eq!(SocketKind::Ws.ptype(), crate::message::PTYPE_SOCKET_WS);
    }
}
