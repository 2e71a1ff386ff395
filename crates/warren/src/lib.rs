// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Warren - multi-worker actor runtime
//!
//! A process hosts many independent *services*, each with a private mailbox
//! and single-threaded execution. Services send asynchronous messages to one
//! another by numeric address, correlate request/response pairs with session
//! identifiers, schedule timers, and perform non-blocking networking through
//! a per-worker reactor.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                              Server                                 |
//! |   wall clock | lifecycle | worker supervision | round-robin spawn   |
//! +---------------------------------------------------------------------+
//! |                              Router                                 |
//! |   sid -> worker decoding | unique names | env map | broadcast       |
//! +---------------------------------------------------------------------+
//! |    Worker 1          |    Worker 2          |    Worker N           |
//! |  mailbox drain       |  mailbox drain       |  mailbox drain        |
//! |  timer wheel         |  timer wheel         |  timer wheel          |
//! |  mio poll reactor    |  mio poll reactor    |  mio poll reactor     |
//! |  service slots       |  service slots       |  service slots        |
//! +---------------------------------------------------------------------+
//! |                       Framed TCP connections                        |
//! |   length-prefix | line-delimited | byte-count | WebSocket server    |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Addressing
//!
//! Every service gets a 32-bit id: the high 16 bits name the worker that
//! owns it (1-based), the low 16 bits a per-worker slot. Socket fds use the
//! same encoding, so any id can be routed to its owning worker in O(1)
//! without a global map.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use warren::{Server, Service, ServiceContext, Message, Result};
//!
//! struct Echo;
//!
//! impl Service for Echo {
//!     fn init(&mut self, _ctx: &mut ServiceContext<'_>) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     fn dispatch(&mut self, ctx: &mut ServiceContext<'_>, msg: Message) {
//!         if msg.session() > 0 {
//!             ctx.response(msg.sender(), "", msg.data(), -msg.session(), msg.ptype());
//!         }
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let mut server = Server::init(2, None)?;
//!     server.register("echo", |_cfg| Box::new(Echo));
//!     server.new_service(0, "echo", r#"{"name":"echo"}"#, 0, 0);
//!     server.run();
//!     Ok(())
//! }
//! ```

/// Reusable byte buffer with head reservation for protocol framing.
pub mod buffer;
/// Service configuration (JSON) and network tunables.
pub mod config;
/// Crate error type and result alias.
pub mod error;
/// Log sink behind the `log` facade (console and file outputs).
pub mod logging;
/// Typed message record and type constants.
pub mod message;
/// Network reactor: framed TCP, line protocols, WebSocket server.
pub mod net;
/// Global directory: worker selection, unique names, environment map.
pub mod router;
/// Wall clock, lifecycle, worker supervision.
pub mod server;
/// Service trait, execution context, memory accounting.
pub mod service;
/// Per-worker cooperative timer wheel.
pub mod timer;
/// Worker thread: mailbox loop, reactor loop, service slots.
pub mod worker;

pub use buffer::Buffer;
pub use config::{NetConfig, ServiceConfig};
pub use error::{Error, Result};
pub use message::{worker_of, Message};
pub use net::{FrameFlag, ReadDelim, SocketKind};
pub use router::Router;
pub use server::Server;
pub use service::{Service, ServiceContext};
