// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service trait and execution context.
//!
//! A service is an addressable unit of single-threaded execution. The core
//! never depends on what a service *is* (a scripted interpreter, a plain
//! Rust struct); it only drives the hook set below, always on the worker
//! thread that owns the service, one hook at a time.
//!
//! The [`ServiceContext`] passed into every hook is the service's capability
//! surface: messaging, timers, sockets, environment, memory accounting and
//! quit. It borrows worker state for the duration of the hook, which is what
//! makes the single-threaded guarantee structural rather than conventional.

use crate::buffer::Buffer;
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::message::{worker_of, Message, PTYPE_TEXT};
use crate::net::{FrameFlag, ReadDelim, SocketKind};
use crate::router::Router;
use crate::timer::TimerWheel;
use crate::worker::{Prefabs, ServiceMeta, WorkerCommand};
use std::sync::Arc;

/// Hook set every service implements.
///
/// `dispatch` receives each mailbox message by value; while it runs, no
/// other message for the same service is delivered. Request/response:
/// a request arrives with a positive session, and the responder replies
/// with that session negated.
pub trait Service: Send {
    /// Construct internal state. Failure frees the slot and surfaces the
    /// error to the requester.
    fn init(&mut self, ctx: &mut ServiceContext<'_>) -> Result<()>;

    /// Called once after a successful init.
    fn start(&mut self, _ctx: &mut ServiceContext<'_>) {}

    /// Handle one message.
    fn dispatch(&mut self, ctx: &mut ServiceContext<'_>, msg: Message);

    /// A timer registered through [`ServiceContext::repeat`] fired.
    /// `removed` is true on the final invocation.
    fn on_timer(&mut self, _ctx: &mut ServiceContext<'_>, _timer_id: u32, _removed: bool) {}

    /// The server is stopping; wind down gracefully.
    fn exit(&mut self, _ctx: &mut ServiceContext<'_>) {}

    /// Final teardown; no hook runs after this.
    fn destroy(&mut self, _ctx: &mut ServiceContext<'_>) {}
}

/// Factory constructing a service from its parsed configuration.
pub type ServiceFactory = dyn Fn(&ServiceConfig) -> Box<dyn Service> + Send + Sync;

/// Per-service memory accounting.
///
/// Tracks bytes the service holds, warns at doubling watermarks and
/// rejects allocations past the hard limit.
#[derive(Debug)]
pub struct MemStat {
    used: usize,
    limit: usize,
    report: usize,
}

const MEM_REPORT_START: usize = 8 * 1024 * 1024;

impl MemStat {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            used: 0,
            limit,
            report: MEM_REPORT_START,
        }
    }

    /// Account `bytes` of new usage. Returns `Ok(true)` when the warn
    /// watermark was crossed, `Err` when the hard limit would be exceeded.
    pub fn charge(&mut self, bytes: usize) -> std::result::Result<bool, Error> {
        let next = self.used + bytes;
        if self.limit != 0 && next > self.limit {
            return Err(Error::MemoryLimit {
                used: next,
                limit: self.limit,
            });
        }
        self.used = next;
        if self.used > self.report {
            self.report *= 2;
            return Ok(true);
        }
        Ok(false)
    }

    /// Release previously charged usage.
    pub fn release(&mut self, bytes: usize) {
        self.used = self.used.saturating_sub(bytes);
    }

    /// Bytes currently charged.
    pub fn used(&self) -> usize {
        self.used
    }
}

/// Capability surface handed to every service hook.
pub struct ServiceContext<'a> {
    pub(crate) worker_id: u32,
    pub(crate) now_ms: i64,
    pub(crate) router: &'a Arc<Router>,
    pub(crate) reactor: &'a mut crate::net::reactor::Reactor,
    pub(crate) timers: &'a mut TimerWheel,
    pub(crate) prefabs: &'a mut Prefabs,
    pub(crate) meta: &'a mut ServiceMeta,
}

impl ServiceContext<'_> {
    // ========================================================================
    // Identity
    // ========================================================================

    /// This service's id.
    pub fn id(&self) -> u32 {
        self.meta.sid
    }

    /// This service's configured name.
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Whether this service registered a unique name.
    pub fn is_unique(&self) -> bool {
        self.meta.unique
    }

    /// Worker-monotonic clock, milliseconds.
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    /// Begin removal of this service after the current hook returns.
    pub fn quit(&mut self) {
        self.meta.quitting = true;
    }

    /// Escalate a service failure: log it, quit, and when this service is
    /// unique request a server-wide stop.
    pub fn error(&mut self, msg: &str) {
        log::error!("{} {}", self.meta.name, msg);
        self.meta.quitting = true;
        if self.meta.unique {
            log::error!(
                "unique service {} crashed, server will abort",
                self.meta.name
            );
            self.router.request_stop();
        }
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Send a message. `session` must be non-negative: a positive value asks
    /// the receiver to respond with it negated, 0 expects no reply.
    pub fn send(&self, receiver: u32, data: &[u8], header: &str, session: i32, ptype: u8) {
        debug_assert!(session >= 0, "requests carry non-negative sessions");
        self.send_buffer(receiver, Buffer::from_slice(data), header, session, ptype);
    }

    /// Send an existing buffer (moves; the buffer is gone afterwards).
    pub fn send_buffer(&self, receiver: u32, buf: Buffer, header: &str, session: i32, ptype: u8) {
        let mut msg = Message::with_buffer(buf);
        msg.set_sender(self.meta.sid);
        msg.set_receiver(receiver);
        msg.set_header(header);
        msg.set_session(session);
        msg.set_ptype(ptype);
        self.router.send(msg);
    }

    /// Reply on a session. Pass the negated request session.
    pub fn response(&self, receiver: u32, header: &str, data: &[u8], session: i32, ptype: u8) {
        if session == 0 {
            return;
        }
        let mut msg = Message::with_buffer(Buffer::from_slice(data));
        msg.set_sender(self.meta.sid);
        msg.set_receiver(receiver);
        msg.set_header(header);
        msg.set_session(session);
        msg.set_ptype(ptype);
        self.router.send(msg);
    }

    /// Broadcast to every service subscribed to `ptype`.
    pub fn broadcast(&self, data: &[u8], header: &str, ptype: u8) {
        self.router
            .broadcast(Buffer::from_slice(data), header, ptype, self.meta.sid);
    }

    /// Subscribe this service to broadcasts of `ptype`.
    pub fn subscribe(&mut self, ptype: u8) {
        self.meta.subscriptions.insert(ptype);
    }

    /// Drop a broadcast subscription.
    pub fn unsubscribe(&mut self, ptype: u8) {
        self.meta.subscriptions.remove(&ptype);
    }

    // ========================================================================
    // Services
    // ========================================================================

    /// Ask the router to spawn a service. `workerid` 0 picks the least
    /// loaded worker; the new sid arrives via the session response.
    pub fn new_service(&self, workerid: u32, kind: &str, config: &str, session: i32) {
        self.router
            .new_service(workerid, kind, config, self.meta.sid, session);
    }

    /// Ask the router to remove a service.
    pub fn remove_service(&self, sid: u32, session: i32) {
        self.router.remove_service(sid, self.meta.sid, session);
    }

    /// Look up a unique service by name; 0 when unregistered.
    pub fn query_service(&self, name: &str) -> u32 {
        self.router.get_unique_service(name)
    }

    // ========================================================================
    // Prefabs
    // ========================================================================

    /// Register a buffer for repeated sends; returns its prefab id.
    pub fn make_prefab(&mut self, buf: Buffer) -> u32 {
        self.prefabs.make(buf)
    }

    /// Send a prefab payload without copying it.
    pub fn send_prefab(
        &self,
        receiver: u32,
        prefab_id: u32,
        header: &str,
        session: i32,
        ptype: u8,
    ) -> bool {
        let Some(shared) = self.prefabs.get(prefab_id) else {
            return false;
        };
        let mut msg = Message::with_shared(shared);
        msg.set_sender(self.meta.sid);
        msg.set_receiver(receiver);
        msg.set_header(header);
        msg.set_session(session);
        msg.set_ptype(ptype);
        self.router.send(msg);
        true
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Register a repeating timer on this worker; fires land in
    /// [`Service::on_timer`]. `times` of -1 repeats until removed.
    pub fn repeat(&mut self, interval_ms: i64, times: i32) -> u32 {
        self.timers.repeat(interval_ms, times, self.meta.sid)
    }

    /// Cancel a timer (best-effort).
    pub fn remove_timer(&mut self, timer_id: u32) -> bool {
        self.timers.remove(timer_id)
    }

    // ========================================================================
    // Sockets
    // ========================================================================

    /// Open a listener on this worker. Returns the listen fd, 0 on failure.
    pub fn listen(&mut self, host: &str, port: u16, kind: SocketKind) -> u32 {
        self.reactor.listen(host, port, self.meta.sid, kind)
    }

    /// Arm an acceptor. `owner` receives the accepted connection (0 means
    /// this service); session 0 keeps accepting, a positive session accepts
    /// once and responds with the new fd.
    pub fn accept(&mut self, listen_fd: u32, session: i32, owner: u32) {
        let owner = if owner == 0 { self.meta.sid } else { owner };
        if worker_of(listen_fd) == self.worker_id {
            self.reactor.accept(listen_fd, session, owner, self.now_ms);
        } else {
            self.router.worker_command(
                worker_of(listen_fd),
                WorkerCommand::Accept {
                    listen_fd,
                    session,
                    owner,
                },
            );
        }
    }

    /// Connect to a remote endpoint. With session 0 the call blocks and
    /// returns the fd; otherwise the fd arrives via the session response
    /// and `timeout_ms` arms a connect watchdog.
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        kind: SocketKind,
        session: i32,
        timeout_ms: i64,
    ) -> u32 {
        self.reactor.connect(
            host,
            port,
            self.meta.sid,
            self.meta.sid,
            kind,
            session,
            timeout_ms,
            self.now_ms,
        )
    }

    /// Issue a read on a delimited/counted connection.
    pub fn read(&mut self, fd: u32, size: usize, delim: ReadDelim, session: i32) {
        if worker_of(fd) == self.worker_id {
            self.reactor
                .read(fd, self.meta.sid, size, delim, session, self.now_ms);
        } else {
            self.router.worker_command(
                worker_of(fd),
                WorkerCommand::Read {
                    fd,
                    owner: self.meta.sid,
                    size,
                    delim,
                    session,
                },
            );
        }
    }

    /// Queue a buffer on a connection. Returns false when the connection is
    /// unknown, closed, or was closed by backpressure.
    pub fn write(&mut self, fd: u32, buf: Buffer) -> bool {
        if worker_of(fd) == self.worker_id {
            self.reactor.write(fd, buf, self.now_ms)
        } else {
            self.router
                .worker_command(worker_of(fd), WorkerCommand::Write { fd, buf })
        }
    }

    /// Queue a buffer with extra flags (framing, close-after-send).
    pub fn write_with_flag(&mut self, fd: u32, mut buf: Buffer, flag: u8) -> bool {
        buf.set_flag(flag);
        self.write(fd, buf)
    }

    /// Close a connection or listener.
    pub fn close_fd(&mut self, fd: u32) -> bool {
        if worker_of(fd) == self.worker_id {
            self.reactor.close(fd)
        } else {
            self.router
                .worker_command(worker_of(fd), WorkerCommand::CloseFd { fd })
        }
    }

    /// Set a connection's idle timeout in seconds (0 disables).
    pub fn settimeout(&mut self, fd: u32, secs: i64) -> bool {
        if worker_of(fd) == self.worker_id {
            self.reactor.settimeout(fd, secs)
        } else {
            self.router
                .worker_command(worker_of(fd), WorkerCommand::SetTimeout { fd, secs })
        }
    }

    /// Enable TCP_NODELAY on a connection.
    pub fn setnodelay(&mut self, fd: u32) -> bool {
        if worker_of(fd) == self.worker_id {
            self.reactor.setnodelay(fd)
        } else {
            self.router
                .worker_command(worker_of(fd), WorkerCommand::SetNodelay { fd })
        }
    }

    /// Change the framing flag of a length-prefixed connection.
    /// Accepts `none`, `r`, `w`, `wr`, `rw`.
    pub fn set_enable_frame(&mut self, fd: u32, flag: &str) -> bool {
        let Some(flag) = FrameFlag::parse(flag) else {
            log::warn!(
                "set_enable_frame: unsupported flag {:?}; use 'none' 'r' 'w' 'wr' 'rw'",
                flag
            );
            return false;
        };
        if worker_of(fd) == self.worker_id {
            self.reactor.set_enable_frame(fd, flag)
        } else {
            self.router
                .worker_command(worker_of(fd), WorkerCommand::SetFrameFlag { fd, flag })
        }
    }

    // ========================================================================
    // Environment
    // ========================================================================

    /// Read a process-wide environment entry.
    pub fn get_env(&self, key: &str) -> Option<String> {
        self.router.get_env(key)
    }

    /// Write a process-wide environment entry.
    pub fn set_env(&self, key: &str, value: &str) {
        self.router.set_env(key, value);
    }

    // ========================================================================
    // Memory accounting
    // ========================================================================

    /// Account memory against this service's limit.
    pub fn charge_memory(&mut self, bytes: usize) -> Result<()> {
        match self.meta.mem.charge(bytes) {
            Ok(false) => Ok(()),
            Ok(true) => {
                log::warn!(
                    "{} memory warning {:.2} MB",
                    self.meta.name,
                    self.meta.mem.used() as f64 / (1024.0 * 1024.0)
                );
                Ok(())
            }
            Err(e) => {
                log::error!("{} {}", self.meta.name, e);
                Err(e)
            }
        }
    }

    /// Release previously charged memory.
    pub fn release_memory(&mut self, bytes: usize) {
        self.meta.mem.release(bytes);
    }

    // ========================================================================
    // Admin
    // ========================================================================

    /// Run an administrative command; the result arrives via the session.
    pub fn runcmd(&self, cmd: &str, session: i32) {
        self.router.runcmd(cmd, self.meta.sid, session);
    }

    /// Convenience: respond to a text request with a text payload.
    pub fn respond_text(&self, msg: &Message, data: &str) {
        if msg.session() > 0 {
            self.response(
                msg.sender(),
                "",
                data.as_bytes(),
                -msg.session(),
                PTYPE_TEXT,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memstat_unlimited() {
        let mut mem = MemStat::new(0);
        assert_eq!(mem.charge(1024).unwrap(), false);
        assert_eq!(mem.used(), 1024);
        mem.release(24);
        assert_eq!(mem.used(), 1000);
        // never errors without a limit
        assert!(mem.charge(usize::MAX / 2).is_ok());
    }

    #[test]
    fn test_memstat_limit() {
        let mut mem = MemStat::new(4096);
        assert!(mem.charge(4096).is_ok());
        let err = mem.charge(1).unwrap_err();
        assert!(matches!(err, Error::MemoryLimit { .. }));
        // failed charge does not change usage
        assert_eq!(mem.used(), 4096);
    }

    #[test]
    fn test_memstat_warn_doubles() {
        let mut mem = MemStat::new(0);
        assert_eq!(mem.charge(MEM_REPORT_START + 1).unwrap(), true);
        // next watermark is doubled, small charges stay quiet
        assert_eq!(mem.charge(1).unwrap(), false);
        assert_eq!(mem.charge(MEM_REPORT_START).unwrap(), true);
    }

    #[test]
    fn test_memstat_release_saturates() {
        let mut mem = MemStat::new(0);
        mem.charge(10).unwrap();
        mem.release(100);
        assert_eq!(mem.used(), 0);
    }
}
