// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker thread: service slots, mailbox loop, reactor loop, timer wheel.
//!
//! One OS thread per worker. The loop interleaves three duties so that
//! neither I/O nor messaging starves the other:
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        Worker loop                           |
//! |   poll I/O (<= 10 ms) -> run commands -> drain mailbox       |
//! |   (<= 128 msgs/pass)  -> tick timers  -> reactor sweep       |
//! +--------------------------------------------------------------+
//! ```
//!
//! Everything a worker owns (service slot table, timer wheel, reactor
//! tables, prefab cache) is touched only from its own thread. The outside
//! world reaches in through two crossbeam channels (mailbox and commands)
//! plus a `mio::Waker`, bundled in [`WorkerHandle`].

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::{Events, Poll, Token, Waker};

use crate::buffer::Buffer;
use crate::config::{NetConfig, ServiceConfig};
use crate::error::{Error, Result};
use crate::message::{Message, PTYPE_ERROR, PTYPE_TEXT, WORKER_SHIFT};
use crate::net::reactor::{Adoption, Reactor};
use crate::net::{FrameFlag, ReadDelim};
use crate::router::Router;
use crate::service::{MemStat, Service, ServiceContext};
use crate::timer::TimerWheel;

/// Token reserved for the mailbox/command waker.
const WAKER_TOKEN: Token = Token(0);

/// Target loop period; also the timer tick granularity.
const LOOP_PERIOD: Duration = Duration::from_millis(10);

/// Mailbox messages drained per loop pass before yielding to I/O.
const MAILBOX_BATCH: usize = 128;

/// Poll events processed per pass.
const MAX_EVENTS: usize = 128;

/// Slots per worker; the low 16 bits of a sid.
const MAX_SLOTS: usize = 0xFFFF;

// ============================================================================
// Commands
// ============================================================================

/// Requests executed on the owning worker's thread.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    NewService {
        kind: String,
        config: String,
        sender: u32,
        session: i32,
    },
    RemoveService {
        sid: u32,
        sender: u32,
        session: i32,
    },
    Accept {
        listen_fd: u32,
        session: i32,
        owner: u32,
    },
    Adopt(Adoption),
    Read {
        fd: u32,
        owner: u32,
        size: usize,
        delim: ReadDelim,
        session: i32,
    },
    Write {
        fd: u32,
        buf: Buffer,
    },
    CloseFd {
        fd: u32,
    },
    SetTimeout {
        fd: u32,
        secs: i64,
    },
    SetNodelay {
        fd: u32,
    },
    SetFrameFlag {
        fd: u32,
        flag: FrameFlag,
    },
    Stop,
}

// ============================================================================
// Handle
// ============================================================================

/// Thread-safe handle to a worker, held by the router.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub id: u32,
    cmd_tx: Sender<WorkerCommand>,
    msg_tx: Sender<Message>,
    waker: Arc<Waker>,
    service_count: Arc<AtomicU32>,
}

impl WorkerHandle {
    /// Enqueue a message into the worker's mailbox and wake its loop.
    pub fn push(&self, msg: Message) {
        if self.msg_tx.send(msg).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Enqueue a command and wake the loop.
    pub fn command(&self, cmd: WorkerCommand) -> bool {
        if self.cmd_tx.send(cmd).is_ok() {
            let _ = self.waker.wake();
            true
        } else {
            false
        }
    }

    /// Services currently hosted (load approximation for placement).
    pub fn service_count(&self) -> u32 {
        self.service_count.load(Ordering::Relaxed)
    }

    /// Messages waiting in the mailbox.
    pub fn mailbox_len(&self) -> usize {
        self.msg_tx.len()
    }
}

// ============================================================================
// Prefabs
// ============================================================================

/// Buffers registered for repeated sends. A prefab stays alive while any
/// in-flight message still references it (shared payload refcount).
#[derive(Debug, Default)]
pub(crate) struct Prefabs {
    next: u32,
    table: HashMap<u32, Arc<Buffer>>,
}

impl Prefabs {
    pub(crate) fn make(&mut self, buf: Buffer) -> u32 {
        loop {
            self.next = self.next.wrapping_add(1);
            if self.next != 0 && !self.table.contains_key(&self.next) {
                break;
            }
        }
        self.table.insert(self.next, Arc::new(buf));
        self.next
    }

    pub(crate) fn get(&self, id: u32) -> Option<Arc<Buffer>> {
        self.table.get(&id).cloned()
    }
}

// ============================================================================
// Service slots
// ============================================================================

/// Identity and bookkeeping kept by the worker for each service.
#[derive(Debug)]
pub(crate) struct ServiceMeta {
    pub sid: u32,
    pub name: String,
    pub unique: bool,
    pub quitting: bool,
    pub subscriptions: HashSet<u8>,
    pub mem: MemStat,
}

struct ServiceSlot {
    meta: ServiceMeta,
    svc: Box<dyn Service>,
}

// ============================================================================
// Worker
// ============================================================================

pub(crate) struct Worker {
    id: u32,
    router: Arc<Router>,
    poll: Poll,
    cmd_rx: Receiver<WorkerCommand>,
    msg_rx: Receiver<Message>,
    slots: Vec<Option<ServiceSlot>>,
    free: Vec<usize>,
    service_count: Arc<AtomicU32>,
    timers: TimerWheel,
    reactor: Reactor,
    prefabs: Prefabs,
    clock: Instant,
    stopping: bool,
}

impl Worker {
    /// Spawn a worker thread. `id` is 1-based and becomes the high 16 bits
    /// of every sid and fd this worker allocates.
    pub(crate) fn spawn(
        id: u32,
        router: Arc<Router>,
        cfg: NetConfig,
    ) -> io::Result<(WorkerHandle, JoinHandle<()>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let registry = poll.registry().try_clone()?;
        let (cmd_tx, cmd_rx) = unbounded();
        let (msg_tx, msg_rx) = unbounded();
        let service_count = Arc::new(AtomicU32::new(0));

        let handle = WorkerHandle {
            id,
            cmd_tx,
            msg_tx,
            waker,
            service_count: Arc::clone(&service_count),
        };

        let worker = Worker {
            id,
            router,
            poll,
            cmd_rx,
            msg_rx,
            slots: Vec::new(),
            free: Vec::new(),
            service_count,
            timers: TimerWheel::new(0),
            reactor: Reactor::new(id, registry, cfg, 0),
            prefabs: Prefabs::default(),
            clock: Instant::now(),
            stopping: false,
        };

        let join = thread::Builder::new()
            .name(format!("warren-worker-{}", id))
            .spawn(move || worker.run())?;

        Ok((handle, join))
    }

    fn now_ms(&self) -> i64 {
        self.clock.elapsed().as_millis() as i64
    }

    fn run(mut self) {
        log::debug!("worker {} started", self.id);
        let mut events = Events::with_capacity(MAX_EVENTS);

        loop {
            let timeout = if self.msg_rx.is_empty() {
                LOOP_PERIOD
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::error!("worker {} poll error: {}", self.id, e);
                }
                continue;
            }

            let now = self.now_ms();
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue; // queues are drained below regardless
                }
                self.reactor
                    .handle_event(event.token(), event.is_readable(), event.is_writable(), now);
            }

            self.flush_reactor();
            self.run_commands();
            self.drain_mailbox(MAILBOX_BATCH);
            self.tick_timers();
            self.reactor.tick(self.now_ms());
            self.flush_reactor();

            if self.stopping && self.msg_rx.is_empty() && self.cmd_rx.is_empty() {
                break;
            }
        }

        self.shutdown();
    }

    /// Route everything the reactor produced since the last pass.
    fn flush_reactor(&mut self) {
        for (target, adoption) in self.reactor.take_adoptions() {
            if target == self.id {
                let now = self.now_ms();
                self.reactor.adopt(adoption, now);
            } else {
                self.router
                    .worker_command(target, WorkerCommand::Adopt(adoption));
            }
        }
        let mut msgs = Vec::new();
        self.reactor.take_messages(&mut msgs);
        for msg in msgs {
            self.router.send(msg);
        }
    }

    fn run_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.stopping = true;
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: WorkerCommand) {
        let now = self.now_ms();
        match cmd {
            WorkerCommand::NewService {
                kind,
                config,
                sender,
                session,
            } => self.new_service(&kind, &config, sender, session),
            WorkerCommand::RemoveService {
                sid,
                sender,
                session,
            } => self.remove_service(sid, sender, session),
            WorkerCommand::Accept {
                listen_fd,
                session,
                owner,
            } => self.reactor.accept(listen_fd, session, owner, now),
            WorkerCommand::Adopt(adoption) => self.reactor.adopt(adoption, now),
            WorkerCommand::Read {
                fd,
                owner,
                size,
                delim,
                session,
            } => self.reactor.read(fd, owner, size, delim, session, now),
            WorkerCommand::Write { fd, buf } => {
                self.reactor.write(fd, buf, now);
            }
            WorkerCommand::CloseFd { fd } => {
                self.reactor.close(fd);
            }
            WorkerCommand::SetTimeout { fd, secs } => {
                self.reactor.settimeout(fd, secs);
            }
            WorkerCommand::SetNodelay { fd } => {
                self.reactor.setnodelay(fd);
            }
            WorkerCommand::SetFrameFlag { fd, flag } => {
                self.reactor.set_enable_frame(fd, flag);
            }
            WorkerCommand::Stop => {
                self.stopping = true;
            }
        }
    }

    fn drain_mailbox(&mut self, max: usize) {
        for _ in 0..max {
            match self.msg_rx.try_recv() {
                Ok(msg) => self.deliver(msg),
                Err(_) => break,
            }
        }
    }

    fn tick_timers(&mut self) {
        let now = self.now_ms();
        let mut fires = Vec::new();
        self.timers.update(now, &mut fires);
        for fire in fires {
            let Some(idx) = self.live_slot(fire.owner) else {
                continue;
            };
            self.with_service(idx, |svc, ctx| svc.on_timer(ctx, fire.id, fire.removed));
        }
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    fn deliver(&mut self, msg: Message) {
        if msg.receiver() == 0 {
            self.deliver_broadcast(msg);
            return;
        }

        let sid = msg.receiver();
        match self.live_slot(sid) {
            Some(idx) => self.with_service(idx, |svc, ctx| svc.dispatch(ctx, msg)),
            None => {
                if msg.session() > 0 {
                    self.router.response(
                        msg.sender(),
                        "error",
                        &format!("dead service [{:08X}]", sid),
                        -msg.session(),
                        PTYPE_ERROR,
                    );
                } else {
                    log::debug!(
                        "worker {} dropped message for dead service {:08X}",
                        self.id,
                        sid
                    );
                }
            }
        }
    }

    fn deliver_broadcast(&mut self, msg: Message) {
        let targets: Vec<(usize, u32)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let slot = slot.as_ref()?;
                if !slot.meta.quitting && slot.meta.subscriptions.contains(&msg.ptype()) {
                    Some((idx, slot.meta.sid))
                } else {
                    None
                }
            })
            .collect();

        for (idx, sid) in targets {
            let mut copy = msg.fork();
            copy.set_receiver(sid);
            self.with_service(idx, |svc, ctx| svc.dispatch(ctx, copy));
        }
    }

    /// Slot index of a live, non-quitting service; validates the full sid.
    fn live_slot(&self, sid: u32) -> Option<usize> {
        let idx = ((sid & 0xFFFF) as usize).checked_sub(1)?;
        let slot = self.slots.get(idx)?.as_ref()?;
        (slot.meta.sid == sid && !slot.meta.quitting).then_some(idx)
    }

    /// Run one hook with the slot taken out, so the hook sees a context
    /// borrowing the rest of the worker.
    fn with_service(&mut self, idx: usize, hook: impl FnOnce(&mut dyn Service, &mut ServiceContext<'_>)) {
        let Some(mut slot) = self.slots.get_mut(idx).and_then(Option::take) else {
            return;
        };
        let now_ms = self.clock.elapsed().as_millis() as i64;
        {
            let mut ctx = ServiceContext {
                worker_id: self.id,
                now_ms,
                router: &self.router,
                reactor: &mut self.reactor,
                timers: &mut self.timers,
                prefabs: &mut self.prefabs,
                meta: &mut slot.meta,
            };
            hook(slot.svc.as_mut(), &mut ctx);
        }
        if slot.meta.quitting {
            self.finish_remove(idx, slot, 0, 0);
        } else {
            self.slots[idx] = Some(slot);
        }
    }

    // ========================================================================
    // Service lifecycle
    // ========================================================================

    fn new_service(&mut self, kind: &str, config_json: &str, sender: u32, session: i32) {
        match self.try_new_service(kind, config_json) {
            Ok(sid) => {
                self.router
                    .response(sender, "", &sid.to_string(), -session, PTYPE_TEXT);
            }
            Err(e) => {
                log::error!("worker {} new service failed: {}", self.id, e);
                self.router
                    .response(sender, "error", &e.to_string(), -session, PTYPE_ERROR);
            }
        }
    }

    fn try_new_service(&mut self, kind: &str, config_json: &str) -> Result<u32> {
        let config = ServiceConfig::parse(config_json)?;
        let factory = self
            .router
            .factory(kind)
            .ok_or_else(|| Error::UnknownServiceKind(kind.to_string()))?;

        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                if self.slots.len() >= MAX_SLOTS {
                    return Err(Error::SlotExhausted(self.id));
                }
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let sid = ((idx as u32) + 1) | (self.id << WORKER_SHIFT);

        if config.unique && !self.router.set_unique_service(&config.name, sid) {
            self.free.push(idx);
            return Err(Error::UniqueNameConflict(config.name));
        }

        let mut slot = ServiceSlot {
            meta: ServiceMeta {
                sid,
                name: config.name.clone(),
                unique: config.unique,
                quitting: false,
                subscriptions: HashSet::new(),
                mem: MemStat::new(config.memlimit.unwrap_or(0) as usize),
            },
            svc: (*factory)(&config),
        };

        let now_ms = self.now_ms();
        let init_result = {
            let mut ctx = ServiceContext {
                worker_id: self.id,
                now_ms,
                router: &self.router,
                reactor: &mut self.reactor,
                timers: &mut self.timers,
                prefabs: &mut self.prefabs,
                meta: &mut slot.meta,
            };
            slot.svc.init(&mut ctx)
        };

        let failed = match init_result {
            Err(e) => Some(e),
            Ok(()) if slot.meta.quitting => {
                Some(Error::InitFailed("service quit during init".into()))
            }
            Ok(()) => None,
        };
        if let Some(e) = failed {
            if config.unique {
                self.router.remove_unique_service(&config.name, sid);
            }
            self.free.push(idx);
            return Err(e);
        }

        log::info!("[WORKER {}] new service [{}:{:08X}]", self.id, slot.meta.name, sid);

        {
            let mut ctx = ServiceContext {
                worker_id: self.id,
                now_ms,
                router: &self.router,
                reactor: &mut self.reactor,
                timers: &mut self.timers,
                prefabs: &mut self.prefabs,
                meta: &mut slot.meta,
            };
            slot.svc.start(&mut ctx);
        }

        self.service_count.fetch_add(1, Ordering::Relaxed);
        if slot.meta.quitting {
            self.finish_remove(idx, slot, 0, 0);
        } else {
            self.slots[idx] = Some(slot);
        }
        Ok(sid)
    }

    fn remove_service(&mut self, sid: u32, sender: u32, session: i32) {
        let taken = self
            .live_slot(sid)
            .and_then(|idx| self.slots[idx].take().map(|slot| (idx, slot)));
        match taken {
            Some((idx, slot)) => self.finish_remove(idx, slot, sender, session),
            None => self.router.response(
                sender,
                "error",
                &format!("dead service [{:08X}]", sid),
                -session,
                PTYPE_ERROR,
            ),
        }
    }

    /// Destroy a slot that is already out of the table.
    fn finish_remove(&mut self, idx: usize, mut slot: ServiceSlot, sender: u32, session: i32) {
        let now_ms = self.now_ms();
        {
            let mut ctx = ServiceContext {
                worker_id: self.id,
                now_ms,
                router: &self.router,
                reactor: &mut self.reactor,
                timers: &mut self.timers,
                prefabs: &mut self.prefabs,
                meta: &mut slot.meta,
            };
            slot.svc.destroy(&mut ctx);
        }
        if slot.meta.unique {
            self.router
                .remove_unique_service(&slot.meta.name, slot.meta.sid);
        }
        log::info!(
            "[WORKER {}] destroy service [{}:{:08X}]",
            self.id,
            slot.meta.name,
            slot.meta.sid
        );
        self.free.push(idx);
        self.service_count.fetch_sub(1, Ordering::Relaxed);
        self.router
            .response(sender, "", "service destroyed", -session, PTYPE_TEXT);
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    fn shutdown(mut self) {
        // one final mailbox drain
        while let Ok(msg) = self.msg_rx.try_recv() {
            self.deliver(msg);
        }
        self.flush_reactor();

        for idx in 0..self.slots.len() {
            let Some(mut slot) = self.slots[idx].take() else {
                continue;
            };
            let now_ms = self.now_ms();
            {
                let mut ctx = ServiceContext {
                    worker_id: self.id,
                    now_ms,
                    router: &self.router,
                    reactor: &mut self.reactor,
                    timers: &mut self.timers,
                    prefabs: &mut self.prefabs,
                    meta: &mut slot.meta,
                };
                slot.svc.exit(&mut ctx);
                slot.svc.destroy(&mut ctx);
            }
            if slot.meta.unique {
                self.router
                    .remove_unique_service(&slot.meta.name, slot.meta.sid);
            }
            log::info!(
                "[WORKER {}] destroy service [{}:{:08X}]",
                self.id,
                slot.meta.name,
                slot.meta.sid
            );
            self.service_count.fetch_sub(1, Ordering::Relaxed);
        }

        self.reactor.close_all();
        log::debug!("worker {} stopped", self.id);
    }
}
