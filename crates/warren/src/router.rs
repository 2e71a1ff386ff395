// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global directory: worker selection, unique names, environment map.
//!
//! The router never looks at message payloads. It decodes the owning worker
//! from the high 16 bits of the receiver id and enqueues into that worker's
//! mailbox; everything else it keeps is read-mostly shared state (unique
//! name registry, environment map, service factories) behind RwLocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::buffer::Buffer;
use crate::config::ServiceConfig;
use crate::error::Error;
use crate::message::{worker_of, Message, PTYPE_ERROR, PTYPE_TEXT};
use crate::service::{Service, ServiceFactory};
use crate::worker::{WorkerCommand, WorkerHandle};

/// Process-wide service directory and message switch.
pub struct Router {
    workers: OnceLock<Vec<WorkerHandle>>,
    unique: RwLock<HashMap<String, u32>>,
    env: RwLock<HashMap<String, String>>,
    factories: RwLock<HashMap<String, Arc<ServiceFactory>>>,
    round_robin: AtomicU32,
    stop_flag: AtomicBool,
}

impl Router {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            workers: OnceLock::new(),
            unique: RwLock::new(HashMap::new()),
            env: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            round_robin: AtomicU32::new(0),
            stop_flag: AtomicBool::new(false),
        })
    }

    /// Install the worker handles. Called once before any traffic flows.
    pub(crate) fn set_workers(&self, workers: Vec<WorkerHandle>) {
        if self.workers.set(workers).is_err() {
            log::error!("router workers installed twice");
        }
    }

    fn workers(&self) -> &[WorkerHandle] {
        self.workers.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.workers().len()
    }

    /// Total services across all workers.
    pub fn service_count(&self) -> u32 {
        self.workers().iter().map(WorkerHandle::service_count).sum()
    }

    // ========================================================================
    // Factories
    // ========================================================================

    /// Register a factory for a service kind.
    pub fn register_factory<F>(&self, kind: &str, factory: F)
    where
        F: Fn(&ServiceConfig) -> Box<dyn Service> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(kind.to_string(), Arc::new(factory));
    }

    pub(crate) fn factory(&self, kind: &str) -> Option<Arc<ServiceFactory>> {
        self.factories.read().get(kind).cloned()
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Route a message to the worker owning its receiver.
    ///
    /// Invalid worker indices drop the message (logged). Dead slots are
    /// detected by the receiving worker, which answers sessions > 0 with a
    /// dead-service error.
    pub fn send(&self, msg: Message) -> bool {
        let receiver = msg.receiver();
        if receiver == 0 {
            log::warn!("send without receiver dropped (use broadcast)");
            return false;
        }
        let widx = worker_of(receiver) as usize;
        let workers = self.workers();
        if widx == 0 || widx > workers.len() {
            log::warn!(
                "message for {:08X} dropped: no worker {}",
                receiver,
                widx
            );
            return false;
        }
        workers[widx - 1].push(msg);
        true
    }

    /// Session-guarded reply. `session` is sent as given (callers negate the
    /// request session); session 0 means nothing is waiting, so no-op.
    pub fn response(&self, receiver: u32, header: &str, data: &str, session: i32, ptype: u8) {
        if session == 0 || receiver == 0 {
            return;
        }
        let mut msg = Message::text(data);
        msg.set_sender(0);
        msg.set_receiver(receiver);
        msg.set_header(header);
        msg.set_session(session);
        msg.set_ptype(ptype);
        self.send(msg);
    }

    /// Deliver a payload to every service subscribed to `ptype`, at most
    /// once per subscriber. Ordering across workers is unspecified.
    pub fn broadcast(&self, payload: Buffer, header: &str, ptype: u8, sender: u32) {
        let shared = Arc::new(payload);
        for worker in self.workers() {
            let mut msg = Message::with_shared(Arc::clone(&shared));
            msg.set_sender(sender);
            msg.set_receiver(0);
            msg.set_header(header);
            msg.set_ptype(ptype);
            worker.push(msg);
        }
    }

    pub(crate) fn worker_command(&self, workerid: u32, cmd: WorkerCommand) -> bool {
        let widx = workerid as usize;
        let workers = self.workers();
        if widx == 0 || widx > workers.len() {
            log::warn!("command for invalid worker {} dropped", workerid);
            return false;
        }
        workers[widx - 1].command(cmd)
    }

    // ========================================================================
    // Service placement
    // ========================================================================

    /// Spawn a service. `workerid` 0 picks the least-loaded worker
    /// (service count, round-robin tiebreak); otherwise the service is
    /// forced onto that worker. The new sid answers via the session.
    pub fn new_service(&self, workerid: u32, kind: &str, config: &str, sender: u32, session: i32) {
        let workers = self.workers();
        if workers.is_empty() {
            log::error!("new_service before router init");
            return;
        }

        let target = if workerid == 0 {
            let start = self.round_robin.fetch_add(1, Ordering::Relaxed) as usize % workers.len();
            let mut best = start;
            let mut best_load = u32::MAX;
            for i in 0..workers.len() {
                let idx = (start + i) % workers.len();
                let load = workers[idx].service_count();
                if load < best_load {
                    best_load = load;
                    best = idx;
                }
            }
            best
        } else {
            let widx = workerid as usize;
            if widx > workers.len() {
                let err = Error::InvalidWorker(workerid);
                log::error!("new_service: {}", err);
                self.response(sender, "error", &err.to_string(), -session, PTYPE_ERROR);
                return;
            }
            widx - 1
        };

        workers[target].command(WorkerCommand::NewService {
            kind: kind.to_string(),
            config: config.to_string(),
            sender,
            session,
        });
    }

    /// Remove a service; confirmation or error answers via the session.
    pub fn remove_service(&self, sid: u32, sender: u32, session: i32) {
        if !self.worker_command(
            worker_of(sid),
            WorkerCommand::RemoveService {
                sid,
                sender,
                session,
            },
        ) {
            self.response(
                sender,
                "error",
                &Error::DeadService(sid).to_string(),
                -session,
                PTYPE_ERROR,
            );
        }
    }

    // ========================================================================
    // Unique names
    // ========================================================================

    /// Register a unique service name. Returns false when the name is
    /// already taken.
    pub fn set_unique_service(&self, name: &str, sid: u32) -> bool {
        let mut unique = self.unique.write();
        if unique.contains_key(name) {
            return false;
        }
        unique.insert(name.to_string(), sid);
        true
    }

    /// Look up a unique service; 0 when unregistered.
    pub fn get_unique_service(&self, name: &str) -> u32 {
        self.unique.read().get(name).copied().unwrap_or(0)
    }

    pub(crate) fn remove_unique_service(&self, name: &str, sid: u32) {
        let mut unique = self.unique.write();
        if unique.get(name) == Some(&sid) {
            unique.remove(name);
        }
    }

    // ========================================================================
    // Environment
    // ========================================================================

    /// Read a process-wide environment entry.
    pub fn get_env(&self, key: &str) -> Option<String> {
        self.env.read().get(key).cloned()
    }

    /// Write a process-wide environment entry.
    pub fn set_env(&self, key: &str, value: &str) {
        self.env.write().insert(key.to_string(), value.to_string());
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Request a server-wide stop.
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Execute an administrative command; the result answers via the
    /// session. Supported: `wstate`, `service_count`,
    /// `set_loglevel <level>`, `abort`.
    pub fn runcmd(&self, cmd: &str, sender: u32, session: i32) {
        let mut parts = cmd.split_whitespace();
        match parts.next() {
            Some("wstate") => {
                let snapshot: Vec<serde_json::Value> = self
                    .workers()
                    .iter()
                    .map(|w| {
                        serde_json::json!({
                            "worker": w.id,
                            "services": w.service_count(),
                            "mqsize": w.mailbox_len(),
                        })
                    })
                    .collect();
                let body = serde_json::Value::Array(snapshot).to_string();
                self.response(sender, "", &body, -session, PTYPE_TEXT);
            }
            Some("service_count") => {
                self.response(
                    sender,
                    "",
                    &self.service_count().to_string(),
                    -session,
                    PTYPE_TEXT,
                );
            }
            Some("set_loglevel") => match parts.next().and_then(crate::logging::parse_level) {
                Some(level) => {
                    crate::logging::set_level(level);
                    log::info!("log level set to {}", level);
                    self.response(sender, "", "ok", -session, PTYPE_TEXT);
                }
                None => {
                    self.response(sender, "error", "invalid log level", -session, PTYPE_ERROR);
                }
            },
            Some("abort") => {
                log::warn!("abort requested by {:08X}", sender);
                self.request_stop();
                self.response(sender, "", "ok", -session, PTYPE_TEXT);
            }
            _ => {
                self.response(
                    sender,
                    "error",
                    &format!("unknown command: {}", cmd),
                    -session,
                    PTYPE_ERROR,
                );
            }
        }
    }
}
