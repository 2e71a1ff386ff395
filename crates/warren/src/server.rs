// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server: wall clock, lifecycle, worker supervision.
//!
//! The server constructs the router and workers, refreshes the shared wall
//! clock while running, and coordinates shutdown: each worker drains its
//! mailbox one final time, destroys its services, then exits.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{NetConfig, ServiceConfig};
use crate::error::Result;
use crate::router::Router;
use crate::service::Service;
use crate::worker::{Worker, WorkerCommand};

/// Server lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Ready,
    Stopping,
    Exited,
}

/// Owns the router and all worker threads.
pub struct Server {
    router: Arc<Router>,
    joins: Vec<JoinHandle<()>>,
    now_ms: AtomicI64,
    state: State,
}

impl Server {
    /// Construct `worker_num` workers (at least one) and start their
    /// threads. `logpath` adds a file output next to the console log.
    pub fn init(worker_num: usize, logpath: Option<&str>) -> Result<Self> {
        Self::init_with_config(worker_num, logpath, NetConfig::default())
    }

    /// Like [`Server::init`] with explicit network tunables.
    pub fn init_with_config(
        worker_num: usize,
        logpath: Option<&str>,
        cfg: NetConfig,
    ) -> Result<Self> {
        crate::logging::init(logpath)?;
        if let Err(msg) = cfg.validate() {
            return Err(crate::error::Error::ConfigParse(msg.to_string()));
        }

        let router = Router::new();

        // boot-time environment entries consumed by service search paths
        for key in ["PATH", "CPATH"] {
            if let Ok(value) = std::env::var(key) {
                router.set_env(key, &value);
            }
        }

        let count = worker_num.max(1);
        let mut handles = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);
        for id in 1..=count as u32 {
            let (handle, join) = Worker::spawn(id, Arc::clone(&router), cfg.clone())?;
            handles.push(handle);
            joins.push(join);
        }
        router.set_workers(handles);

        log::info!("server initialized with {} workers", count);
        Ok(Self {
            router,
            joins,
            now_ms: AtomicI64::new(wall_ms()),
            state: State::Init,
        })
    }

    /// The shared router.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Register a service factory under a kind name.
    pub fn register<F>(&self, kind: &str, factory: F)
    where
        F: Fn(&ServiceConfig) -> Box<dyn Service> + Send + Sync + 'static,
    {
        self.router.register_factory(kind, factory);
    }

    /// Spawn a service (see [`Router::new_service`]).
    pub fn new_service(&self, workerid: u32, kind: &str, config: &str, sender: u32, session: i32) {
        self.router.new_service(workerid, kind, config, sender, session);
    }

    /// Total live services.
    pub fn service_count(&self) -> u32 {
        self.router.service_count()
    }

    /// Wall clock in milliseconds since the epoch. Refreshed once per tick
    /// while running; `sync` forces a fresh reading.
    pub fn now(&self, sync: bool) -> i64 {
        if sync {
            let ms = wall_ms();
            self.now_ms.store(ms, Ordering::Relaxed);
            ms
        } else {
            self.now_ms.load(Ordering::Relaxed)
        }
    }

    /// Block the calling thread, updating the clock, until a stop is
    /// requested, then shut everything down.
    pub fn run(&mut self) {
        self.state = State::Ready;
        log::info!("server running");
        while !self.router.stop_requested() {
            self.now_ms.store(wall_ms(), Ordering::Relaxed);
            std::thread::sleep(Duration::from_millis(10));
        }
        self.shutdown();
    }

    /// Request a stop; `run` (or `shutdown`) completes it.
    pub fn stop(&self) {
        self.router.request_stop();
    }

    /// Stop all workers and join their threads.
    pub fn shutdown(&mut self) {
        if self.state == State::Exited {
            return;
        }
        self.state = State::Stopping;
        self.router.request_stop();
        for id in 1..=self.router.worker_count() as u32 {
            self.router.worker_command(id, WorkerCommand::Stop);
        }
        for join in self.joins.drain(..) {
            if join.join().is_err() {
                log::error!("worker thread panicked during shutdown");
            }
        }
        self.state = State::Exited;
        log::info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wall_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Calendar helper
// ============================================================================

/// Calendar fields of a UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateParts {
    pub year: u32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

/// Split a unix timestamp (seconds) into calendar fields.
///
/// Timestamps before the epoch clamp to it.
pub fn date_parts(unix_secs: i64) -> DateParts {
    let secs = unix_secs.max(0) as u64;
    let days = secs / 86_400;
    let rem = secs % 86_400;

    let (year, month, day) = days_to_date(days);
    DateParts {
        year,
        month,
        day,
        hour: (rem / 3_600) as u32,
        minute: (rem % 3_600 / 60) as u32,
        second: (rem % 60) as u32,
    }
}

fn days_to_date(days: u64) -> (u32, u32, u32) {
    let mut year = 1970u32;
    let mut remaining = days;
    loop {
        let in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining < in_year {
            break;
        }
        remaining -= in_year;
        year += 1;
    }

    let lengths: [u64; 12] = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1u32;
    for len in lengths {
        if remaining < len {
            break;
        }
        remaining -= len;
        month += 1;
    }

    (year, month, remaining as u32 + 1)
}

/// Gregorian leap year test.
pub fn is_leap_year(year: u32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}
