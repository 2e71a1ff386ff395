// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Log sink behind the [`log`] facade.
//!
//! The runtime logs through the standard `log` macros; this module supplies
//! the sink: an [`Output`] trait with console and file backends, and a global
//! logger with a runtime-adjustable level filter. Install it once early via
//! [`init`] (the [`Server`](crate::server::Server) does this); the
//! `set_loglevel` admin command adjusts the filter while running.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Output destination for formatted log lines.
///
/// Implementations must be thread-safe and handle write errors gracefully.
pub trait Output: Send + Sync {
    /// Write one formatted line (no trailing newline).
    fn write(&self, line: &str) -> io::Result<()>;

    /// Flush any buffered output.
    fn flush(&self) -> io::Result<()>;
}

/// Console output, writing to stderr.
pub struct ConsoleOutput;

impl Output for ConsoleOutput {
    fn write(&self, line: &str) -> io::Result<()> {
        eprintln!("{}", line);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// File output, appending to a log file.
///
/// Thread-safe via an internal mutex protecting the file handle.
pub struct FileOutput {
    file: Mutex<std::fs::File>,
}

impl FileOutput {
    /// Open (or create) the log file at `path` in append mode.
    pub fn new(path: &str) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl Output for FileOutput {
    fn write(&self, line: &str) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file mutex poisoned"))?;
        writeln!(file, "{}", line)
    }

    fn flush(&self) -> io::Result<()> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("log file mutex poisoned"))?
            .flush()
    }
}

struct Sink {
    outputs: Vec<Box<dyn Output>>,
    // log::LevelFilter encoded as usize so the admin command can swap it
    // without taking a lock on the hot path.
    filter: AtomicUsize,
}

static SINK: OnceLock<Sink> = OnceLock::new();

fn filter_from_usize(v: usize) -> log::LevelFilter {
    match v {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

struct Facade;

impl log::Log for Facade {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        match SINK.get() {
            Some(sink) => {
                metadata.level() <= filter_from_usize(sink.filter.load(Ordering::Relaxed))
            }
            None => false,
        }
    }

    fn log(&self, record: &log::Record<'_>) {
        let Some(sink) = SINK.get() else { return };
        if record.level() > filter_from_usize(sink.filter.load(Ordering::Relaxed)) {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let line = format!(
            "{}.{:03} {:5} {}",
            now.as_secs(),
            now.subsec_millis(),
            record.level(),
            record.args()
        );
        for out in &sink.outputs {
            let _ = out.write(&line);
        }
    }

    fn flush(&self) {
        if let Some(sink) = SINK.get() {
            for out in &sink.outputs {
                let _ = out.flush();
            }
        }
    }
}

static FACADE: Facade = Facade;

/// Initialize the global logger with a console output and, when `logpath`
/// is given, a file output as well.
///
/// Safe to call more than once; later calls are ignored (useful in tests
/// where several servers start in one process).
pub fn init(logpath: Option<&str>) -> io::Result<()> {
    let mut outputs: Vec<Box<dyn Output>> = vec![Box::new(ConsoleOutput)];
    if let Some(path) = logpath {
        outputs.push(Box::new(FileOutput::new(path)?));
    }

    if SINK
        .set(Sink {
            outputs,
            filter: AtomicUsize::new(log::LevelFilter::Info as usize),
        })
        .is_ok()
    {
        let _ = log::set_logger(&FACADE);
        log::set_max_level(log::LevelFilter::Trace);
    }
    Ok(())
}

/// Change the runtime level filter.
pub fn set_level(filter: log::LevelFilter) {
    if let Some(sink) = SINK.get() {
        sink.filter.store(filter as usize, Ordering::Relaxed);
    }
}

/// Parse a level name as used by the `set_loglevel` admin command.
pub fn parse_level(name: &str) -> Option<log::LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "off" => Some(log::LevelFilter::Off),
        "error" => Some(log::LevelFilter::Error),
        "warn" | "warning" => Some(log::LevelFilter::Warn),
        "info" => Some(log::LevelFilter::Info),
        "debug" => Some(log::LevelFilter::Debug),
        "trace" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}
