// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for runtime operations.

use std::fmt;
use std::io;

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the runtime core.
#[derive(Debug)]
pub enum Error {
    /// Service configuration could not be parsed
    ConfigParse(String),

    /// A unique service name was registered twice
    UniqueNameConflict(String),

    /// Message addressed to a service that does not exist
    DeadService(u32),

    /// No factory registered for the requested service kind
    UnknownServiceKind(String),

    /// Worker index decoded from an id does not name a live worker
    InvalidWorker(u32),

    /// A worker ran out of service slots
    SlotExhausted(u32),

    /// Per-service memory limit exceeded
    MemoryLimit {
        /// Bytes the service would hold after the allocation
        used: usize,
        /// Configured hard limit
        limit: usize,
    },

    /// Service init hook failed
    InitFailed(String),

    /// Underlying I/O error
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigParse(msg) => write!(f, "config parse failed: {}", msg),
            Self::UniqueNameConflict(name) => {
                write!(f, "unique service name {} repeated", name)
            }
            Self::DeadService(sid) => write!(f, "dead service [{:08X}]", sid),
            Self::UnknownServiceKind(kind) => write!(f, "unknown service kind: {}", kind),
            Self::InvalidWorker(id) => write!(f, "invalid worker index in id {:08X}", id),
            Self::SlotExhausted(worker) => {
                write!(f, "worker {} has no free service slots", worker)
            }
            Self::MemoryLimit { used, limit } => {
                write!(f, "memory limit exceeded: {} > {} bytes", used, limit)
            }
            Self::InitFailed(msg) => write!(f, "service init failed: {}", msg),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::ConfigParse(e.to_string())
    }
}
