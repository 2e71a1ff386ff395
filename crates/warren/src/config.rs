// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service configuration (JSON) and network tunables.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Service configuration, parsed from the JSON string handed to
/// `new_service`.
///
/// `name` is required; everything else is optional and unknown keys are kept
/// in `extra` for service implementations to consume.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name (also the registry key for unique services).
    pub name: String,

    /// Entry file for scripted services; opaque to the core.
    #[serde(default)]
    pub file: Option<String>,

    /// Hard memory limit in bytes (0 or absent = unlimited).
    #[serde(default)]
    pub memlimit: Option<u64>,

    /// Register the name in the unique-service registry.
    #[serde(default)]
    pub unique: bool,

    /// Additional module search path fragment.
    #[serde(default)]
    pub path: Option<String>,

    /// Additional native module search path fragment.
    #[serde(default)]
    pub cpath: Option<String>,

    /// Pass-through keys for the service implementation.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServiceConfig {
    /// Parse a config JSON string.
    pub fn parse(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        if cfg.name.is_empty() {
            return Err(Error::ConfigParse("service name is empty".into()));
        }
        Ok(cfg)
    }

    /// Module search path: the config fragment plus the boot-time `PATH`
    /// environment entry.
    pub fn search_path(&self, env_path: &str) -> String {
        let mut s = self.path.clone().unwrap_or_default();
        s.push_str(env_path);
        s
    }

    /// Native search path: the config fragment plus the boot-time `CPATH`
    /// environment entry.
    pub fn search_cpath(&self, env_cpath: &str) -> String {
        let mut s = self.cpath.clone().unwrap_or_default();
        s.push_str(env_cpath);
        s
    }
}

/// Network reactor tunables, one instance per worker.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Ceiling for one length-prefixed frame, delimited line, or WebSocket
    /// message. Incoming data beyond it closes the connection.
    pub max_frame_size: usize,

    /// Send queue depth that triggers a warning log.
    pub warn_send_queue: usize,

    /// Send queue depth that closes the connection.
    pub max_send_queue: usize,

    /// Listener backlog.
    pub listen_backlog: i32,

    /// Cadence of the idle-connection sweep, milliseconds.
    pub sweep_interval_ms: i64,

    /// Cap on the buffered WebSocket handshake request.
    pub handshake_limit: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_frame_size: u16::MAX as usize,
            warn_send_queue: 512,
            max_send_queue: 2048,
            listen_backlog: 1024,
            sweep_interval_ms: 10_000,
            handshake_limit: 8 * 1024,
        }
    }
}

impl NetConfig {
    /// Builder: frame/line/message ceiling.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Builder: send queue watermarks.
    pub fn with_send_queue(mut self, warn: usize, max: usize) -> Self {
        self.warn_send_queue = warn;
        self.max_send_queue = max;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.max_frame_size == 0 {
            return Err("max_frame_size must be > 0");
        }
        if self.max_frame_size > u16::MAX as usize {
            return Err("max_frame_size cannot exceed the 2-byte length prefix");
        }
        if self.warn_send_queue == 0 || self.max_send_queue < self.warn_send_queue {
            return Err("send queue watermarks must satisfy 0 < warn <= max");
        }
        if self.sweep_interval_ms <= 0 {
            return Err("sweep_interval_ms must be > 0");
        }
        Ok(())
    }
}
