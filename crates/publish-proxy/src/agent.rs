//! Agent bookkeeping: the registry of running helpers and the port allow-list.
//!
//! The registry is keyed by the absolute notebook path and is only touched by
//! the launcher. Each key has its own lock, so launches for different
//! notebooks run independently. The allow-list is shared with the proxy, which consults it
//! before forwarding anything to a local port.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, RwLock};

use log::warn;
use tokio::process::Child;
use tokio::sync::Mutex;

/// A running (or previously running) publishing agent.
#[derive(Debug)]
pub struct Agent {
    /// The helper process. Spawned with `kill_on_drop`, so dropping the
    /// agent terminates it.
    process: Child,
    /// Connection URL reported on the helper's first stdout line.
    url: String,
    /// Port parsed from `url`.
    port: u16,
}

impl Agent {
    pub fn new(process: Child, url: String, port: u16) -> Self {
        Self { process, url, port }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Process ID of the helper, if it has not been reaped yet.
    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    /// Exit status of the helper, or `None` while it is still running.
    ///
    /// A failure to query the process is reported as "still running": the
    /// caller would otherwise start a second helper for the same notebook.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.process.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("[agent] Failed to query helper on port {}: {}", self.port, e);
                None
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.exit_status().is_none()
    }
}

/// The agent for one resource key. Empty until the first successful launch
/// and after a failed relaunch.
///
/// A launch holds the slot's lock from the liveness check until the new
/// agent is stored, so one key never has two helpers starting at once.
pub type AgentSlot = Arc<Mutex<Option<Agent>>>;

/// Agent slots by resource key (absolute notebook path).
///
/// The map itself is only locked to look up or create a slot; a slow launch
/// holds its own slot and leaves the other keys free.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    slots: HashMap<PathBuf, AgentSlot>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot for `resource_key`, created empty on first use.
    pub fn slot(&mut self, resource_key: &Path) -> AgentSlot {
        self.slots
            .entry(resource_key.to_path_buf())
            .or_default()
            .clone()
    }

    pub fn get(&self, resource_key: &Path) -> Option<AgentSlot> {
        self.slots.get(resource_key).cloned()
    }

    /// Snapshot of every slot, for callers that need to inspect them
    /// without keeping the map locked.
    pub fn slots(&self) -> Vec<AgentSlot> {
        self.slots.values().cloned().collect()
    }

    /// Number of keys that have been launched at least once.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Ports that the proxy is permitted to forward to.
///
/// Only successful launches add ports; nothing removes them.
#[derive(Debug, Default)]
pub struct PortAllowList {
    ports: RwLock<HashSet<u16>>,
}

impl PortAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow a port. Returns `false` if it was already allowed.
    pub fn insert(&self, port: u16) -> bool {
        self.ports
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&port)
    }

    pub fn len(&self) -> usize {
        self.ports
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
