//! Thread-safe, swappable view of the loaded networks.
//!
//! The registry publishes immutable snapshots: a reload builds a complete new
//! `name → network` map and swaps the pointer, so readers either see the old
//! world or the new one, never a mix. Readers copy the `Arc` under a short
//! read lock and keep using their copy for the duration of an operation even
//! if a swap happens underneath.

use crate::config::Network;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One immutable view of the registry.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    /// Loaded networks by name.
    pub networks: HashMap<String, Arc<Network>>,
    /// Effective default network name; empty when none is available.
    pub default_name: String,
}

impl RegistrySnapshot {
    /// Looks a network up by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<Network>> {
        self.networks.get(name).cloned()
    }

    /// Returns the default network when one is both named and present.
    pub fn default_network(&self) -> Option<Arc<Network>> {
        if self.default_name.is_empty() {
            return None;
        }
        self.lookup(&self.default_name)
    }

    /// True when no networks are loaded at all.
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

/// The swappable snapshot holder.
#[derive(Debug)]
pub struct NetworkRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl NetworkRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Atomically replaces the snapshot. Snapshots already handed out stay
    /// valid for their holders.
    pub fn replace(&self, snapshot: RegistrySnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        Self::new()
    }
}
