//! The local name directory and the ledger of names this node owns.

use std::collections::HashMap;

use log::warn;

use crate::types::ServiceEntry;

/// Mapping from service name to the most recently written entry.
#[derive(Debug, Default)]
pub struct Directory {
    entries: HashMap<String, ServiceEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any entry with the same name.  Returns `false` for a no-op
    /// write so callers can avoid redundant peer traffic.
    pub fn upsert(&mut self, entry: ServiceEntry) -> bool {
        match self.entries.get(&entry.name) {
            Some(current) if current.location == entry.location => false,
            _ => {
                self.entries.insert(entry.name.clone(), entry);
                true
            }
        }
    }

    /// Removes `name` only while it still points at `expected_location`.
    pub fn remove(&mut self, name: &str, expected_location: &str) -> bool {
        match self.entries.get(name) {
            Some(current) if current.location == expected_location => {
                self.entries.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&ServiceEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The subset of directory entries registered through this node.
#[derive(Debug, Default)]
pub struct Ledger {
    owned: HashMap<String, ServiceEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records ownership of `entry`; returns whether anything changed.
    pub fn insert(&mut self, entry: ServiceEntry) -> bool {
        match self.owned.get(&entry.name) {
            Some(current) if current == &entry => false,
            _ => {
                self.owned.insert(entry.name.clone(), entry);
                true
            }
        }
    }

    pub fn remove(&mut self, name: &str, expected_location: &str) -> bool {
        match self.owned.get(name) {
            Some(current) if current.location == expected_location => {
                self.owned.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn owns(&self, name: &str) -> bool {
        self.owned.contains_key(name)
    }

    pub fn location_of(&self, name: &str) -> Option<&str> {
        self.owned.get(name).map(|entry| entry.location.as_str())
    }

    /// Snapshot of everything this node manages, sorted by name.
    pub fn all_owned(&self) -> Vec<ServiceEntry> {
        let mut owned: Vec<ServiceEntry> = self.owned.values().cloned().collect();
        owned.sort_by(|a, b| a.name.cmp(&b.name));
        owned
    }

    pub fn len(&self) -> usize {
        self.owned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
    }
}

/// Directory and ledger together, as handed to peer connections.
///
/// Entries evicted because a peer rejected them are collected in
/// `evicted` until the coordinator fans the removal out to other peers.
#[derive(Debug, Default)]
pub struct Registry {
    pub directory: Directory,
    pub ledger: Ledger,
    evicted: Vec<(String, ServiceEntry)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<&ServiceEntry> {
        self.directory.lookup(name)
    }

    pub fn all_owned(&self) -> Vec<ServiceEntry> {
        self.ledger.all_owned()
    }

    /// Merges an entry learned from a peer.  Names owned here under a
    /// different location are left alone so the ledger stays consistent.
    pub fn on_remote_learned(&mut self, name: &str, location: &str) -> bool {
        if let Some(owned) = self.ledger.location_of(name) {
            if owned != location {
                warn!(
                    "Ignoring remote entry {} -> {}: owned locally at {}",
                    name,
                    location,
                    owned
                );
                return false;
            }
        }
        self.directory.upsert(ServiceEntry::new(name, location))
    }

    /// Drops an owned entry after `peer` refused it.
    pub fn evict_rejected(&mut self, peer: &str, entry: &ServiceEntry) {
        if self.ledger.remove(&entry.name, &entry.location) {
            self.directory.remove(&entry.name, &entry.location);
            self.evicted.push((peer.to_string(), entry.clone()));
        }
    }

    pub(crate) fn take_evicted(&mut self) -> Vec<(String, ServiceEntry)> {
        std::mem::take(&mut self.evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, location: &str) -> ServiceEntry {
        ServiceEntry::new(name, location)
    }

    #[test]
    fn upsert_reports_only_real_changes() {
        let mut dir = Directory::new();
        assert!(dir.upsert(entry("svc1", "host:1")));
        assert!(!dir.upsert(entry("svc1", "host:1")));
        assert!(dir.upsert(entry("svc1", "host:2")));
        assert_eq!(dir.lookup("svc1"), Some(&entry("svc1", "host:2")));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn remove_requires_matching_location() {
        let mut dir = Directory::new();
        dir.upsert(entry("svc1", "host:2"));
        assert!(!dir.remove("svc1", "host:1"));
        assert!(dir.lookup("svc1").is_some());
        assert!(dir.remove("svc1", "host:2"));
        assert!(dir.lookup("svc1").is_none());
        assert!(!dir.remove("svc1", "host:2"));
    }

    #[test]
    fn ledger_snapshot_is_sorted() {
        let mut ledger = Ledger::new();
        ledger.insert(entry("b", "host:2"));
        ledger.insert(entry("a", "host:1"));
        assert!(!ledger.insert(entry("a", "host:1")));
        let owned = ledger.all_owned();
        assert_eq!(owned, vec![entry("a", "host:1"), entry("b", "host:2")]);
        assert_eq!(ledger.location_of("b"), Some("host:2"));
    }

    #[test]
    fn remote_entries_do_not_override_owned_names() {
        let mut reg = Registry::new();
        reg.ledger.insert(entry("svc1", "host:1"));
        reg.directory.upsert(entry("svc1", "host:1"));

        assert!(!reg.on_remote_learned("svc1", "elsewhere:9"));
        assert_eq!(reg.lookup("svc1"), Some(&entry("svc1", "host:1")));

        assert!(reg.on_remote_learned("svc2", "elsewhere:9"));
        assert!(!reg.ledger.owns("svc2"));
    }

    #[test]
    fn eviction_is_recorded_once() {
        let mut reg = Registry::new();
        reg.ledger.insert(entry("svc1", "host:1"));
        reg.directory.upsert(entry("svc1", "host:1"));

        reg.evict_rejected("b", &entry("svc1", "host:1"));
        reg.evict_rejected("b", &entry("svc1", "host:1"));

        assert!(reg.ledger.is_empty());
        assert!(reg.directory.is_empty());
        assert_eq!(
            reg.take_evicted(),
            vec![("b".to_string(), entry("svc1", "host:1"))]
        );
        assert!(reg.take_evicted().is_empty());
    }
}
