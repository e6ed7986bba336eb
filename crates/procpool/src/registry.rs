//! Process registry
//!
//! Live units record their pid under a key derived from their identity.
//! The registry is shared by every unit of a server, so implementations
//! must make `set` and `delete` atomic per key.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Registry access errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The backing store rejected or could not perform the operation
    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

/// Fixed-size registry key: MD5 digest of a unit identity in lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistryKey(String);

impl RegistryKey {
    /// Derive the key for a unit identity
    pub fn for_identity(identity: &str) -> Self {
        Self(format!("{:x}", md5::compute(identity.as_bytes())))
    }

    /// Hex representation of the key
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runtime metadata recorded for a started unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    /// OS process id of the unit
    pub pid: u32,
}

/// Concurrent keyed store of live units
pub trait ProcessRegistry: Send + Sync {
    /// Insert or replace the entry for `key`
    fn set(&self, key: &RegistryKey, entry: ProcessEntry) -> Result<(), RegistryError>;

    /// Remove the entry for `key`, returning whether one existed
    fn delete(&self, key: &RegistryKey) -> Result<bool, RegistryError>;

    /// Look up the entry for `key`
    fn get(&self, key: &RegistryKey) -> Option<ProcessEntry>;

    /// Number of live entries
    fn len(&self) -> usize;

    /// Whether the registry holds no entries
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory registry backed by a sharded concurrent map
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    entries: DashMap<RegistryKey, ProcessEntry>,
}

impl InMemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<(RegistryKey, ProcessEntry)> {
        self.entries
            .iter()
            .map(|item| (item.key().clone(), *item.value()))
            .collect()
    }
}

impl ProcessRegistry for InMemoryRegistry {
    fn set(&self, key: &RegistryKey, entry: ProcessEntry) -> Result<(), RegistryError> {
        self.entries.insert(key.clone(), entry);
        Ok(())
    }

    fn delete(&self, key: &RegistryKey) -> Result<bool, RegistryError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn get(&self, key: &RegistryKey) -> Option<ProcessEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_md5_hex() {
        assert_eq!(
            RegistryKey::for_identity("").as_str(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            RegistryKey::for_identity("abc").as_str(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn test_key_is_fixed_size() {
        let long = "w".repeat(10_000);
        assert_eq!(RegistryKey::for_identity(&long).as_str().len(), 32);
        assert_eq!(RegistryKey::for_identity("a").as_str().len(), 32);
    }

    #[test]
    fn test_set_get_delete() {
        let registry = InMemoryRegistry::new();
        let key = RegistryKey::for_identity("worker-a");

        registry.set(&key, ProcessEntry { pid: 42 }).unwrap();
        assert_eq!(registry.get(&key), Some(ProcessEntry { pid: 42 }));
        assert_eq!(registry.len(), 1);

        assert!(registry.delete(&key).unwrap());
        assert!(!registry.delete(&key).unwrap());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_replaces_entry() {
        let registry = InMemoryRegistry::new();
        let key = RegistryKey::for_identity("worker-a");

        registry.set(&key, ProcessEntry { pid: 1 }).unwrap();
        registry.set(&key, ProcessEntry { pid: 2 }).unwrap();

        assert_eq!(registry.entries(), vec![(key, ProcessEntry { pid: 2 })]);
    }
}
