//! Durable storage for relationship state and leases.
//!
//! The failover engine writes through the [`Storage`] trait and commits
//! explicitly; nothing it writes counts as durable until `commit` returns
//! `Ok`. [`JsonStorage`] keeps a JSON snapshot on disk, [`MemoryStorage`]
//! keeps it in memory and can be told to fail.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::state::FailoverState;

/// Persisted view of one relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub name: String,
    pub local_state: FailoverState,
    pub local_stos: i64,
    pub partner_state: FailoverState,
    pub partner_stos: i64,
    pub mclt: u32,
}

/// Everything that survives a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub states: BTreeMap<String, StateRecord>,
    #[serde(default)]
    pub leases: BTreeMap<Ipv4Addr, Lease>,
}

impl Snapshot {
    fn merge(&mut self, pending: Snapshot) {
        self.states.extend(pending.states);
        self.leases.extend(pending.leases);
    }
}

/// Durable storage used by the failover engine.
pub trait Storage {
    fn write_state(&mut self, record: &StateRecord) -> Result<()>;
    fn write_lease(&mut self, lease: &Lease) -> Result<()>;
    /// Makes every write since the last commit durable.
    fn commit(&mut self) -> Result<()>;
    /// Drops every write since the last commit.
    fn discard(&mut self);
    /// The last committed snapshot.
    fn snapshot(&self) -> &Snapshot;
}

/// Snapshot storage in a JSON file.
///
/// Commits write to a temporary file and rename it over the old one, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug)]
pub struct JsonStorage {
    path: PathBuf,
    committed: Snapshot,
    pending: Snapshot,
    dirty: bool,
}

impl JsonStorage {
    /// Opens the snapshot at `path`, starting empty if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let committed = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Snapshot::default()
        };

        Ok(Self {
            path,
            committed,
            pending: Snapshot::default(),
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for JsonStorage {
    fn write_state(&mut self, record: &StateRecord) -> Result<()> {
        self.pending.states.insert(record.name.clone(), record.clone());
        self.dirty = true;
        Ok(())
    }

    fn write_lease(&mut self, lease: &Lease) -> Result<()> {
        self.pending.leases.insert(lease.ip_address, lease.clone());
        self.dirty = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let mut next = self.committed.clone();
        next.merge(self.pending.clone());

        let content = serde_json::to_string_pretty(&next)?;
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &self.path)?;

        debug!(
            "Committed {} relationship state(s) and {} lease(s) to {}",
            next.states.len(),
            next.leases.len(),
            self.path.display()
        );

        self.committed = next;
        self.discard();
        Ok(())
    }

    fn discard(&mut self) {
        self.pending = Snapshot::default();
        self.dirty = false;
    }

    fn snapshot(&self) -> &Snapshot {
        &self.committed
    }
}

/// In-memory storage for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    committed: Snapshot,
    pending: Snapshot,
    /// Make every write and commit fail.
    pub fail_writes: bool,
    /// Accept writes but fail every commit.
    pub fail_commits: bool,
    /// Number of successful commits that wrote something.
    pub commits: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self) -> Result<()> {
        if self.fail_writes {
            return Err(Error::Persistence("storage is failing writes".to_string()));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn write_state(&mut self, record: &StateRecord) -> Result<()> {
        self.check()?;
        self.pending.states.insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn write_lease(&mut self, lease: &Lease) -> Result<()> {
        self.check()?;
        self.pending.leases.insert(lease.ip_address, lease.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.check()?;
        if self.pending.states.is_empty() && self.pending.leases.is_empty() {
            return Ok(());
        }
        if self.fail_commits {
            return Err(Error::Persistence("storage is failing commits".to_string()));
        }
        let pending = std::mem::take(&mut self.pending);
        self.committed.merge(pending);
        self.commits += 1;
        Ok(())
    }

    fn discard(&mut self) {
        self.pending = Snapshot::default();
    }

    fn snapshot(&self) -> &Snapshot {
        &self.committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::PoolId;
    use crate::state::BindingState;

    struct TestGuard(String);

    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
            let _ = std::fs::remove_file(format!("{}.tmp", self.0));
        }
    }

    fn test_path(name: &str) -> (String, TestGuard) {
        let path = format!("test_store_{}.json", name);
        let _ = std::fs::remove_file(&path);
        (path.clone(), TestGuard(path))
    }

    fn record(state: FailoverState) -> StateRecord {
        StateRecord {
            name: "peer".to_string(),
            local_state: state,
            local_stos: 1_700_000_000,
            partner_state: FailoverState::Unknown,
            partner_stos: 0,
            mclt: 3600,
        }
    }

    #[test]
    fn test_json_commit_and_reopen() {
        let (path, _guard) = test_path("reopen");

        let mut storage = JsonStorage::open(&path).unwrap();
        storage.write_state(&record(FailoverState::Normal)).unwrap();
        let mut lease = Lease::new(Ipv4Addr::new(10, 0, 0, 5), PoolId(0));
        lease.binding_state = BindingState::Active;
        storage.write_lease(&lease).unwrap();
        assert!(storage.snapshot().states.is_empty());
        storage.commit().unwrap();

        let reopened = JsonStorage::open(&path).unwrap();
        let snapshot = reopened.snapshot();
        assert_eq!(snapshot.states["peer"].local_state, FailoverState::Normal);
        assert_eq!(
            snapshot.leases[&Ipv4Addr::new(10, 0, 0, 5)].binding_state,
            BindingState::Active
        );
    }

    #[test]
    fn test_json_commit_overwrites_records() {
        let (path, _guard) = test_path("overwrite");

        let mut storage = JsonStorage::open(&path).unwrap();
        storage.write_state(&record(FailoverState::Normal)).unwrap();
        storage.commit().unwrap();
        storage.write_state(&record(FailoverState::PartnerDown)).unwrap();
        storage.commit().unwrap();

        let reopened = JsonStorage::open(&path).unwrap();
        assert_eq!(
            reopened.snapshot().states["peer"].local_state,
            FailoverState::PartnerDown
        );
    }

    #[test]
    fn test_memory_storage_failure() {
        let mut storage = MemoryStorage::new();
        storage.write_state(&record(FailoverState::Normal)).unwrap();
        storage.fail_writes = true;
        assert!(storage.commit().is_err());
        assert!(storage.write_state(&record(FailoverState::Recover)).is_err());
        storage.fail_writes = false;
        storage.commit().unwrap();
        assert_eq!(storage.commits, 1);
        assert_eq!(
            storage.snapshot().states["peer"].local_state,
            FailoverState::Normal
        );
    }

    #[test]
    fn test_discard_drops_uncommitted_writes() {
        let (path, _guard) = test_path("discard");

        let mut storage = JsonStorage::open(&path).unwrap();
        storage.write_state(&record(FailoverState::Normal)).unwrap();
        storage.commit().unwrap();
        storage.write_state(&record(FailoverState::PartnerDown)).unwrap();
        storage.discard();
        storage.commit().unwrap();

        let reopened = JsonStorage::open(&path).unwrap();
        assert_eq!(
            reopened.snapshot().states["peer"].local_state,
            FailoverState::Normal
        );

        let mut memory = MemoryStorage::new();
        memory.fail_commits = true;
        memory.write_state(&record(FailoverState::Recover)).unwrap();
        assert!(memory.commit().is_err());
        memory.discard();
        memory.fail_commits = false;
        memory.commit().unwrap();
        assert!(memory.snapshot().states.is_empty());
    }
}
