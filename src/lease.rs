//! Lease and pool records seen through the failover engine.
//!
//! Leases live in an arena ([`LeaseDb`]) and are referred to by
//! [`LeaseId`] handles. Queue membership is a tag on the lease
//! ([`QueueSlot`]) rather than a linked list, so a lease can sit on at most
//! one of the update and ack queues by construction.
//!
//! Pools group leases and bind them to a failover relationship. The
//! free/backup/active/expired/abandoned/reserved lists are views derived
//! from each lease's binding state.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::state::BindingState;

/// Handle into the lease arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LeaseId(pub usize);

/// Handle into the pool table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub usize);

/// Which failover queue a lease is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueSlot {
    #[default]
    Idle,
    /// Waiting to be sent to the partner.
    Update,
    /// Sent, waiting for the partner's ack.
    Ack,
}

/// The per-pool lists a lease can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolList {
    Free,
    Active,
    Expired,
    Abandoned,
    Backup,
    Reserved,
}

/// Encodes bytes as colon-separated hex for logs.
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// A lease as the failover engine tracks it.
///
/// Times are seconds since the epoch; zero means "never".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub ip_address: Ipv4Addr,

    #[serde(skip, default = "default_pool")]
    pub pool: PoolId,

    pub binding_state: BindingState,

    /// State the lease moves to at its next transition.
    pub next_binding_state: BindingState,

    /// State being propagated to the partner.
    pub desired_binding_state: BindingState,

    /// Last state the partner acknowledged.
    pub rewind_binding_state: BindingState,

    pub starts: i64,
    pub ends: i64,

    /// Client last transaction time.
    pub cltt: i64,

    /// Time the partner may reuse the lease (sent-from-peer potential expiry).
    pub tsfp: i64,

    /// Potential expiry we last sent to the partner.
    pub tstp: i64,

    /// Potential expiry the partner acknowledged.
    pub atsfp: i64,

    /// Transaction id of the outstanding bind update, 0 if none.
    #[serde(default)]
    pub last_xid: u32,

    /// Hardware type followed by hardware address.
    #[serde(default)]
    pub hardware_address: Vec<u8>,

    #[serde(default)]
    pub client_identifier: Vec<u8>,

    #[serde(default)]
    pub reserved: bool,

    #[serde(default)]
    pub bootp: bool,

    #[serde(skip)]
    pub queue: QueueSlot,
}

fn default_pool() -> PoolId {
    PoolId(0)
}

impl Lease {
    /// A never-used free lease.
    pub fn new(ip_address: Ipv4Addr, pool: PoolId) -> Self {
        Self {
            ip_address,
            pool,
            binding_state: BindingState::Free,
            next_binding_state: BindingState::Free,
            desired_binding_state: BindingState::Free,
            rewind_binding_state: BindingState::Free,
            starts: 0,
            ends: 0,
            cltt: 0,
            tsfp: 0,
            tstp: 0,
            atsfp: 0,
            last_xid: 0,
            hardware_address: Vec::new(),
            client_identifier: Vec::new(),
            reserved: false,
            bootp: false,
            queue: QueueSlot::Idle,
        }
    }

    /// The pool list this lease belongs on.
    pub fn list(&self) -> PoolList {
        match self.binding_state {
            BindingState::Free | BindingState::Backup if self.reserved => PoolList::Reserved,
            BindingState::Free => PoolList::Free,
            BindingState::Backup => PoolList::Backup,
            BindingState::Active => PoolList::Active,
            BindingState::Expired | BindingState::Released | BindingState::Reset => {
                PoolList::Expired
            }
            BindingState::Abandoned => PoolList::Abandoned,
        }
    }

    /// Time the lease reaches its next transition. In partner-down the
    /// expired list waits for the later of `tsfp` and `ends`.
    pub fn sort_time(&self, partner_down: bool) -> i64 {
        if partner_down && self.list() == PoolList::Expired {
            self.tsfp.max(self.ends)
        } else {
            self.ends
        }
    }

    /// Commits the pending transition: the binding state becomes the next
    /// binding state, and the next state becomes whatever the lease turns
    /// into when its timer runs out. Returns the state it left.
    pub fn commit_transition(&mut self) -> BindingState {
        let old = self.binding_state;
        self.binding_state = self.next_binding_state;
        self.next_binding_state = match self.binding_state {
            BindingState::Active => BindingState::Expired,
            BindingState::Expired
            | BindingState::Released
            | BindingState::Abandoned
            | BindingState::Reset => BindingState::Free,
            state @ (BindingState::Free | BindingState::Backup) => state,
        };
        old
    }

    /// Whether a transition is pending.
    pub fn has_pending_transition(&self) -> bool {
        self.next_binding_state != self.binding_state
    }

    /// Key the load-balancing hash runs over: the client identifier if
    /// present, else the hardware address without its type byte.
    pub fn client_key(&self) -> Option<&[u8]> {
        if !self.client_identifier.is_empty() {
            Some(&self.client_identifier)
        } else if self.hardware_address.len() > 1 {
            Some(&self.hardware_address[1..])
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pool {
    pub id: PoolId,
    pub name: String,

    /// Failover relationship this pool is shared under.
    pub relationship: String,

    /// When the pool's expiry timer next fires.
    pub next_event_time: Option<i64>,

    leases: Vec<LeaseId>,
}

impl Pool {
    pub fn leases(&self) -> &[LeaseId] {
        &self.leases
    }
}

/// Arena of leases and the pools that own them.
#[derive(Debug, Default)]
pub struct LeaseDb {
    leases: Vec<Lease>,
    by_address: HashMap<Ipv4Addr, LeaseId>,
    pools: Vec<Pool>,
}

impl LeaseDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds pools from configuration, seeding every address as a
    /// never-used free lease.
    pub fn from_pools(pools: &[PoolConfig]) -> Result<Self> {
        let mut db = Self::new();
        for config in pools {
            let pool = db.add_pool(&config.name, &config.failover_peer);
            let start = u32::from(config.range_start);
            let end = u32::from(config.range_end);
            for addr in start..=end {
                db.add_lease(Lease::new(Ipv4Addr::from(addr), pool))?;
            }
        }
        Ok(db)
    }

    pub fn add_pool(&mut self, name: &str, relationship: &str) -> PoolId {
        let id = PoolId(self.pools.len());
        self.pools.push(Pool {
            id,
            name: name.to_string(),
            relationship: relationship.to_string(),
            next_event_time: None,
            leases: Vec::new(),
        });
        id
    }

    /// Adds a lease to the arena and its pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the address is already known or
    /// the pool does not exist.
    pub fn add_lease(&mut self, lease: Lease) -> Result<LeaseId> {
        if self.by_address.contains_key(&lease.ip_address) {
            return Err(Error::InvalidConfig(format!(
                "address {} is in more than one pool",
                lease.ip_address
            )));
        }
        let pool = self
            .pools
            .get_mut(lease.pool.0)
            .ok_or_else(|| Error::InvalidConfig(format!("no pool {}", lease.pool.0)))?;

        let id = LeaseId(self.leases.len());
        pool.leases.push(id);
        self.by_address.insert(lease.ip_address, id);
        self.leases.push(lease);
        Ok(id)
    }

    /// Overwrites the failover fields of a known lease with a persisted
    /// copy. Unknown addresses are ignored.
    pub fn restore(&mut self, saved: &Lease) -> bool {
        let Some(id) = self.find_by_address(saved.ip_address) else {
            return false;
        };
        let lease = &mut self.leases[id.0];
        let pool = lease.pool;
        *lease = saved.clone();
        lease.pool = pool;
        lease.queue = QueueSlot::Idle;
        true
    }

    pub fn find_by_address(&self, addr: Ipv4Addr) -> Option<LeaseId> {
        self.by_address.get(&addr).copied()
    }

    pub fn get(&self, id: LeaseId) -> Option<&Lease> {
        self.leases.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LeaseId, &Lease)> {
        self.leases
            .iter()
            .enumerate()
            .map(|(index, lease)| (LeaseId(index), lease))
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn pool(&self, id: PoolId) -> Option<&Pool> {
        self.pools.get(id.0)
    }

    pub fn pool_mut(&mut self, id: PoolId) -> Option<&mut Pool> {
        self.pools.get_mut(id.0)
    }

    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    /// Pools shared under the named relationship.
    pub fn pools_for(&self, relationship: &str) -> Vec<PoolId> {
        self.pools
            .iter()
            .filter(|pool| pool.relationship == relationship)
            .map(|pool| pool.id)
            .collect()
    }

    /// Leases on one of a pool's lists, in the order they reach their
    /// next transition (oldest first, never-used before used).
    pub fn list(&self, pool: PoolId, list: PoolList, partner_down: bool) -> Vec<LeaseId> {
        let Some(pool) = self.pools.get(pool.0) else {
            return Vec::new();
        };
        let mut ids: Vec<LeaseId> = pool
            .leases
            .iter()
            .copied()
            .filter(|id| self.leases[id.0].list() == list)
            .collect();
        ids.sort_by_key(|id| {
            let lease = &self.leases[id.0];
            (lease.sort_time(partner_down), u32::from(lease.ip_address))
        });
        ids
    }

    /// Number of leases on a pool list.
    pub fn count(&self, pool: PoolId, list: PoolList) -> usize {
        self.pools.get(pool.0).map_or(0, |pool| {
            pool.leases
                .iter()
                .filter(|id| self.leases[id.0].list() == list)
                .count()
        })
    }

    /// Commits the lease's pending transition. See
    /// [`Lease::commit_transition`].
    pub fn supersede(&mut self, id: LeaseId) -> BindingState {
        self.leases[id.0].commit_transition()
    }
}

impl Index<LeaseId> for LeaseDb {
    type Output = Lease;

    fn index(&self, id: LeaseId) -> &Lease {
        &self.leases[id.0]
    }
}

impl IndexMut<LeaseId> for LeaseDb {
    fn index_mut(&mut self, id: LeaseId) -> &mut Lease {
        &mut self.leases[id.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> LeaseDb {
        LeaseDb::from_pools(&[PoolConfig {
            name: "lan".to_string(),
            failover_peer: "peer".to_string(),
            range_start: Ipv4Addr::new(10, 0, 0, 10),
            range_end: Ipv4Addr::new(10, 0, 0, 19),
        }])
        .unwrap()
    }

    #[test]
    fn test_seeded_pool_is_free() {
        let db = test_db();
        let pool = db.pools_for("peer")[0];
        assert_eq!(db.len(), 10);
        assert_eq!(db.count(pool, PoolList::Free), 10);
        assert_eq!(db.count(pool, PoolList::Backup), 0);
        assert!(db.pools_for("other").is_empty());
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut db = test_db();
        let pool = db.pools_for("peer")[0];
        assert!(db.add_lease(Lease::new(Ipv4Addr::new(10, 0, 0, 10), pool)).is_err());
    }

    #[test]
    fn test_supersede_moves_between_lists() {
        let mut db = test_db();
        let pool = db.pools_for("peer")[0];
        let id = db.find_by_address(Ipv4Addr::new(10, 0, 0, 12)).unwrap();

        db[id].next_binding_state = BindingState::Backup;
        assert_eq!(db.supersede(id), BindingState::Free);
        assert_eq!(db.count(pool, PoolList::Free), 9);
        assert_eq!(db.list(pool, PoolList::Backup, false), vec![id]);

        assert_eq!(db[id].next_binding_state, BindingState::Backup);

        db[id].reserved = true;
        assert_eq!(db.count(pool, PoolList::Reserved), 1);
        assert_eq!(db.count(pool, PoolList::Backup), 0);
    }

    #[test]
    fn test_supersede_schedules_follow_on_state() {
        let mut db = test_db();
        let id = db.find_by_address(Ipv4Addr::new(10, 0, 0, 13)).unwrap();

        db[id].next_binding_state = BindingState::Active;
        db.supersede(id);
        assert_eq!(db[id].next_binding_state, BindingState::Expired);

        assert_eq!(db.supersede(id), BindingState::Active);
        assert_eq!(db[id].binding_state, BindingState::Expired);
        assert_eq!(db[id].next_binding_state, BindingState::Free);
    }

    #[test]
    fn test_list_orders_never_used_first() {
        let mut db = test_db();
        let pool = db.pools_for("peer")[0];
        let used = db.find_by_address(Ipv4Addr::new(10, 0, 0, 10)).unwrap();
        db[used].ends = 1_000;

        let free = db.list(pool, PoolList::Free, false);
        assert_eq!(free.len(), 10);
        assert_eq!(free[9], used);
        assert_eq!(db[free[0]].ip_address, Ipv4Addr::new(10, 0, 0, 11));
    }

    #[test]
    fn test_partner_down_sort_time() {
        let mut lease = Lease::new(Ipv4Addr::new(10, 0, 0, 1), PoolId(0));
        lease.binding_state = BindingState::Expired;
        lease.ends = 100;
        lease.tsfp = 500;
        assert_eq!(lease.sort_time(false), 100);
        assert_eq!(lease.sort_time(true), 500);
    }

    #[test]
    fn test_restore_keeps_pool() {
        let mut db = test_db();
        let mut saved = Lease::new(Ipv4Addr::new(10, 0, 0, 15), PoolId(7));
        saved.binding_state = BindingState::Active;
        assert!(db.restore(&saved));
        let id = db.find_by_address(saved.ip_address).unwrap();
        assert_eq!(db[id].binding_state, BindingState::Active);
        assert_eq!(db[id].pool, PoolId(0));
        assert!(!db.restore(&Lease::new(Ipv4Addr::new(192, 0, 2, 1), PoolId(0))));
    }

    #[test]
    fn test_client_key() {
        let mut lease = Lease::new(Ipv4Addr::new(10, 0, 0, 1), PoolId(0));
        assert_eq!(lease.client_key(), None);
        lease.hardware_address = vec![1, 0xaa, 0xbb];
        assert_eq!(lease.client_key(), Some(&[0xaa, 0xbb][..]));
        lease.client_identifier = vec![9];
        assert_eq!(lease.client_key(), Some(&[9][..]));
        assert_eq!(format_hex(&[0xaa, 0x0b]), "aa:0b");
    }
}
