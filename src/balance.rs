//! Pool balancing and load-balance hashing.
//!
//! Free leases belong to the primary and backup leases to the secondary.
//! The balancer keeps the two counts of each pool close to even by handing
//! leases across, in two passes over the giving side's list:
//!
//! ```text
//!   lts = (mine - theirs) / 2         leases to send
//!
//!   pass 1: leases the partner's hash buckets would serve anyway,
//!           until the partner is `hold` ahead
//!   pass 2: never-used leases until even, then used leases
//!           until we are only `hold` ahead
//! ```
//!
//! Everything here is pure; [`crate::failover`] applies the moves and
//! schedules the next run.

use std::collections::HashSet;

use crate::config::{HBA_SIZE, PeerConfig};
use crate::lease::{Lease, LeaseDb, LeaseId, PoolId, PoolList};
use crate::state::{BindingState, Role};

/// Mixing table from the load balancing draft: 256 distinct values in
/// pseudo-random order.
pub const LOAD_BALANCE_MIX_TABLE: [u8; 256] = [
    251, 175, 119, 215, 81, 14, 79, 191, 103, 49, 181, 143, 186, 157, 0, 232, 31, 32, 55, 60, 152,
    58, 17, 237, 174, 70, 160, 144, 220, 90, 57, 223, 59, 3, 18, 140, 111, 166, 203, 196, 134,
    243, 124, 95, 222, 179, 197, 65, 180, 48, 36, 15, 107, 46, 233, 130, 165, 30, 123, 161, 209,
    23, 97, 16, 40, 91, 219, 61, 100, 10, 210, 109, 250, 127, 22, 138, 29, 108, 244, 67, 207, 9,
    178, 204, 74, 98, 126, 249, 167, 116, 34, 77, 193, 200, 121, 5, 20, 113, 71, 35, 128, 13, 182,
    94, 25, 226, 227, 199, 75, 27, 41, 245, 230, 224, 43, 225, 177, 26, 155, 150, 212, 142, 218,
    115, 241, 73, 88, 105, 39, 114, 62, 255, 192, 201, 145, 214, 168, 158, 221, 148, 154, 122, 12,
    84, 82, 163, 44, 139, 228, 236, 205, 242, 217, 11, 187, 146, 159, 64, 86, 239, 195, 42, 106,
    198, 118, 112, 184, 172, 87, 2, 173, 117, 176, 229, 247, 253, 137, 185, 99, 164, 102, 147, 45,
    66, 231, 52, 141, 211, 194, 206, 246, 238, 56, 110, 78, 248, 63, 240, 189, 93, 92, 51, 53,
    183, 19, 171, 72, 50, 33, 104, 101, 69, 8, 252, 83, 120, 76, 135, 85, 54, 202, 125, 188, 213,
    96, 235, 136, 208, 162, 129, 190, 132, 156, 38, 47, 1, 7, 254, 24, 4, 216, 131, 89, 21, 28,
    133, 37, 153, 149, 80, 170, 68, 6, 169, 234, 151,
];

/// Hashes a client key into one of 256 buckets.
pub fn load_balance_hash(key: &[u8]) -> u8 {
    key.iter()
        .rev()
        .fold(key.len() as u8, |hash, byte| {
            LOAD_BALANCE_MIX_TABLE[(hash ^ byte) as usize]
        })
}

/// Whether the bucket is set in the hash bucket assignment.
pub fn hba_bit(hba: &[u8; HBA_SIZE], bucket: u8) -> bool {
    hba[(bucket >> 3) as usize & 0x1f] & (1 << (bucket & 0x07)) != 0
}

/// Whether this server should answer a client with the given key.
///
/// A client that has been retrying for longer than `max_seconds` is
/// answered by whoever sees it. Without an assignment nothing is ours.
pub fn load_balance_mine(
    hba: Option<&[u8; HBA_SIZE]>,
    role: Role,
    client_key: &[u8],
    seconds: u16,
    max_seconds: u32,
) -> bool {
    if u32::from(seconds) > max_seconds {
        return true;
    }
    let Some(hba) = hba else {
        return false;
    };
    let bit = hba_bit(hba, load_balance_hash(client_key));
    match role {
        Role::Primary => bit,
        Role::Secondary => !bit,
    }
}

/// Whether the partner's buckets would serve the lease's client.
///
/// Not simply the inverse of [`load_balance_mine`]: a lease without a
/// client key, or a relationship without an assignment, is nobody's.
pub fn peer_wants_lease(hba: Option<&[u8; HBA_SIZE]>, role: Role, lease: &Lease) -> bool {
    let (Some(hba), Some(key)) = (hba, lease.client_key()) else {
        return false;
    };
    let bit = hba_bit(hba, load_balance_hash(key));
    match role {
        Role::Primary => !bit,
        Role::Secondary => bit,
    }
}

/// Rounded percentage of `total`.
fn percent_of(total: i64, percent: u32) -> i64 {
    (total * i64::from(percent) + 50) / 100
}

/// False when the secondary already holds more than its allowed share of
/// the pool, so a freed lease should stay with the primary.
pub fn secondary_not_hoarding(free: usize, backup: usize, max_lease_ownership: u32) -> bool {
    let (free, backup) = (free as i64, backup as i64);
    let hold = percent_of(free + backup, max_lease_ownership);
    let lts = (free - backup) / 2;
    lts > -hold
}

/// Balancer settings for one relationship.
#[derive(Debug, Clone)]
pub struct BalanceSettings {
    pub role: Role,
    pub hba: Option<[u8; HBA_SIZE]>,
    pub max_lease_misbalance: u32,
    pub max_lease_ownership: u32,
    pub min_balance: u32,
    pub max_balance: u32,
}

impl BalanceSettings {
    pub fn from_config(config: &PeerConfig, hba: Option<[u8; HBA_SIZE]>) -> Self {
        Self {
            role: config.role,
            hba,
            max_lease_misbalance: config.max_lease_misbalance,
            max_lease_ownership: config.max_lease_ownership,
            min_balance: config.min_balance,
            max_balance: config.max_balance,
        }
    }

    /// The list leases are given from and the state they are given in.
    fn giving(&self) -> (PoolList, BindingState) {
        match self.role {
            Role::Primary => (PoolList::Free, BindingState::Backup),
            Role::Secondary => (PoolList::Backup, BindingState::Free),
        }
    }
}

/// The balancer's decision for one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPlan {
    pub pool: PoolId,
    pub total: i64,
    pub free: i64,
    pub backup: i64,
    /// Leases to send before any moves; negative if the partner should send.
    pub lts: i64,
    /// Leases still to send once `moves` are applied.
    pub remaining: i64,
    pub threshold: i64,
    pub hold: i64,
    pub panic: i64,
    /// The partner is short enough that it should be asked to rebalance.
    pub request_peer: bool,
    /// State the moved leases take.
    pub peer_state: BindingState,
    pub moves: Vec<LeaseId>,
}

impl PoolPlan {
    pub fn is_balanced(&self) -> bool {
        self.remaining <= self.threshold
    }
}

/// Decides which leases of a pool to hand to the partner.
pub fn plan_pool(leases: &LeaseDb, pool: PoolId, settings: &BalanceSettings) -> PoolPlan {
    let free = leases.count(pool, PoolList::Free) as i64;
    let backup = leases.count(pool, PoolList::Backup) as i64;
    let (list, peer_state) = settings.giving();

    let lts = match settings.role {
        Role::Primary => (free - backup) / 2,
        Role::Secondary => (backup - free) / 2,
    };
    let total = free + backup;
    let threshold = percent_of(total, settings.max_lease_misbalance);
    let hold = percent_of(total, settings.max_lease_ownership);
    let panic = match threshold * -2 {
        0 => -1,
        panic => panic,
    };

    let mut plan = PoolPlan {
        pool,
        total,
        free,
        backup,
        lts,
        remaining: lts,
        threshold,
        hold,
        panic,
        request_peer: lts < panic,
        peer_state,
        moves: Vec::new(),
    };

    let candidates = leases.list(pool, list, false);
    let mut moved = HashSet::new();

    for &id in &candidates {
        if plan.remaining <= -hold {
            return plan;
        }
        if peer_wants_lease(settings.hba.as_ref(), settings.role, &leases[id]) {
            plan.remaining -= 1;
            plan.moves.push(id);
            moved.insert(id);
        }
    }

    for &id in candidates.iter().filter(|id| !moved.contains(*id)) {
        let floor = if leases[id].ends != 0 { hold } else { 0 };
        if plan.remaining <= floor {
            break;
        }
        plan.remaining -= 1;
        plan.moves.push(id);
    }

    plan
}

/// When the pool should next be balanced, before jitter.
///
/// The age of the oldest free and backup leases estimates how long the
/// pool will take to drift out of balance. The side that would panic first
/// gets twice the time.
pub fn rebalance_estimate(
    leases: &LeaseDb,
    pool: PoolId,
    settings: &BalanceSettings,
    last_balance: i64,
    now: i64,
) -> i64 {
    let age = |list| {
        leases
            .list(pool, list, false)
            .first()
            .map(|id| leases[*id].ends)
            .filter(|ends| *ends < now)
            .map_or(0, |ends| now - ends)
    };

    let mut free_estimate = percent_of(age(PoolList::Free), settings.max_lease_misbalance);
    let mut backup_estimate = percent_of(age(PoolList::Backup), settings.max_lease_misbalance);
    match settings.role {
        Role::Primary => free_estimate *= 2,
        Role::Secondary => backup_estimate *= 2,
    }

    let mut estimate = free_estimate
        .min(backup_estimate)
        .min(i64::from(settings.max_balance))
        + now;

    let floor = last_balance + i64::from(settings.min_balance);
    if last_balance != 0 && estimate < floor {
        estimate = floor;
    }
    estimate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::net::Ipv4Addr;

    const NOW: i64 = 1_700_000_000;

    fn test_db(count: u32) -> (LeaseDb, PoolId) {
        let start = u32::from(Ipv4Addr::new(10, 0, 1, 0));
        let db = LeaseDb::from_pools(&[PoolConfig {
            name: "lan".to_string(),
            failover_peer: "peer".to_string(),
            range_start: Ipv4Addr::from(start),
            range_end: Ipv4Addr::from(start + count - 1),
        }])
        .unwrap();
        let pool = db.pools_for("peer")[0];
        (db, pool)
    }

    fn settings(role: Role, misbalance: u32, ownership: u32) -> BalanceSettings {
        BalanceSettings {
            role,
            hba: None,
            max_lease_misbalance: misbalance,
            max_lease_ownership: ownership,
            min_balance: 60,
            max_balance: 3600,
        }
    }

    #[test]
    fn test_hash_known_values() {
        assert_eq!(load_balance_hash(&[]), 0);
        // len 1: hash = TBL[1 ^ 0] = 175
        assert_eq!(load_balance_hash(&[0]), 175);
        // len 2: TBL[2 ^ 0] = 119, then TBL[119 ^ 0] = 150
        assert_eq!(load_balance_hash(&[0, 0]), 150);
    }

    #[test]
    fn test_hba_bit() {
        let mut hba = [0u8; HBA_SIZE];
        hba[1] = 0b0000_0100;
        assert!(hba_bit(&hba, 10));
        assert!(!hba_bit(&hba, 11));
        assert!(!hba_bit(&hba, 2));
    }

    #[test]
    fn test_load_balance_mine() {
        let all = [0xffu8; HBA_SIZE];
        let none = [0u8; HBA_SIZE];
        let key = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

        assert!(load_balance_mine(Some(&all), Role::Primary, &key, 0, 3));
        assert!(!load_balance_mine(Some(&all), Role::Secondary, &key, 0, 3));
        assert!(load_balance_mine(Some(&none), Role::Secondary, &key, 0, 3));
        assert!(!load_balance_mine(None, Role::Primary, &key, 0, 3));
        assert!(load_balance_mine(None, Role::Secondary, &key, 4, 3));
    }

    #[test]
    fn test_peer_wants_lease() {
        let all = [0xffu8; HBA_SIZE];
        let mut lease = Lease::new(Ipv4Addr::new(10, 0, 1, 1), PoolId(0));
        assert!(!peer_wants_lease(Some(&all), Role::Secondary, &lease));

        lease.hardware_address = vec![1, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
        assert!(peer_wants_lease(Some(&all), Role::Secondary, &lease));
        assert!(!peer_wants_lease(Some(&all), Role::Primary, &lease));
        assert!(!peer_wants_lease(None, Role::Secondary, &lease));
    }

    #[test]
    fn test_secondary_not_hoarding() {
        assert!(secondary_not_hoarding(50, 50, 10));
        // lts = -10, hold = 10
        assert!(!secondary_not_hoarding(40, 60, 10));
        assert!(secondary_not_hoarding(40, 60, 25));
    }

    #[test]
    fn test_plan_fresh_pool_splits_evenly() {
        let (db, pool) = test_db(100);
        let plan = plan_pool(&db, pool, &settings(Role::Primary, 10, 50));

        assert_eq!(plan.lts, 50);
        assert_eq!(plan.threshold, 10);
        assert_eq!(plan.hold, 50);
        assert_eq!(plan.moves.len(), 50);
        assert_eq!(plan.remaining, 0);
        assert_eq!(plan.peer_state, BindingState::Backup);
        assert!(plan.is_balanced());
        assert!(!plan.request_peer);
    }

    #[test]
    fn test_plan_keeps_hold_of_used_leases() {
        let (mut db, pool) = test_db(20);
        for id in db.list(pool, PoolList::Free, false) {
            db[id].ends = NOW - 100;
        }
        let plan = plan_pool(&db, pool, &settings(Role::Primary, 10, 20));
        // lts 10, hold 4: used leases move only while more than hold remain
        assert_eq!(plan.moves.len(), 6);
        assert_eq!(plan.remaining, 4);
        assert!(!plan.is_balanced());
    }

    #[test]
    fn test_plan_prefers_partner_clients() {
        let (mut db, pool) = test_db(10);
        let free = db.list(pool, PoolList::Free, false);
        let keyed = [free[7], free[8], free[9]];
        for &id in &keyed {
            db[id].hardware_address = vec![1, 0xaa, id.0 as u8];
        }

        let mut settings = settings(Role::Primary, 10, 0);
        settings.hba = Some([0u8; HBA_SIZE]);
        let plan = plan_pool(&db, pool, &settings);

        assert_eq!(plan.moves.len(), 5);
        assert_eq!(&plan.moves[..3], &keyed);
    }

    #[test]
    fn test_secondary_short_requests_rebalance() {
        // Secondary with 0 backup and 10 free: lts -5, panic -2.
        let (mut db, pool) = test_db(10);
        let plan = plan_pool(&db, pool, &settings(Role::Secondary, 10, 10));
        assert_eq!(plan.lts, -5);
        assert_eq!(plan.panic, -2);
        assert!(plan.request_peer);
        assert!(plan.moves.is_empty());

        for id in db.list(pool, PoolList::Free, false) {
            db[id].next_binding_state = BindingState::Backup;
            db.supersede(id);
        }
        let plan = plan_pool(&db, pool, &settings(Role::Secondary, 10, 10));
        assert_eq!(plan.peer_state, BindingState::Free);
        assert_eq!(plan.moves.len(), 5);
    }

    #[test]
    fn test_rebalance_estimate() {
        let (mut db, pool) = test_db(4);
        let settings = settings(Role::Primary, 10, 10);

        // An empty backup list estimates zero.
        assert_eq!(rebalance_estimate(&db, pool, &settings, 0, NOW), NOW);

        for id in db.list(pool, PoolList::Free, false) {
            db[id].ends = NOW - 1000;
        }
        let half = db.list(pool, PoolList::Free, false)[..2].to_vec();
        for id in half {
            db[id].next_binding_state = BindingState::Backup;
            db.supersede(id);
        }
        // free age 1000 -> 100, doubled to 200; backup age 1000 -> 100
        assert_eq!(rebalance_estimate(&db, pool, &settings, 0, NOW), NOW + 100);
        // never sooner than min_balance after the last run
        assert_eq!(
            rebalance_estimate(&db, pool, &settings, NOW, NOW),
            NOW + 100
        );
        assert_eq!(
            rebalance_estimate(&db, pool, &settings, NOW + 50, NOW),
            NOW + 110
        );
    }
}
