//! Timer queue for the failover reactor.
//!
//! Each timer is identified by a [`TimerKind`] naming what it does and the
//! object it belongs to. At most one deadline is pending per kind: adding a
//! timer that is already armed moves it. Cancelled or moved entries stay in
//! the heap and are skipped when they surface.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;

use crate::lease::PoolId;
use crate::link::LinkId;

/// What a timer does when it fires, and whose it is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Retry the outbound connection for a relationship.
    Reconnect(String),
    /// Retry binding a listener.
    ListenerRestart(SocketAddr),
    /// Give up on a connection whose handshake did not complete.
    LinkStartup(LinkId),
    /// Send a contact message to keep the link alive.
    SendContact(String),
    /// Nothing heard from the partner for too long.
    PeerTimeout(String),
    /// Leave startup for the saved state.
    Startup(String),
    /// MCLT has passed since entering recover-wait.
    RecoverDone(String),
    /// Move from communications-interrupted to partner-down.
    AutoPartnerDown(String),
    /// Run the pool balancer.
    Rebalance(String),
    /// Send batched binding acks.
    FlushAcks(String),
    /// Deferred lease commit.
    CommitLeases,
    /// Apply due lease state changes in a pool.
    PoolExpiry(PoolId),
}

impl TimerKind {
    /// Relationship the timer belongs to, if any.
    pub fn relationship(&self) -> Option<&str> {
        match self {
            Self::Reconnect(name)
            | Self::SendContact(name)
            | Self::PeerTimeout(name)
            | Self::Startup(name)
            | Self::RecoverDone(name)
            | Self::AutoPartnerDown(name)
            | Self::Rebalance(name)
            | Self::FlushAcks(name) => Some(name),
            Self::ListenerRestart(_)
            | Self::LinkStartup(_)
            | Self::CommitLeases
            | Self::PoolExpiry(_) => None,
        }
    }
}

/// A pending deadline, ordered so the heap pops the earliest first.
#[derive(Debug, Clone)]
struct ScheduledTimer {
    deadline: i64,
    seq: u64,
    kind: TimerKind,
}

impl PartialEq for ScheduledTimer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledTimer {}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse for earliest deadline first.
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

#[derive(Debug, Default)]
pub struct Timers {
    heap: BinaryHeap<ScheduledTimer>,
    /// Live sequence number per armed timer.
    armed: HashMap<TimerKind, (u64, i64)>,
    next_seq: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `kind` to fire at `deadline` (unix seconds), replacing any
    /// pending deadline for the same kind.
    pub fn add(&mut self, kind: TimerKind, deadline: i64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.armed.insert(kind.clone(), (seq, deadline));
        self.heap.push(ScheduledTimer {
            deadline,
            seq,
            kind,
        });
    }

    /// Disarms `kind`. Returns true if it was armed.
    pub fn cancel(&mut self, kind: &TimerKind) -> bool {
        self.armed.remove(kind).is_some()
    }

    pub fn deadline(&self, kind: &TimerKind) -> Option<i64> {
        self.armed.get(kind).map(|(_, deadline)| *deadline)
    }

    pub fn is_armed(&self, kind: &TimerKind) -> bool {
        self.armed.contains_key(kind)
    }

    /// Disarms every timer belonging to the named relationship.
    pub fn cancel_relationship(&mut self, name: &str) {
        self.armed.retain(|kind, _| kind.relationship() != Some(name));
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&mut self) -> Option<i64> {
        self.discard_stale();
        self.heap.peek().map(|timer| timer.deadline)
    }

    /// Removes and returns the earliest timer due at or before `now`.
    pub fn pop_due(&mut self, now: i64) -> Option<TimerKind> {
        self.discard_stale();
        if self.heap.peek()?.deadline > now {
            return None;
        }
        let timer = self.heap.pop()?;
        self.armed.remove(&timer.kind);
        Some(timer.kind)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    fn discard_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            let live = matches!(self.armed.get(&top.kind), Some((seq, _)) if *seq == top.seq);
            if live {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut timers = Timers::new();
        timers.add(TimerKind::Startup("a".to_string()), 30);
        timers.add(TimerKind::CommitLeases, 10);
        timers.add(TimerKind::Rebalance("a".to_string()), 20);

        assert_eq!(timers.next_deadline(), Some(10));
        assert_eq!(timers.pop_due(5), None);
        assert_eq!(timers.pop_due(25), Some(TimerKind::CommitLeases));
        assert_eq!(timers.pop_due(25), Some(TimerKind::Rebalance("a".to_string())));
        assert_eq!(timers.pop_due(25), None);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_same_deadline_fires_in_arming_order() {
        let mut timers = Timers::new();
        timers.add(TimerKind::SendContact("a".to_string()), 10);
        timers.add(TimerKind::PeerTimeout("a".to_string()), 10);
        assert_eq!(timers.pop_due(10), Some(TimerKind::SendContact("a".to_string())));
        assert_eq!(timers.pop_due(10), Some(TimerKind::PeerTimeout("a".to_string())));
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let mut timers = Timers::new();
        let kind = TimerKind::SendContact("a".to_string());
        timers.add(kind.clone(), 10);
        timers.add(kind.clone(), 40);
        assert_eq!(timers.deadline(&kind), Some(40));
        assert_eq!(timers.pop_due(20), None);
        assert_eq!(timers.pop_due(40), Some(kind));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_cancel_relationship() {
        let mut timers = Timers::new();
        timers.add(TimerKind::Startup("a".to_string()), 10);
        timers.add(TimerKind::Startup("b".to_string()), 10);
        timers.add(TimerKind::LinkStartup(LinkId(3)), 10);
        timers.cancel_relationship("a");

        assert_eq!(timers.pop_due(10), Some(TimerKind::Startup("b".to_string())));
        assert_eq!(timers.pop_due(10), Some(TimerKind::LinkStartup(LinkId(3))));
        assert_eq!(timers.pop_due(10), None);
    }
}
