//! The relationship record: one per configured partner.
//!
//! Holds both sides' states, the negotiated parameters, and the three
//! update queues:
//!
//! ```text
//!   local change ──> update queue ──send──> ack queue ──ack──> done
//!                        ^                      │
//!                        └── leaving normal ────┘
//!
//!   partner update ──> to-ack queue ──batched bind-acks──> partner
//! ```
//!
//! A lease is on at most one of the update and ack queues; its
//! [`QueueSlot`] tag says which. Queue operations keep the tag and the
//! queues in step.

use std::collections::VecDeque;
use std::net::SocketAddr;

use serde::Serialize;

use crate::balance::BalanceSettings;
use crate::config::{HBA_SIZE, PeerConfig};
use crate::error::Result;
use crate::lease::{LeaseDb, LeaseId, QueueSlot, format_hex};
use crate::link::LinkId;
use crate::message::Message;
use crate::state::{FailoverState, Role, ServiceState, service_state};
use crate::store::StateRecord;

/// One side's view of the relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Side {
    pub state: FailoverState,
    /// When `state` was entered.
    pub stos: i64,
    pub max_unacked: u32,
    pub max_response_delay: u32,
}

/// Bulk update we asked the partner for and have not seen finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingRequest {
    #[default]
    None,
    Request,
    RequestAll,
}

#[derive(Debug)]
pub struct Relationship {
    pub name: String,
    pub config: PeerConfig,
    pub role: Role,
    pub me: Side,
    pub partner: Side,

    /// State to return to when startup ends.
    pub saved_state: FailoverState,

    pub mclt: u32,
    pub balance: BalanceSettings,

    pub service_state: ServiceState,
    /// Why the server is not answering clients, if it is not.
    pub not_responding_reason: Option<&'static str>,

    pub last_balance: i64,
    /// Scheduled rebalance, 0 if none.
    pub sched_balance: i64,

    pub pending_request: PendingRequest,
    /// Xid of the partner's update request we are answering.
    pub update_xid: u32,
    /// Lease whose ack completes the partner's update request.
    pub send_update_done: Option<LeaseId>,

    update_queue: VecDeque<LeaseId>,
    ack_queue: VecDeque<LeaseId>,
    /// Partner updates accepted but not yet acknowledged.
    pub toack_queue: VecDeque<Message>,

    /// The established connection, once the handshake completed.
    pub link: Option<LinkId>,
    pub last_packet_sent: i64,
    pub last_timestamp_received: i64,
    /// Partner clock minus ours, from the last message received.
    pub skew: i64,
}

impl Relationship {
    /// Builds the relationship from its configuration and, if there is
    /// one, its persisted record. A relationship seen for the first time
    /// starts in recover.
    pub fn new(config: PeerConfig, record: Option<&StateRecord>, now: i64) -> Result<Self> {
        let hba = config.hash_buckets()?;
        let balance = BalanceSettings::from_config(&config, hba);

        let (local_state, local_stos, partner_state, partner_stos) = match record {
            Some(record) => (
                record.local_state,
                record.local_stos,
                record.partner_state,
                record.partner_stos,
            ),
            None => (FailoverState::Recover, now, FailoverState::Unknown, now),
        };

        let mclt = match config.role {
            Role::Primary => config.mclt.unwrap_or(0),
            Role::Secondary => record.map_or(0, |record| record.mclt),
        };

        let (service_state, not_responding_reason) = service_state(local_state, partner_state);

        Ok(Self {
            name: config.name.clone(),
            role: config.role,
            me: Side {
                state: local_state,
                stos: local_stos,
                max_unacked: config.max_unacked_updates,
                max_response_delay: config.max_response_delay,
            },
            partner: Side {
                state: partner_state,
                stos: partner_stos,
                max_unacked: config.max_unacked_updates,
                max_response_delay: config.max_response_delay,
            },
            saved_state: local_state,
            mclt,
            balance,
            service_state,
            not_responding_reason,
            last_balance: 0,
            sched_balance: 0,
            pending_request: PendingRequest::None,
            update_xid: 0,
            send_update_done: None,
            update_queue: VecDeque::new(),
            ack_queue: VecDeque::new(),
            toack_queue: VecDeque::new(),
            link: None,
            last_packet_sent: 0,
            last_timestamp_received: 0,
            skew: 0,
            config,
        })
    }

    pub fn local_socket(&self) -> SocketAddr {
        self.config.local_socket()
    }

    pub fn peer_socket(&self) -> SocketAddr {
        self.config.peer_socket()
    }

    pub fn hba(&self) -> Option<&[u8; HBA_SIZE]> {
        self.balance.hba.as_ref()
    }

    /// The local state, or the saved one while in startup.
    pub fn effective_state(&self) -> FailoverState {
        if self.me.state == FailoverState::Startup {
            self.saved_state
        } else {
            self.me.state
        }
    }

    /// The record persisted for this relationship. Startup is never
    /// persisted; the state it will return to is.
    pub fn state_record(&self) -> StateRecord {
        StateRecord {
            name: self.name.clone(),
            local_state: self.effective_state(),
            local_stos: self.me.stos,
            partner_state: self.partner.state,
            partner_stos: self.partner.stos,
            mclt: self.mclt,
        }
    }

    /// Recomputes the service state. Returns true if it changed.
    pub fn refresh_service_state(&mut self) -> bool {
        let (service, reason) = service_state(self.me.state, self.partner.state);
        let changed = service != self.service_state || reason != self.not_responding_reason;
        self.service_state = service;
        self.not_responding_reason = reason;
        changed
    }

    pub fn update_queue(&self) -> &VecDeque<LeaseId> {
        &self.update_queue
    }

    pub fn ack_queue(&self) -> &VecDeque<LeaseId> {
        &self.ack_queue
    }

    /// Updates sent and not yet acknowledged.
    pub fn current_unacked(&self) -> usize {
        self.ack_queue.len()
    }

    /// Whether another update may be sent without exceeding the
    /// partner's window.
    pub fn can_send_update(&self) -> bool {
        (self.partner.max_unacked as usize) > self.ack_queue.len()
    }

    /// Queues a lease to be sent. A lease already waiting is left where it
    /// is; a lease waiting for an ack is withdrawn and resent, since the
    /// newer change supersedes what is in flight. Returns false if the
    /// lease was already queued.
    pub fn enqueue_update(&mut self, leases: &mut LeaseDb, id: LeaseId) -> bool {
        match leases[id].queue {
            QueueSlot::Update => return false,
            QueueSlot::Ack => {
                self.ack_queue_remove(leases, id);
            }
            QueueSlot::Idle => {}
        }
        leases[id].queue = QueueSlot::Update;
        self.update_queue.push_back(id);
        true
    }

    /// Moves the head of the update queue to the ack queue once it has
    /// been sent.
    pub fn mark_sent(&mut self, leases: &mut LeaseDb) -> Option<LeaseId> {
        let id = self.update_queue.pop_front()?;
        leases[id].queue = QueueSlot::Ack;
        self.ack_queue.push_back(id);
        Some(id)
    }

    /// Takes a lease off the ack queue. Returns false if it was not on it.
    pub fn ack_queue_remove(&mut self, leases: &mut LeaseDb, id: LeaseId) -> bool {
        if leases[id].queue != QueueSlot::Ack {
            return false;
        }
        if let Some(position) = self.ack_queue.iter().position(|queued| *queued == id) {
            self.ack_queue.remove(position);
        }
        let lease = &mut leases[id];
        lease.queue = QueueSlot::Idle;
        lease.last_xid = 0;
        true
    }

    /// Puts every unacknowledged update back at the front of the update
    /// queue, in its original order.
    pub fn requeue_unacked(&mut self, leases: &mut LeaseDb) {
        while let Some(id) = self.ack_queue.pop_back() {
            leases[id].queue = QueueSlot::Update;
            self.update_queue.push_front(id);
        }
    }

    /// Snapshot of the management attributes.
    pub fn status(&self) -> RelationshipStatus {
        RelationshipStatus {
            name: self.name.clone(),
            role: self.role,
            local_address: self.local_socket(),
            partner_address: self.peer_socket(),
            max_outstanding_updates: self.me.max_unacked,
            mclt: self.mclt,
            load_balance_max_seconds: self.config.load_balance_max_seconds,
            load_balance_hba: self.hba().map(|hba| format_hex(hba)),
            local_state: self.me.state,
            local_stos: self.me.stos,
            partner_state: self.partner.state,
            partner_stos: self.partner.stos,
            service_state: self.service_state,
            not_responding_reason: self.not_responding_reason.map(str::to_string),
            connected: self.link.is_some(),
            last_packet_sent: self.last_packet_sent,
            last_timestamp_received: self.last_timestamp_received,
            skew: self.skew,
            max_response_delay: self.me.max_response_delay,
            current_unacked: self.current_unacked(),
            pending_updates: self.update_queue.len(),
        }
    }
}

/// Management view of a relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationshipStatus {
    pub name: String,
    pub role: Role,
    pub local_address: SocketAddr,
    pub partner_address: SocketAddr,
    pub max_outstanding_updates: u32,
    pub mclt: u32,
    pub load_balance_max_seconds: u32,
    pub load_balance_hba: Option<String>,
    pub local_state: FailoverState,
    pub local_stos: i64,
    pub partner_state: FailoverState,
    pub partner_stos: i64,
    pub service_state: ServiceState,
    pub not_responding_reason: Option<String>,
    pub connected: bool,
    pub last_packet_sent: i64,
    pub last_timestamp_received: i64,
    pub skew: i64,
    pub max_response_delay: u32,
    pub current_unacked: usize,
    pub pending_updates: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::net::Ipv4Addr;

    const NOW: i64 = 1_700_000_000;

    fn setup() -> (Relationship, LeaseDb, Vec<LeaseId>) {
        let config = PeerConfig::new(
            "peer",
            Role::Primary,
            "10.0.0.1:647".parse().unwrap(),
            "10.0.0.2:647".parse().unwrap(),
        );
        let relationship = Relationship::new(config, None, NOW).unwrap();
        let leases = LeaseDb::from_pools(&[PoolConfig {
            name: "lan".to_string(),
            failover_peer: "peer".to_string(),
            range_start: Ipv4Addr::new(10, 0, 0, 10),
            range_end: Ipv4Addr::new(10, 0, 0, 14),
        }])
        .unwrap();
        let ids = leases.iter().map(|(id, _)| id).collect();
        (relationship, leases, ids)
    }

    #[test]
    fn test_fresh_relationship_starts_in_recover() {
        let (relationship, _, _) = setup();
        assert_eq!(relationship.me.state, FailoverState::Recover);
        assert_eq!(relationship.me.stos, NOW);
        assert_eq!(relationship.partner.state, FailoverState::Unknown);
        assert_eq!(relationship.mclt, 3600);
        assert_eq!(relationship.service_state, ServiceState::NotResponding);
    }

    #[test]
    fn test_restored_from_record() {
        let config = PeerConfig::new(
            "peer",
            Role::Secondary,
            "10.0.0.2:647".parse().unwrap(),
            "10.0.0.1:647".parse().unwrap(),
        );
        let record = StateRecord {
            name: "peer".to_string(),
            local_state: FailoverState::Normal,
            local_stos: NOW - 50,
            partner_state: FailoverState::Normal,
            partner_stos: NOW - 40,
            mclt: 1800,
        };
        let relationship = Relationship::new(config, Some(&record), NOW).unwrap();
        assert_eq!(relationship.me.state, FailoverState::Normal);
        assert_eq!(relationship.mclt, 1800);
        assert_eq!(relationship.service_state, ServiceState::Cooperating);
        assert_eq!(relationship.state_record(), record);
    }

    #[test]
    fn test_startup_persists_saved_state() {
        let (mut relationship, _, _) = setup();
        relationship.saved_state = FailoverState::Normal;
        relationship.me.state = FailoverState::Startup;
        assert_eq!(relationship.state_record().local_state, FailoverState::Normal);
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let (mut relationship, mut leases, ids) = setup();
        assert!(relationship.enqueue_update(&mut leases, ids[0]));
        assert!(!relationship.enqueue_update(&mut leases, ids[0]));
        assert_eq!(relationship.update_queue().len(), 1);
        assert_eq!(leases[ids[0]].queue, QueueSlot::Update);
    }

    #[test]
    fn test_enqueue_withdraws_unacked() {
        let (mut relationship, mut leases, ids) = setup();
        relationship.enqueue_update(&mut leases, ids[0]);
        relationship.enqueue_update(&mut leases, ids[1]);
        relationship.mark_sent(&mut leases);
        leases[ids[0]].last_xid = 7;
        assert_eq!(relationship.current_unacked(), 1);

        assert!(relationship.enqueue_update(&mut leases, ids[0]));
        assert_eq!(relationship.current_unacked(), 0);
        assert_eq!(leases[ids[0]].last_xid, 0);
        assert_eq!(
            relationship.update_queue().iter().copied().collect::<Vec<_>>(),
            vec![ids[1], ids[0]]
        );
    }

    #[test]
    fn test_ack_queue_remove() {
        let (mut relationship, mut leases, ids) = setup();
        relationship.enqueue_update(&mut leases, ids[2]);
        assert!(!relationship.ack_queue_remove(&mut leases, ids[2]));
        relationship.mark_sent(&mut leases);
        assert!(relationship.ack_queue_remove(&mut leases, ids[2]));
        assert_eq!(leases[ids[2]].queue, QueueSlot::Idle);
        assert!(relationship.ack_queue().is_empty());
    }

    #[test]
    fn test_requeue_keeps_order() {
        let (mut relationship, mut leases, ids) = setup();
        for id in &ids[..4] {
            relationship.enqueue_update(&mut leases, *id);
        }
        relationship.mark_sent(&mut leases);
        relationship.mark_sent(&mut leases);
        relationship.requeue_unacked(&mut leases);

        assert_eq!(relationship.current_unacked(), 0);
        assert_eq!(
            relationship.update_queue().iter().copied().collect::<Vec<_>>(),
            ids[..4].to_vec()
        );
        assert!(ids[..4].iter().all(|id| leases[*id].queue == QueueSlot::Update));
    }

    #[test]
    fn test_send_window() {
        let (mut relationship, mut leases, ids) = setup();
        relationship.partner.max_unacked = 2;
        for id in &ids {
            relationship.enqueue_update(&mut leases, *id);
        }
        let mut sent = 0;
        while relationship.can_send_update() && relationship.mark_sent(&mut leases).is_some() {
            sent += 1;
        }
        assert_eq!(sent, 2);
        assert_eq!(relationship.update_queue().len(), 3);
    }

    #[test]
    fn test_status_serializes() {
        let (relationship, _, _) = setup();
        let status = relationship.status();
        assert_eq!(status.local_state, FailoverState::Recover);
        assert!(status.load_balance_hba.is_some());
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"local_state\":\"recover\""));
    }
}
