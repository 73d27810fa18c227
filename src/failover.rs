//! The failover engine.
//!
//! [`Failover`] owns every relationship, the live links, the lease
//! database, the timer queue and storage. It performs no I/O: the
//! transport reports events, each stamped with the current time (unix
//! seconds), and collects the [`Action`]s the engine wants carried out.
//!
//! ```text
//!   transport                          Failover
//!   ─────────                          ────────
//!   connected / accepted     ──────>   new link, connect handshake
//!   receive(bytes)           ──────>   framing, message dispatch
//!   link_closed              ──────>   disconnect event, reconnect timer
//!   fire_timers(now)         ──────>   contact, timeouts, balancing, expiry
//!                            <──────   take_actions(): Send / Close /
//!                                      Connect / Listen
//! ```
//!
//! Everything runs on the caller's thread, one event at a time, so no
//! state is shared and nothing is locked.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::balance::{
    self, peer_wants_lease, plan_pool, rebalance_estimate, secondary_not_hoarding,
};
use crate::config::{Config, HBA_SIZE};
use crate::error::{Error, Result};
use crate::lease::{Lease, LeaseDb, LeaseId, PoolId, PoolList, QueueSlot};
use crate::link::{Link, LinkId};
use crate::message::{Message, PROTOCOL_VERSION};
use crate::options::{
    FailoverOption, IP_FLAG_BOOTP, IP_FLAG_RESERVE, MessageType, RejectReason,
    SERVER_FLAG_STARTUP,
};
use crate::relationship::{PendingRequest, Relationship, RelationshipStatus};
use crate::state::{
    self, BindingState, FailoverState, LocalEvent, LocalOutcome, PeerOutcome, Role, ServiceState,
};
use crate::store::Storage;
use crate::timer::{TimerKind, Timers};
use crate::validator::{check_conflict, check_normal, lease_mine_to_reallocate, local_update_wins};

/// Seconds a relationship waits in startup to hear from its partner.
pub const STARTUP_TIMEOUT: i64 = 15;

/// Seconds a new connection has to complete the connect handshake.
pub const LINK_STARTUP_TIMEOUT: i64 = 15;

/// Seconds before retrying a failed connect or listen.
pub const RETRY_INTERVAL: i64 = 90;

/// Seconds before reconnecting after losing a connection.
pub const RECONNECT_DELAY: i64 = 5;

/// Largest clock difference tolerated between the partners.
pub const MAX_CLOCK_SKEW: i64 = 60;

/// Seconds binding acks are held back for batching.
pub const ACK_FLUSH_DELAY: i64 = 2;

/// Seconds a lease commit is deferred after an ack.
pub const COMMIT_DELAY: i64 = 2;

const VENDOR_CLASS: &str = concat!("dhcpfailover-", env!("CARGO_PKG_VERSION"));

/// Work the transport performs on behalf of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write an encoded message to a connection.
    Send { link: LinkId, bytes: Vec<u8> },
    /// Close a connection after flushing what was already queued on it.
    Close { link: LinkId },
    /// Open a connection to a relationship's partner.
    Connect {
        relationship: String,
        addr: SocketAddr,
    },
    /// Accept connections on a local address.
    Listen { addr: SocketAddr },
}

/// Converts a time to the protocol's 32-bit representation.
fn wire_time(time: i64) -> u32 {
    time.clamp(0, i64::from(u32::MAX)) as u32
}

/// Whether a binding change moved a lease onto or off the free/backup lists.
fn balance_affected(old: BindingState, new: BindingState) -> bool {
    use BindingState::*;
    old != new && (matches!(old, Free | Backup) || matches!(new, Free | Backup))
}

pub struct Failover<S: Storage> {
    relationships: Vec<Relationship>,
    links: HashMap<LinkId, Link>,
    leases: LeaseDb,
    timers: Timers,
    storage: S,
    actions: Vec<Action>,
    next_link: u64,
}

impl<S: Storage> Failover<S> {
    /// Builds the engine from configuration and whatever the storage has
    /// persisted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration does not
    /// validate or pools overlap.
    pub fn new(config: &Config, storage: S, now: i64) -> Result<Self> {
        config.validate()?;

        let mut leases = LeaseDb::from_pools(&config.pools)?;
        let snapshot = storage.snapshot();
        let restored = snapshot
            .leases
            .values()
            .filter(|lease| leases.restore(lease))
            .count();
        if restored > 0 {
            info!("Restored {} lease(s) from storage", restored);
        }

        let relationships = config
            .relationships
            .iter()
            .map(|peer| Relationship::new(peer.clone(), snapshot.states.get(&peer.name), now))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            relationships,
            links: HashMap::new(),
            leases,
            timers: Timers::new(),
            storage,
            actions: Vec::new(),
            next_link: 1,
        })
    }

    /// Puts every relationship into startup, asks for listeners and
    /// outbound connections, and arms the pool expiry timers.
    pub fn start(&mut self, now: i64) {
        let mut listening = Vec::new();
        for relationship in &self.relationships {
            let addr = relationship.local_socket();
            if !listening.contains(&addr) {
                listening.push(addr);
                self.actions.push(Action::Listen { addr });
            }
        }

        for idx in 0..self.relationships.len() {
            let relationship = &self.relationships[idx];
            info!(
                "failover peer {}: starting as {} in {}",
                relationship.name, relationship.role, relationship.me.state
            );
            self.apply_local_event(idx, LocalEvent::Startup, now);
            self.request_connect(idx);
        }

        for pool in 0..self.leases.pools().len() {
            self.reschedule_pool(PoolId(pool), now);
        }
    }

    /// Drains the actions produced since the last call.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// When [`Failover::fire_timers`] next has work.
    pub fn next_deadline(&mut self) -> Option<i64> {
        self.timers.next_deadline()
    }

    /// Runs every timer due at or before `now`.
    pub fn fire_timers(&mut self, now: i64) {
        while let Some(kind) = self.timers.pop_due(now) {
            debug!("Timer {:?} fired", kind);
            self.fire(kind, now);
        }
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|relationship| relationship.name == name)
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn leases(&self) -> &LeaseDb {
        &self.leases
    }

    pub fn lease(&self, address: Ipv4Addr) -> Option<&Lease> {
        self.leases.find_by_address(address).map(|id| &self.leases[id])
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Number of open connections, handshaken or not.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Management attributes of a relationship.
    pub fn status(&self, name: &str) -> Result<RelationshipStatus> {
        Ok(self.relationships[self.index_of(name)?].status())
    }

    pub fn statuses(&self) -> Vec<RelationshipStatus> {
        self.relationships.iter().map(Relationship::status).collect()
    }

    /// Forces the local state of a relationship, as an operator would.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRelationship`] for an unknown name and
    /// [`Error::Persistence`] if the new state could not be recorded, in
    /// which case the relationship keeps its old state.
    pub fn set_local_state(&mut self, name: &str, state: FailoverState, now: i64) -> Result<()> {
        let idx = self.index_of(name)?;
        info!("failover peer {}: local state set to {} by operator", name, state);
        self.set_state(idx, state, now)
    }

    /// Changes a lease on behalf of the DHCP service and propagates the
    /// change to the partner.
    ///
    /// `change` sets the lease's next binding state and whatever client
    /// fields go with it; the transition is then committed to storage and
    /// queued for the partner.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeaseNotFound`] for an unknown address, or the
    /// storage error if the lease could not be committed. On error the
    /// lease is left as it was.
    pub fn update_lease<F>(&mut self, address: Ipv4Addr, now: i64, change: F) -> Result<()>
    where
        F: FnOnce(&mut Lease),
    {
        let id = self
            .leases
            .find_by_address(address)
            .ok_or(Error::LeaseNotFound(address))?;
        let idx = self.lease_relationship(id)?;

        let mut updated = self.leases[id].clone();
        change(&mut updated);
        let old = self.advance(idx, &mut updated, true, true);
        let new = updated.binding_state;

        self.persist(|storage| storage.write_lease(&updated))?;

        let pool = updated.pool;
        self.install(idx, id, updated, true, now);
        if balance_affected(old, new) {
            self.pool_check(idx, pool, now);
        }
        self.send_updates(idx, now);
        Ok(())
    }

    /// Whether this server may hand the lease at `address` to a client.
    pub fn is_mine_to_reallocate(&self, address: Ipv4Addr, now: i64) -> Result<bool> {
        let id = self
            .leases
            .find_by_address(address)
            .ok_or(Error::LeaseNotFound(address))?;
        let relationship = &self.relationships[self.lease_relationship(id)?];
        Ok(lease_mine_to_reallocate(
            &self.leases[id],
            relationship.role,
            relationship.service_state,
            relationship.me.stos,
            i64::from(relationship.mclt),
            now,
        ))
    }

    /// Whether this server should answer a client under the relationship's
    /// load balancing. `seconds` is the client's elapsed-time field.
    pub fn load_balance_mine(&self, name: &str, client_key: &[u8], seconds: u16) -> Result<bool> {
        let relationship = &self.relationships[self.index_of(name)?];
        Ok(balance::load_balance_mine(
            relationship.hba(),
            relationship.role,
            client_key,
            seconds,
            relationship.config.load_balance_max_seconds,
        ))
    }

    // ---- transport events ----

    /// An outbound connection for `relationship` is up.
    pub fn connected(&mut self, relationship: &str, peer: SocketAddr, now: i64) -> Result<LinkId> {
        let idx = self.index_of(relationship)?;
        let link = self.new_link(peer, Some(relationship.to_string()), true);
        info!("failover peer {}: connected to {} ({})", relationship, peer, link);
        self.begin_link(link, Some(idx), now);
        Ok(link)
    }

    /// An outbound connection attempt failed.
    pub fn connect_failed(&mut self, relationship: &str, now: i64) {
        if self.find(relationship).is_some() {
            warn!(
                "failover peer {}: connect failed, retrying in {}s",
                relationship, RETRY_INTERVAL
            );
            self.timers.add(
                TimerKind::Reconnect(relationship.to_string()),
                now + RETRY_INTERVAL,
            );
        }
    }

    /// An inbound connection arrived. Returns `None` if no relationship
    /// expects a partner at that address; the transport drops it.
    pub fn accepted(&mut self, peer: SocketAddr, now: i64) -> Option<LinkId> {
        let matching: Vec<usize> = (0..self.relationships.len())
            .filter(|idx| self.relationships[*idx].config.peer_address == peer.ip())
            .collect();
        if matching.is_empty() {
            warn!("Refusing failover connection from unknown peer {}", peer);
            return None;
        }

        let hint = match matching.as_slice() {
            [idx] => Some(*idx),
            _ => None,
        };
        let name = hint.map(|idx| self.relationships[idx].name.clone());
        let link = self.new_link(peer, name, false);
        info!("Accepted failover connection from {} ({})", peer, link);
        self.begin_link(link, hint, now);
        Some(link)
    }

    /// A listener could not be bound.
    pub fn listen_failed(&mut self, addr: SocketAddr, now: i64) {
        warn!("Cannot listen on {}, retrying in {}s", addr, RETRY_INTERVAL);
        self.timers
            .add(TimerKind::ListenerRestart(addr), now + RETRY_INTERVAL);
    }

    /// Bytes arrived on a connection.
    pub fn receive(&mut self, link: LinkId, data: &[u8], now: i64) {
        let Some(conn) = self.links.get_mut(&link) else {
            return;
        };
        match conn.feed(data) {
            Ok(messages) => {
                for message in messages {
                    if !self.links.contains_key(&link) {
                        break;
                    }
                    self.dispatch(link, message, now);
                }
            }
            Err(error) => {
                warn!("{}: {}", link, error);
                self.close_link(link, now);
            }
        }
    }

    /// The transport lost or closed a connection.
    pub fn link_closed(&mut self, link: LinkId, now: i64) {
        if let Some(conn) = self.links.remove(&link) {
            info!("{}: connection to {} closed", link, conn.peer);
            self.link_gone(conn, now);
        }
    }

    // ---- lookups ----

    fn find(&self, name: &str) -> Option<usize> {
        self.relationships
            .iter()
            .position(|relationship| relationship.name == name)
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.find(name)
            .ok_or_else(|| Error::UnknownRelationship(name.to_string()))
    }

    fn established(&self, link: LinkId) -> Option<usize> {
        self.relationships
            .iter()
            .position(|relationship| relationship.link == Some(link))
    }

    fn pool_relationship(&self, pool: PoolId) -> Option<usize> {
        self.leases
            .pool(pool)
            .and_then(|pool| self.find(&pool.relationship))
    }

    fn lease_relationship(&self, id: LeaseId) -> Result<usize> {
        let pool = self.leases[id].pool;
        self.pool_relationship(pool).ok_or_else(|| {
            Error::UnknownRelationship(
                self.leases
                    .pool(pool)
                    .map_or_else(String::new, |pool| pool.relationship.clone()),
            )
        })
    }

    // ---- timers ----

    fn fire(&mut self, kind: TimerKind, now: i64) {
        let idx = kind.relationship().and_then(|name| self.find(name));

        match (kind, idx) {
            (TimerKind::Reconnect(_), Some(idx)) => {
                if self.relationships[idx].link.is_none() {
                    self.request_connect(idx);
                }
            }
            (TimerKind::ListenerRestart(addr), _) => self.actions.push(Action::Listen { addr }),
            (TimerKind::LinkStartup(link), _) => {
                if self.links.contains_key(&link) && self.established(link).is_none() {
                    warn!("{}: connect handshake timed out", link);
                    self.close_link(link, now);
                }
            }
            (TimerKind::SendContact(_), Some(idx)) => {
                self.send_to_peer(idx, Message::new(MessageType::Contact), now);
            }
            (TimerKind::PeerTimeout(_), Some(idx)) => {
                let relationship = &self.relationships[idx];
                error!(
                    "failover peer {}: timeout waiting for failover peer",
                    relationship.name
                );
                if let Some(link) = relationship.link {
                    self.close_link(link, now);
                }
            }
            (TimerKind::Startup(_), Some(idx)) => {
                if self.relationships[idx].me.state == FailoverState::Startup {
                    info!(
                        "failover peer {}: no word from partner, leaving startup",
                        self.relationships[idx].name
                    );
                    self.apply_local_event(idx, LocalEvent::ConnectTimeout, now);
                }
            }
            (TimerKind::RecoverDone(name), Some(idx)) => {
                if self.relationships[idx].me.state == FailoverState::RecoverWait
                    && !self.try_set_state(idx, FailoverState::RecoverDone, now)
                {
                    self.timers
                        .add(TimerKind::RecoverDone(name), now + COMMIT_DELAY);
                }
            }
            (TimerKind::AutoPartnerDown(name), Some(idx)) => {
                if self.relationships[idx].me.state == FailoverState::CommunicationsInterrupted {
                    info!(
                        "failover peer {}: partner unreachable for too long, assuming partner-down",
                        name
                    );
                    if !self.try_set_state(idx, FailoverState::PartnerDown, now) {
                        self.timers
                            .add(TimerKind::AutoPartnerDown(name), now + COMMIT_DELAY);
                    }
                }
            }
            (TimerKind::Rebalance(_), Some(idx)) => self.pool_rebalance(idx, now),
            (TimerKind::FlushAcks(_), Some(idx)) => self.send_acks(idx, now),
            (TimerKind::CommitLeases, _) => {
                self.commit("deferred lease commit");
            }
            (TimerKind::PoolExpiry(pool), _) => self.pool_timer(pool, now),
            (kind, None) => debug!("Dropping timer {:?} for an unknown relationship", kind),
        }
    }

    // ---- storage ----

    fn commit(&mut self, what: &str) -> bool {
        match self.storage.commit() {
            Ok(()) => true,
            Err(error) => {
                error!("Unable to commit leases ({}): {}", what, error);
                false
            }
        }
    }

    /// Makes a single write durable on its own.
    ///
    /// Earlier writes are committed first, so a failed commit drops only
    /// this write and the caller can roll its change back.
    fn persist<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce(&mut S) -> Result<()>,
    {
        self.storage.commit()?;
        let written = write(&mut self.storage).and_then(|()| self.storage.commit());
        if written.is_err() {
            self.storage.discard();
        }
        written
    }

    fn write_lease(&mut self, id: LeaseId) -> bool {
        match self.storage.write_lease(&self.leases[id]) {
            Ok(()) => true,
            Err(error) => {
                error!("Unable to write lease {}: {}", self.leases[id].ip_address, error);
                false
            }
        }
    }

    // ---- links ----

    fn new_link(&mut self, peer: SocketAddr, relationship: Option<String>, outbound: bool) -> LinkId {
        let id = LinkId(self.next_link);
        self.next_link += 1;
        self.links
            .insert(id, Link::new(id, peer, relationship, outbound));
        id
    }

    /// Arms the handshake timeout; the primary opens the handshake on every
    /// connection it knows the relationship of.
    fn begin_link(&mut self, link: LinkId, idx: Option<usize>, now: i64) {
        self.timers
            .add(TimerKind::LinkStartup(link), now + LINK_STARTUP_TIMEOUT);

        let Some(idx) = idx else {
            return;
        };
        if self.relationships[idx].role == Role::Primary {
            let relationship = &self.relationships[idx];
            let connect = Message::new(MessageType::Connect)
                .with(FailoverOption::RelationshipName(relationship.name.clone()))
                .with(FailoverOption::MaxUnacked(relationship.me.max_unacked))
                .with(FailoverOption::ReceiveTimer(relationship.me.max_response_delay))
                .with(FailoverOption::VendorClass(VENDOR_CLASS.to_string()))
                .with(FailoverOption::ProtocolVersion(PROTOCOL_VERSION))
                .with(FailoverOption::Mclt(relationship.mclt))
                .with_optional(
                    relationship
                        .hba()
                        .map(|hba| FailoverOption::Hba(hba.to_vec())),
                );
            self.send(link, connect, now);
        }
    }

    fn request_connect(&mut self, idx: usize) {
        let relationship = &self.relationships[idx];
        self.actions.push(Action::Connect {
            relationship: relationship.name.clone(),
            addr: relationship.peer_socket(),
        });
    }

    fn close_link(&mut self, link: LinkId, now: i64) {
        let Some(conn) = self.links.remove(&link) else {
            return;
        };
        debug!("{}: closing connection to {}", link, conn.peer);
        self.actions.push(Action::Close { link });
        self.link_gone(conn, now);
    }

    fn link_gone(&mut self, conn: Link, now: i64) {
        self.timers.cancel(&TimerKind::LinkStartup(conn.id));

        let Some(idx) = conn.relationship.as_deref().and_then(|name| self.find(name)) else {
            return;
        };
        if self.relationships[idx].link == Some(conn.id) {
            self.peer_disconnected(idx, now);
        }
        let name = self.relationships[idx].name.clone();
        self.timers
            .add(TimerKind::Reconnect(name), now + RECONNECT_DELAY);
    }

    /// The relationship lost its established connection.
    fn peer_disconnected(&mut self, idx: usize, now: i64) {
        let relationship = &mut self.relationships[idx];
        relationship.link = None;
        relationship.pending_request = PendingRequest::None;
        relationship.send_update_done = None;
        relationship.toack_queue.clear();
        relationship.requeue_unacked(&mut self.leases);

        let name = relationship.name.clone();
        warn!("failover peer {}: disconnected", name);

        for kind in [
            TimerKind::SendContact(name.clone()),
            TimerKind::PeerTimeout(name.clone()),
            TimerKind::Startup(name.clone()),
            TimerKind::FlushAcks(name),
        ] {
            self.timers.cancel(&kind);
        }

        self.apply_local_event(idx, LocalEvent::Disconnect, now);
    }

    /// Encodes and queues a message on a connection. Assigns the next
    /// transaction id unless the message already carries one. Returns the
    /// transaction id used.
    fn send(&mut self, link: LinkId, mut message: Message, now: i64) -> Option<u32> {
        let conn = self.links.get_mut(&link)?;
        if message.xid == 0 {
            message.xid = conn.next_xid();
        }
        message.time = wire_time(now);

        match message.encode() {
            Ok(bytes) => {
                debug!("{}: sending {} xid {}", link, message.message_type, message.xid);
                self.actions.push(Action::Send { link, bytes });
                Some(message.xid)
            }
            Err(error) => {
                error!("{}: cannot encode {}: {}", link, message.message_type, error);
                None
            }
        }
    }

    /// Sends on the relationship's established connection and pushes the
    /// keepalive back. Returns false if there is no connection.
    fn send_to_peer(&mut self, idx: usize, message: Message, now: i64) -> bool {
        let Some(link) = self.relationships[idx].link else {
            return false;
        };
        if self.send(link, message, now).is_none() {
            return false;
        }

        let relationship = &mut self.relationships[idx];
        relationship.last_packet_sent = now;
        let interval = i64::from(relationship.partner.max_response_delay / 3).max(1);
        self.timers.add(
            TimerKind::SendContact(relationship.name.clone()),
            now + interval,
        );
        true
    }

    fn send_disconnect(&mut self, link: LinkId, reason: RejectReason, text: &str, now: i64) {
        let disconnect = Message::new(MessageType::Disconnect)
            .with(FailoverOption::RejectReason(reason))
            .with(FailoverOption::Message(text.to_string()));
        self.send(link, disconnect, now);
        self.close_link(link, now);
    }

    // ---- message dispatch ----

    fn dispatch(&mut self, link: LinkId, message: Message, now: i64) {
        debug!("{}: received {} xid {}", link, message.message_type, message.xid);

        match message.message_type {
            MessageType::Connect => return self.handle_connect(link, &message, now),
            MessageType::ConnectAck => return self.handle_connect_ack(link, &message, now),
            MessageType::Disconnect => return self.handle_disconnect(link, &message, now),
            _ => {}
        }

        let Some(idx) = self.established(link) else {
            warn!(
                "{}: {} before the connect handshake completed, ignoring",
                link, message.message_type
            );
            return;
        };
        self.note_received(idx, &message, now);

        match message.message_type {
            MessageType::State => self.peer_state_changed(idx, &message, now),
            MessageType::Contact => {}
            MessageType::BindUpdate => self.process_bind_update(idx, message, now),
            MessageType::BindAck => self.process_bind_ack(idx, &message, now),
            MessageType::UpdateRequest => self.process_update_request(idx, &message, false, now),
            MessageType::UpdateRequestAll => self.process_update_request(idx, &message, true, now),
            MessageType::UpdateDone => self.process_update_done(idx, now),
            MessageType::PoolRequest => self.process_pool_request(idx, &message, now),
            MessageType::PoolResponse => info!(
                "failover peer {}: pool response: {} leases",
                self.relationships[idx].name,
                message.addresses_transferred().unwrap_or(0)
            ),
            MessageType::Connect | MessageType::ConnectAck | MessageType::Disconnect => {}
        }
    }

    fn note_received(&mut self, idx: usize, message: &Message, now: i64) {
        let relationship = &mut self.relationships[idx];
        relationship.last_timestamp_received = i64::from(message.time);
        relationship.skew = i64::from(message.time) - now;
        let deadline = now + i64::from(relationship.me.max_response_delay);
        self.timers
            .add(TimerKind::PeerTimeout(relationship.name.clone()), deadline);
    }

    /// Validates a connect from the primary. The first failing check
    /// decides the reject reason.
    fn check_connect(
        &self,
        idx: usize,
        message: &Message,
        now: i64,
    ) -> std::result::Result<(), (RejectReason, &'static str)> {
        let relationship = &self.relationships[idx];

        if relationship.role == Role::Primary {
            return Err((RejectReason::InvalidPartner, "both servers are primary"));
        }
        if (i64::from(message.time) - now).abs() > MAX_CLOCK_SKEW {
            return Err((RejectReason::TimeMismatch, "time offset too large"));
        }
        match message.hba() {
            Some(hba) if hba.len() != HBA_SIZE => {
                return Err((RejectReason::HbaConflict, "invalid HBA"));
            }
            None if relationship.hba().is_some() => {
                return Err((RejectReason::HbaConflict, "HBA required"));
            }
            _ => {}
        }
        if relationship.link.is_some() {
            return Err((RejectReason::DuplicateConnection, "already connected"));
        }
        if message.mclt().is_none() {
            return Err((RejectReason::InvalidMclt, "no MCLT provided"));
        }
        Ok(())
    }

    fn handle_connect(&mut self, link: LinkId, message: &Message, now: i64) {
        let name = message.relationship_name().unwrap_or("unknown").to_string();
        let Some(idx) = message.relationship_name().and_then(|name| self.find(name)) else {
            error!("Failover CONNECT from {}: unknown failover relationship name", name);
            return self.send_disconnect(
                link,
                RejectReason::InvalidPartner,
                "unknown failover relationship name",
                now,
            );
        };

        if let Err((reason, text)) = self.check_connect(idx, message, now) {
            error!("Failover CONNECT from {}: {}", name, text);
            return self.send_disconnect(link, reason, text, now);
        }

        let relationship = &mut self.relationships[idx];
        relationship.link = Some(link);
        if let Some(max_unacked) = message.max_unacked() {
            relationship.partner.max_unacked = max_unacked;
        }
        if let Some(receive_timer) = message.receive_timer() {
            relationship.partner.max_response_delay = receive_timer;
        }
        if let Some(mclt) = message.mclt() {
            relationship.mclt = mclt;
        }
        if let Some(hba) = message.hba().and_then(|hba| <[u8; HBA_SIZE]>::try_from(hba).ok()) {
            relationship.balance.hba = Some(hba);
        }

        let mut ack = Message::new(MessageType::ConnectAck)
            .with(FailoverOption::RelationshipName(relationship.name.clone()))
            .with(FailoverOption::MaxUnacked(relationship.me.max_unacked))
            .with(FailoverOption::ReceiveTimer(relationship.me.max_response_delay))
            .with(FailoverOption::VendorClass(VENDOR_CLASS.to_string()))
            .with(FailoverOption::ProtocolVersion(PROTOCOL_VERSION));
        ack.xid = message.xid;

        if let Some(conn) = self.links.get_mut(&link) {
            conn.relationship = Some(name.clone());
            info!("failover peer {}: connection from {} accepted", name, conn.peer);
        }
        self.timers.cancel(&TimerKind::LinkStartup(link));

        self.send_to_peer(idx, ack, now);
        self.note_received(idx, message, now);
        self.apply_local_event(idx, LocalEvent::Connect, now);
    }

    fn handle_connect_ack(&mut self, link: LinkId, message: &Message, now: i64) {
        self.timers.cancel(&TimerKind::LinkStartup(link));

        let idx = self
            .links
            .get(&link)
            .and_then(|conn| conn.relationship.as_deref())
            .and_then(|name| self.find(name));
        let Some(idx) = idx else {
            warn!("{}: connect-ack on a connection with no relationship", link);
            return self.close_link(link, now);
        };
        let name = self.relationships[idx].name.clone();

        if let Some(reason) = message.reject_reason() {
            error!(
                "Failover CONNECT to {} rejected: {}{}",
                name,
                reason,
                message.text().map(|text| format!(" ({})", text)).unwrap_or_default()
            );
            return self.close_link(link, now);
        }

        let rejection = match message.relationship_name() {
            None => Some((RejectReason::InvalidPartner, "missing relationship-name".to_string())),
            Some(remote) if remote != name => Some((
                RejectReason::InvalidPartner,
                format!("remote failover relationship name {} does not match", remote),
            )),
            Some(_) if self.relationships[idx].link.is_some() => Some((
                RejectReason::DuplicateConnection,
                "already connected".to_string(),
            )),
            Some(_) if (i64::from(message.time) - now).abs() > MAX_CLOCK_SKEW => Some((
                RejectReason::TimeMismatch,
                "time offset too large".to_string(),
            )),
            Some(_) => None,
        };
        if let Some((reason, text)) = rejection {
            error!("Failover CONNECTACK from {}: {}", name, text);
            return self.send_disconnect(link, reason, &text, now);
        }

        let relationship = &mut self.relationships[idx];
        relationship.link = Some(link);
        if let Some(max_unacked) = message.max_unacked() {
            relationship.partner.max_unacked = max_unacked;
        }
        if let Some(receive_timer) = message.receive_timer() {
            relationship.partner.max_response_delay = receive_timer;
        }
        info!("failover peer {}: connect accepted by partner", name);

        self.note_received(idx, message, now);
        self.apply_local_event(idx, LocalEvent::Connect, now);
    }

    fn handle_disconnect(&mut self, link: LinkId, message: &Message, now: i64) {
        let who = self
            .links
            .get(&link)
            .and_then(|conn| conn.relationship.clone())
            .unwrap_or_else(|| link.to_string());
        let reason = message
            .text()
            .map(str::to_string)
            .or_else(|| message.reject_reason().map(|reason| reason.to_string()))
            .unwrap_or_else(|| "no reason given".to_string());
        error!("failover peer {}: disconnect: {}", who, reason);
        self.close_link(link, now);
    }

    // ---- state machine ----

    fn apply_local_event(&mut self, idx: usize, event: LocalEvent, now: i64) {
        let relationship = &self.relationships[idx];
        match state::transition(relationship.me.state, relationship.saved_state, event) {
            LocalOutcome::Enter(next) => {
                if let Err(error) = self.set_state(idx, next, now) {
                    debug!("{} event not applied: {}", event, error);
                }
            }
            LocalOutcome::AnnounceState => self.send_state(idx, now),
            LocalOutcome::Unchanged => {}
        }
    }

    /// `set_state` for callers with nobody to report a failure to.
    /// Returns whether the state changed.
    fn try_set_state(&mut self, idx: usize, new: FailoverState, now: i64) -> bool {
        match self.set_state(idx, new, now) {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    "failover peer {}: staying in {} instead of {}: {}",
                    self.relationships[idx].name, self.relationships[idx].me.state, new, error
                );
                false
            }
        }
    }

    fn refresh_service_state(&mut self, idx: usize) {
        let relationship = &mut self.relationships[idx];
        if relationship.refresh_service_state() {
            match relationship.not_responding_reason {
                Some(reason) => info!(
                    "failover peer {}: service state {}: {}",
                    relationship.name, relationship.service_state, reason
                ),
                None => info!(
                    "failover peer {}: service state {}",
                    relationship.name, relationship.service_state
                ),
            }
        }
    }

    fn send_state(&mut self, idx: usize, now: i64) {
        let relationship = &self.relationships[idx];
        let flags = if relationship.service_state == ServiceState::StartingUp {
            SERVER_FLAG_STARTUP
        } else {
            0
        };
        let message = Message::new(MessageType::State)
            .with(FailoverOption::ServerState(relationship.effective_state() as u8))
            .with(FailoverOption::ServerFlags(flags))
            .with(FailoverOption::Stos(wire_time(relationship.me.stos)));
        self.send_to_peer(idx, message, now);
    }

    /// Moves the relationship to a new local state.
    ///
    /// The state is persisted before anything else happens; if that fails
    /// the relationship is left exactly as it was.
    fn set_state(&mut self, idx: usize, new: FailoverState, now: i64) -> Result<()> {
        use FailoverState::*;

        let relationship = &mut self.relationships[idx];
        let old = relationship.me.state;
        let old_stos = relationship.me.stos;
        let old_saved = relationship.saved_state;

        if new != RecoverWait && new != Startup && old != Startup {
            relationship.me.stos = now;
        }
        if new == Recover
            && old == ShutDown
            && relationship.partner.state == PartnerDown
            && relationship.update_queue().is_empty()
            && relationship.ack_queue().is_empty()
        {
            relationship.me.stos = now - i64::from(relationship.mclt);
        }
        relationship.me.state = new;
        if new == Startup && old != Startup {
            relationship.saved_state = old;
        }

        let record = relationship.state_record();
        if let Err(error) = self.persist(|storage| storage.write_state(&record)) {
            let relationship = &mut self.relationships[idx];
            relationship.me.state = old;
            relationship.me.stos = old_stos;
            relationship.saved_state = old_saved;
            error!(
                "Unable to record current failover state for {}: {}",
                relationship.name, error
            );
            return Err(Error::Persistence(format!("{}: {}", relationship.name, error)));
        }

        if matches!(old, Normal | PotentialConflict | PartnerDown) {
            let relationship = &mut self.relationships[idx];
            relationship.requeue_unacked(&mut self.leases);
        }

        let name = self.relationships[idx].name.clone();
        info!("failover peer {}: I move from {} to {}", name, old, new);
        if new == Normal && self.relationships[idx].partner.state == Normal {
            info!("failover peer {}: Both servers normal", name);
        }

        if old == Startup && new != Startup {
            self.timers.cancel(&TimerKind::Startup(name.clone()));
        }
        self.timers.cancel(&TimerKind::AutoPartnerDown(name.clone()));
        self.refresh_service_state(idx);
        if self.relationships[idx].link.is_some() {
            self.send_state(idx, now);
        }

        match new {
            CommunicationsInterrupted => {
                let delay = self.relationships[idx].config.auto_partner_down;
                if delay > 0 {
                    self.timers
                        .add(TimerKind::AutoPartnerDown(name), now + i64::from(delay));
                }
            }
            Normal => {
                self.pool_balance(idx, now);
                self.generate_update_queue(idx, false);
                if !self.relationships[idx].update_queue().is_empty() {
                    info!("failover peer {}: sending updates", name);
                    self.send_updates(idx, now);
                }
            }
            PotentialConflict => {
                if self.relationships[idx].role == Role::Primary {
                    self.send_update_request(idx, now);
                }
            }
            Startup => self.timers.add(TimerKind::Startup(name), now + STARTUP_TIMEOUT),
            RecoverWait => {
                let relationship = &self.relationships[idx];
                let done = relationship.me.stos + i64::from(relationship.mclt);
                if done > now {
                    self.timers.add(TimerKind::RecoverDone(name), done);
                } else {
                    return self.set_state(idx, RecoverDone, now);
                }
            }
            Recover => {
                if self.relationships[idx].link.is_some() {
                    self.send_update_request_all(idx, now);
                }
            }
            PartnerDown => self.enter_partner_down(idx, now),
            Unknown | Paused | ShutDown | RecoverDone | ResolutionInterrupted | ConflictDone => {}
        }

        Ok(())
    }

    /// Handles the partner's state message.
    fn peer_state_changed(&mut self, idx: usize, message: &Message, now: i64) {
        let code = message
            .server_state()
            .unwrap_or(FailoverState::Unknown as u8);
        let reported = FailoverState::from_code(code);
        let starting = message.server_flags().unwrap_or(0) & SERVER_FLAG_STARTUP != 0;

        let relationship = &self.relationships[idx];
        let previous = relationship.partner.state;
        let name = relationship.name.clone();

        if reported == Some(previous) && relationship.me.state != FailoverState::Unknown {
            if relationship.me.state == FailoverState::Startup {
                let saved = relationship.saved_state;
                self.try_set_state(idx, saved, now);
                self.refresh_service_state(idx);
                return;
            }
            if !state::repeat_needs_processing(relationship.me.state) {
                return;
            }
        }

        let relationship = &mut self.relationships[idx];
        match reported {
            Some(new) => {
                relationship.partner.state = new;
                info!("failover peer {}: peer moves from {} to {}", name, previous, new);
            }
            None => error!("failover peer {}: peer reported undefined state {}", name, code),
        }
        relationship.partner.stos = message.stos().map_or(now, i64::from);
        if relationship.me.state == FailoverState::Normal
            && relationship.partner.state == FailoverState::Normal
        {
            info!("failover peer {}: Both servers normal", name);
        }

        let record = relationship.state_record();
        if let Err(error) = self
            .storage
            .write_state(&record)
            .and_then(|()| self.storage.commit())
        {
            error!("failover peer {}: unable to record peer state: {}", name, error);
        }

        let relationship = &self.relationships[idx];
        let outcome = state::on_peer_state(
            relationship.effective_state(),
            relationship.me.state == FailoverState::Startup,
            previous,
            reported,
            starting,
        );
        self.apply_peer_outcome(idx, outcome, now);

        let relationship = &self.relationships[idx];
        if relationship.me.state == FailoverState::Startup {
            let saved = relationship.saved_state;
            self.try_set_state(idx, saved, now);
        }
        self.refresh_service_state(idx);
    }

    fn apply_peer_outcome(&mut self, idx: usize, outcome: PeerOutcome, now: i64) {
        let name = self.relationships[idx].name.clone();
        let result = match outcome {
            PeerOutcome::Nothing => Ok(()),
            PeerOutcome::Enter(next) => self.set_state(idx, next, now),
            PeerOutcome::PoolCheck => {
                for pool in self.leases.pools_for(&name) {
                    self.pool_check(idx, pool, now);
                }
                Ok(())
            }
            PeerOutcome::SendUpdateRequest => {
                self.send_update_request(idx, now);
                Ok(())
            }
            PeerOutcome::SendUpdateRequestAll => {
                self.send_update_request_all(idx, now);
                Ok(())
            }
            PeerOutcome::FlushThenEnter(next) => {
                self.send_updates(idx, now);
                self.set_state(idx, next, now)
            }
            PeerOutcome::Violation(reason) => {
                error!("failover peer {}: {}", name, reason);
                Ok(())
            }
            PeerOutcome::WarnThenEnter(reason, next) => {
                error!("failover peer {}: {}", name, reason);
                self.set_state(idx, next, now)
            }
            PeerOutcome::ShutDown(reason) => {
                error!("failover peer {}: {}, shutting down", name, reason);
                self.set_state(idx, FailoverState::ShutDown, now)
            }
        };
        if let Err(error) = result {
            debug!("failover peer {}: state change not applied: {}", name, error);
        }
    }

    fn enter_partner_down(&mut self, idx: usize, now: i64) {
        let relationship = &self.relationships[idx];
        let free_at = relationship.me.stos + i64::from(relationship.mclt);
        for pool in self.leases.pools_for(&relationship.name) {
            for id in self.leases.list(pool, PoolList::Expired, true) {
                self.leases[id].tsfp = free_at;
            }
            self.reschedule_pool(pool, now);
        }
    }

    // ---- lease transitions ----

    /// Commits a lease's pending transition in a copy of the lease.
    /// Returns the state it left.
    fn advance(&self, idx: usize, lease: &mut Lease, propagate: bool, commit: bool) -> BindingState {
        use BindingState::*;

        let relationship = &self.relationships[idx];
        let old = lease.commit_transition();
        if relationship.me.state == FailoverState::PartnerDown
            && matches!(lease.binding_state, Expired | Released | Abandoned | Reset)
        {
            lease.tsfp = relationship.me.stos + i64::from(relationship.mclt);
        }
        if propagate {
            lease.desired_binding_state = lease.binding_state;
            if commit
                && matches!(
                    relationship.service_state,
                    ServiceState::Cooperating | ServiceState::NotResponding
                )
            {
                lease.rewind_binding_state = lease.binding_state;
            }
        }
        old
    }

    /// Replaces a lease with an updated copy, keeping its queue membership.
    fn install(&mut self, idx: usize, id: LeaseId, mut updated: Lease, propagate: bool, now: i64) {
        let current = &self.leases[id];
        updated.pool = current.pool;
        updated.queue = current.queue;
        updated.last_xid = current.last_xid;
        self.leases[id] = updated;

        if propagate {
            let relationship = &mut self.relationships[idx];
            relationship.enqueue_update(&mut self.leases, id);
        }
        self.note_lease_timer(id, now);
    }

    /// Applies the lease's pending transition in place.
    fn supersede_lease(&mut self, idx: usize, id: LeaseId, now: i64, propagate: bool, commit: bool) {
        let mut updated = self.leases[id].clone();
        self.advance(idx, &mut updated, propagate, commit);
        self.install(idx, id, updated, propagate, now);
        if commit && self.write_lease(id) {
            self.commit("lease transition");
        }
    }

    /// Makes sure the pool timer fires no later than this lease's next
    /// transition.
    fn note_lease_timer(&mut self, id: LeaseId, now: i64) {
        let lease = &self.leases[id];
        if !lease.has_pending_transition() {
            return;
        }
        let pool = lease.pool;
        let partner_down = self
            .pool_relationship(pool)
            .is_some_and(|idx| self.relationships[idx].me.state == FailoverState::PartnerDown);
        let due = lease.sort_time(partner_down).max(now);

        let Some(entry) = self.leases.pool_mut(pool) else {
            return;
        };
        if entry.next_event_time.is_none_or(|next| due < next) {
            entry.next_event_time = Some(due);
            self.timers.add(TimerKind::PoolExpiry(pool), due);
        }
    }

    /// Lists whose leases the pool timer moves along. A secondary in normal
    /// leaves active leases to the primary, and expired leases only become
    /// free on their own in partner-down.
    fn due_lists(&self, idx: usize) -> Vec<PoolList> {
        let relationship = &self.relationships[idx];
        let partner_down = relationship.me.state == FailoverState::PartnerDown;
        let mut lists = Vec::new();
        if partner_down
            || !(relationship.role == Role::Secondary
                && relationship.me.state == FailoverState::Normal)
        {
            lists.push(PoolList::Active);
        }
        if partner_down {
            lists.push(PoolList::Expired);
        }
        lists.push(PoolList::Abandoned);
        lists
    }

    fn reschedule_pool(&mut self, pool: PoolId, now: i64) {
        let Some(idx) = self.pool_relationship(pool) else {
            return;
        };
        let partner_down = self.relationships[idx].me.state == FailoverState::PartnerDown;

        let next = self
            .due_lists(idx)
            .into_iter()
            .flat_map(|list| self.leases.list(pool, list, partner_down))
            .filter(|id| self.leases[*id].has_pending_transition())
            .map(|id| self.leases[id].sort_time(partner_down).max(now))
            .min();

        if let Some(entry) = self.leases.pool_mut(pool) {
            entry.next_event_time = next;
        }
        match next {
            Some(due) => self.timers.add(TimerKind::PoolExpiry(pool), due),
            None => {
                self.timers.cancel(&TimerKind::PoolExpiry(pool));
            }
        }
    }

    /// Applies every lease transition in the pool that has come due.
    fn pool_timer(&mut self, pool: PoolId, now: i64) {
        let Some(idx) = self.pool_relationship(pool) else {
            return;
        };
        if let Some(entry) = self.leases.pool_mut(pool) {
            entry.next_event_time = None;
        }
        let partner_down = self.relationships[idx].me.state == FailoverState::PartnerDown;

        let mut changed = 0;
        for list in self.due_lists(idx) {
            for id in self.leases.list(pool, list, partner_down) {
                let lease = &self.leases[id];
                if lease.sort_time(partner_down) > now {
                    break;
                }
                if !lease.has_pending_transition() {
                    continue;
                }

                let relationship = &self.relationships[idx];
                let rewind = lease.rewind_binding_state;
                let can_rewind = relationship.service_state == ServiceState::NotCooperating
                    && lease.next_binding_state == BindingState::Expired
                    && match relationship.role {
                        Role::Primary => rewind == BindingState::Free,
                        Role::Secondary => rewind == BindingState::Backup,
                    };
                if can_rewind {
                    self.leases[id].next_binding_state = rewind;
                }

                debug!(
                    "{}: {} to {}",
                    self.leases[id].ip_address,
                    self.leases[id].binding_state,
                    self.leases[id].next_binding_state
                );
                self.supersede_lease(idx, id, now, true, true);
                changed += 1;
            }
        }

        if changed > 0 {
            self.pool_check(idx, pool, now);
            self.send_updates(idx, now);
        }
        self.reschedule_pool(pool, now);
    }

    // ---- update pipeline ----

    /// Sends batched acks, then as many queued updates as the partner's
    /// window allows.
    fn send_updates(&mut self, idx: usize, now: i64) {
        if self.relationships[idx].link.is_none() {
            return;
        }
        self.send_acks(idx, now);

        while self.relationships[idx].can_send_update() {
            let Some(&id) = self.relationships[idx].update_queue().front() else {
                break;
            };
            if !self.send_bind_update(idx, id, now) {
                break;
            }
            let relationship = &mut self.relationships[idx];
            relationship.mark_sent(&mut self.leases);
        }
    }

    fn send_bind_update(&mut self, idx: usize, id: LeaseId, now: i64) -> bool {
        let Some(link) = self.relationships[idx].link else {
            return false;
        };
        let role = self.relationships[idx].role;
        let Some(xid) = self.links.get_mut(&link).map(Link::next_xid) else {
            return false;
        };

        let lease = &mut self.leases[id];
        lease.last_xid = xid;

        let mut status = lease.desired_binding_state;
        let mut flags = 0u16;
        if lease.reserved {
            flags |= IP_FLAG_RESERVE;
            status = match (role, status) {
                (Role::Primary, BindingState::Free) => BindingState::Backup,
                (Role::Secondary, BindingState::Backup) => BindingState::Free,
                (_, status) => status,
            };
        }
        if lease.bootp {
            flags |= IP_FLAG_BOOTP;
        }

        let rewound = lease.rewind_binding_state != lease.binding_state;
        if rewound {
            lease.rewind_binding_state = lease.binding_state;
        }

        let mut update = Message::new(MessageType::BindUpdate)
            .with(FailoverOption::AssignedIpAddress(lease.ip_address))
            .with(FailoverOption::BindingStatus(status))
            .with_optional(
                (!lease.client_identifier.is_empty())
                    .then(|| FailoverOption::ClientIdentifier(lease.client_identifier.clone())),
            )
            .with_optional(
                (!lease.hardware_address.is_empty())
                    .then(|| FailoverOption::Chaddr(lease.hardware_address.clone())),
            )
            .with(FailoverOption::LeaseExpiry(wire_time(lease.ends)))
            .with(FailoverOption::PotentialExpiry(wire_time(lease.tstp)))
            .with(FailoverOption::Stos(wire_time(lease.starts)))
            .with_optional((lease.cltt != 0).then(|| FailoverOption::Cltt(wire_time(lease.cltt))))
            .with_optional((flags != 0).then_some(FailoverOption::IpFlags(flags)));
        update.xid = xid;

        if rewound && self.write_lease(id) {
            self.commit("rewind state");
        }
        self.send_to_peer(idx, update, now)
    }

    fn send_bind_ack(
        &mut self,
        idx: usize,
        xid: u32,
        address: Option<Ipv4Addr>,
        reject: Option<(RejectReason, &str)>,
        now: i64,
    ) {
        let mut ack = Message::new(MessageType::BindAck)
            .with_optional(address.map(FailoverOption::AssignedIpAddress))
            .with_optional(reject.map(|(reason, _)| FailoverOption::RejectReason(reason)))
            .with_optional(reject.map(|(_, text)| FailoverOption::Message(text.to_string())));
        ack.xid = xid;
        self.send_to_peer(idx, ack, now);
    }

    /// Holds an accepted update's ack for batching.
    fn queue_ack(&mut self, idx: usize, message: Message, now: i64) {
        let relationship = &mut self.relationships[idx];
        relationship.toack_queue.push_back(message);
        let batch = (relationship.partner.max_unacked / 2).max(1) as usize;
        if relationship.toack_queue.len() >= batch {
            self.send_acks(idx, now);
        }

        let relationship = &self.relationships[idx];
        if !relationship.toack_queue.is_empty() {
            self.timers.add(
                TimerKind::FlushAcks(relationship.name.clone()),
                now + ACK_FLUSH_DELAY,
            );
        }
    }

    /// Acks every held update. Accepted updates are committed first, so an
    /// ack never promises something a crash could lose.
    fn send_acks(&mut self, idx: usize, now: i64) {
        let relationship = &self.relationships[idx];
        if relationship.toack_queue.is_empty() || relationship.link.is_none() {
            return;
        }
        let name = relationship.name.clone();

        if !self.commit("acknowledging binding updates") {
            self.timers
                .add(TimerKind::FlushAcks(name), now + ACK_FLUSH_DELAY);
            return;
        }
        while let Some(message) = self.relationships[idx].toack_queue.pop_front() {
            self.send_bind_ack(idx, message.xid, message.assigned_address(), None, now);
        }
        self.timers.cancel(&TimerKind::FlushAcks(name));
    }

    /// Handles a partner's binding update: accepted updates are queued for
    /// a batched ack, refused ones are answered at once.
    fn process_bind_update(&mut self, idx: usize, message: Message, now: i64) {
        match self.apply_bind_update(idx, &message, now) {
            Ok(give_away) => {
                self.queue_ack(idx, message, now);
                if let Some(id) = give_away
                    && self.give_to_backup(idx, id, now)
                {
                    self.send_updates(idx, now);
                }
            }
            Err(error) => {
                let (reason, text) = match error {
                    Error::Rejected { reason, message } => (reason, message),
                    other => (RejectReason::MiscReject, other.to_string()),
                };
                warn!(
                    "failover peer {}: refusing bind update for {}: {}",
                    self.relationships[idx].name,
                    message
                        .assigned_address()
                        .map_or_else(|| "unknown address".to_string(), |addr| addr.to_string()),
                    text
                );
                self.send_bind_ack(
                    idx,
                    message.xid,
                    message.assigned_address(),
                    Some((reason, &text)),
                    now,
                );
            }
        }
    }

    /// Validates and installs a binding update. Returns the lease if it
    /// should now be handed to the secondary.
    ///
    /// Every check happens before anything changes, so a refused update
    /// leaves the lease and its queue membership untouched.
    fn apply_bind_update(&mut self, idx: usize, message: &Message, now: i64) -> Result<Option<LeaseId>> {
        use BindingState::*;

        let (Some(address), Some(status)) = (message.assigned_address(), message.binding_status())
        else {
            return Err(Error::rejected(
                RejectReason::MissingBindingInfo,
                "binding update lacks an address or binding status",
            ));
        };
        let id = self
            .leases
            .find_by_address(address)
            .ok_or_else(|| Error::rejected(RejectReason::IllegalIpAddress, "unknown IP address"))?;

        let relationship = &self.relationships[idx];
        let covered = self
            .leases
            .pool(self.leases[id].pool)
            .is_some_and(|pool| pool.relationship == relationship.name);
        if !covered {
            return Err(Error::rejected(
                RejectReason::IllegalIpAddress,
                "IP address is covered by a different failover relationship",
            ));
        }

        let current = &self.leases[id];
        let dueling = current.queue == QueueSlot::Ack;
        if dueling
            && local_update_wins(
                current,
                relationship.role,
                status,
                message.cltt().map(i64::from),
            )
        {
            return Err(Error::rejected(
                RejectReason::LessCriticalBindingInfo,
                "incoming update is less critical than outgoing update",
            ));
        }

        let mut updated = current.clone();
        match message.chaddr() {
            Some(_) if status == Abandoned => {
                return Err(Error::rejected(
                    RejectReason::MiscReject,
                    "BNDUPD to ABANDONED with a CHADDR",
                ));
            }
            Some(chaddr) => updated.hardware_address = chaddr.to_vec(),
            None if matches!(status, Active | Expired | Released) => {
                return Err(Error::rejected(
                    RejectReason::MissingBindingInfo,
                    "BNDUPD without CHADDR",
                ));
            }
            None if status == Abandoned => updated.hardware_address.clear(),
            None => {}
        }
        match message.client_identifier() {
            Some(_) if status == Abandoned => {
                return Err(Error::rejected(
                    RejectReason::MiscReject,
                    "BNDUPD to ABANDONED with client-id",
                ));
            }
            Some(client_id) => updated.client_identifier = client_id.to_vec(),
            None if !matches!(status, Reset | Free | Backup) => updated.client_identifier.clear(),
            None => {}
        }

        if let Some(stos) = message.stos() {
            updated.starts = i64::from(stos);
        }
        if let Some(expiry) = message.lease_expiry() {
            updated.ends = i64::from(expiry);
        }
        if let Some(cltt) = message.cltt() {
            updated.cltt = i64::from(cltt);
        }
        if let Some(potential) = message.potential_expiry() {
            updated.tsfp = i64::from(potential);
            updated.atsfp = updated.tsfp;
        }

        let ours_free = match relationship.role {
            Role::Primary => current.binding_state == Free,
            Role::Secondary => current.binding_state == Backup,
        };
        match message.ip_flags() {
            Some(flags) => {
                let reserve = flags & IP_FLAG_RESERVE != 0;
                let bootp = flags & IP_FLAG_BOOTP != 0;
                if reserve && ours_free && !current.reserved {
                    return Err(Error::rejected(
                        RejectReason::IpNotReserved,
                        "Address is not reserved.",
                    ));
                }
                if bootp && ours_free && !current.bootp {
                    return Err(Error::rejected(
                        RejectReason::MiscReject,
                        "Address is not allocated to BOOTP.",
                    ));
                }
                updated.reserved = reserve;
                updated.bootp = bootp;
            }
            None => {
                updated.reserved = false;
                updated.bootp = false;
            }
        }

        let allowed = if relationship.me.state == FailoverState::Normal {
            let tsfp = message.potential_expiry().map_or(0, i64::from);
            check_normal(current, relationship.role, status, tsfp, now)
        } else {
            check_conflict(current, status, now)
        };
        if allowed != status {
            return Err(Error::rejected(
                RejectReason::FatalConflict,
                format!(
                    "{}: invalid state transition: {} to {}",
                    address, current.binding_state, status
                ),
            ));
        }

        let returning = matches!(status, Expired | Released | Reset);
        let give_away = returning
            && relationship.role == Role::Primary
            && !updated.reserved
            && !updated.bootp
            && peer_wants_lease(relationship.hba(), relationship.role, &updated);

        updated.next_binding_state = if returning { Free } else { status };
        updated.rewind_binding_state = updated.next_binding_state;
        updated.desired_binding_state = updated.next_binding_state;
        let old = updated.commit_transition();
        let new = updated.binding_state;

        self.storage.write_lease(&updated).map_err(|error| {
            error!("Unable to write lease {}: {}", address, error);
            Error::rejected(RejectReason::MiscReject, "database update failed")
        })?;

        if dueling {
            let relationship = &mut self.relationships[idx];
            relationship.ack_queue_remove(&mut self.leases, id);
        }
        let pool = updated.pool;
        self.install(idx, id, updated, false, now);
        if balance_affected(old, new) {
            self.pool_check(idx, pool, now);
        }

        Ok(give_away.then_some(id))
    }

    /// Moves a lease the primary just freed to the secondary's backup
    /// pool, unless the secondary already holds more than its share.
    fn give_to_backup(&mut self, idx: usize, id: LeaseId, now: i64) -> bool {
        let pool = self.leases[id].pool;
        let free = self.leases.count(pool, PoolList::Free);
        let backup = self.leases.count(pool, PoolList::Backup);
        if !secondary_not_hoarding(free, backup, self.relationships[idx].config.max_lease_ownership) {
            return false;
        }

        let lease = &mut self.leases[id];
        lease.next_binding_state = BindingState::Backup;
        lease.tstp = now;
        lease.starts = now;
        self.supersede_lease(idx, id, now, true, false);
        self.write_lease(id);
        true
    }

    fn process_bind_ack(&mut self, idx: usize, message: &Message, now: i64) {
        let name = self.relationships[idx].name.clone();
        let Some(address) = message.assigned_address() else {
            warn!("failover peer {}: bind ack without an address", name);
            return;
        };
        let Some(id) = self.leases.find_by_address(address) else {
            info!("bind update on {} got ack from {}: no such lease", address, name);
            return;
        };

        let last_xid = self.leases[id].last_xid;
        if last_xid != 0 && last_xid != message.xid {
            info!("bind update on {} from {}: xid mismatch", address, name);
            return;
        }

        let mut give_away = false;
        if let Some(reason) = message.reject_reason() {
            error!(
                "bind update on {} from {} rejected: {}",
                address,
                name,
                message.text().map_or_else(|| reason.to_string(), str::to_string)
            );
        } else if last_xid != 0 {
            give_away = self.apply_bind_ack(idx, id, message, now);
        }

        let relationship = &mut self.relationships[idx];
        relationship.ack_queue_remove(&mut self.leases, id);
        if relationship.ack_queue().is_empty() {
            self.commit("last outstanding update acknowledged");
        }

        if self.relationships[idx].send_update_done == Some(id) {
            self.relationships[idx].send_update_done = None;
            self.send_update_done(idx, now);
        }

        if give_away
            && self.give_to_backup(idx, id, now)
            && self.relationships[idx].me.state == FailoverState::Normal
        {
            self.commit("lease handed to backup");
        }
        self.send_updates(idx, now);
    }

    /// Records the partner's acknowledgment of an update. Returns true if
    /// the lease, now free, should go to the secondary.
    fn apply_bind_ack(&mut self, idx: usize, id: LeaseId, message: &Message, now: i64) -> bool {
        use BindingState::*;

        let relationship = &self.relationships[idx];
        let role = relationship.role;
        let normal = relationship.me.state == FailoverState::Normal;

        let lease = &mut self.leases[id];
        let potential = message.potential_expiry().map_or(lease.tstp, i64::from);
        lease.tsfp = potential;
        lease.atsfp = potential;

        let old = lease.binding_state;
        let mut give_away = false;
        if matches!(lease.desired_binding_state, Expired | Reset | Released) {
            let next = if role == Role::Secondary && lease.reserved {
                Backup
            } else {
                Free
            };
            lease.next_binding_state = next;
            lease.desired_binding_state = next;
            lease.rewind_binding_state = next;
            lease.commit_transition();

            give_away = role == Role::Primary
                && !lease.reserved
                && !lease.bootp
                && peer_wants_lease(relationship.hba(), role, lease);

            if self.write_lease(id) && !give_away && normal {
                self.commit("released lease acknowledged");
            }
        } else {
            if lease.desired_binding_state != lease.binding_state {
                lease.next_binding_state = lease.desired_binding_state;
                lease.commit_transition();
            }
            self.write_lease(id);
            self.timers.add(TimerKind::CommitLeases, now + COMMIT_DELAY);
        }

        let lease = &self.leases[id];
        let (new, pool) = (lease.binding_state, lease.pool);
        self.note_lease_timer(id, now);
        if balance_affected(old, new) {
            self.pool_check(idx, pool, now);
        }
        give_away
    }

    /// Queues leases the partner may not have seen: every lease if `all`,
    /// else those whose potential expiry the partner has not acknowledged
    /// and anything expired. Returns how many were queued.
    fn generate_update_queue(&mut self, idx: usize, all: bool) -> usize {
        const LISTS: [PoolList; 6] = [
            PoolList::Free,
            PoolList::Active,
            PoolList::Expired,
            PoolList::Abandoned,
            PoolList::Backup,
            PoolList::Reserved,
        ];

        let name = self.relationships[idx].name.clone();
        let mut queued = 0;
        for pool in self.leases.pools_for(&name) {
            for list in LISTS {
                for id in self.leases.list(pool, list, false) {
                    let lease = &mut self.leases[id];
                    if lease.queue != QueueSlot::Idle {
                        continue;
                    }
                    if all || lease.tstp > lease.atsfp || list == PoolList::Expired {
                        lease.desired_binding_state = lease.binding_state;
                        let relationship = &mut self.relationships[idx];
                        relationship.enqueue_update(&mut self.leases, id);
                        queued += 1;
                    }
                }
            }
        }
        queued
    }

    fn send_update_request(&mut self, idx: usize, now: i64) {
        if self.relationships[idx].pending_request != PendingRequest::None {
            return;
        }
        if self.send_to_peer(idx, Message::new(MessageType::UpdateRequest), now) {
            let relationship = &mut self.relationships[idx];
            relationship.pending_request = PendingRequest::Request;
            info!("failover peer {}: sent update request", relationship.name);
        }
    }

    /// Asks for every binding. A plain request already outstanding is
    /// escalated; a full one is not repeated.
    fn send_update_request_all(&mut self, idx: usize, now: i64) {
        if self.relationships[idx].pending_request == PendingRequest::RequestAll {
            return;
        }
        if self.send_to_peer(idx, Message::new(MessageType::UpdateRequestAll), now) {
            let relationship = &mut self.relationships[idx];
            relationship.pending_request = PendingRequest::RequestAll;
            info!("failover peer {}: sent update request all", relationship.name);
        }
    }

    fn send_update_done(&mut self, idx: usize, now: i64) {
        let relationship = &self.relationships[idx];
        let name = relationship.name.clone();
        let mut done = Message::new(MessageType::UpdateDone);
        done.xid = relationship.update_xid;
        if self.send_to_peer(idx, done, now) {
            info!("failover peer {}: sent update done", name);
        }
        self.commit("update done");
    }

    fn process_update_request(&mut self, idx: usize, message: &Message, all: bool, now: i64) {
        let relationship = &mut self.relationships[idx];
        let name = relationship.name.clone();
        if relationship.send_update_done.take().is_some() {
            info!("failover peer {}: dropping unfinished update request", name);
        }

        self.generate_update_queue(idx, all);
        let relationship = &mut self.relationships[idx];
        relationship.update_xid = message.xid;

        match relationship.update_queue().back().copied() {
            Some(tail) => {
                relationship.send_update_done = Some(tail);
                info!(
                    "failover peer {}: sending {} update(s)",
                    name,
                    relationship.update_queue().len()
                );
                self.send_updates(idx, now);
            }
            None => {
                info!("failover peer {}: nothing pending, update done", name);
                self.send_update_done(idx, now);
            }
        }
    }

    fn process_update_done(&mut self, idx: usize, now: i64) {
        use FailoverState::*;

        let relationship = &mut self.relationships[idx];
        relationship.pending_request = PendingRequest::None;
        let name = relationship.name.clone();
        let (local, partner, role) = (relationship.me.state, relationship.partner.state, relationship.role);
        let recover_until = relationship.me.stos + i64::from(relationship.mclt);
        info!("failover peer {}: peer update completed", name);

        let result = match local {
            PotentialConflict if partner == ConflictDone => match role {
                Role::Secondary => self.set_state(idx, Normal, now),
                Role::Primary => {
                    error!(
                        "failover peer {}: update done from a partner already in conflict-done",
                        name
                    );
                    self.set_state(idx, ShutDown, now)
                }
            },
            PotentialConflict => match role {
                Role::Primary => self.set_state(idx, ConflictDone, now),
                Role::Secondary => {
                    error!("failover peer {}: Spurious update-done message", name);
                    Ok(())
                }
            },
            ConflictDone => {
                error!("failover peer {}: Spurious update-done message", name);
                Ok(())
            }
            Recover if recover_until > now && !matches!(partner, Recover | RecoverDone) => {
                self.set_state(idx, RecoverWait, now)
            }
            Recover => self.set_state(idx, RecoverDone, now),
            Unknown | Startup | Normal | CommunicationsInterrupted | PartnerDown | Paused
            | ShutDown | RecoverDone | ResolutionInterrupted | RecoverWait => Ok(()),
        };
        if let Err(error) = result {
            debug!("failover peer {}: state change not applied: {}", name, error);
        }
        self.refresh_service_state(idx);
    }

    // ---- pool balancing ----

    /// Balances the pools on entering normal.
    fn pool_balance(&mut self, idx: usize, now: i64) {
        let relationship = &mut self.relationships[idx];
        relationship.sched_balance = 0;
        self.timers
            .cancel(&TimerKind::Rebalance(relationship.name.clone()));
        self.balance_pools(idx, false, now);
    }

    /// The rebalance timer fired.
    fn pool_rebalance(&mut self, idx: usize, now: i64) {
        self.relationships[idx].sched_balance = 0;
        let (queued, request) = self.balance_pools(idx, true, now);
        if queued > 0 {
            self.send_updates(idx, now);
        }
        if request && self.send_to_peer(idx, Message::new(MessageType::PoolRequest), now) {
            info!(
                "failover peer {}: sent pool request",
                self.relationships[idx].name
            );
        }
    }

    fn process_pool_request(&mut self, idx: usize, message: &Message, now: i64) {
        let relationship = &mut self.relationships[idx];
        let name = relationship.name.clone();
        info!("failover peer {}: received pool request", name);
        relationship.sched_balance = 0;
        self.timers.cancel(&TimerKind::Rebalance(name.clone()));

        let (queued, _) = self.balance_pools(idx, false, now);
        let mut response = Message::new(MessageType::PoolResponse).with(
            FailoverOption::AddressesTransferred(u32::try_from(queued).unwrap_or(u32::MAX)),
        );
        response.xid = message.xid;
        self.send_to_peer(idx, response, now);

        if queued > 0 {
            self.send_updates(idx, now);
        } else {
            info!("failover peer {}: pool request answered negatively", name);
        }
    }

    /// Hands leases across in every pool of the relationship. Returns how
    /// many leases were queued and whether the partner should be asked to
    /// rebalance (only considered when `may_request`).
    fn balance_pools(&mut self, idx: usize, may_request: bool, now: i64) -> (usize, bool) {
        if self.relationships[idx].me.state != FailoverState::Normal {
            return (0, false);
        }
        self.relationships[idx].last_balance = now;

        let name = self.relationships[idx].name.clone();
        let mut queued = 0;
        let mut request = false;

        for pool in self.leases.pools_for(&name) {
            let plan = plan_pool(&self.leases, pool, &self.relationships[idx].balance);
            let requesting = may_request && plan.request_peer;
            request |= requesting;
            let pool_name = self
                .leases
                .pool(pool)
                .map_or_else(String::new, |pool| pool.name.clone());

            info!(
                "balancing pool {}  total {}  free {}  backup {}  lts {}  max-own (+/-){}{}",
                pool_name,
                plan.total,
                plan.free,
                plan.backup,
                plan.lts,
                plan.hold,
                if requesting {
                    "  (requesting peer rebalance!)"
                } else {
                    ""
                }
            );

            for &id in &plan.moves {
                let lease = &mut self.leases[id];
                lease.next_binding_state = plan.peer_state;
                lease.tstp = now;
                lease.starts = now;
                self.supersede_lease(idx, id, now, true, false);
                self.write_lease(id);
            }
            queued += plan.moves.len();

            let free = self.leases.count(pool, PoolList::Free);
            let backup = self.leases.count(pool, PoolList::Backup);
            if plan.is_balanced() {
                info!(
                    "balanced pool {}  total {}  free {}  backup {}  lts {}  max-misbal {}",
                    pool_name, plan.total, free, backup, plan.remaining, plan.threshold
                );
            } else {
                error!(
                    "IMBALANCED pool {}  total {}  free {}  backup {}  lts {}  max-misbal {}",
                    pool_name, plan.total, free, backup, plan.remaining, plan.threshold
                );
            }

            self.pool_check(idx, pool, now);
        }

        if queued > 0 {
            self.commit("pool balance");
        }
        (queued, request)
    }

    /// Pulls the next rebalance earlier if the pool looks like it will
    /// drift out of balance sooner. Never pushes it later.
    fn pool_check(&mut self, idx: usize, pool: PoolId, now: i64) {
        let relationship = &self.relationships[idx];
        if relationship.me.state != FailoverState::Normal {
            return;
        }

        let estimate = rebalance_estimate(
            &self.leases,
            pool,
            &relationship.balance,
            relationship.last_balance,
            now,
        ) + rand::thread_rng().gen_range(0..5);
        if relationship.sched_balance != 0 && estimate >= relationship.sched_balance {
            return;
        }

        let relationship = &mut self.relationships[idx];
        relationship.sched_balance = estimate;
        self.timers
            .add(TimerKind::Rebalance(relationship.name.clone()), estimate);
    }
}
