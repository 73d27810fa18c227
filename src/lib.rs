//! # dhcpfailover
//!
//! The DHCP failover protocol: two DHCP servers sharing one set of address
//! pools keep each other informed of every lease change, so either can
//! serve clients while the other is down without handing out the same
//! address twice.
//!
//! ## Features
//!
//! - Framed binary failover protocol over TCP (port 647 by default)
//! - Full peer state machine: startup, normal, communications-interrupted,
//!   partner-down, potential-conflict, recover and the states between
//! - Binding updates with batched acks and a bounded in-flight window
//! - Conflict resolution between dueling updates
//! - Pool balancing between the primary's free and the secondary's backup
//!   leases, with scheduled rebalancing
//! - Load balancing of client requests via hash bucket assignment
//! - State and leases persisted with explicit commits
//!
//! ## Quick Start
//!
//! ```no_run
//! use dhcpfailover::{Config, FailoverServer};
//!
//! #[tokio::main]
//! async fn main() -> dhcpfailover::Result<()> {
//!     let config = Config::load_or_create("failover.json")?;
//!     let mut server = FailoverServer::new(&config)?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Failover`] - The protocol engine. Synchronous and I/O-free: it takes
//!   events with the current time and returns [`Action`]s
//! - [`FailoverServer`] - Tokio transport driving the engine
//! - [`Message`] / [`FailoverOption`] - Wire format
//! - [`LeaseDb`] - Leases and the per-pool views the engine works on
//! - [`Storage`] - Durable state, with [`JsonStorage`] and [`MemoryStorage`]

pub mod balance;
pub mod config;
pub mod error;
pub mod failover;
pub mod lease;
pub mod link;
pub mod message;
pub mod options;
pub mod relationship;
pub mod server;
pub mod state;
pub mod store;
pub mod timer;
pub mod validator;

pub use config::{Config, PeerConfig, PoolConfig};
pub use error::{Error, Result};
pub use failover::{Action, Failover};
pub use lease::{Lease, LeaseDb};
pub use message::Message;
pub use options::{FailoverOption, MessageType, RejectReason};
pub use relationship::{Relationship, RelationshipStatus};
pub use server::FailoverServer;
pub use state::{BindingState, FailoverState, Role, ServiceState};
pub use store::{JsonStorage, MemoryStorage, Storage};
