use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use crate::error::{Error, Result};
use crate::state::Role;

/// Registered failover port.
pub const DEFAULT_FAILOVER_PORT: u16 = 647;

/// Size of the hash bucket assignment in bytes (256 buckets).
pub const HBA_SIZE: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where relationship states and leases are persisted.
    pub state_file: String,
    pub relationships: Vec<PeerConfig>,
    pub pools: Vec<PoolConfig>,
}

/// One failover relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub role: Role,
    pub local_address: IpAddr,
    #[serde(default = "default_port")]
    pub local_port: u16,
    pub peer_address: IpAddr,
    #[serde(default = "default_port")]
    pub peer_port: u16,
    /// Seconds without traffic before the partner is declared unreachable.
    #[serde(default = "default_max_response_delay")]
    pub max_response_delay: u32,
    #[serde(default = "default_max_unacked_updates")]
    pub max_unacked_updates: u32,
    /// Maximum client lead time. Only the primary's value is used.
    #[serde(default)]
    pub mclt: Option<u32>,
    /// Buckets below `split` belong to the primary. Ignored when `hba` is set.
    #[serde(default)]
    pub split: Option<u16>,
    /// Explicit hash bucket assignment as 64 hex digits.
    #[serde(default)]
    pub hba: Option<String>,
    #[serde(default = "default_load_balance_max_seconds")]
    pub load_balance_max_seconds: u32,
    /// Percent of imbalance tolerated before rebalancing.
    #[serde(default = "default_max_lease_misbalance")]
    pub max_lease_misbalance: u32,
    /// Percent of the pool one side may keep beyond an even split.
    #[serde(default = "default_max_lease_ownership")]
    pub max_lease_ownership: u32,
    #[serde(default = "default_min_balance")]
    pub min_balance: u32,
    #[serde(default = "default_max_balance")]
    pub max_balance: u32,
    /// Seconds in communications-interrupted before assuming partner-down.
    /// Zero disables it.
    #[serde(default)]
    pub auto_partner_down: u32,
}

/// An address range shared under a relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub failover_peer: String,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
}

fn default_port() -> u16 {
    DEFAULT_FAILOVER_PORT
}

fn default_max_response_delay() -> u32 {
    60
}

fn default_max_unacked_updates() -> u32 {
    10
}

fn default_load_balance_max_seconds() -> u32 {
    3
}

fn default_max_lease_misbalance() -> u32 {
    15
}

fn default_max_lease_ownership() -> u32 {
    10
}

fn default_min_balance() -> u32 {
    60
}

fn default_max_balance() -> u32 {
    3600
}

impl PeerConfig {
    pub fn new(name: &str, role: Role, local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            name: name.to_string(),
            role,
            local_address: local.ip(),
            local_port: local.port(),
            peer_address: peer.ip(),
            peer_port: peer.port(),
            max_response_delay: default_max_response_delay(),
            max_unacked_updates: default_max_unacked_updates(),
            mclt: match role {
                Role::Primary => Some(3600),
                Role::Secondary => None,
            },
            split: Some(128),
            hba: None,
            load_balance_max_seconds: default_load_balance_max_seconds(),
            max_lease_misbalance: default_max_lease_misbalance(),
            max_lease_ownership: default_max_lease_ownership(),
            min_balance: default_min_balance(),
            max_balance: default_max_balance(),
            auto_partner_down: 0,
        }
    }

    pub fn local_socket(&self) -> SocketAddr {
        SocketAddr::new(self.local_address, self.local_port)
    }

    pub fn peer_socket(&self) -> SocketAddr {
        SocketAddr::new(self.peer_address, self.peer_port)
    }

    /// The hash bucket assignment, from `hba` or built from `split`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `hba` is not 64 hex digits or
    /// `split` exceeds 256.
    pub fn hash_buckets(&self) -> Result<Option<[u8; HBA_SIZE]>> {
        if let Some(hex) = &self.hba {
            return parse_hba(hex).map(Some);
        }
        let Some(split) = self.split else {
            return Ok(None);
        };
        if split > 256 {
            return Err(Error::InvalidConfig(format!(
                "{}: split {} exceeds 256",
                self.name, split
            )));
        }
        let mut hba = [0u8; HBA_SIZE];
        for bucket in 0..split as usize {
            hba[bucket / 8] |= 1 << (bucket % 8);
        }
        Ok(Some(hba))
    }
}

fn parse_hba(hex: &str) -> Result<[u8; HBA_SIZE]> {
    let digits: String = hex.chars().filter(|c| *c != ':').collect();
    if digits.len() != HBA_SIZE * 2 {
        return Err(Error::InvalidConfig(format!(
            "hba must be {} hex digits, got {}",
            HBA_SIZE * 2,
            digits.len()
        )));
    }
    let mut hba = [0u8; HBA_SIZE];
    for (index, byte) in hba.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&digits[index * 2..index * 2 + 2], 16)
            .map_err(|error| Error::InvalidConfig(format!("invalid hba: {}", error)))?;
    }
    Ok(hba)
}

impl Default for Config {
    fn default() -> Self {
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), DEFAULT_FAILOVER_PORT);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)), DEFAULT_FAILOVER_PORT);
        Self {
            state_file: "failover-state.json".to_string(),
            relationships: vec![PeerConfig::new("dhcp-failover", Role::Primary, local, peer)],
            pools: vec![PoolConfig {
                name: "lan".to_string(),
                failover_peer: "dhcp-failover".to_string(),
                range_start: Ipv4Addr::new(192, 168, 1, 100),
                range_end: Ipv4Addr::new(192, 168, 1, 200),
            }],
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for peer in &self.relationships {
            if peer.name.is_empty() {
                return Err(Error::InvalidConfig(
                    "relationship name must not be empty".to_string(),
                ));
            }
            if !names.insert(peer.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate relationship name {}",
                    peer.name
                )));
            }
            if peer.role == Role::Primary && peer.mclt.unwrap_or(0) == 0 {
                return Err(Error::InvalidConfig(format!(
                    "{}: primary must set a non-zero mclt",
                    peer.name
                )));
            }
            if peer.max_response_delay == 0 || peer.max_unacked_updates == 0 {
                return Err(Error::InvalidConfig(format!(
                    "{}: max_response_delay and max_unacked_updates must be greater than 0",
                    peer.name
                )));
            }
            if peer.max_lease_misbalance > 100 || peer.max_lease_ownership > 100 {
                return Err(Error::InvalidConfig(format!(
                    "{}: max_lease_misbalance and max_lease_ownership are percentages",
                    peer.name
                )));
            }
            if peer.min_balance > peer.max_balance {
                return Err(Error::InvalidConfig(format!(
                    "{}: min_balance must be less than or equal to max_balance",
                    peer.name
                )));
            }
            peer.hash_buckets()?;
        }

        for pool in &self.pools {
            if u32::from(pool.range_start) > u32::from(pool.range_end) {
                return Err(Error::InvalidConfig(format!(
                    "pool {}: range_start must be less than or equal to range_end",
                    pool.name
                )));
            }
            if !names.contains(pool.failover_peer.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "pool {} refers to unknown failover peer {}",
                    pool.name, pool.failover_peer
                )));
            }
        }

        Ok(())
    }

    pub fn relationship(&self, name: &str) -> Option<&PeerConfig> {
        self.relationships.iter().find(|peer| peer.name == name)
    }
}
