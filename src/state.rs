//! Failover states and the two transition tables.
//!
//! A relationship moves through thirteen failover states. Two kinds of
//! input drive it:
//!
//! - local events (the connection came up, went down, or timed out), handled
//!   by [`transition`]
//! - the partner announcing a new state, handled by [`on_peer_state`]
//!
//! Both are total functions over the state enums, so every combination is
//! spelled out and the compiler flags a missing one. They only decide; the
//! caller in [`crate::failover`] performs the side effects.

use serde::{Deserialize, Serialize};

/// Failover relationship state, with its wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum FailoverState {
    Unknown = 0,
    Startup = 1,
    Normal = 2,
    CommunicationsInterrupted = 3,
    PartnerDown = 4,
    PotentialConflict = 5,
    Recover = 6,
    Paused = 7,
    ShutDown = 8,
    RecoverDone = 9,
    ResolutionInterrupted = 10,
    ConflictDone = 11,
    RecoverWait = 254,
}

impl FailoverState {
    /// Decodes a wire state code. Codes outside the thirteen known
    /// states return `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unknown),
            1 => Some(Self::Startup),
            2 => Some(Self::Normal),
            3 => Some(Self::CommunicationsInterrupted),
            4 => Some(Self::PartnerDown),
            5 => Some(Self::PotentialConflict),
            6 => Some(Self::Recover),
            7 => Some(Self::Paused),
            8 => Some(Self::ShutDown),
            9 => Some(Self::RecoverDone),
            10 => Some(Self::ResolutionInterrupted),
            11 => Some(Self::ConflictDone),
            254 => Some(Self::RecoverWait),
            _ => None,
        }
    }

    /// Parses the operator-facing state name.
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_STATES
            .iter()
            .copied()
            .find(|state| state.to_string() == name)
    }
}

/// Every failover state, in wire-code order.
pub const ALL_STATES: [FailoverState; 13] = [
    FailoverState::Unknown,
    FailoverState::Startup,
    FailoverState::Normal,
    FailoverState::CommunicationsInterrupted,
    FailoverState::PartnerDown,
    FailoverState::PotentialConflict,
    FailoverState::Recover,
    FailoverState::Paused,
    FailoverState::ShutDown,
    FailoverState::RecoverDone,
    FailoverState::ResolutionInterrupted,
    FailoverState::ConflictDone,
    FailoverState::RecoverWait,
];

impl std::fmt::Display for FailoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "unknown-state",
            Self::Startup => "startup",
            Self::Normal => "normal",
            Self::CommunicationsInterrupted => "communications-interrupted",
            Self::PartnerDown => "partner-down",
            Self::PotentialConflict => "potential-conflict",
            Self::Recover => "recover",
            Self::Paused => "paused",
            Self::ShutDown => "shutdown",
            Self::RecoverDone => "recover-done",
            Self::ResolutionInterrupted => "resolution-interrupted",
            Self::ConflictDone => "conflict-done",
            Self::RecoverWait => "recover-wait",
        };
        write!(f, "{}", name)
    }
}

/// Failover-visible lifecycle phase of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum BindingState {
    Free = 1,
    Active = 2,
    Expired = 3,
    Released = 4,
    Abandoned = 5,
    Reset = 6,
    Backup = 7,
}

impl TryFrom<u8> for BindingState {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Free),
            2 => Ok(Self::Active),
            3 => Ok(Self::Expired),
            4 => Ok(Self::Released),
            5 => Ok(Self::Abandoned),
            6 => Ok(Self::Reset),
            7 => Ok(Self::Backup),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for BindingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Released => "released",
            Self::Abandoned => "abandoned",
            Self::Reset => "reset",
            Self::Backup => "backup",
        };
        write!(f, "{}", name)
    }
}

/// Which side of the relationship this server is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// What the relationship lets the DHCP service do, derived from the local
/// and partner states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    NotResponding,
    StartingUp,
    Cooperating,
    NotCooperating,
    PartnerDown,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotResponding => "not-responding",
            Self::StartingUp => "startup",
            Self::Cooperating => "cooperating",
            Self::NotCooperating => "not-cooperating",
            Self::PartnerDown => "partner-down",
        };
        write!(f, "{}", name)
    }
}

/// Derives the service state and, when the server must not answer
/// clients, the reason it is not responding.
pub fn service_state(
    local: FailoverState,
    partner: FailoverState,
) -> (ServiceState, Option<&'static str>) {
    let (service, reason) = match local {
        FailoverState::Unknown => (
            ServiceState::NotResponding,
            Some("my state is unknown"),
        ),
        FailoverState::PartnerDown => (ServiceState::PartnerDown, None),
        FailoverState::Normal => (ServiceState::Cooperating, None),
        FailoverState::CommunicationsInterrupted => (ServiceState::NotCooperating, None),
        FailoverState::ResolutionInterrupted
        | FailoverState::PotentialConflict
        | FailoverState::ConflictDone => (
            ServiceState::NotResponding,
            Some("seeking conflict resolution"),
        ),
        FailoverState::Recover => (ServiceState::NotResponding, Some("recovering")),
        FailoverState::ShutDown => (ServiceState::NotResponding, Some("shut down")),
        FailoverState::Paused => (ServiceState::NotResponding, Some("paused")),
        FailoverState::RecoverWait => (
            ServiceState::NotResponding,
            Some("recovering but waiting for MCLT to expire"),
        ),
        FailoverState::RecoverDone => (
            ServiceState::NotResponding,
            Some("recovered, waiting for partner to be normal"),
        ),
        FailoverState::Startup => (ServiceState::StartingUp, Some("startup")),
    };

    if service != ServiceState::NotResponding {
        let reason = match partner {
            FailoverState::PartnerDown => Some("my partner is in partner-down"),
            FailoverState::PotentialConflict
            | FailoverState::ConflictDone
            | FailoverState::ResolutionInterrupted => {
                Some("my partner is seeking conflict resolution")
            }
            _ => None,
        };
        if reason.is_some() {
            return (ServiceState::NotResponding, reason);
        }
    }

    (service, reason)
}

/// Local events that move the relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEvent {
    Startup,
    Connect,
    Disconnect,
    ConnectTimeout,
}

impl std::fmt::Display for LocalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Startup => write!(f, "startup"),
            Self::Connect => write!(f, "connect"),
            Self::Disconnect => write!(f, "disconnect"),
            Self::ConnectTimeout => write!(f, "connect-timeout"),
        }
    }
}

/// Outcome of a local event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOutcome {
    /// Move to the given state.
    Enter(FailoverState),
    /// Stay put but tell the peer our current state.
    AnnounceState,
    /// Nothing to do.
    Unchanged,
}

/// Applies a local event.
///
/// `saved` is the state remembered on entering startup; losing the peer
/// while in startup is judged against it.
pub fn transition(current: FailoverState, saved: FailoverState, event: LocalEvent) -> LocalOutcome {
    use FailoverState::*;

    match event {
        LocalEvent::Startup => LocalOutcome::Enter(Startup),

        LocalEvent::Connect => match current {
            CommunicationsInterrupted => LocalOutcome::Enter(Normal),
            ResolutionInterrupted => LocalOutcome::Enter(PotentialConflict),
            Unknown | Startup | Normal | PartnerDown | PotentialConflict | Recover | Paused
            | ShutDown | RecoverDone | ConflictDone | RecoverWait => LocalOutcome::AnnounceState,
        },

        LocalEvent::Disconnect | LocalEvent::ConnectTimeout => {
            let effective = if current == Startup { saved } else { current };
            match effective {
                Normal => LocalOutcome::Enter(CommunicationsInterrupted),
                PotentialConflict | Unknown => LocalOutcome::Enter(ResolutionInterrupted),
                CommunicationsInterrupted | ConflictDone | PartnerDown | Paused | Recover
                | RecoverDone | RecoverWait | ResolutionInterrupted | ShutDown | Startup => {
                    if current == Startup && saved != Startup {
                        LocalOutcome::Enter(saved)
                    } else {
                        LocalOutcome::Unchanged
                    }
                }
            }
        }
    }
}

/// Outcome of the partner announcing a new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOutcome {
    Nothing,
    Enter(FailoverState),
    /// Both sides normal: check whether the pools need rebalancing.
    PoolCheck,
    SendUpdateRequest,
    SendUpdateRequestAll,
    /// Flush pending updates, then enter the state.
    FlushThenEnter(FailoverState),
    /// Unexpected but harmless; log it.
    Violation(&'static str),
    /// Unexpected; log it, then enter the state anyway.
    WarnThenEnter(&'static str, FailoverState),
    /// The peer broke the protocol; force shut-down.
    ShutDown(&'static str),
}

/// Whether a repeated announcement of an unchanged partner state still
/// has to be processed in the given local state.
pub fn repeat_needs_processing(local: FailoverState) -> bool {
    use FailoverState::*;

    match local {
        PartnerDown | CommunicationsInterrupted | ResolutionInterrupted | Recover
        | ConflictDone => true,
        Unknown | Startup | Normal | PotentialConflict | RecoverDone | ShutDown | Paused
        | RecoverWait => false,
    }
}

/// Decides what to do when the partner reports `peer`.
///
/// `local` is the effective local state (the saved state while in startup),
/// `in_startup` whether we are actually still in startup, `previous` the
/// partner state we knew before, and `peer_starting` the partner's startup
/// flag. `peer` is `None` when the partner sent an undefined state code.
pub fn on_peer_state(
    local: FailoverState,
    in_startup: bool,
    previous: FailoverState,
    peer: Option<FailoverState>,
    peer_starting: bool,
) -> PeerOutcome {
    use FailoverState::*;

    let Some(peer) = peer else {
        return match local {
            RecoverWait | ShutDown | Paused | Unknown => PeerOutcome::Nothing,
            Startup | Normal | CommunicationsInterrupted | PartnerDown | PotentialConflict
            | Recover | RecoverDone | ResolutionInterrupted | ConflictDone => {
                PeerOutcome::ShutDown("peer reported an undefined state")
            }
        };
    };

    match local {
        Normal => match peer {
            Normal => PeerOutcome::PoolCheck,
            PartnerDown if in_startup => PeerOutcome::Enter(Recover),
            PartnerDown => PeerOutcome::Enter(PotentialConflict),
            PotentialConflict | ResolutionInterrupted | ConflictDone => {
                PeerOutcome::ShutDown("peer entered conflict resolution while we are normal")
            }
            Recover | ShutDown => PeerOutcome::Enter(PartnerDown),
            Paused => PeerOutcome::Enter(CommunicationsInterrupted),
            RecoverWait | RecoverDone | Unknown | Startup | CommunicationsInterrupted => {
                PeerOutcome::Nothing
            }
        },

        Recover => match peer {
            Recover | PartnerDown | CommunicationsInterrupted if !in_startup => {
                PeerOutcome::SendUpdateRequestAll
            }
            Recover | PartnerDown | CommunicationsInterrupted => PeerOutcome::Nothing,
            PotentialConflict | ResolutionInterrupted | ConflictDone | Normal => {
                PeerOutcome::Enter(PotentialConflict)
            }
            ShutDown => PeerOutcome::Enter(PartnerDown),
            Paused | RecoverDone | RecoverWait | Unknown | Startup => PeerOutcome::Nothing,
        },

        PotentialConflict => match peer {
            Normal => PeerOutcome::ShutDown("peer moved to normal during conflict resolution"),
            ConflictDone if previous == PotentialConflict => PeerOutcome::SendUpdateRequest,
            ConflictDone => PeerOutcome::Violation("unexpected move to conflict-done"),
            Recover => PeerOutcome::Enter(Recover),
            ShutDown => PeerOutcome::Enter(PartnerDown),
            RecoverDone | RecoverWait | PotentialConflict | PartnerDown
            | CommunicationsInterrupted | ResolutionInterrupted | Paused | Unknown | Startup => {
                PeerOutcome::Nothing
            }
        },

        ConflictDone => match peer {
            Normal => PeerOutcome::Enter(Normal),
            ShutDown => PeerOutcome::Enter(ShutDown),
            Unknown | Startup | CommunicationsInterrupted | PartnerDown | PotentialConflict
            | Recover | Paused | RecoverDone | ResolutionInterrupted | ConflictDone
            | RecoverWait => {
                PeerOutcome::ShutDown("invalid peer move while local state is conflict-done")
            }
        },

        PartnerDown if peer_starting => PeerOutcome::Nothing,
        PartnerDown => match peer {
            RecoverDone => PeerOutcome::Enter(Normal),
            Normal | PotentialConflict | PartnerDown | CommunicationsInterrupted
            | ResolutionInterrupted | ConflictDone => PeerOutcome::Enter(PotentialConflict),
            Recover | RecoverWait | ShutDown | Paused | Unknown | Startup => PeerOutcome::Nothing,
        },

        CommunicationsInterrupted => match peer {
            Recover => PeerOutcome::Enter(PartnerDown),
            Normal | CommunicationsInterrupted | RecoverDone | RecoverWait => {
                PeerOutcome::FlushThenEnter(Normal)
            }
            PotentialConflict | PartnerDown | ResolutionInterrupted | ConflictDone => {
                PeerOutcome::Enter(PotentialConflict)
            }
            ShutDown => PeerOutcome::Enter(PartnerDown),
            Paused | Unknown | Startup => PeerOutcome::Nothing,
        },

        ResolutionInterrupted => match peer {
            Normal | Recover | PotentialConflict | PartnerDown | CommunicationsInterrupted
            | ResolutionInterrupted | ConflictDone | RecoverDone | RecoverWait => {
                PeerOutcome::Enter(PotentialConflict)
            }
            ShutDown => PeerOutcome::Enter(PartnerDown),
            Paused | Unknown | Startup => PeerOutcome::Nothing,
        },

        RecoverWait => PeerOutcome::Nothing,

        RecoverDone => match peer {
            RecoverDone => {
                PeerOutcome::WarnThenEnter("both servers have entered recover-done", Normal)
            }
            Normal => PeerOutcome::Enter(Normal),
            ShutDown => PeerOutcome::Enter(PartnerDown),
            PotentialConflict | PartnerDown | CommunicationsInterrupted
            | ResolutionInterrupted | ConflictDone | Paused | Recover | RecoverWait | Unknown
            | Startup => PeerOutcome::Nothing,
        },

        ShutDown | Paused | Unknown | Startup => PeerOutcome::Nothing,
    }
}
