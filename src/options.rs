//! Failover message options.
//!
//! Every failover message carries zero or more options after its fixed
//! header. Each option is a TLV: a 2-byte code, a 2-byte length and the
//! value, all in network byte order.
//!
//! This module implements parsing and encoding for every option the
//! failover engine understands. Unknown options are preserved as
//! [`FailoverOption::Unknown`] and skipped by the engine.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::state::BindingState;

/// Size of an option's code and length fields.
pub const OPTION_HEADER_SIZE: usize = 4;

/// Server flag: the sending server is in the startup state.
pub const SERVER_FLAG_STARTUP: u8 = 1;

/// IP flag: the address is reserved for a specific client.
pub const IP_FLAG_RESERVE: u16 = 1;

/// IP flag: the address was handed out through BOOTP.
pub const IP_FLAG_BOOTP: u16 = 2;

/// Failover option codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum OptionCode {
    AddressesTransferred = 1,
    AssignedIpAddress = 2,
    BindingStatus = 3,
    ClientIdentifier = 4,
    Chaddr = 5,
    Cltt = 6,
    ReplyOptions = 7,
    RequestOptions = 8,
    Ddns = 9,
    DelayedService = 10,
    Hba = 11,
    IpFlags = 12,
    LeaseExpiry = 13,
    MaxUnacked = 14,
    Mclt = 15,
    Message = 16,
    MessageDigest = 17,
    PotentialExpiry = 18,
    ReceiveTimer = 19,
    ProtocolVersion = 20,
    RejectReason = 21,
    RelationshipName = 22,
    ServerFlags = 23,
    ServerState = 24,
    Stos = 25,
    TlsReply = 26,
    TlsRequest = 27,
    VendorClass = 28,
    VendorOptions = 29,
}

impl OptionCode {
    /// Exact value size for options that hold a single fixed-width value.
    ///
    /// Returns `None` for variable-length options.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            Self::BindingStatus
            | Self::DelayedService
            | Self::ProtocolVersion
            | Self::RejectReason
            | Self::ServerFlags
            | Self::ServerState => Some(1),
            Self::IpFlags => Some(2),
            Self::AddressesTransferred
            | Self::AssignedIpAddress
            | Self::Cltt
            | Self::LeaseExpiry
            | Self::MaxUnacked
            | Self::Mclt
            | Self::PotentialExpiry
            | Self::ReceiveTimer
            | Self::Stos => Some(4),
            Self::ClientIdentifier
            | Self::Chaddr
            | Self::ReplyOptions
            | Self::RequestOptions
            | Self::Ddns
            | Self::Hba
            | Self::Message
            | Self::MessageDigest
            | Self::RelationshipName
            | Self::TlsReply
            | Self::TlsRequest
            | Self::VendorClass
            | Self::VendorOptions => None,
        }
    }
}

impl TryFrom<u16> for OptionCode {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::AddressesTransferred),
            2 => Ok(Self::AssignedIpAddress),
            3 => Ok(Self::BindingStatus),
            4 => Ok(Self::ClientIdentifier),
            5 => Ok(Self::Chaddr),
            6 => Ok(Self::Cltt),
            7 => Ok(Self::ReplyOptions),
            8 => Ok(Self::RequestOptions),
            9 => Ok(Self::Ddns),
            10 => Ok(Self::DelayedService),
            11 => Ok(Self::Hba),
            12 => Ok(Self::IpFlags),
            13 => Ok(Self::LeaseExpiry),
            14 => Ok(Self::MaxUnacked),
            15 => Ok(Self::Mclt),
            16 => Ok(Self::Message),
            17 => Ok(Self::MessageDigest),
            18 => Ok(Self::PotentialExpiry),
            19 => Ok(Self::ReceiveTimer),
            20 => Ok(Self::ProtocolVersion),
            21 => Ok(Self::RejectReason),
            22 => Ok(Self::RelationshipName),
            23 => Ok(Self::ServerFlags),
            24 => Ok(Self::ServerState),
            25 => Ok(Self::Stos),
            26 => Ok(Self::TlsReply),
            27 => Ok(Self::TlsRequest),
            28 => Ok(Self::VendorClass),
            29 => Ok(Self::VendorOptions),
            other => Err(other),
        }
    }
}

/// Failover message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Ask the partner to run its pool balancer.
    PoolRequest = 1,
    /// Reply to a pool request with the number of addresses moved.
    PoolResponse = 2,
    /// Propagate a lease binding change.
    BindUpdate = 3,
    /// Acknowledge (or reject) a binding update.
    BindAck = 4,
    /// Open a relationship over a fresh connection.
    Connect = 5,
    /// Accept (or reject) a connect.
    ConnectAck = 6,
    /// Ask for every lease binding.
    UpdateRequestAll = 7,
    /// A requested bulk update is complete.
    UpdateDone = 8,
    /// Ask for bindings the partner has not yet seen.
    UpdateRequest = 9,
    /// Announce the sender's failover state.
    State = 10,
    /// Keepalive.
    Contact = 11,
    /// Close the connection, with a reason.
    Disconnect = 12,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::PoolRequest),
            2 => Ok(Self::PoolResponse),
            3 => Ok(Self::BindUpdate),
            4 => Ok(Self::BindAck),
            5 => Ok(Self::Connect),
            6 => Ok(Self::ConnectAck),
            7 => Ok(Self::UpdateRequestAll),
            8 => Ok(Self::UpdateDone),
            9 => Ok(Self::UpdateRequest),
            10 => Ok(Self::State),
            11 => Ok(Self::Contact),
            12 => Ok(Self::Disconnect),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoolRequest => write!(f, "pool-request"),
            Self::PoolResponse => write!(f, "pool-response"),
            Self::BindUpdate => write!(f, "bind-update"),
            Self::BindAck => write!(f, "bind-ack"),
            Self::Connect => write!(f, "connect"),
            Self::ConnectAck => write!(f, "connect-ack"),
            Self::UpdateRequestAll => write!(f, "update-request-all"),
            Self::UpdateDone => write!(f, "update-done"),
            Self::UpdateRequest => write!(f, "update-request"),
            Self::State => write!(f, "state"),
            Self::Contact => write!(f, "contact"),
            Self::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// Reasons carried in the reject-reason option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RejectReason {
    IllegalIpAddress = 1,
    FatalConflict = 2,
    MissingBindingInfo = 3,
    TimeMismatch = 4,
    InvalidMclt = 5,
    MiscReject = 6,
    DuplicateConnection = 7,
    InvalidPartner = 8,
    TlsUnsupported = 9,
    TlsUnconfigured = 10,
    TlsRequired = 11,
    DigestUnsupported = 12,
    DigestUnconfigured = 13,
    VersionMismatch = 14,
    OutdatedBindingInfo = 15,
    LessCriticalBindingInfo = 16,
    NoTraffic = 17,
    HbaConflict = 18,
    IpNotReserved = 19,
    IpDigestFailure = 20,
    IpMissingDigest = 21,
    Unknown = 254,
}

impl RejectReason {
    /// Maps a wire code to a reason; codes this engine does not know
    /// collapse to [`RejectReason::Unknown`].
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::IllegalIpAddress,
            2 => Self::FatalConflict,
            3 => Self::MissingBindingInfo,
            4 => Self::TimeMismatch,
            5 => Self::InvalidMclt,
            6 => Self::MiscReject,
            7 => Self::DuplicateConnection,
            8 => Self::InvalidPartner,
            9 => Self::TlsUnsupported,
            10 => Self::TlsUnconfigured,
            11 => Self::TlsRequired,
            12 => Self::DigestUnsupported,
            13 => Self::DigestUnconfigured,
            14 => Self::VersionMismatch,
            15 => Self::OutdatedBindingInfo,
            16 => Self::LessCriticalBindingInfo,
            17 => Self::NoTraffic,
            18 => Self::HbaConflict,
            19 => Self::IpNotReserved,
            20 => Self::IpDigestFailure,
            21 => Self::IpMissingDigest,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::IllegalIpAddress => "Illegal IP address (not part of any address pool).",
            Self::FatalConflict => "Fatal conflict exists: address in use by other client.",
            Self::MissingBindingInfo => "Missing binding information.",
            Self::TimeMismatch => "Connection rejected, time mismatch too great.",
            Self::InvalidMclt => "Connection rejected, invalid MCLT.",
            Self::MiscReject => "Connection rejected, unknown reason.",
            Self::DuplicateConnection => "Connection rejected, duplicate connection.",
            Self::InvalidPartner => "Connection rejected, invalid failover partner.",
            Self::TlsUnsupported => "TLS not supported.",
            Self::TlsUnconfigured => "TLS supported but not configured.",
            Self::TlsRequired => "TLS required but not supported by partner.",
            Self::DigestUnsupported => "Message digest not supported.",
            Self::DigestUnconfigured => "Message digest not configured.",
            Self::VersionMismatch => "Protocol version mismatch.",
            Self::OutdatedBindingInfo => "Outdated binding information.",
            Self::LessCriticalBindingInfo => "Less critical binding information.",
            Self::NoTraffic => "No traffic within sufficient time.",
            Self::HbaConflict => "Hash bucket assignment conflict.",
            Self::IpNotReserved => "IP not reserved on this server.",
            Self::IpDigestFailure => "Message digest failed to compare.",
            Self::IpMissingDigest => "Missing message digest.",
            Self::Unknown => "Unknown Error.",
        };
        write!(f, "{}", text)
    }
}

/// A parsed failover option.
///
/// Each variant fixes the value type for its option code, so a message
/// built from these values cannot carry a mistyped option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOption {
    AddressesTransferred(u32),
    AssignedIpAddress(Ipv4Addr),
    BindingStatus(BindingState),
    ClientIdentifier(Vec<u8>),
    /// Hardware type followed by the hardware address.
    Chaddr(Vec<u8>),
    Cltt(u32),
    ReplyOptions(Vec<u8>),
    RequestOptions(Vec<u8>),
    Ddns(Vec<u8>),
    DelayedService(u8),
    /// 256-bit hash bucket assignment.
    Hba(Vec<u8>),
    IpFlags(u16),
    LeaseExpiry(u32),
    MaxUnacked(u32),
    Mclt(u32),
    Message(String),
    /// Integrity digest; must be the final option of a message.
    MessageDigest(Vec<u8>),
    PotentialExpiry(u32),
    ReceiveTimer(u32),
    ProtocolVersion(u8),
    RejectReason(RejectReason),
    RelationshipName(String),
    ServerFlags(u8),
    /// Raw failover state code; the peer may send codes outside the known set.
    ServerState(u8),
    Stos(u32),
    VendorClass(String),
    VendorOptions(Vec<u8>),
    /// Option this engine does not interpret, carried as raw bytes.
    Unknown(u16, Vec<u8>),
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

impl FailoverOption {
    /// Returns the wire code for this option.
    pub fn option_code(&self) -> u16 {
        let code = match self {
            Self::AddressesTransferred(_) => OptionCode::AddressesTransferred,
            Self::AssignedIpAddress(_) => OptionCode::AssignedIpAddress,
            Self::BindingStatus(_) => OptionCode::BindingStatus,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::Chaddr(_) => OptionCode::Chaddr,
            Self::Cltt(_) => OptionCode::Cltt,
            Self::ReplyOptions(_) => OptionCode::ReplyOptions,
            Self::RequestOptions(_) => OptionCode::RequestOptions,
            Self::Ddns(_) => OptionCode::Ddns,
            Self::DelayedService(_) => OptionCode::DelayedService,
            Self::Hba(_) => OptionCode::Hba,
            Self::IpFlags(_) => OptionCode::IpFlags,
            Self::LeaseExpiry(_) => OptionCode::LeaseExpiry,
            Self::MaxUnacked(_) => OptionCode::MaxUnacked,
            Self::Mclt(_) => OptionCode::Mclt,
            Self::Message(_) => OptionCode::Message,
            Self::MessageDigest(_) => OptionCode::MessageDigest,
            Self::PotentialExpiry(_) => OptionCode::PotentialExpiry,
            Self::ReceiveTimer(_) => OptionCode::ReceiveTimer,
            Self::ProtocolVersion(_) => OptionCode::ProtocolVersion,
            Self::RejectReason(_) => OptionCode::RejectReason,
            Self::RelationshipName(_) => OptionCode::RelationshipName,
            Self::ServerFlags(_) => OptionCode::ServerFlags,
            Self::ServerState(_) => OptionCode::ServerState,
            Self::Stos(_) => OptionCode::Stos,
            Self::VendorClass(_) => OptionCode::VendorClass,
            Self::VendorOptions(_) => OptionCode::VendorOptions,
            Self::Unknown(code, _) => return *code,
        };
        code as u16
    }

    /// Parses an option from its code and raw value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if a fixed-width option has the wrong
    /// length or a binding status is out of range.
    pub fn parse(code: u16, data: &[u8]) -> Result<Self> {
        let known = match OptionCode::try_from(code) {
            Ok(known) => known,
            Err(code) => return Ok(Self::Unknown(code, data.to_vec())),
        };

        if let Some(size) = known.fixed_size()
            && data.len() != size
        {
            return Err(Error::Protocol(format!(
                "option {:?} has length {}, expected {}",
                known,
                data.len(),
                size
            )));
        }

        let option = match known {
            OptionCode::AddressesTransferred => Self::AddressesTransferred(read_u32(data)),
            OptionCode::AssignedIpAddress => {
                Self::AssignedIpAddress(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
            }
            OptionCode::BindingStatus => {
                let state = BindingState::try_from(data[0]).map_err(|value| {
                    Error::Protocol(format!("invalid binding status {}", value))
                })?;
                Self::BindingStatus(state)
            }
            OptionCode::ClientIdentifier => Self::ClientIdentifier(data.to_vec()),
            OptionCode::Chaddr => Self::Chaddr(data.to_vec()),
            OptionCode::Cltt => Self::Cltt(read_u32(data)),
            OptionCode::ReplyOptions => Self::ReplyOptions(data.to_vec()),
            OptionCode::RequestOptions => Self::RequestOptions(data.to_vec()),
            OptionCode::Ddns => Self::Ddns(data.to_vec()),
            OptionCode::DelayedService => Self::DelayedService(data[0]),
            OptionCode::Hba => Self::Hba(data.to_vec()),
            OptionCode::IpFlags => Self::IpFlags(u16::from_be_bytes([data[0], data[1]])),
            OptionCode::LeaseExpiry => Self::LeaseExpiry(read_u32(data)),
            OptionCode::MaxUnacked => Self::MaxUnacked(read_u32(data)),
            OptionCode::Mclt => Self::Mclt(read_u32(data)),
            OptionCode::Message => Self::Message(text(data)),
            OptionCode::MessageDigest => Self::MessageDigest(data.to_vec()),
            OptionCode::PotentialExpiry => Self::PotentialExpiry(read_u32(data)),
            OptionCode::ReceiveTimer => Self::ReceiveTimer(read_u32(data)),
            OptionCode::ProtocolVersion => Self::ProtocolVersion(data[0]),
            OptionCode::RejectReason => Self::RejectReason(RejectReason::from_code(data[0])),
            OptionCode::RelationshipName => Self::RelationshipName(text(data)),
            OptionCode::ServerFlags => Self::ServerFlags(data[0]),
            OptionCode::ServerState => Self::ServerState(data[0]),
            OptionCode::Stos => Self::Stos(read_u32(data)),
            OptionCode::VendorClass => Self::VendorClass(text(data)),
            OptionCode::VendorOptions => Self::VendorOptions(data.to_vec()),
            OptionCode::TlsReply | OptionCode::TlsRequest => Self::Unknown(code, data.to_vec()),
        };

        Ok(option)
    }

    fn value_bytes(&self) -> Vec<u8> {
        match self {
            Self::AddressesTransferred(value)
            | Self::Cltt(value)
            | Self::LeaseExpiry(value)
            | Self::MaxUnacked(value)
            | Self::Mclt(value)
            | Self::PotentialExpiry(value)
            | Self::ReceiveTimer(value)
            | Self::Stos(value) => value.to_be_bytes().to_vec(),
            Self::AssignedIpAddress(addr) => addr.octets().to_vec(),
            Self::BindingStatus(state) => vec![*state as u8],
            Self::DelayedService(value)
            | Self::ProtocolVersion(value)
            | Self::ServerFlags(value)
            | Self::ServerState(value) => vec![*value],
            Self::RejectReason(reason) => vec![*reason as u8],
            Self::IpFlags(flags) => flags.to_be_bytes().to_vec(),
            Self::Message(value) | Self::RelationshipName(value) | Self::VendorClass(value) => {
                value.as_bytes().to_vec()
            }
            Self::ClientIdentifier(data)
            | Self::Chaddr(data)
            | Self::ReplyOptions(data)
            | Self::RequestOptions(data)
            | Self::Ddns(data)
            | Self::Hba(data)
            | Self::MessageDigest(data)
            | Self::VendorOptions(data)
            | Self::Unknown(_, data) => data.clone(),
        }
    }

    /// Appends this option's TLV encoding to `buffer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the value does not fit the 16-bit
    /// length field, or if a raw [`Unknown`](Self::Unknown) option reuses
    /// a fixed-width code with the wrong number of bytes.
    pub fn encode_into(&self, buffer: &mut Vec<u8>) -> Result<()> {
        let code = self.option_code();
        let value = self.value_bytes();

        if let Ok(known) = OptionCode::try_from(code)
            && let Some(size) = known.fixed_size()
            && value.len() != size
        {
            return Err(Error::Protocol(format!(
                "option {:?} needs {} bytes, got {}",
                known,
                size,
                value.len()
            )));
        }

        let length = u16::try_from(value.len()).map_err(|_| {
            Error::Protocol(format!("option {} value too long ({} bytes)", code, value.len()))
        })?;

        buffer.extend_from_slice(&code.to_be_bytes());
        buffer.extend_from_slice(&length.to_be_bytes());
        buffer.extend_from_slice(&value);
        Ok(())
    }
}
