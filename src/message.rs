//! Failover message parsing and encoding.
//!
//! A failover message is a fixed 12-byte header followed by TLV options.
//! Messages travel over a TCP stream, so the header starts with the total
//! message length (the length field itself included).
//!
//! # Message Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          length (2)           |   type (1)    | payload off(1)|
//! +-------------------------------+---------------+---------------+
//! |                            time (4)                           |
//! +---------------------------------------------------------------+
//! |                            xid (4)                            |
//! +-------------------------------+-------------------------------+
//! |        option code (2)        |       option length (2)       |
//! +-------------------------------+-------------------------------+
//! |                     option value (variable)                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! A decoded message keeps its options in arrival order. Options are built
//! with [`Message::with`], one strongly-typed [`FailoverOption`] per call.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{FailoverOption, MessageType, OPTION_HEADER_SIZE, OptionCode, RejectReason};
use crate::state::BindingState;

/// Size of the fixed message header, length field included.
pub const HEADER_SIZE: usize = 12;

/// Size of the length prefix that frames a message on the stream.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Smallest legal message: a bare header.
pub const MIN_MESSAGE_SIZE: usize = HEADER_SIZE;

/// Largest legal message.
pub const MAX_MESSAGE_SIZE: usize = 2048;

/// Protocol version carried in connect messages.
pub const PROTOCOL_VERSION: u8 = 1;

/// Validates a length prefix and returns the total message size it announces.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the size is outside
/// [`MIN_MESSAGE_SIZE`]..=[`MAX_MESSAGE_SIZE`].
pub fn frame_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize> {
    let length = u16::from_be_bytes(prefix) as usize;
    if !(MIN_MESSAGE_SIZE..=MAX_MESSAGE_SIZE).contains(&length) {
        return Err(Error::Protocol(format!(
            "message length {} outside {}..={}",
            length, MIN_MESSAGE_SIZE, MAX_MESSAGE_SIZE
        )));
    }
    Ok(length)
}

/// A failover protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,

    /// Transaction id; assigned by the link when the message is sent.
    pub xid: u32,

    /// Sender's clock (seconds since the epoch) when the message was sent.
    pub time: u32,

    pub options: Vec<FailoverOption>,
}

impl Message {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            xid: 0,
            time: 0,
            options: Vec::new(),
        }
    }

    /// Appends an option.
    pub fn with(mut self, option: FailoverOption) -> Self {
        self.options.push(option);
        self
    }

    /// Appends an option if there is one.
    pub fn with_optional(self, option: Option<FailoverOption>) -> Self {
        match option {
            Some(option) => self.with(option),
            None => self,
        }
    }

    /// Parses one complete message, length prefix included.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if:
    /// - The length prefix is out of bounds or disagrees with `data`
    /// - The message type is unknown
    /// - The payload offset points outside the message
    /// - An option header or value overruns the message
    /// - An option appears twice
    /// - A fixed-width option has the wrong length
    /// - A digest option is not the last option
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "message too short: {} bytes (minimum {})",
                data.len(),
                HEADER_SIZE
            )));
        }

        let length = frame_length([data[0], data[1]])?;
        if length != data.len() {
            return Err(Error::Protocol(format!(
                "length field says {} bytes, got {}",
                length,
                data.len()
            )));
        }

        let message_type = MessageType::try_from(data[2])
            .map_err(|value| Error::Protocol(format!("unknown message type {}", value)))?;
        let payload_offset = data[3] as usize;
        if payload_offset < HEADER_SIZE || payload_offset > length {
            return Err(Error::Protocol(format!(
                "payload offset {} outside {}..={}",
                payload_offset, HEADER_SIZE, length
            )));
        }

        let time = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let xid = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let options = Self::parse_options(&data[payload_offset..])?;

        Ok(Self {
            message_type,
            xid,
            time,
            options,
        })
    }

    fn parse_options(data: &[u8]) -> Result<Vec<FailoverOption>> {
        let mut options = Vec::new();
        let mut seen: u32 = 0;
        let mut index = 0;

        while index < data.len() {
            if index + 2 > data.len() {
                return Err(Error::Protocol("option code overflows message".to_string()));
            }
            let code = u16::from_be_bytes([data[index], data[index + 1]]);

            if index + OPTION_HEADER_SIZE > data.len() {
                return Err(Error::Protocol(format!(
                    "option {} length overflows message",
                    code
                )));
            }
            let length = u16::from_be_bytes([data[index + 2], data[index + 3]]) as usize;

            let start = index + OPTION_HEADER_SIZE;
            if start + length > data.len() {
                return Err(Error::Protocol(format!(
                    "option {} data overflows message ({} bytes past end)",
                    code,
                    start + length - data.len()
                )));
            }
            let value = &data[start..start + length];
            index = start + length;

            if let Ok(known) = OptionCode::try_from(code) {
                let bit = 1u32 << (known as u16);
                if seen & bit != 0 {
                    return Err(Error::Protocol(format!("duplicate option {:?}", known)));
                }
                seen |= bit;

                if known == OptionCode::MessageDigest && index != data.len() {
                    return Err(Error::Protocol(
                        "message digest is not the last option".to_string(),
                    ));
                }
            }

            options.push(FailoverOption::parse(code, value)?);
        }

        Ok(options)
    }

    /// Encodes the message for transmission, length prefix included.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if an option fails to encode, a digest
    /// option is not last, or the message exceeds [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut message = Vec::with_capacity(HEADER_SIZE + 64);

        message.extend_from_slice(&[0, 0]);
        message.push(self.message_type as u8);
        message.push(HEADER_SIZE as u8);
        message.extend_from_slice(&self.time.to_be_bytes());
        message.extend_from_slice(&self.xid.to_be_bytes());

        let last = self.options.len().saturating_sub(1);
        for (position, option) in self.options.iter().enumerate() {
            if matches!(option, FailoverOption::MessageDigest(_)) && position != last {
                return Err(Error::Protocol(
                    "message digest must be the last option".to_string(),
                ));
            }
            option.encode_into(&mut message)?;
        }

        if message.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "{} message is {} bytes (maximum {})",
                self.message_type,
                message.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let length = (message.len() as u16).to_be_bytes();
        message[..LENGTH_PREFIX_SIZE].copy_from_slice(&length);
        Ok(message)
    }

    /// Bitmask of the known option codes present (bit `n` for code `n`).
    pub fn options_present(&self) -> u32 {
        self.options
            .iter()
            .filter_map(|option| OptionCode::try_from(option.option_code()).ok())
            .fold(0, |mask, code| mask | (1u32 << (code as u16)))
    }

    /// Returns true if an option with the given code is present.
    pub fn has(&self, code: OptionCode) -> bool {
        self.options_present() & (1u32 << (code as u16)) != 0
    }

    fn find<T>(&self, select: impl Fn(&FailoverOption) -> Option<T>) -> Option<T> {
        self.options.iter().find_map(select)
    }

    pub fn relationship_name(&self) -> Option<&str> {
        self.options.iter().find_map(|option| match option {
            FailoverOption::RelationshipName(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn assigned_address(&self) -> Option<Ipv4Addr> {
        self.find(|option| match option {
            FailoverOption::AssignedIpAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn binding_status(&self) -> Option<BindingState> {
        self.find(|option| match option {
            FailoverOption::BindingStatus(state) => Some(*state),
            _ => None,
        })
    }

    pub fn client_identifier(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            FailoverOption::ClientIdentifier(id) => Some(id.as_slice()),
            _ => None,
        })
    }

    /// Hardware type followed by hardware address.
    pub fn chaddr(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            FailoverOption::Chaddr(addr) => Some(addr.as_slice()),
            _ => None,
        })
    }

    pub fn hba(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            FailoverOption::Hba(hba) => Some(hba.as_slice()),
            _ => None,
        })
    }

    pub fn cltt(&self) -> Option<u32> {
        self.find(|option| match option {
            FailoverOption::Cltt(value) => Some(*value),
            _ => None,
        })
    }

    pub fn lease_expiry(&self) -> Option<u32> {
        self.find(|option| match option {
            FailoverOption::LeaseExpiry(value) => Some(*value),
            _ => None,
        })
    }

    pub fn potential_expiry(&self) -> Option<u32> {
        self.find(|option| match option {
            FailoverOption::PotentialExpiry(value) => Some(*value),
            _ => None,
        })
    }

    pub fn stos(&self) -> Option<u32> {
        self.find(|option| match option {
            FailoverOption::Stos(value) => Some(*value),
            _ => None,
        })
    }

    pub fn ip_flags(&self) -> Option<u16> {
        self.find(|option| match option {
            FailoverOption::IpFlags(flags) => Some(*flags),
            _ => None,
        })
    }

    pub fn max_unacked(&self) -> Option<u32> {
        self.find(|option| match option {
            FailoverOption::MaxUnacked(value) => Some(*value),
            _ => None,
        })
    }

    pub fn receive_timer(&self) -> Option<u32> {
        self.find(|option| match option {
            FailoverOption::ReceiveTimer(value) => Some(*value),
            _ => None,
        })
    }

    pub fn mclt(&self) -> Option<u32> {
        self.find(|option| match option {
            FailoverOption::Mclt(value) => Some(*value),
            _ => None,
        })
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        self.find(|option| match option {
            FailoverOption::RejectReason(reason) => Some(*reason),
            _ => None,
        })
    }

    /// Free-text message, usually explaining a reject reason.
    pub fn text(&self) -> Option<&str> {
        self.options.iter().find_map(|option| match option {
            FailoverOption::Message(text) => Some(text.as_str()),
            _ => None,
        })
    }

    /// Raw server state code.
    pub fn server_state(&self) -> Option<u8> {
        self.find(|option| match option {
            FailoverOption::ServerState(code) => Some(*code),
            _ => None,
        })
    }

    pub fn server_flags(&self) -> Option<u8> {
        self.find(|option| match option {
            FailoverOption::ServerFlags(flags) => Some(*flags),
            _ => None,
        })
    }

    pub fn addresses_transferred(&self) -> Option<u32> {
        self.find(|option| match option {
            FailoverOption::AddressesTransferred(count) => Some(*count),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::IP_FLAG_BOOTP;

    fn bind_update() -> Message {
        let mut message = Message::new(MessageType::BindUpdate)
            .with(FailoverOption::AssignedIpAddress(Ipv4Addr::new(10, 0, 0, 50)))
            .with(FailoverOption::BindingStatus(BindingState::Active))
            .with(FailoverOption::Chaddr(vec![1, 0, 0x11, 0x22, 0x33, 0x44, 0x55]))
            .with(FailoverOption::LeaseExpiry(1_700_003_600))
            .with(FailoverOption::PotentialExpiry(1_700_007_200))
            .with(FailoverOption::Stos(1_700_000_000))
            .with(FailoverOption::Cltt(1_700_000_000))
            .with(FailoverOption::IpFlags(IP_FLAG_BOOTP));
        message.xid = 42;
        message.time = 1_700_000_001;
        message
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let original = bind_update();
        let encoded = original.encode().unwrap();
        assert_eq!(
            u16::from_be_bytes([encoded[0], encoded[1]]) as usize,
            encoded.len()
        );
        assert_eq!(encoded[3] as usize, HEADER_SIZE);

        let decoded = Message::parse(&encoded).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.assigned_address(), Some(Ipv4Addr::new(10, 0, 0, 50)));
        assert_eq!(decoded.binding_status(), Some(BindingState::Active));
        assert_eq!(decoded.ip_flags(), Some(IP_FLAG_BOOTP));
        assert!(decoded.has(OptionCode::Cltt));
        assert!(!decoded.has(OptionCode::ClientIdentifier));
    }

    #[test]
    fn test_bare_header() {
        let encoded = Message::new(MessageType::Contact).encode().unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE);
        let decoded = Message::parse(&encoded).unwrap();
        assert_eq!(decoded.message_type, MessageType::Contact);
        assert!(decoded.options.is_empty());
    }

    #[test]
    fn test_option_length_overflow_rejected() {
        let mut encoded = Message::new(MessageType::State)
            .with(FailoverOption::RelationshipName("peer".to_string()))
            .encode()
            .unwrap();
        // Claim 200 bytes of value where 4 remain.
        encoded[14..16].copy_from_slice(&200u16.to_be_bytes());
        let result = Message::parse(&encoded);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_truncated_option_header_rejected() {
        let mut encoded = Message::new(MessageType::State).encode().unwrap();
        encoded.extend_from_slice(&[0, 24, 0]);
        let length = encoded.len() as u16;
        encoded[..2].copy_from_slice(&length.to_be_bytes());
        assert!(Message::parse(&encoded).is_err());
    }

    #[test]
    fn test_duplicate_option_rejected() {
        let encoded = Message::new(MessageType::State)
            .with(FailoverOption::ServerState(2))
            .with(FailoverOption::ServerState(3))
            .encode()
            .unwrap();
        assert!(Message::parse(&encoded).is_err());
    }

    #[test]
    fn test_duplicate_unknown_option_tolerated() {
        let encoded = Message::new(MessageType::Contact)
            .with(FailoverOption::Unknown(300, vec![1]))
            .with(FailoverOption::Unknown(300, vec![2]))
            .encode()
            .unwrap();
        let decoded = Message::parse(&encoded).unwrap();
        assert_eq!(decoded.options.len(), 2);
    }

    #[test]
    fn test_digest_must_be_last() {
        let message = Message::new(MessageType::Contact)
            .with(FailoverOption::MessageDigest(vec![0; 16]))
            .with(FailoverOption::ServerFlags(0));
        assert!(message.encode().is_err());

        let mut encoded = Message::new(MessageType::Contact)
            .with(FailoverOption::ServerFlags(0))
            .with(FailoverOption::MessageDigest(vec![0; 16]))
            .encode()
            .unwrap();
        assert!(Message::parse(&encoded).is_ok());

        // Swap the two options on the wire.
        let flags = encoded[12..17].to_vec();
        let digest = encoded[17..].to_vec();
        encoded.truncate(12);
        encoded.extend_from_slice(&digest);
        encoded.extend_from_slice(&flags);
        assert!(Message::parse(&encoded).is_err());
    }

    #[test]
    fn test_length_bounds() {
        assert!(frame_length(11u16.to_be_bytes()).is_err());
        assert!(frame_length(2049u16.to_be_bytes()).is_err());
        assert_eq!(frame_length(12u16.to_be_bytes()).unwrap(), 12);

        let oversized = Message::new(MessageType::BindUpdate)
            .with(FailoverOption::VendorOptions(vec![0; MAX_MESSAGE_SIZE]));
        assert!(oversized.encode().is_err());
    }

    #[test]
    fn test_payload_offset_skips_unknown_header_bytes() {
        let mut encoded = Message::new(MessageType::Contact)
            .with(FailoverOption::ServerFlags(1))
            .encode()
            .unwrap();
        encoded.splice(12..12, [0xde, 0xad]);
        encoded[3] = 14;
        let length = encoded.len() as u16;
        encoded[..2].copy_from_slice(&length.to_be_bytes());

        let decoded = Message::parse(&encoded).unwrap();
        assert_eq!(decoded.server_flags(), Some(1));
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let mut encoded = Message::new(MessageType::Contact).encode().unwrap();
        encoded[2] = 99;
        assert!(Message::parse(&encoded).is_err());
    }
}
