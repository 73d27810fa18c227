//! Per-connection framing.
//!
//! A [`Link`] sits on one TCP connection to a failover partner. The
//! transport hands it bytes as they arrive; the link reassembles them into
//! complete messages, one at a time, and keeps the transaction id counter
//! used for everything sent over the connection.
//!
//! The first protocol error marks the link disconnected. It never reads
//! past the bytes it was given.

use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::message::{LENGTH_PREFIX_SIZE, Message, frame_length};

/// Handle for a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub u64);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Where the link is in reading the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    AwaitingLength,
    AwaitingBody { length: usize },
    Disconnected,
}

#[derive(Debug)]
pub struct Link {
    pub id: LinkId,
    pub peer: SocketAddr,

    /// Relationship served by this link; `None` until a connect names it.
    pub relationship: Option<String>,

    /// True if this side opened the connection.
    pub outbound: bool,

    state: ParseState,
    /// Bytes of the message under construction, length prefix included.
    partial: Vec<u8>,
    xid: u32,
}

impl Link {
    pub fn new(id: LinkId, peer: SocketAddr, relationship: Option<String>, outbound: bool) -> Self {
        Self {
            id,
            peer,
            relationship,
            outbound,
            state: ParseState::AwaitingLength,
            partial: Vec::new(),
            xid: 1,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Number of bytes of the current message consumed so far.
    pub fn consumed(&self) -> usize {
        self.partial.len()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == ParseState::Disconnected
    }

    pub fn disconnect(&mut self) {
        self.state = ParseState::Disconnected;
        self.partial.clear();
    }

    /// Returns the next transaction id. Zero is never issued.
    pub fn next_xid(&mut self) -> u32 {
        if self.xid == 0 {
            self.xid = 1;
        }
        let xid = self.xid;
        self.xid = self.xid.wrapping_add(1);
        xid
    }

    /// Consumes received bytes and returns every message they complete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on the first framing or option error,
    /// after which the link is disconnected and rejects further input.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<Vec<Message>> {
        let mut messages = Vec::new();

        while !data.is_empty() {
            match self.state {
                ParseState::Disconnected => {
                    return Err(Error::Protocol(format!("{} is disconnected", self.id)));
                }
                ParseState::AwaitingLength => {
                    let wanted = LENGTH_PREFIX_SIZE - self.partial.len();
                    let take = wanted.min(data.len());
                    self.partial.extend_from_slice(&data[..take]);
                    data = &data[take..];

                    if self.partial.len() == LENGTH_PREFIX_SIZE {
                        match frame_length([self.partial[0], self.partial[1]]) {
                            Ok(length) => self.state = ParseState::AwaitingBody { length },
                            Err(error) => {
                                self.disconnect();
                                return Err(error);
                            }
                        }
                    }
                }
                ParseState::AwaitingBody { length } => {
                    let wanted = length - self.partial.len();
                    let take = wanted.min(data.len());
                    self.partial.extend_from_slice(&data[..take]);
                    data = &data[take..];

                    if self.partial.len() == length {
                        let parsed = Message::parse(&self.partial);
                        self.partial.clear();
                        match parsed {
                            Ok(message) => {
                                messages.push(message);
                                self.state = ParseState::AwaitingLength;
                            }
                            Err(error) => {
                                self.disconnect();
                                return Err(error);
                            }
                        }
                    }
                }
            }
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{FailoverOption, MessageType};

    fn test_link() -> Link {
        Link::new(LinkId(1), "127.0.0.1:647".parse().unwrap(), None, false)
    }

    fn state_message() -> Vec<u8> {
        Message::new(MessageType::State)
            .with(FailoverOption::ServerState(2))
            .with(FailoverOption::RelationshipName("peer".to_string()))
            .encode()
            .unwrap()
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut link = test_link();
        let bytes = state_message();
        let mut messages = Vec::new();
        for byte in &bytes {
            messages.extend(link.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].server_state(), Some(2));
        assert_eq!(link.state(), ParseState::AwaitingLength);
        assert_eq!(link.consumed(), 0);
    }

    #[test]
    fn test_several_messages_in_one_read() {
        let mut link = test_link();
        let mut bytes = state_message();
        bytes.extend(state_message());
        bytes.extend(&state_message()[..5]);

        let messages = link.feed(&bytes).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(link.consumed(), 5);
        assert!(matches!(link.state(), ParseState::AwaitingBody { .. }));
    }

    #[test]
    fn test_bad_length_disconnects() {
        let mut link = test_link();
        assert!(link.feed(&[0, 3]).is_err());
        assert!(link.is_disconnected());
        assert!(link.feed(&state_message()).is_err());
    }

    #[test]
    fn test_overflowing_option_disconnects() {
        let mut link = test_link();
        let mut bytes = state_message();
        bytes[14..16].copy_from_slice(&u16::MAX.to_be_bytes());
        assert!(matches!(link.feed(&bytes), Err(Error::Protocol(_))));
        assert!(link.is_disconnected());
    }

    #[test]
    fn test_xid_skips_zero() {
        let mut link = test_link();
        link.xid = u32::MAX;
        assert_eq!(link.next_xid(), u32::MAX);
        assert_eq!(link.next_xid(), 1);
    }
}
