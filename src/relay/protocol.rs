// Relay wire protocol - frames, destination keys, reply frames
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::relay::state::ConnectionId;

/// Separates the UTF-8 header from the raw payload.
pub const FRAME_DELIMITER: u8 = b'|';

/// Separates header fields.
pub const HEADER_SEPARATOR: char = ':';

/// A buffer this long without a delimiter can never become a valid header.
pub const MAX_HEADER_LEN: usize = 512;

/// Size of a single control-connection or TCP destination read.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Largest datagram the UDP reply loop will receive.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

pub const DEFAULT_RELAY_PORT: u16 = 7300;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Protocol::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Protocol::Udp)
        } else {
            Err(s.to_string())
        }
    }
}

/// Identity of one outbound endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

impl DestinationKey {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.protocol, self.host, self.port)
    }
}

/// Key of the session table. `scope` is the owning control connection when
/// sessions are per-connection, `None` when they are shared relay-wide.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub scope: Option<ConnectionId>,
    pub destination: DestinationKey,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Some(conn) => write!(f, "{}@{}", self.destination, conn),
            None => write!(f, "{}", self.destination),
        }
    }
}

/// One relay request: where to send, and what.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub destination: DestinationKey,
    pub payload: Vec<u8>,
}

/// Reply envelope written back in tagged reply mode.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ReplyFrame {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub data: Vec<u8>,
}
