use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::relay::protocol::DEFAULT_RELAY_PORT;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionIds {
    next: AtomicU64,
}

impl ConnectionIds {
    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
}

/// Which control connections may share an outbound session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SessionScope {
    /// One session per (control connection, destination)
    #[default]
    Connection,
    /// One session per destination, shared by every control connection;
    /// replies go to whichever connection created it
    Global,
}

/// How reply bytes are written back onto the control connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReplyMode {
    /// Verbatim destination bytes, no header
    #[default]
    Raw,
    /// Length-prefixed bincode `ReplyFrame` naming the destination
    Tagged,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub udp_idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_connections: Option<usize>,
    pub max_sessions: Option<usize>,
    pub session_scope: SessionScope,
    pub reply_mode: ReplyMode,
    pub strict_udp_source: bool,
    /// Replies queued per control connection before sessions wait on the writer.
    pub reply_queue_depth: usize,
}

impl RelayConfig {
    pub const MIN_BACKLOG: u32 = 5;

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_RELAY_PORT,
            backlog: 128,
            udp_idle_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            max_connections: None,
            max_sessions: None,
            session_scope: SessionScope::default(),
            reply_mode: ReplyMode::default(),
            strict_udp_source: false,
            reply_queue_depth: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_reference_relay() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:7300");
        assert_eq!(config.udp_idle_timeout, Duration::from_secs(5));
        assert!(config.backlog >= RelayConfig::MIN_BACKLOG);
        assert_eq!(config.reply_mode, ReplyMode::Raw);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let ids = ConnectionIds::default();
        let a = ids.next();
        let b = ids.next();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "conn#1");
    }
}
