use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::relay::control::handle_control_connection;
use crate::relay::session::{SessionLimiter, SessionOptions, Sessions};
use crate::relay::shutdown::Shutdown;
use crate::relay::state::{ConnectionIds, RelayConfig};

/// How long `run` waits for sessions to notice shutdown before returning.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const SESSION_DRAIN_POLL: Duration = Duration::from_millis(20);

const ACCEPT_BASE_DELAY: Duration = Duration::from_millis(10);
const ACCEPT_MAX_DELAY: Duration = Duration::from_secs(1);

/// Pause after `failures` consecutive accept errors: 10ms doubling up to 1s,
/// so a persistent error such as EMFILE cannot spin the loop.
fn accept_backoff(failures: u32) -> Duration {
    let delay = ACCEPT_BASE_DELAY * 2_u32.pow(failures.saturating_sub(1).min(7));
    delay.min(ACCEPT_MAX_DELAY)
}

/// State shared by every control connection.
pub struct RelayContext {
    pub config: RelayConfig,
    pub sessions: Sessions,
    pub session_options: SessionOptions,
    pub session_limiter: Option<SessionLimiter>,
    pub connection_ids: ConnectionIds,
}

impl RelayContext {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            session_options: SessionOptions::from(&config),
            session_limiter: config.max_sessions.map(SessionLimiter::new),
            sessions: Sessions::new(),
            connection_ids: ConnectionIds::default(),
            config,
        }
    }
}

pub struct RelayServer {
    listener: TcpListener,
    context: Arc<RelayContext>,
    connection_limit: Option<Arc<Semaphore>>,
}

impl RelayServer {
    /// Bind the listening socket with `SO_REUSEADDR`. Failure here is the one
    /// fatal error of the relay.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let bind_addr = config.bind_addr();
        let addr: SocketAddr = tokio::net::lookup_host(&bind_addr)
            .await
            .with_context(|| format!("Failed to resolve relay address {}", bind_addr))?
            .next()
            .with_context(|| format!("No address found for {}", bind_addr))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("Failed to create relay socket")?;
        socket
            .set_reuseaddr(true)
            .context("Failed to set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .with_context(|| format!("Failed to bind relay listener on {}", addr))?;
        let listener = socket
            .listen(config.backlog.max(RelayConfig::MIN_BACKLOG))
            .with_context(|| format!("Failed to listen on {}", addr))?;

        let connection_limit = config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));

        Ok(Self {
            listener,
            context: Arc::new(RelayContext::new(config)),
            connection_limit,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle on the session table, for inspection.
    pub fn sessions(&self) -> Sessions {
        self.context.sessions.clone()
    }

    /// Accept control connections until shutdown. Closes the listener first,
    /// then waits for every control connection and, briefly, for sessions to
    /// drain.
    pub async fn run(self, mut shutdown: Shutdown) -> Result<()> {
        let Self {
            listener,
            context,
            connection_limit,
        } = self;
        let mut connections = JoinSet::new();
        let mut accept_failures = 0u32;

        info!(addr = %listener.local_addr()?, "relay listening");

        loop {
            let permit = match &connection_limit {
                Some(limit) => tokio::select! {
                    _ = shutdown.wait() => break,
                    permit = Arc::clone(limit).acquire_owned() => Some(permit?),
                },
                None => None,
            };

            let accepted = tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer)) => {
                    accept_failures = 0;
                    let id = context.connection_ids.next();
                    let context = Arc::clone(&context);
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        let _permit = permit;
                        if let Err(e) =
                            handle_control_connection(socket, peer, id, context, shutdown).await
                        {
                            warn!(conn = %id, %peer, error = %e, "control connection failed");
                        }
                    });
                }
                Err(e) => {
                    accept_failures = accept_failures.saturating_add(1);
                    let delay = accept_backoff(accept_failures);
                    warn!(error = %e, retry_in = ?delay, "failed to accept control connection");
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            while connections.try_join_next().is_some() {}
        }

        drop(listener);
        info!(connections = connections.len(), "relay shutting down");
        while connections.join_next().await.is_some() {}

        // Slots of creations cut short by shutdown never hold a session
        let drained = tokio::time::timeout(SESSION_DRAIN_TIMEOUT, async {
            while !context.sessions.sessions().await.is_empty() {
                tokio::time::sleep(SESSION_DRAIN_POLL).await;
            }
        })
        .await;
        if drained.is_err() {
            let open = context.sessions.sessions().await.len();
            warn!(sessions = open, "sessions still open after shutdown");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::shutdown::shutdown_channel;

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(5), Duration::from_millis(160));
        assert_eq!(accept_backoff(8), ACCEPT_MAX_DELAY);
        assert_eq!(accept_backoff(u32::MAX), ACCEPT_MAX_DELAY);
    }

    #[tokio::test]
    async fn test_run_future_can_be_spawned() {
        let config = RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..RelayConfig::default()
        };
        let server = RelayServer::bind(config).await.unwrap();
        let (trigger, shutdown) = shutdown_channel();

        let run = server.run(shutdown);
        assert_send(&run);
        let handle = tokio::spawn(run);

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("relay did not stop")
            .unwrap()
            .unwrap();
    }
}
