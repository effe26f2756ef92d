//! Outbound sessions: one socket to one destination plus its reply loop.
//!
//! A session is created through the session table, then `start`ed once it is
//! visible there. From then on its reply loop owns teardown: it is the only
//! code that removes the session from the table, whichever of destination EOF,
//! read error, failed forward, UDP idle timeout, a closed control connection or
//! relay shutdown ended it.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::relay::protocol::{MAX_DATAGRAM_SIZE, Protocol, READ_CHUNK_SIZE, SessionKey};
use crate::relay::reply::ReplySink;
use crate::relay::shutdown::Shutdown;
use crate::relay::state::{ConnectionId, RelayConfig, SessionState};
use crate::relay::table::{SessionTable, Tracked};

pub type Sessions = SessionTable<SessionKey, OutboundSession>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to resolve {0}: {1}")]
    Resolve(String, #[source] io::Error),
    #[error("no address found for {0}")]
    NoAddress(String),
    #[error("connect to {0} failed: {1}")]
    Connect(SocketAddr, #[source] io::Error),
    #[error("connect to {0} timed out after {1:?}")]
    ConnectTimeout(SocketAddr, Duration),
    #[error("failed to bind udp socket: {0}")]
    Bind(#[source] io::Error),
    #[error("session limit of {0} reached")]
    Capacity(usize),
    #[error("session {0} is closing")]
    Closed(SessionKey),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Per-session knobs taken from the relay config.
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub udp_idle_timeout: Duration,
    pub strict_udp_source: bool,
}

impl From<&RelayConfig> for SessionOptions {
    fn from(config: &RelayConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            udp_idle_timeout: config.udp_idle_timeout,
            strict_udp_source: config.strict_udp_source,
        }
    }
}

/// Caps the number of live sessions relay-wide.
#[derive(Clone, Debug)]
pub struct SessionLimiter {
    permits: Arc<Semaphore>,
    max: usize,
}

impl SessionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    fn acquire(&self) -> Result<OwnedSemaphorePermit, SessionError> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| SessionError::Capacity(self.max))
    }
}

enum Transport {
    Tcp(tokio::sync::Mutex<OwnedWriteHalf>),
    Udp {
        socket: Arc<UdpSocket>,
        target: SocketAddr,
    },
}

/// Read side of the transport, held until the reply loop starts.
enum ReplySource {
    Tcp(OwnedReadHalf),
    Udp,
}

pub struct OutboundSession {
    key: SessionKey,
    transport: Transport,
    local_addr: SocketAddr,
    sink: ReplySink,
    options: SessionOptions,
    closing: AtomicBool,
    close_notify: Notify,
    pending: Mutex<Option<ReplySource>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Tracked for OutboundSession {
    fn state(&self) -> SessionState {
        if self.closing.load(Ordering::Acquire) {
            SessionState::Closing
        } else {
            SessionState::Active
        }
    }
}

impl OutboundSession {
    /// Open the outbound socket for `key`. TCP connects here; UDP only binds.
    /// The reply loop is not running until `start` is called.
    pub async fn open(
        key: SessionKey,
        sink: ReplySink,
        options: SessionOptions,
        limiter: Option<&SessionLimiter>,
    ) -> Result<Arc<Self>, SessionError> {
        let permit = limiter.map(SessionLimiter::acquire).transpose()?;
        let target = resolve(&key).await?;

        let (transport, local_addr, source) = match key.destination.protocol {
            Protocol::Tcp => {
                let connect = TcpStream::connect(target);
                let stream = tokio::time::timeout(options.connect_timeout, connect)
                    .await
                    .map_err(|_| SessionError::ConnectTimeout(target, options.connect_timeout))?
                    .map_err(|e| SessionError::Connect(target, e))?;
                stream.set_nodelay(true).ok();
                let local_addr = stream.local_addr()?;
                let (read, write) = stream.into_split();
                (
                    Transport::Tcp(tokio::sync::Mutex::new(write)),
                    local_addr,
                    ReplySource::Tcp(read),
                )
            }
            Protocol::Udp => {
                let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(bind_addr).await.map_err(SessionError::Bind)?;
                let local_addr = socket.local_addr()?;
                (
                    Transport::Udp {
                        socket: Arc::new(socket),
                        target,
                    },
                    local_addr,
                    ReplySource::Udp,
                )
            }
        };

        info!(session = %key, %target, local = %local_addr, "session opened");

        Ok(Arc::new(Self {
            key,
            transport,
            local_addr,
            sink,
            options,
            closing: AtomicBool::new(false),
            close_notify: Notify::new(),
            pending: Mutex::new(Some(source)),
            _permit: permit,
        }))
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Control connection this session delivers replies to.
    pub fn owner(&self) -> ConnectionId {
        self.sink.connection()
    }

    /// Local address of the outbound socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the reply loop. Only the first call does anything.
    pub fn start(self: &Arc<Self>, table: &Sessions, shutdown: &Shutdown) {
        let source = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(source) = source {
            let session = Arc::clone(self);
            let table = table.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                session.run_reply_loop(source, table, shutdown).await;
            });
        }
    }

    /// Send `payload` to the destination. A failed write marks the session
    /// closing; the reply loop finishes the teardown.
    pub async fn forward(&self, payload: &[u8]) -> Result<(), SessionError> {
        if self.state() == SessionState::Closing {
            return Err(SessionError::Closed(self.key.clone()));
        }

        let result = match &self.transport {
            Transport::Tcp(write) => write.lock().await.write_all(payload).await,
            Transport::Udp { socket, target } => {
                socket.send_to(payload, *target).await.map(|_| ())
            }
        };

        match result {
            Ok(()) => {
                trace!(session = %self.key, bytes = payload.len(), "forwarded");
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(SessionError::Io(e))
            }
        }
    }

    /// Ask the reply loop to tear the session down.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_one();
        }
    }

    async fn run_reply_loop(
        self: Arc<Self>,
        source: ReplySource,
        table: Sessions,
        shutdown: Shutdown,
    ) {
        let reason = match source {
            ReplySource::Tcp(read) => self.tcp_replies(read, shutdown).await,
            ReplySource::Udp => self.udp_replies(shutdown).await,
        };
        self.teardown(&table, reason).await;
    }

    async fn tcp_replies(&self, mut read: OwnedReadHalf, mut shutdown: Shutdown) -> &'static str {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = tokio::select! {
                _ = self.close_notify.notified() => return "closed",
                _ = shutdown.wait() => return "relay shutting down",
                result = read.read(&mut buf) => match result {
                    Ok(0) => return "destination closed",
                    Ok(n) => n,
                    Err(e) => {
                        warn!(session = %self.key, error = %e, "destination read failed");
                        return "read error";
                    }
                },
            };

            if self.sink.deliver(&self.key.destination, buf[..n].to_vec()).await.is_err() {
                return "control connection closed";
            }
        }
    }

    async fn udp_replies(&self, mut shutdown: Shutdown) -> &'static str {
        let Transport::Udp { socket, target } = &self.transport else {
            return "transport mismatch";
        };

        let idle = self.options.udp_idle_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, from) = tokio::select! {
                _ = self.close_notify.notified() => return "closed",
                _ = shutdown.wait() => return "relay shutting down",
                result = tokio::time::timeout(idle, socket.recv_from(&mut buf)) => {
                    match result {
                        Err(_) => return "idle timeout",
                        Ok(Ok(received)) => received,
                        Ok(Err(e)) => {
                            warn!(session = %self.key, error = %e, "datagram receive failed");
                            return "receive error";
                        }
                    }
                }
            };

            if self.options.strict_udp_source && from != *target {
                debug!(session = %self.key, %from, "dropping datagram from unexpected source");
                continue;
            }

            if self.sink.deliver(&self.key.destination, buf[..n].to_vec()).await.is_err() {
                return "control connection closed";
            }
        }
    }

    async fn teardown(self: &Arc<Self>, table: &Sessions, reason: &'static str) {
        self.closing.store(true, Ordering::Release);
        // A forward stuck on a full send buffer holds the write half. Skip the
        // FIN then; the socket closes once the last handle drops.
        if let Transport::Tcp(write) = &self.transport {
            if let Ok(mut write) = write.try_lock() {
                write.shutdown().await.ok();
            }
        }

        if table.remove(&self.key, self).await {
            if reason == "idle timeout" {
                debug!(session = %self.key, reason, "session closed");
            } else {
                info!(session = %self.key, reason, "session closed");
            }
        }
    }
}

async fn resolve(key: &SessionKey) -> Result<SocketAddr, SessionError> {
    let dest = &key.destination;
    let authority = format!("{}:{}", dest.host, dest.port);
    let mut addrs = tokio::net::lookup_host((dest.host.as_str(), dest.port))
        .await
        .map_err(|e| SessionError::Resolve(authority.clone(), e))?;
    addrs.next().ok_or(SessionError::NoAddress(authority))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::DestinationKey;
    use crate::relay::reply::Reply;
    use crate::relay::shutdown::shutdown_channel;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn options() -> SessionOptions {
        SessionOptions {
            connect_timeout: Duration::from_secs(2),
            udp_idle_timeout: Duration::from_secs(2),
            strict_udp_source: false,
        }
    }

    fn key(protocol: Protocol, addr: SocketAddr) -> SessionKey {
        SessionKey {
            scope: Some(ConnectionId(1)),
            destination: DestinationKey::new(protocol, addr.ip().to_string(), addr.port()),
        }
    }

    fn sink() -> (ReplySink, mpsc::Receiver<Reply>) {
        let (tx, rx) = mpsc::channel(16);
        (ReplySink::new(ConnectionId(1), tx), rx)
    }

    async fn udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                socket.send_to(&buf[..n], from).await.ok();
            }
        });
        addr
    }

    async fn open_started(
        table: &Sessions,
        key: &SessionKey,
        sink: ReplySink,
        options: SessionOptions,
        shutdown: &Shutdown,
    ) -> Result<Arc<OutboundSession>, SessionError> {
        let session = table
            .get_or_create(key, || OutboundSession::open(key.clone(), sink, options, None))
            .await?;
        session.start(table, shutdown);
        Ok(session)
    }

    #[tokio::test]
    async fn test_udp_session_relays_echo() {
        let (_trigger, shutdown) = shutdown_channel();
        let table = Sessions::new();
        let (sink, mut replies) = sink();
        let key = key(Protocol::Udp, udp_echo().await);

        let session = open_started(&table, &key, sink, options(), &shutdown).await.unwrap();
        session.forward(b"Hello, UDP relay!").await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.data, b"Hello, UDP relay!");
        assert_eq!(reply.destination, key.destination);
        assert_eq!(table.state(&key).await, Some(SessionState::Active));
    }

    #[tokio::test]
    async fn test_udp_idle_timeout_removes_session() {
        let (_trigger, shutdown) = shutdown_channel();
        let table = Sessions::new();
        let (sink, _replies) = sink();
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let key = key(Protocol::Udp, silent.local_addr().unwrap());
        let opts = SessionOptions {
            udp_idle_timeout: Duration::from_millis(100),
            ..options()
        };

        let session = open_started(&table, &key, sink, opts, &shutdown).await.unwrap();
        session.forward(b"anyone there?").await.unwrap();
        assert!(table.contains(&key).await);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!table.contains(&key).await);
        assert_eq!(session.state(), SessionState::Closing);
        assert!(matches!(
            session.forward(b"late").await,
            Err(SessionError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_strict_source_drops_foreign_datagrams() {
        let (_trigger, shutdown) = shutdown_channel();
        let table = Sessions::new();
        let (sink, mut replies) = sink();

        // Receives on one socket, answers from another
        let inbound = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let outbound = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let key = key(Protocol::Udp, inbound.local_addr().unwrap());
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            if let Ok((n, from)) = inbound.recv_from(&mut buf).await {
                outbound.send_to(&buf[..n], from).await.ok();
            }
        });

        let opts = SessionOptions {
            strict_udp_source: true,
            ..options()
        };
        let session = open_started(&table, &key, sink, opts, &shutdown).await.unwrap();
        session.forward(b"ping").await.unwrap();

        let reply = tokio::time::timeout(Duration::from_millis(300), replies.recv()).await;
        assert!(reply.is_err(), "foreign datagram was delivered");
    }

    #[tokio::test]
    async fn test_tcp_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let table = Sessions::new();
        let (sink, _replies) = sink();
        let key = key(Protocol::Tcp, addr);
        let result = table
            .get_or_create(&key, || OutboundSession::open(key.clone(), sink, options(), None))
            .await;

        assert!(matches!(result, Err(SessionError::Connect(..))));
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_tcp_session_relays_and_tears_down_on_peer_close() {
        let (_trigger, shutdown) = shutdown_channel();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
            // dropping the stream closes the destination side
        });

        let table = Sessions::new();
        let (sink, mut replies) = sink();
        let key = key(Protocol::Tcp, addr);
        let session = open_started(&table, &key, sink, options(), &shutdown).await.unwrap();
        session.forward(b"Hello, TCP relay!").await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), replies.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.data, b"Hello, TCP relay!");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!table.contains(&key).await);
    }

    #[tokio::test]
    async fn test_closed_sink_tears_down_session() {
        let (_trigger, shutdown) = shutdown_channel();
        let table = Sessions::new();
        let (sink, replies) = sink();
        drop(replies);
        let key = key(Protocol::Udp, udp_echo().await);

        let session = open_started(&table, &key, sink, options(), &shutdown).await.unwrap();
        session.forward(b"nobody listening").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!table.contains(&key).await);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_session() {
        let (trigger, shutdown) = shutdown_channel();
        let table = Sessions::new();
        let (sink, _replies) = sink();
        let key = key(Protocol::Udp, udp_echo().await);

        open_started(&table, &key, sink, options(), &shutdown).await.unwrap();
        trigger.trigger();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_session_with_blocked_forward() {
        let (trigger, shutdown) = shutdown_channel();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts and never reads, so the relay's send buffer fills up
        let (held_tx, held_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            held_tx.send(stream).ok();
        });

        let table = Sessions::new();
        let (sink, _replies) = sink();
        let key = key(Protocol::Tcp, addr);
        let session = open_started(&table, &key, sink, options(), &shutdown).await.unwrap();
        let _held = held_rx.await.unwrap();

        let forwarding = Arc::clone(&session);
        let writer = tokio::spawn(async move {
            let chunk = vec![0u8; 1 << 20];
            while forwarding.forward(&chunk).await.is_ok() {}
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!writer.is_finished(), "forward never blocked");

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !table.is_empty().await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session still in the table after shutdown");
        assert_eq!(session.state(), SessionState::Closing);
        writer.abort();
    }

    #[tokio::test]
    async fn test_limiter_caps_live_sessions() {
        let limiter = SessionLimiter::new(1);
        let first_addr = udp_echo().await;
        let second_addr = udp_echo().await;
        let (sink, _replies) = sink();

        let first = OutboundSession::open(
            key(Protocol::Udp, first_addr),
            sink.clone(),
            options(),
            Some(&limiter),
        )
        .await
        .unwrap();

        let second = OutboundSession::open(
            key(Protocol::Udp, second_addr),
            sink.clone(),
            options(),
            Some(&limiter),
        )
        .await;
        assert!(matches!(second, Err(SessionError::Capacity(1))));

        drop(first);
        assert!(
            OutboundSession::open(key(Protocol::Udp, second_addr), sink, options(), Some(&limiter))
                .await
                .is_ok()
        );
    }
}
