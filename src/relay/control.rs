use anyhow::Result;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::relay::codec::FrameDecoder;
use crate::relay::protocol::{DestinationKey, Frame, READ_CHUNK_SIZE, SessionKey};
use crate::relay::reply::{ReplySink, run_reply_writer};
use crate::relay::server::RelayContext;
use crate::relay::session::OutboundSession;
use crate::relay::shutdown::Shutdown;
use crate::relay::state::{ConnectionId, SessionScope};

/// One accepted worker connection.
pub struct ControlConnection {
    id: ConnectionId,
    peer: SocketAddr,
    relay: Arc<RelayContext>,
    sink: ReplySink,
    shutdown: Shutdown,
    sessions_created: HashSet<DestinationKey>,
}

impl ControlConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    fn session_key(&self, destination: DestinationKey) -> SessionKey {
        let scope = match self.relay.config.session_scope {
            SessionScope::Connection => Some(self.id),
            SessionScope::Global => None,
        };
        SessionKey { scope, destination }
    }

    /// Resolve or create the frame's session and forward its payload. Failures
    /// are logged and swallowed: one bad destination never ends the connection.
    async fn dispatch(&mut self, frame: Frame) {
        let key = self.session_key(frame.destination);
        let relay = &self.relay;

        let session = match relay
            .sessions
            .get_or_create(&key, || {
                OutboundSession::open(
                    key.clone(),
                    self.sink.clone(),
                    relay.session_options,
                    relay.session_limiter.as_ref(),
                )
            })
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(conn = %self.id, session = %key, error = %e, "dropping forward, no session");
                return;
            }
        };
        session.start(&relay.sessions, &self.shutdown);

        if session.owner() == self.id {
            self.sessions_created.insert(key.destination.clone());
        }

        if let Err(e) = session.forward(&frame.payload).await {
            warn!(conn = %self.id, session = %key, error = %e, "forward failed");
        }
    }

    /// Dispatch every complete frame buffered in `decoder`, in order.
    async fn dispatch_buffered(&mut self, decoder: &mut FrameDecoder) {
        while let Some(next) = decoder.next_frame() {
            match next {
                Ok(frame) => self.dispatch(frame).await,
                Err(e) => debug!(conn = %self.id, error = %e, "dropping malformed frame"),
            }
        }
    }
}

/// Serve one control connection until the worker hangs up, a read fails, or
/// the relay shuts down.
///
/// Sessions created here outlive the connection. Once the reply writer stops,
/// their next delivery fails and they tear themselves down.
pub async fn handle_control_connection(
    socket: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
    relay: Arc<RelayContext>,
    mut shutdown: Shutdown,
) -> Result<()> {
    let (mut reader, writer) = socket.into_split();
    let (reply_tx, reply_rx) = mpsc::channel(relay.config.reply_queue_depth.max(1));
    let (close_tx, close_rx) = oneshot::channel::<()>();
    let writer_task = tokio::spawn(run_reply_writer(
        writer,
        reply_rx,
        relay.config.reply_mode,
        close_rx,
        id,
    ));

    let mut conn = ControlConnection {
        id,
        peer,
        relay,
        sink: ReplySink::new(id, reply_tx),
        shutdown: shutdown.clone(),
        sessions_created: HashSet::new(),
    };

    info!(conn = %conn.id, peer = %conn.peer, "control connection opened");

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let result = loop {
        let n = tokio::select! {
            _ = shutdown.wait() => break Ok(()),
            read = reader.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
        };

        decoder.extend(&buf[..n]);
        // A destination that stops reading can stall a forward indefinitely
        tokio::select! {
            _ = shutdown.wait() => break Ok(()),
            _ = conn.dispatch_buffered(&mut decoder) => {}
        }
    };

    drop(close_tx);
    writer_task.await.ok();

    let mut created: Vec<String> = conn.sessions_created.iter().map(|d| d.to_string()).collect();
    created.sort();
    info!(
        conn = %conn.id,
        peer = %conn.peer,
        sessions = ?created,
        pending_bytes = decoder.buffered(),
        "control connection closed"
    );

    result.map_err(Into::into)
}
