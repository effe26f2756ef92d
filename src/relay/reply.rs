use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::relay::protocol::{DestinationKey, ReplyFrame};
use crate::relay::state::{ConnectionId, ReplyMode};

/// Bytes received from a destination, on their way to a control connection.
#[derive(Debug)]
pub struct Reply {
    pub destination: DestinationKey,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
#[error("control connection {0} is closed")]
pub struct SinkClosed(pub ConnectionId);

/// Handle sessions use to push replies onto their owning control connection.
/// Every clone feeds the same single writer, so replies never interleave
/// mid-write.
#[derive(Clone, Debug)]
pub struct ReplySink {
    conn: ConnectionId,
    tx: mpsc::Sender<Reply>,
}

impl ReplySink {
    pub fn new(conn: ConnectionId, tx: mpsc::Sender<Reply>) -> Self {
        Self { conn, tx }
    }

    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    pub async fn deliver(
        &self,
        destination: &DestinationKey,
        data: Vec<u8>,
    ) -> Result<(), SinkClosed> {
        self.tx
            .send(Reply {
                destination: destination.clone(),
                data,
            })
            .await
            .map_err(|_| SinkClosed(self.conn))
    }
}

/// Write one reply in the connection's reply mode.
pub async fn write_reply<W>(writer: &mut W, reply: &Reply, mode: ReplyMode) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match mode {
        ReplyMode::Raw => writer.write_all(&reply.data).await?,
        ReplyMode::Tagged => {
            let frame = ReplyFrame {
                protocol: reply.destination.protocol,
                host: reply.destination.host.clone(),
                port: reply.destination.port,
                data: reply.data.clone(),
            };
            let data = bincode::serialize(&frame)?;
            let len = (data.len() as u32).to_be_bytes();
            writer.write_all(&len).await?;
            writer.write_all(&data).await?;
        }
    }
    Ok(())
}

/// Read one tagged reply. The worker-side counterpart of `write_reply`.
pub async fn read_tagged_reply<R>(reader: &mut R) -> Result<ReplyFrame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    let frame = bincode::deserialize(&buf)?;
    Ok(frame)
}

/// Sole writer for a control connection. Runs until `close` fires (or its
/// sender is dropped), every sink is gone, or a write fails. `close` also
/// abandons a write the worker is not draining. Dropping the queue on exit is
/// what makes later `deliver` calls fail.
pub async fn run_reply_writer<W>(
    mut writer: W,
    mut replies: mpsc::Receiver<Reply>,
    mode: ReplyMode,
    mut close: oneshot::Receiver<()>,
    conn: ConnectionId,
) where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    loop {
        let reply = tokio::select! {
            _ = &mut close => break,
            reply = replies.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
        };

        let written_reply = tokio::select! {
            _ = &mut close => break,
            result = write_reply(&mut writer, &reply, mode) => result,
        };
        if let Err(e) = written_reply {
            warn!(%conn, destination = %reply.destination, error = %e, "failed to write reply");
            break;
        }
        written += reply.data.len() as u64;
    }

    writer.shutdown().await.ok();
    debug!(%conn, bytes = written, "reply writer stopped");
}
