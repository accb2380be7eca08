//! Socket side of a connection: one writer task draining the
//! [`PacketQueue`] and one reader task forwarding client packets.

use std::time::Instant;

use futures::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::error::StreamError;
use crate::pipeline::queue::PacketQueue;
use crate::pipeline::stats::SharedGlobalStatistics;
use crate::wire::{ClientPacket, ServerCodec, ServerPacket, frame_size};

/// Capacity of the client packet channel.
const CLIENT_CHANNEL: usize = 100;

/// The two background tasks of a served connection.
#[derive(Debug)]
pub struct Connection {
    writer: JoinHandle<Result<u64, StreamError>>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Spawn the writer and reader tasks on `stream`.
    ///
    /// Returns the receiver of client packets; it closes when the client
    /// disconnects or sends garbage.
    pub fn spawn<S>(stream: S, queue: PacketQueue, global: SharedGlobalStatistics) -> (Self, mpsc::Receiver<ClientPacket>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (net_writer, net_reader) = Framed::new(stream, ServerCodec::new()).split();
        let (client_tx, client_rx) = mpsc::channel(CLIENT_CHANNEL);

        // Writer task: queue -> network
        let writer = tokio::spawn(write_loop(net_writer, queue.clone(), global));

        // Reader task: network -> event loop
        let reader = tokio::spawn(async move {
            let mut net_reader = net_reader;
            while let Some(result) = net_reader.next().await {
                match result {
                    Ok(packet) => {
                        if client_tx.send(packet).await.is_err() {
                            // event loop gone
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "network read error");
                        break;
                    }
                }
            }
            tracing::debug!("client reader finished");
            queue.close();
        });

        (Self { writer, reader }, client_rx)
    }

    /// Wait for the writer to drain the queue. Returns the bytes written.
    pub async fn finish(self) -> Result<u64, StreamError> {
        self.reader.abort();
        match self.writer.await {
            Ok(result) => result,
            Err(e) => Err(StreamError::Other(format!("writer task failed: {e}"))),
        }
    }
}

async fn write_loop<W>(mut sink: W, queue: PacketQueue, global: SharedGlobalStatistics) -> Result<u64, StreamError>
where
    W: Sink<ServerPacket, Error = StreamError> + Unpin,
{
    let mut total: u64 = 0;
    while let Some(item) = queue.pop().await {
        let size = frame_size(&item.packet)?;
        if let Some(start) = item.start_send {
            start(Instant::now(), total);
        }
        if let Err(e) = sink.send(item.packet).await {
            tracing::warn!(error = %e, "network write error");
            queue.close();
            return Err(e);
        }
        total += size;
        let now = Instant::now();
        if let Some(end) = item.end_send {
            end(now, total);
        }
        global.lock().bytes_sent.push((now, size));
    }
    tracing::debug!(bytes = total, "packet writer finished");
    Ok(total)
}

// ── Tests ────────────────────────────────────────────────────────
