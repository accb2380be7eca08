//! Packet transmission queue with an ordinary and a bulk lane.
//!
//! Control packets go on the ordinary lane, pixel data on the bulk lane.
//! The network writer always drains the ordinary lane first. Bulk packets
//! may carry `start_send` / `end_send` hooks which the writer calls with
//! its cumulative byte count when it starts and finishes writing them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::pipeline::stats::SharedGlobalStatistics;
use crate::wire::ServerPacket;

/// Called with `(when, bytes written so far on the connection)`.
pub type SendHook = Box<dyn FnOnce(Instant, u64) + Send + 'static>;

pub struct QueuedPacket {
    pub packet: ServerPacket,
    pub start_send: Option<SendHook>,
    pub end_send: Option<SendHook>,
}

impl QueuedPacket {
    pub fn new(packet: ServerPacket) -> Self {
        Self {
            packet,
            start_send: None,
            end_send: None,
        }
    }

    pub fn with_hooks(packet: ServerPacket, start_send: SendHook, end_send: SendHook) -> Self {
        Self {
            packet,
            start_send: Some(start_send),
            end_send: Some(end_send),
        }
    }
}

impl std::fmt::Debug for QueuedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedPacket")
            .field("bulk", &self.packet.is_bulk())
            .field("hooks", &self.start_send.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Lanes {
    ordinary: VecDeque<QueuedPacket>,
    bulk: VecDeque<QueuedPacket>,
    closed: bool,
}

/// Cloneable handle on the queue of one connection.
#[derive(Clone)]
pub struct PacketQueue {
    lanes: Arc<Mutex<Lanes>>,
    notify: Arc<Notify>,
    global: SharedGlobalStatistics,
}

impl PacketQueue {
    pub fn new(global: SharedGlobalStatistics) -> Self {
        Self {
            lanes: Arc::new(Mutex::new(Lanes::default())),
            notify: Arc::new(Notify::new()),
            global,
        }
    }

    /// Queue a control packet.
    pub fn send(&self, packet: ServerPacket) {
        self.push(QueuedPacket::new(packet), 0, 0);
    }

    /// Queue a packet on the lane its kind belongs to.
    ///
    /// Bulk packets record the queue depth and `pixels` for `wid` in the
    /// connection statistics.
    pub fn push(&self, item: QueuedPacket, wid: u32, pixels: u64) {
        let bulk = item.packet.is_bulk();
        let depth = {
            let mut lanes = self.lanes.lock();
            if lanes.closed {
                tracing::trace!("packet queue closed, packet dropped");
                return;
            }
            if bulk {
                lanes.bulk.push_back(item);
            } else {
                lanes.ordinary.push_back(item);
            }
            lanes.bulk.len()
        };
        if bulk {
            let now = Instant::now();
            let mut global = self.global.lock();
            global.packet_qsizes.push((now, depth as f64));
            global.damage_packet_qpixels.push((now, wid, pixels));
        }
        self.notify.notify_one();
    }

    /// Next packet, ordinary lane first.
    pub fn try_pop(&self) -> Option<QueuedPacket> {
        let mut lanes = self.lanes.lock();
        lanes.ordinary.pop_front().or_else(|| lanes.bulk.pop_front())
    }

    /// Wait for the next packet. `None` once closed and drained.
    pub async fn pop(&self) -> Option<QueuedPacket> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.lanes.lock().closed {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting packets. Queued ones can still be popped.
    pub fn close(&self) {
        self.lanes.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lanes.lock().closed
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.ordinary.len() + lanes.bulk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bulk_len(&self) -> usize {
        self.lanes.lock().bulk.len()
    }
}

impl std::fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lanes = self.lanes.lock();
        f.debug_struct("PacketQueue")
            .field("ordinary", &lanes.ordinary.len())
            .field("bulk", &lanes.bulk.len())
            .field("closed", &lanes.closed)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stats::GlobalStatistics;
    use crate::wire::{DrawPacket, Options, Payload};
    use bytes::Bytes;

    fn draw(wid: u32) -> ServerPacket {
        ServerPacket::Draw(DrawPacket {
            wid,
            x: 0,
            y: 0,
            width: 1,
            height: 1,
            encoding: "rgb24".into(),
            payload: Payload::Raw(Bytes::from_static(&[0, 0, 0])),
            damage_packet_sequence: 1,
            row_stride: 3,
            options: Options::new(),
        })
    }

    #[test]
    fn ordinary_lane_goes_first() {
        let global = GlobalStatistics::shared();
        let q = PacketQueue::new(Arc::clone(&global));
        q.push(QueuedPacket::new(draw(1)), 1, 1);
        q.send(ServerPacket::LostWindow { wid: 2 });
        assert_eq!(q.bulk_len(), 1);
        assert!(matches!(q.try_pop().unwrap().packet, ServerPacket::LostWindow { wid: 2 }));
        assert!(q.try_pop().unwrap().packet.is_bulk());
        assert!(q.try_pop().is_none());
        let g = global.lock();
        assert_eq!(g.packet_qsizes.len(), 1);
        assert_eq!(g.get_damage_pixels(1).len(), 1);
    }

    #[test]
    fn closed_queue_drops_new_packets() {
        let q = PacketQueue::new(GlobalStatistics::shared());
        q.send(ServerPacket::LostWindow { wid: 1 });
        q.close();
        q.send(ServerPacket::LostWindow { wid: 2 });
        assert_eq!(q.len(), 1);
        assert!(tokio_test::block_on(q.pop()).is_some());
        assert!(tokio_test::block_on(q.pop()).is_none());
    }

    #[tokio::test]
    async fn pop_waits_for_a_packet() {
        let q = PacketQueue::new(GlobalStatistics::shared());
        let producer = q.clone();
        let handle = tokio::spawn(async move { q.pop().await });
        tokio::task::yield_now().await;
        producer.send(ServerPacket::LostWindow { wid: 9 });
        let item = handle.await.unwrap().unwrap();
        assert!(matches!(item.packet, ServerPacket::LostWindow { wid: 9 }));
    }
}
