//! Worker side of a window: turns one captured region into a draw packet.
//!
//! A [`WindowEncoder`] is shared between the event loop and the encode
//! worker. The event loop only touches the cancellation mark and
//! the delta buckets; everything else runs on the worker thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::codec::mmap::MmapArea;
use crate::codec::{CodecRegistry, EncodeParams, EncodedImage, Encoding};
use crate::config::DeltaSection;
use crate::error::EncodeError;
use crate::pipeline::delta::{self, DeltaBuckets, DeltaKey};
use crate::pipeline::queue::{PacketQueue, QueuedPacket};
use crate::pipeline::refresh::SentUpdate;
use crate::pipeline::stats::{EncodingRecord, SharedGlobalStatistics, SharedWindowStatistics};
use crate::pixels::ImageWrapper;
use crate::wire::{DrawPacket, Options, OptionsExt, ServerPacket};

/// Encodings a client may receive as deltas.
pub const DELTA_ENCODINGS: [Encoding; 3] = [Encoding::Png, Encoding::Rgb24, Encoding::Rgb32];

/// Delta output at least this share of the raw size is not worth keeping.
const DELTA_MAX_RATIO_PCT: usize = 40;

// ── Events back to the loop ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum EncodeOutcome {
    /// The packet is on the bulk lane.
    Sent(SentUpdate),
    /// The window cancelled this sequence; nothing was sent.
    Cancelled,
    Failed(EncodeError),
}

/// Sent by the worker to the connection event loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Encoded {
        wid: u32,
        sequence: u64,
        outcome: EncodeOutcome,
    },
}

// ── EncodeJob ────────────────────────────────────────────────────

/// Everything the worker needs for one region, captured on the loop.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub sequence: u64,
    pub image: ImageWrapper,
    pub encoding: Encoding,
    /// Used when the mmap area is full.
    pub fallback: Encoding,
    pub params: EncodeParams,
    /// Packets still to come in the same flush.
    pub flush: usize,
    /// When the damage was recorded.
    pub damage_time: Instant,
}

// ── WindowEncoder ────────────────────────────────────────────────

struct DeltaState {
    buckets: DeltaBuckets,
    encodings: Vec<Encoding>,
}

pub struct WindowEncoder {
    pub wid: u32,
    registry: Arc<CodecRegistry>,
    damage_cancelled: AtomicU64,
    /// Last damage packet sequence put on the wire.
    damage_packet_sequence: AtomicU64,
    delta: Mutex<DeltaState>,
    delta_cfg: DeltaSection,
    mmap: Option<MmapArea>,
    /// Echo encoding options the client can live without.
    client_options: bool,
    integrity_hash: bool,
    stats: SharedWindowStatistics,
    global: SharedGlobalStatistics,
    queue: PacketQueue,
    events: mpsc::UnboundedSender<LoopEvent>,
}

/// Construction inputs of a [`WindowEncoder`].
pub struct EncoderSetup {
    pub registry: Arc<CodecRegistry>,
    pub delta_cfg: DeltaSection,
    /// Client side bucket count.
    pub delta_buckets: usize,
    pub delta_encodings: Vec<Encoding>,
    pub mmap: Option<MmapArea>,
    pub client_options: bool,
    pub integrity_hash: bool,
    pub global: SharedGlobalStatistics,
    pub queue: PacketQueue,
    pub events: mpsc::UnboundedSender<LoopEvent>,
}

impl WindowEncoder {
    pub fn new(wid: u32, stats: SharedWindowStatistics, setup: EncoderSetup) -> Self {
        let buckets = if setup.delta_cfg.enabled {
            setup.delta_buckets.min(setup.delta_cfg.max_buckets)
        } else {
            0
        };
        let encodings = setup
            .delta_encodings
            .into_iter()
            .filter(|e| DELTA_ENCODINGS.contains(e))
            .collect();
        Self {
            wid,
            registry: setup.registry,
            damage_cancelled: AtomicU64::new(0),
            damage_packet_sequence: AtomicU64::new(0),
            delta: Mutex::new(DeltaState {
                buckets: DeltaBuckets::new(buckets, setup.delta_cfg.max_delta_hits),
                encodings,
            }),
            delta_cfg: setup.delta_cfg,
            mmap: setup.mmap,
            client_options: setup.client_options,
            integrity_hash: setup.integrity_hash,
            stats,
            global: setup.global,
            queue: setup.queue,
            events: setup.events,
        }
    }

    // ── Cancellation ─────────────────────────────────────────────

    /// Void every sequence up to `sequence`. The mark never goes down.
    pub fn cancel_up_to(&self, sequence: u64) {
        self.damage_cancelled.fetch_max(sequence, Ordering::SeqCst);
    }

    /// Void everything, for good.
    pub fn cancel_all(&self) {
        self.damage_cancelled.store(u64::MAX, Ordering::SeqCst);
    }

    pub fn damage_cancelled(&self) -> u64 {
        self.damage_cancelled.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self, sequence: u64) -> bool {
        sequence <= self.damage_cancelled()
    }

    pub fn has_mmap(&self) -> bool {
        self.mmap.is_some()
    }

    // ── Delta state ──────────────────────────────────────────────

    pub fn clear_delta(&self) {
        self.delta.lock().buckets.clear();
    }

    pub fn set_delta_encodings(&self, encodings: &[Encoding]) {
        let mut state = self.delta.lock();
        state.encodings = encodings.iter().copied().filter(|e| DELTA_ENCODINGS.contains(e)).collect();
        state.buckets.clear();
    }

    pub fn delta_encodings(&self) -> Vec<Encoding> {
        self.delta.lock().encodings.clone()
    }

    pub fn delta_stored(&self) -> usize {
        self.delta.lock().buckets.stored()
    }

    // ── Worker entry point ───────────────────────────────────────

    /// Encode `job`, queue the packet and report back to the loop.
    pub fn process(&self, job: EncodeJob) {
        let sequence = job.sequence;
        let pixels = job.image.rect.area();
        let outcome = match self.make_data_packet(job) {
            Ok(Some((draw, update, damage_time))) => {
                self.queue_packet(draw, pixels, damage_time);
                EncodeOutcome::Sent(update)
            }
            Ok(None) => EncodeOutcome::Cancelled,
            Err(e) => {
                tracing::error!(wid = self.wid, sequence, error = %e, "encoding failed");
                EncodeOutcome::Failed(e)
            }
        };
        self.stats.lock().encoding_pending.remove(&sequence);
        let _ = self.events.send(LoopEvent::Encoded {
            wid: self.wid,
            sequence,
            outcome,
        });
    }

    /// Build the draw packet for `job`, `None` when it was cancelled.
    pub fn make_data_packet(&self, job: EncodeJob) -> Result<Option<(DrawPacket, SentUpdate, Instant)>, EncodeError> {
        let started = Instant::now();
        let sequence = job.sequence;
        let use_mmap = job.encoding == Encoding::Mmap;
        if self.is_cancelled(sequence) && !use_mmap {
            tracing::trace!(wid = self.wid, sequence, "cancelled before encoding");
            return Ok(None);
        }
        let rect = job.image.rect;

        let (encoded, delta_info) = match self.mmap.as_ref().filter(|_| use_mmap) {
            Some(area) => match area.encode(&job.image, &job.params) {
                Ok((encoded, written)) => {
                    let mut global = self.global.lock();
                    global.mmap_free_size = written.free_size;
                    global.mmap_bytes_sent += encoded.payload.len() as u64;
                    (encoded, None)
                }
                Err(EncodeError::MmapFull { needed, available }) => {
                    tracing::warn!(wid = self.wid, needed, available, fallback = %job.fallback, "mmap area full");
                    if self.is_cancelled(sequence) {
                        return Ok(None);
                    }
                    self.encode_with_delta(job.fallback, &job)?
                }
                Err(e) => return Err(e),
            },
            None if use_mmap => return Err(EncodeError::NoEncoder(Encoding::Mmap)),
            None => self.encode_with_delta(job.encoding, &job)?,
        };

        if self.is_cancelled(sequence) && encoded.encoding != Encoding::Mmap {
            tracing::trace!(wid = self.wid, sequence, "cancelled while encoding");
            return Ok(None);
        }

        let mut options = encoded.client_options.clone();
        if let Some(d) = delta_info {
            options.extend(d);
        }
        if self.client_options {
            if job.flush > 0 {
                options.set("flush", job.flush as i64);
            }
            if !encoded.encoding.has_fixed_quality() && encoded.encoding != Encoding::Mmap {
                options.entry("quality".to_string()).or_insert(i64::from(job.params.quality).into());
                options.entry("speed".to_string()).or_insert(i64::from(job.params.speed).into());
            }
        }
        if self.integrity_hash {
            if let Some(bytes) = encoded.payload.as_bytes() {
                let digest = blake3::hash(bytes).to_hex();
                options.set("z.blake3", &digest.as_str()[..16]);
                options.set("z.len", bytes.len() as i64);
            }
        }

        let quality = options
            .get_int("quality")
            .map_or(job.params.quality, |q| q.clamp(0, 100) as u8);
        let lossy = !encoded.encoding.is_lossless() || options.get_str("csc").is_some_and(|c| c != "RGB");
        let update = SentUpdate {
            rect,
            lossy,
            quality: if lossy { quality } else { 100 },
            speed: job.params.speed,
        };
        self.record_encoding(&encoded, rect.area(), started);
        let packet_sequence = self.damage_packet_sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let draw = DrawPacket {
            wid: self.wid,
            x: rect.x,
            y: rect.y,
            width: encoded.width,
            height: encoded.height,
            encoding: encoded.encoding.as_str().to_string(),
            payload: encoded.payload,
            damage_packet_sequence: packet_sequence,
            row_stride: encoded.stride,
            options,
        };
        tracing::trace!(wid = self.wid, sequence, packet_sequence, encoding = %draw.encoding, bytes = draw.payload.len(), "packet ready");
        Ok(Some((draw, update, job.damage_time)))
    }

    fn encode_with_delta(&self, encoding: Encoding, job: &EncodeJob) -> Result<(EncodedImage, Option<Options>), EncodeError> {
        let image = &job.image;
        let pixels = image.rect.area();
        let key = DeltaKey {
            width: image.width(),
            height: image.height(),
            format: image.format,
            encoding,
            len: image.pixels.len(),
        };
        let mut state = self.delta.lock();
        let eligible = !state.buckets.is_empty()
            && state.encodings.contains(&encoding)
            && self.delta_cfg.min_delta_size < pixels
            && pixels < self.delta_cfg.max_delta_size;
        let slot = if eligible { state.buckets.slot_for(&key) } else { None };
        let Some(slot) = slot else {
            drop(state);
            return Ok((self.registry.encode(encoding, image, &job.params)?, None));
        };

        let reference = slot.delta.and_then(|seq| state.buckets.reference(slot.bucket, seq).map(|r| (seq, r)));
        let (encoded, delta_seq) = match reference {
            Some((seq, reference)) => {
                let mut xored = image.clone();
                xored.set_pixels(delta::xor(&image.pixels, reference));
                (self.registry.encode(encoding, &xored, &job.params)?, Some(seq))
            }
            None => (self.registry.encode(encoding, image, &job.params)?, None),
        };

        let mut options = Options::new();
        if let Some(seq) = delta_seq {
            options.set("delta", seq as i64);
            options.set("bucket", slot.bucket as i64);
        }
        let raw = image.pixels.len();
        if delta_seq.is_some() && encoded.payload.len() * 100 >= raw * DELTA_MAX_RATIO_PCT {
            // not helping: drop the reference
            state.buckets.clear_bucket(slot.bucket);
        } else {
            state.buckets.store(slot, key, job.sequence, image.pixels.clone());
            options.set("store", job.sequence as i64);
            options.set("bucket", slot.bucket as i64);
            drop(state);
            let mut stats = self.stats.lock();
            let totals = stats.encoding_totals.entry("delta".to_string()).or_default();
            totals.0 += 1;
            totals.1 += pixels;
        }
        Ok((encoded, Some(options)))
    }

    fn record_encoding(&self, encoded: &EncodedImage, pixels: u64, started: Instant) {
        let now = Instant::now();
        let mut stats = self.stats.lock();
        let totals = stats
            .encoding_totals
            .entry(encoded.encoding.as_str().to_string())
            .or_default();
        totals.0 += 1;
        totals.1 += pixels;
        stats.encoding_stats.push(EncodingRecord {
            when: now,
            encoding: encoded.encoding,
            pixels,
            bpp: encoded.bpp,
            compressed_size: encoded.payload.len() as u64,
            elapsed: now.saturating_duration_since(started).as_secs_f64(),
        });
    }

    fn queue_packet(&self, draw: DrawPacket, pixels: u64, damage_time: Instant) {
        let sequence = draw.damage_packet_sequence;
        {
            let mut stats = self.stats.lock();
            stats.packet_count += 1;
            let latency = Instant::now().saturating_duration_since(damage_time).as_secs_f64();
            stats.damage_in_latency.push((Instant::now(), pixels, latency));
        }
        let start_stats = Arc::clone(&self.stats);
        let end_stats = Arc::clone(&self.stats);
        let item = QueuedPacket::with_hooks(
            ServerPacket::Draw(draw),
            Box::new(move |when, bytes| start_stats.lock().record_send_start(sequence, when, bytes, pixels)),
            Box::new(move |when, bytes| end_stats.lock().record_send_end(sequence, when, bytes, Some(damage_time))),
        );
        self.queue.push(item, self.wid, pixels);
    }
}

impl std::fmt::Debug for WindowEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowEncoder")
            .field("wid", &self.wid)
            .field("damage_cancelled", &self.damage_cancelled())
            .field("mmap", &self.mmap.is_some())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::pipeline::stats::{GlobalStatistics, WindowStatistics};
    use crate::pixels::PixelFormat;

    fn setup(delta_buckets: usize) -> (WindowEncoder, PacketQueue, mpsc::UnboundedReceiver<LoopEvent>) {
        let global = GlobalStatistics::shared();
        let queue = PacketQueue::new(Arc::clone(&global));
        let (tx, rx) = mpsc::unbounded_channel();
        let encoder = WindowEncoder::new(
            1,
            WindowStatistics::shared(),
            EncoderSetup {
                registry: Arc::new(CodecRegistry::with_defaults()),
                delta_cfg: DeltaSection::default(),
                delta_buckets,
                delta_encodings: vec![Encoding::Rgb32, Encoding::Jpeg],
                mmap: None,
                client_options: true,
                integrity_hash: true,
                global,
                queue: queue.clone(),
                events: tx,
            },
        );
        (encoder, queue, rx)
    }

    fn job(sequence: u64, w: u32, h: u32, value: u8) -> EncodeJob {
        let rect = Rect::full(w, h);
        EncodeJob {
            sequence,
            image: ImageWrapper::new(rect, w * 4, PixelFormat::Bgrx, vec![value; (w * h * 4) as usize]),
            encoding: Encoding::Rgb32,
            fallback: Encoding::Rgb32,
            params: EncodeParams {
                rgb_zlib: false,
                ..Default::default()
            },
            flush: 0,
            damage_time: Instant::now(),
        }
    }

    #[test]
    fn cancelled_sequence_produces_nothing() {
        let (encoder, queue, mut rx) = setup(0);
        encoder.cancel_up_to(5);
        encoder.cancel_up_to(2);
        assert_eq!(encoder.damage_cancelled(), 5);
        encoder.process(job(5, 4, 4, 0));
        assert!(queue.is_empty());
        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            LoopEvent::Encoded {
                sequence: 5,
                outcome: EncodeOutcome::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn packet_sequence_counts_emitted_packets_only() {
        let (encoder, queue, _rx) = setup(0);
        encoder.process(job(1, 4, 4, 0));
        encoder.cancel_up_to(2);
        encoder.process(job(2, 4, 4, 0));
        encoder.process(job(3, 4, 4, 0));
        let mut sequences = Vec::new();
        while let Some(item) = queue.try_pop() {
            if let ServerPacket::Draw(draw) = item.packet {
                sequences.push(draw.damage_packet_sequence);
            }
        }
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn packet_carries_hash_and_hooks() {
        let (encoder, queue, mut rx) = setup(0);
        encoder.process(job(1, 4, 4, 7));
        let item = queue.try_pop().unwrap();
        let ServerPacket::Draw(draw) = &item.packet else {
            panic!("not a draw packet");
        };
        assert_eq!(draw.encoding, "rgb32");
        assert_eq!(draw.options.get_int("z.len"), Some(64));
        assert_eq!(draw.options.get_str("z.blake3").map(str::len), Some(16));
        assert!(item.start_send.is_some() && item.end_send.is_some());
        match rx.try_recv().unwrap() {
            LoopEvent::Encoded {
                outcome: EncodeOutcome::Sent(update),
                ..
            } => assert!(!update.lossy),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn second_frame_is_sent_as_delta() {
        let (encoder, queue, _rx) = setup(5);
        // 2048 pixels, inside the delta size window
        encoder.process(job(1, 64, 32, 3));
        encoder.process(job(2, 64, 32, 3));
        let pop = || match queue.try_pop().map(|i| i.packet) {
            Some(ServerPacket::Draw(d)) => d,
            other => panic!("unexpected {other:?}"),
        };
        let first = pop();
        let second = pop();
        assert_eq!(first.options.get_int("store"), Some(1));
        assert_eq!(first.options.get_int("delta"), None);
        assert_eq!(second.options.get_int("delta"), Some(1));
        // identical frames xor to zero
        assert!(second.payload.as_bytes().unwrap().iter().all(|b| *b == 0));
        // an all-zero delta is tiny once compressed; raw here so the bucket is dropped
        assert_eq!(encoder.delta_stored(), 0);
    }

    #[test]
    fn missing_encoder_is_a_failure() {
        let (encoder, queue, mut rx) = setup(0);
        let mut j = job(1, 4, 4, 0);
        j.encoding = Encoding::H264;
        encoder.process(j);
        assert!(queue.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            LoopEvent::Encoded {
                outcome: EncodeOutcome::Failed(EncodeError::NoEncoder(Encoding::H264)),
                ..
            }
        ));
    }
}
