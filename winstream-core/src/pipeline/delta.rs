//! XOR delta against previously sent frames.
//!
//! A window keeps a few buckets with the raw pixels of frames it sent,
//! keyed by everything that must match for the client to apply a delta:
//! geometry, pixel layout, encoding and buffer size. A new frame that
//! matches a bucket is sent as the byte-wise XOR against it, with the
//! `delta` option naming the sequence the client stored it under.

use crate::codec::Encoding;
use crate::pixels::PixelFormat;

/// What two frames must share for one to be a delta of the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeltaKey {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub encoding: Encoding,
    pub len: usize,
}

#[derive(Debug, Clone)]
struct Bucket {
    key: DeltaKey,
    sequence: u64,
    pixels: Vec<u8>,
    hits: u32,
    last_used: u64,
}

/// Where a frame goes and what it is a delta of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaSlot {
    pub bucket: usize,
    /// Sequence of the reference frame, `None` to send the frame whole.
    pub delta: Option<u64>,
    /// Times the reference has been used so far.
    pub hits: u32,
}

// ── DeltaBuckets ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct DeltaBuckets {
    buckets: Vec<Option<Bucket>>,
    max_hits: u32,
    clock: u64,
}

impl DeltaBuckets {
    pub fn new(count: usize, max_hits: u32) -> Self {
        Self {
            buckets: vec![None; count],
            max_hits,
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Frames currently stored.
    pub fn stored(&self) -> usize {
        self.buckets.iter().flatten().count()
    }

    /// Pick the bucket for a frame with `key`.
    ///
    /// A matching bucket is used for a delta unless it was used too
    /// often, in which case it is emptied and reused. Otherwise the
    /// first empty bucket, or the least recently used one, is picked.
    pub fn slot_for(&mut self, key: &DeltaKey) -> Option<DeltaSlot> {
        if self.buckets.is_empty() {
            return None;
        }
        let matching = self
            .buckets
            .iter()
            .position(|b| b.as_ref().is_some_and(|b| b.key == *key));
        if let Some(i) = matching {
            if let Some(b) = &self.buckets[i] {
                if b.hits < self.max_hits {
                    return Some(DeltaSlot {
                        bucket: i,
                        delta: Some(b.sequence),
                        hits: b.hits,
                    });
                }
            }
            tracing::trace!(bucket = i, "delta bucket used too often, clearing");
            self.buckets[i] = None;
            return Some(DeltaSlot {
                bucket: i,
                delta: None,
                hits: 0,
            });
        }
        let bucket = self
            .buckets
            .iter()
            .position(Option::is_none)
            .or_else(|| {
                self.buckets
                    .iter()
                    .enumerate()
                    .filter_map(|(i, b)| b.as_ref().map(|b| (i, b.last_used)))
                    .min_by_key(|&(_, used)| used)
                    .map(|(i, _)| i)
            })
            .unwrap_or(0);
        Some(DeltaSlot {
            bucket,
            delta: None,
            hits: 0,
        })
    }

    /// The raw pixels stored in `bucket`, if they were stored under `sequence`.
    pub fn reference(&self, bucket: usize, sequence: u64) -> Option<&[u8]> {
        self.buckets
            .get(bucket)?
            .as_ref()
            .filter(|b| b.sequence == sequence)
            .map(|b| b.pixels.as_slice())
    }

    /// Keep `pixels` in `slot` as the reference for later deltas.
    pub fn store(&mut self, slot: DeltaSlot, key: DeltaKey, sequence: u64, pixels: Vec<u8>) {
        let Some(entry) = self.buckets.get_mut(slot.bucket) else {
            return;
        };
        self.clock += 1;
        *entry = Some(Bucket {
            key,
            sequence,
            pixels,
            hits: slot.hits + u32::from(slot.delta.is_some()),
            last_used: self.clock,
        });
    }

    pub fn clear_bucket(&mut self, bucket: usize) {
        if let Some(entry) = self.buckets.get_mut(bucket) {
            *entry = None;
        }
    }

    pub fn clear(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = None);
    }
}

/// Byte-wise XOR of `current` against `reference`.
///
/// Both buffers have the same length when they come from the same
/// [`DeltaKey`]; extra bytes of `current` are copied unchanged.
pub fn xor(current: &[u8], reference: &[u8]) -> Vec<u8> {
    let mut out = current.to_vec();
    out.iter_mut().zip(reference).for_each(|(c, r)| *c ^= r);
    out
}

// ── Tests ────────────────────────────────────────────────────────
