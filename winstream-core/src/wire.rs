//! Wire packets and the length-prefixed bincode codec.
//!
//! Every frame on the socket is a big-endian `u32` length followed by a
//! bincode body. [`WireCodec`] plugs into `tokio_util::codec::Framed`.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::caps::ClientCapabilities;
use crate::error::StreamError;
use crate::flags::WindowFlags;

/// Upper bound for one frame body.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

// ── Options ──────────────────────────────────────────────────────

/// One value of an encoder options map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Pair(i64, i64),
}

impl OptionValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(v) => Some(*v),
            OptionValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            OptionValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

macro_rules! option_value_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for OptionValue {
            fn from(v: $t) -> Self {
                OptionValue::Int(v as i64)
            }
        })*
    };
}

option_value_from_int!(i32, i64, u8, u32, u64, usize);

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Str(v)
    }
}

impl From<(u32, u32)> for OptionValue {
    fn from((a, b): (u32, u32)) -> Self {
        OptionValue::Pair(i64::from(a), i64::from(b))
    }
}

/// Encoder options map (`quality`, `speed`, `rgb_format`, `delta`, ...).
pub type Options = BTreeMap<String, OptionValue>;

/// Typed lookups on an [`Options`] map.
pub trait OptionsExt {
    fn get_int(&self, key: &str) -> Option<i64>;
    fn get_bool(&self, key: &str) -> bool;
    fn get_str(&self, key: &str) -> Option<&str>;
    fn set(&mut self, key: &str, value: impl Into<OptionValue>);
}

impl OptionsExt for Options {
    fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(OptionValue::as_int)
    }

    fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(OptionValue::as_bool).unwrap_or(false)
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(OptionValue::as_str)
    }

    fn set(&mut self, key: &str, value: impl Into<OptionValue>) {
        self.insert(key.to_string(), value.into());
    }
}

// ── Payload ──────────────────────────────────────────────────────

/// Pixel data carried by a draw packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Uncompressed pixels (the transport may compress them).
    Raw(Bytes),
    /// Already compressed by the encoder; must not be recompressed.
    Compressed(Bytes),
    /// `(offset, length)` chunks inside the shared memory area.
    Mmap(Vec<(u32, u32)>),
}

impl Payload {
    /// Bytes this payload occupies, inline or in the mmap area.
    pub fn len(&self) -> usize {
        match self {
            Payload::Raw(b) | Payload::Compressed(b) => b.len(),
            Payload::Mmap(chunks) => chunks.iter().map(|&(_, l)| l as usize).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inline bytes, `None` for mmap references.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Raw(b) | Payload::Compressed(b) => Some(b),
            Payload::Mmap(_) => None,
        }
    }
}

// ── Packets ──────────────────────────────────────────────────────

/// `["draw", wid, x, y, w, h, encoding, payload, seq, stride, options]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawPacket {
    pub wid: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Wire name of the encoding (`"png"`, `"rgb24"`, ...).
    pub encoding: String,
    pub payload: Payload,
    /// Per-window ack correlation counter.
    pub damage_packet_sequence: u64,
    pub row_stride: u32,
    pub options: Options,
}

impl DrawPacket {
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Client acknowledgement of one draw packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DamageAck {
    pub damage_packet_sequence: u64,
    pub wid: u32,
    pub width: u32,
    pub height: u32,
    /// Client decode time in microseconds. Zero or negative means failure.
    pub decode_time: i64,
    pub message: String,
}

/// Server hello: what the server ended up using.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerHello {
    pub version: String,
    pub encodings: Vec<String>,
    pub encoding: String,
    pub auto_refresh_encodings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerPacket {
    Hello(ServerHello),
    NewWindow {
        wid: u32,
        width: u32,
        height: u32,
        flags: WindowFlags,
    },
    Draw(DrawPacket),
    LostWindow {
        wid: u32,
    },
    /// Rate-limited congestion advisory.
    BandwidthWarning {
        send_speed: u64,
        bandwidth_limit: u64,
    },
}

impl ServerPacket {
    /// Pixel packets go on the bulk lane, everything else on the ordinary lane.
    pub fn is_bulk(&self) -> bool {
        matches!(self, ServerPacket::Draw(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientPacket {
    Hello(ClientCapabilities),
    DamageAck(DamageAck),
    /// Request a full quality refresh of one window.
    Refresh { wid: u32 },
    SetEncoding { encoding: String, strict: bool },
    Focus { wid: Option<u32> },
    Suspend,
    Resume,
    /// Accept the congestion advisory and halve the bandwidth cap.
    LowerBandwidth,
    /// Fixed quality for every window, `0` for automatic.
    Quality { quality: Option<u8>, min_quality: Option<u8> },
    /// Fixed speed for every window, `0` for automatic.
    Speed { speed: Option<u8>, min_speed: Option<u8> },
    /// Renegotiate the client properties of one window.
    ClientProperties { wid: u32, properties: PropertyUpdate },
}

/// Window properties a client changes after the hello.
/// `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub encodings: Option<Vec<String>>,
    pub auto_refresh_encodings: Option<Vec<String>>,
    pub supports_delta: Option<Vec<String>>,
    pub rgb_formats: Option<Vec<String>>,
    pub transparency: Option<bool>,
    pub full_frames_only: Option<bool>,
    pub maximized: Option<bool>,
}

// ── WireCodec ────────────────────────────────────────────────────

/// Length-prefixed bincode codec, decoding `I` and encoding `O`.
pub struct WireCodec<I, O> {
    max_frame: usize,
    _marker: PhantomData<fn() -> (I, O)>,
}

impl<I, O> WireCodec<I, O> {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            max_frame,
            _marker: PhantomData,
        }
    }
}

impl<I, O> Default for WireCodec<I, O> {
    fn default() -> Self {
        Self::new()
    }
}

/// Codec used by the server side of a connection.
pub type ServerCodec = WireCodec<ClientPacket, ServerPacket>;
/// Codec used by a client (tests, viewers).
pub type ClientCodec = WireCodec<ServerPacket, ClientPacket>;

/// Bytes a packet takes on the wire, prefix included.
pub fn frame_size<T: Serialize>(item: &T) -> Result<u64, StreamError> {
    Ok(bincode::serialized_size(item)? + LENGTH_PREFIX as u64)
}

impl<I: DeserializeOwned, O> tokio_util::codec::Decoder for WireCodec<I, O> {
    type Item = I;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame {
            return Err(StreamError::FrameTooLarge {
                size: len,
                max: self.max_frame,
            });
        }
        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX);
        let body = src.split_to(len);
        let item = bincode::deserialize(&body)?;
        Ok(Some(item))
    }
}

impl<I, O: Serialize> tokio_util::codec::Encoder<O> for WireCodec<I, O> {
    type Error = StreamError;

    fn encode(&mut self, item: O, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = bincode::serialize(&item)?;
        if body.len() > self.max_frame {
            return Err(StreamError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame,
            });
        }
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::codec::{Decoder, Encoder};

    fn sample_draw() -> DrawPacket {
        let mut options = Options::new();
        options.set("rgb_format", "BGRX");
        options.set("store", 3u64);
        DrawPacket {
            wid: 1,
            x: 0,
            y: 0,
            width: 2,
            height: 1,
            encoding: "rgb32".into(),
            payload: Payload::Raw(Bytes::from_static(&[0; 8])),
            damage_packet_sequence: 7,
            row_stride: 8,
            options,
        }
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut enc = ClientCodec::new();
        let mut buf = BytesMut::new();
        enc.encode(ClientPacket::Suspend, &mut buf).unwrap();
        let full = buf.clone();

        let mut dec = ServerCodec::new();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(dec.decode(&mut partial).unwrap().is_none());

        let mut whole = full;
        assert_eq!(dec.decode(&mut whole).unwrap(), Some(ClientPacket::Suspend));
        assert!(whole.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut dec = ServerCodec::with_max_frame(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.extend_from_slice(&[0; 32]);
        assert!(matches!(
            dec.decode(&mut buf),
            Err(StreamError::FrameTooLarge { size: 1024, max: 16 })
        ));
    }

    #[test]
    fn frame_size_matches_encoded_length() {
        let pkt = ServerPacket::Draw(sample_draw());
        let expected = frame_size(&pkt).unwrap();
        let mut enc = ServerCodec::new();
        let mut buf = BytesMut::new();
        enc.encode(pkt, &mut buf).unwrap();
        assert_eq!(buf.len() as u64, expected);
    }

    #[test]
    fn options_typed_access() {
        let pkt = sample_draw();
        assert_eq!(pkt.options.get_str("rgb_format"), Some("BGRX"));
        assert_eq!(pkt.options.get_int("store"), Some(3));
        assert!(!pkt.options.get_bool("delta"));
    }

    #[test]
    fn mmap_payload_len_sums_chunks() {
        let p = Payload::Mmap(vec![(8, 100), (8, 28)]);
        assert_eq!(p.len(), 128);
        assert!(p.as_bytes().is_none());
    }
}
