//! # winstream-core
//!
//! Per window damage-to-wire encoding pipeline for remote window streaming.
//!
//! This crate contains:
//! - **Geometry and pixels**: `Rect`, `ImageWrapper`, `PixelFormat`
//! - **Window model**: the `WindowModel` trait the window system implements
//! - **Negotiation**: `ClientCapabilities` and the tunables in `PipelineConfig`
//! - **Wire**: `ServerPacket` / `ClientPacket` and the length-prefixed `WireCodec`
//! - **Codecs**: `CodecRegistry` with rgb, png, jpeg and the mmap ring
//! - **Pipeline**: damage batching, encoding selection, the encode worker,
//!   the packet queue, quality/speed estimation and auto-refresh
//! - **Network**: writer and reader tasks of a served connection
//! - **Error**: `StreamError` and `EncodeError`, typed, `thiserror`-based

pub mod caps;
pub mod codec;
pub mod config;
pub mod error;
pub mod flags;
pub mod geometry;
pub mod network;
pub mod pipeline;
pub mod pixels;
pub mod window;
pub mod wire;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use caps::ClientCapabilities;
pub use codec::{CodecRegistry, EncodeParams, EncodedImage, Encoder, Encoding, MmapArea};
pub use config::PipelineConfig;
pub use error::{EncodeError, StreamError};
pub use flags::WindowFlags;
pub use geometry::Rect;
pub use network::Connection;
pub use pipeline::{
    ConnectionSource, DamageOptions, EncodeWorker, GlobalStatistics, PacketQueue, WindowEvent, WindowSource,
};
pub use pixels::{ImageWrapper, PixelFormat};
pub use window::{MemoryWindow, WindowModel, WindowProperty};
pub use wire::{
    ClientCodec, ClientPacket, DamageAck, DrawPacket, MAX_FRAME_SIZE, Payload, PropertyUpdate, ServerCodec, ServerHello, ServerPacket,
};
