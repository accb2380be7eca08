//! # winstream-server: synthetic window streaming server
//!
//! Accepts TCP clients, reads their capabilities and streams an
//! animated test pattern window through the `winstream-core`
//! pipeline. Useful for exercising clients and for tuning the
//! batching and encoding parameters in the config file.

pub mod config;
pub mod pattern;
pub mod service;
