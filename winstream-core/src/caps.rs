//! Client capabilities, sent once in the hello packet.
//!
//! Everything is `#[serde(default)]` so that older or minimal clients
//! only need to send what they care about. Encoding names the server
//! does not know are ignored rather than rejected.

use serde::{Deserialize, Serialize};

use crate::codec::Encoding;
use crate::pixels::PixelFormat;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientCapabilities {
    /// Every encoding the client can decode, by wire name.
    pub encodings: Vec<String>,
    /// Encodings usable for window pixels. Empty means `encodings`.
    pub core_encodings: Vec<String>,
    /// Preferred primary encoding (`None` or `"auto"` lets the server pick).
    pub encoding: Option<String>,
    /// Pixel layouts accepted for rgb and delta encodings.
    pub rgb_formats: Vec<String>,
    /// Encodings for which the client keeps delta buckets.
    pub supports_delta: Vec<String>,
    pub delta_buckets: u32,
    /// The client can paint alpha channels.
    pub transparency: bool,
    /// The client always wants whole-window updates.
    pub full_frames_only: bool,
    /// Lossless encodings usable for auto-refresh, in preference order.
    pub auto_refresh_encodings: Vec<String>,
    /// Overrides the configured auto-refresh delay (ms). Zero disables it.
    pub auto_refresh_delay: Option<u32>,
    /// Bytes per second, `0` means unlimited.
    pub bandwidth_limit: u64,
    pub bandwidth_detection: bool,
    pub quality: Option<u8>,
    pub min_quality: Option<u8>,
    pub max_quality: Option<u8>,
    pub speed: Option<u8>,
    pub min_speed: Option<u8>,
    pub max_speed: Option<u8>,
    /// Echo encoder options back in draw packets.
    pub client_options: bool,
    /// Honour the `flush` option on multi-region updates.
    pub flush: bool,
    pub rgb_zlib: bool,
    pub rgb_zstd: bool,
    pub rgb_lz4: bool,
    /// Display refresh rate in Hz, used to derive the minimum batch delay.
    pub vrefresh: i32,
    pub batch_always: Option<bool>,
    pub batch_min_delay: Option<u32>,
    pub batch_max_delay: Option<u32>,
    pub batch_delay: Option<u32>,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            encodings: Vec::new(),
            core_encodings: Vec::new(),
            encoding: None,
            rgb_formats: vec!["RGB".into()],
            supports_delta: Vec::new(),
            delta_buckets: 1,
            transparency: false,
            full_frames_only: false,
            auto_refresh_encodings: Vec::new(),
            auto_refresh_delay: None,
            bandwidth_limit: 0,
            bandwidth_detection: true,
            quality: None,
            min_quality: None,
            max_quality: None,
            speed: None,
            min_speed: None,
            max_speed: None,
            client_options: true,
            flush: false,
            rgb_zlib: true,
            rgb_zstd: false,
            rgb_lz4: false,
            vrefresh: -1,
            batch_always: None,
            batch_min_delay: None,
            batch_max_delay: None,
            batch_delay: None,
        }
    }
}

pub(crate) fn parse_encodings(names: &[String]) -> Vec<Encoding> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        match Encoding::from_name(name) {
            Some(e) if !out.contains(&e) => out.push(e),
            Some(_) => {}
            None => tracing::debug!(encoding = %name, "ignoring unknown client encoding"),
        }
    }
    out
}

impl ClientCapabilities {
    /// Core encodings, falling back to `encodings` when unset.
    pub fn core_encodings(&self) -> Vec<Encoding> {
        if self.core_encodings.is_empty() {
            parse_encodings(&self.encodings)
        } else {
            parse_encodings(&self.core_encodings)
        }
    }

    pub fn rgb_formats(&self) -> Vec<PixelFormat> {
        self.rgb_formats
            .iter()
            .filter_map(|f| PixelFormat::from_name(f))
            .collect()
    }

    /// Encodings with delta support, empty when no buckets are offered.
    pub fn delta_encodings(&self) -> Vec<Encoding> {
        if self.delta_buckets == 0 {
            return Vec::new();
        }
        parse_encodings(&self.supports_delta)
    }

    pub fn auto_refresh_encodings(&self) -> Vec<Encoding> {
        parse_encodings(&self.auto_refresh_encodings)
    }

    /// Requested primary encoding. `rgb24` is an alias for `rgb`.
    pub fn preferred_encoding(&self) -> Option<Encoding> {
        match self.encoding.as_deref() {
            None | Some("auto") => None,
            Some("rgb24") => Some(Encoding::Rgb),
            Some(name) => Encoding::from_name(name),
        }
    }

    /// Minimum batch delay implied by the display refresh rate.
    pub fn vrefresh_min_delay(&self) -> Option<u32> {
        (self.vrefresh > 0).then(|| 1000 / self.vrefresh as u32)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_encodings_are_ignored() {
        let caps = ClientCapabilities {
            encodings: vec!["png".into(), "avif".into(), "rgb32".into(), "png".into()],
            ..Default::default()
        };
        assert_eq!(caps.core_encodings(), vec![Encoding::Png, Encoding::Rgb32]);
    }

    #[test]
    fn core_encodings_override_encodings() {
        let caps = ClientCapabilities {
            encodings: vec!["png".into(), "jpeg".into()],
            core_encodings: vec!["jpeg".into()],
            ..Default::default()
        };
        assert_eq!(caps.core_encodings(), vec![Encoding::Jpeg]);
    }

    #[test]
    fn no_buckets_means_no_delta() {
        let caps = ClientCapabilities {
            supports_delta: vec!["png".into()],
            delta_buckets: 0,
            ..Default::default()
        };
        assert!(caps.delta_encodings().is_empty());
    }

    #[test]
    fn rgb24_preference_aliases_rgb() {
        let caps = ClientCapabilities {
            encoding: Some("rgb24".into()),
            ..Default::default()
        };
        assert_eq!(caps.preferred_encoding(), Some(Encoding::Rgb));
        let auto = ClientCapabilities {
            encoding: Some("auto".into()),
            ..Default::default()
        };
        assert_eq!(auto.preferred_encoding(), None);
    }

    #[test]
    fn minimal_hello_deserializes_with_defaults() {
        let caps: ClientCapabilities = serde_json::from_str(r#"{"encodings":["png"]}"#).unwrap();
        assert!(caps.bandwidth_detection);
        assert_eq!(caps.rgb_formats(), vec![PixelFormat::Rgb]);
    }
}
