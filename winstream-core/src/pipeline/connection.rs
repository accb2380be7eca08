//! One client connection: every window source, the shared encode worker,
//! the timer queue and the connection level policies.
//!
//! [`ConnectionSource::run`] is the event loop. It is the only task that
//! touches window state; the encode worker reports back through
//! [`LoopEvent`]s and the network tasks through the client channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::caps::ClientCapabilities;
use crate::codec::mmap::MmapArea;
use crate::codec::{CodecRegistry, Encoding};
use crate::config::PipelineConfig;
use crate::error::StreamError;
use crate::geometry::Rect;
use crate::pipeline::damage::DamageOptions;
use crate::pipeline::encoder::{EncoderSetup, LoopEvent};
use crate::pipeline::estimator::{self, CongestionTracker};
use crate::pipeline::queue::PacketQueue;
use crate::pipeline::selector::EncodingSelector;
use crate::pipeline::stats::SharedGlobalStatistics;
use crate::pipeline::window_source::{ClientProperties, ClientSettings, Context, Timers, WindowSource};
use crate::pipeline::worker::EncodeWorker;
use crate::window::{WindowModel, WindowProperty};
use crate::wire::{ClientPacket, ServerHello, ServerPacket};

/// How often the loop looks for windows due a recalculation.
const RECALCULATE_TICK: Duration = Duration::from_millis(250);

/// What the window system reports to a connection.
pub enum WindowEvent {
    Map { wid: u32, window: Arc<dyn WindowModel> },
    Damage { wid: u32, rect: Rect, options: DamageOptions },
    Property { wid: u32, property: WindowProperty },
    Unmap { wid: u32 },
    Remove { wid: u32 },
}

impl std::fmt::Debug for WindowEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Map { wid, .. } => write!(f, "Map({wid})"),
            Self::Damage { wid, rect, .. } => write!(f, "Damage({wid}, {rect})"),
            Self::Property { wid, property } => write!(f, "Property({wid}, {property:?})"),
            Self::Unmap { wid } => write!(f, "Unmap({wid})"),
            Self::Remove { wid } => write!(f, "Remove({wid})"),
        }
    }
}

pub struct ConnectionSource {
    ctx: Context,
    settings: ClientSettings,
    registry: Arc<CodecRegistry>,
    queue: PacketQueue,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    windows: BTreeMap<u32, WindowSource>,
    congestion: CongestionTracker,
    /// Explicit cap from the client or configuration, `0` for none.
    bandwidth_limit: u64,
    mmap: Option<MmapArea>,
    integrity_hash: bool,
    suspended: bool,
    hello: ServerHello,
}

impl ConnectionSource {
    /// Negotiate with a client.
    ///
    /// Fails with [`StreamError::NoCommonEncodings`] when nothing the
    /// client decodes can be produced here.
    pub fn new(
        cfg: Arc<PipelineConfig>,
        caps: &ClientCapabilities,
        registry: Arc<CodecRegistry>,
        queue: PacketQueue,
        global: SharedGlobalStatistics,
    ) -> Result<Self, StreamError> {
        let settings = ClientSettings::from_caps(caps, &cfg);
        let selector = EncodingSelector::new(
            &registry,
            &settings.core_encodings,
            &settings.refresh_encodings,
            settings.encoding,
            settings.strict,
            cfg.encoding.max_pixels_prefer_rgb,
        )?;
        let hello = ServerHello {
            version: env!("CARGO_PKG_VERSION").to_string(),
            encodings: selector.common.iter().map(|e| e.as_str().to_string()).collect(),
            encoding: selector.encoding.as_str().to_string(),
            auto_refresh_encodings: selector.auto_refresh.iter().map(|e| e.as_str().to_string()).collect(),
        };
        let explicit = match (caps.bandwidth_limit, cfg.congestion.bandwidth_limit) {
            (0, server) => server,
            (client, 0) => client,
            (client, server) => client.min(server),
        };
        let detection = caps.bandwidth_detection && cfg.congestion.bandwidth_detection;
        let worker = EncodeWorker::spawn("encode", Arc::clone(&global))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tracing::info!(
            encoding = %hello.encoding,
            encodings = ?hello.encodings,
            bandwidth_limit = explicit,
            "connection negotiated"
        );
        Ok(Self {
            congestion: CongestionTracker::new(cfg.congestion.clone(), detection),
            integrity_hash: cfg.encoding.integrity_hash,
            ctx: Context {
                cfg,
                timers: Timers::new(),
                worker,
                global,
                delay_per_megapixel: None,
            },
            settings,
            registry,
            queue,
            events_tx,
            events_rx,
            windows: BTreeMap::new(),
            bandwidth_limit: explicit,
            mmap: None,
            suspended: false,
            hello,
        })
    }

    /// Write pixels through a shared memory ring instead of the socket.
    pub fn with_mmap(mut self, area: MmapArea) -> Self {
        let mut global = self.ctx.global.lock();
        global.mmap_size = area.size();
        global.mmap_free_size = area.size();
        drop(global);
        self.mmap = Some(area);
        self
    }

    pub fn hello(&self) -> &ServerHello {
        &self.hello
    }

    pub fn send_hello(&self) {
        self.queue.send(ServerPacket::Hello(self.hello.clone()));
    }

    pub fn window(&self, wid: u32) -> Option<&WindowSource> {
        self.windows.get(&wid)
    }

    pub fn window_mut(&mut self, wid: u32) -> Option<&mut WindowSource> {
        self.windows.get_mut(&wid)
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    pub fn global(&self) -> &SharedGlobalStatistics {
        &self.ctx.global
    }

    pub fn bandwidth_limit(&self) -> u64 {
        self.bandwidth_limit
    }

    pub fn delay_per_megapixel(&self) -> Option<f64> {
        self.ctx.delay_per_megapixel
    }

    // ── Windows ──────────────────────────────────────────────────

    pub fn add_window(&mut self, wid: u32, window: Arc<dyn WindowModel>, now: Instant) -> Result<(), StreamError> {
        if self.windows.contains_key(&wid) {
            self.remove_window(wid, now);
        }
        let setup = EncoderSetup {
            registry: Arc::clone(&self.registry),
            delta_cfg: self.ctx.cfg.delta.clone(),
            delta_buckets: self.settings.delta_buckets,
            delta_encodings: self.settings.delta_encodings.clone(),
            mmap: self.mmap.clone(),
            client_options: self.settings.client_options,
            integrity_hash: self.integrity_hash,
            global: Arc::clone(&self.ctx.global),
            queue: self.queue.clone(),
            events: self.events_tx.clone(),
        };
        let (width, height) = window.dimensions();
        let flags = window.flags();
        let source = WindowSource::new(wid, window, self.settings.clone(), setup, &self.ctx)?;
        self.queue.send(ServerPacket::NewWindow {
            wid,
            width,
            height,
            flags,
        });
        self.windows.insert(wid, source);
        self.update_bandwidth_limits(now);
        Ok(())
    }

    /// Drop a window. Nothing is sent for it afterwards.
    pub fn remove_window(&mut self, wid: u32, now: Instant) {
        let Some(mut source) = self.windows.remove(&wid) else {
            return;
        };
        source.cleanup(&mut self.ctx);
        self.queue.send(ServerPacket::LostWindow { wid });
        tracing::debug!(wid, "window removed");
        self.update_bandwidth_limits(now);
    }

    pub fn damage(&mut self, wid: u32, rect: Rect, options: DamageOptions, now: Instant) {
        if self.suspended {
            return;
        }
        match self.windows.get_mut(&wid) {
            Some(source) => source.damage(&mut self.ctx, rect, options, now),
            None => tracing::trace!(wid, "damage for unknown window"),
        }
    }

    pub fn handle_window_event(&mut self, event: WindowEvent, now: Instant) -> Result<(), StreamError> {
        match event {
            WindowEvent::Map { wid, window } => self.add_window(wid, window, now)?,
            WindowEvent::Damage { wid, rect, options } => self.damage(wid, rect, options, now),
            WindowEvent::Property { wid, property } => {
                let source = self.windows.get_mut(&wid).ok_or(StreamError::UnknownWindow(wid))?;
                source.set_property(&mut self.ctx, property, now);
            }
            WindowEvent::Unmap { wid } => {
                let source = self.windows.get_mut(&wid).ok_or(StreamError::UnknownWindow(wid))?;
                source.unmap(&mut self.ctx);
            }
            WindowEvent::Remove { wid } => self.remove_window(wid, now),
        }
        Ok(())
    }

    // ── Client packets ───────────────────────────────────────────

    pub fn handle_client_packet(&mut self, packet: ClientPacket, now: Instant) -> Result<(), StreamError> {
        match packet {
            ClientPacket::Hello(_) => {
                return Err(StreamError::ProtocolViolation("hello after negotiation"));
            }
            ClientPacket::DamageAck(ack) => {
                let Some(source) = self.windows.get_mut(&ack.wid) else {
                    tracing::trace!(wid = ack.wid, "ack for unknown window");
                    return Ok(());
                };
                let congested = source.damage_packet_acked(&mut self.ctx, &ack, now);
                if let Some((late_pct, send_speed)) = congested {
                    let warn = self
                        .congestion
                        .record(&mut self.ctx.global.lock(), late_pct, send_speed, now);
                    if warn {
                        self.queue.send(ServerPacket::BandwidthWarning {
                            send_speed: send_speed as u64,
                            bandwidth_limit: self.bandwidth_limit,
                        });
                    }
                }
                self.recalculate_due(now);
            }
            ClientPacket::Refresh { wid } => {
                if let Some(source) = self.windows.get_mut(&wid) {
                    source.full_quality_refresh(&mut self.ctx, now);
                }
            }
            ClientPacket::SetEncoding { encoding, strict } => {
                let encoding = match encoding.as_str() {
                    "auto" => None,
                    name => match Encoding::from_name(name) {
                        Some(e) => Some(e),
                        None => {
                            tracing::warn!(encoding = %name, "client asked for an unknown encoding");
                            return Ok(());
                        }
                    },
                };
                self.settings.encoding = encoding;
                self.settings.strict = strict;
                for source in self.windows.values_mut() {
                    source.set_new_encoding(encoding, strict)?;
                }
            }
            ClientPacket::Focus { wid } => {
                for (id, source) in &mut self.windows {
                    source.set_focus(Some(*id) == wid);
                }
            }
            ClientPacket::Suspend => self.suspend(),
            ClientPacket::Resume => self.resume(now),
            ClientPacket::LowerBandwidth => {
                let detected = self.ctx.global.lock().avg_congestion_send_speed;
                let min_bw = self.ctx.cfg.congestion.min_bandwidth;
                self.bandwidth_limit = estimator::lower_bandwidth(self.bandwidth_limit, detected, min_bw);
                tracing::info!(bandwidth_limit = self.bandwidth_limit, "bandwidth cap lowered");
                self.update_bandwidth_limits(now);
            }
            ClientPacket::Quality { quality, min_quality } => {
                for source in self.windows.values_mut() {
                    if let Some(q) = quality {
                        source.set_quality(q);
                    }
                    if let Some(q) = min_quality {
                        source.set_min_quality(q);
                    }
                }
            }
            ClientPacket::Speed { speed, min_speed } => {
                for source in self.windows.values_mut() {
                    if let Some(s) = speed {
                        source.set_speed(s);
                    }
                    if let Some(s) = min_speed {
                        source.set_min_speed(s);
                    }
                }
            }
            ClientPacket::ClientProperties { wid, properties } => {
                let Some(source) = self.windows.get_mut(&wid) else {
                    tracing::debug!(wid, "properties for unknown window");
                    return Ok(());
                };
                source.set_client_properties(ClientProperties::from_update(&properties))?;
            }
        }
        Ok(())
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
        for source in self.windows.values_mut() {
            source.suspend(&mut self.ctx);
        }
        tracing::debug!("connection suspended");
    }

    pub fn resume(&mut self, now: Instant) {
        self.suspended = false;
        for source in self.windows.values_mut() {
            source.resume(&mut self.ctx, now);
        }
        tracing::debug!("connection resumed");
    }

    // ── Loop plumbing ────────────────────────────────────────────

    pub fn on_loop_event(&mut self, event: LoopEvent, now: Instant) {
        match event {
            LoopEvent::Encoded { wid, sequence, outcome } => {
                if let Some(source) = self.windows.get_mut(&wid) {
                    source.on_encoded(&mut self.ctx, sequence, outcome, now);
                }
            }
        }
    }

    /// Run every timer due at `now`.
    pub fn fire_timers(&mut self, now: Instant) {
        while let Some((_, (wid, event))) = self.ctx.timers.pop_due(now) {
            if let Some(source) = self.windows.get_mut(&wid) {
                source.on_timer(&mut self.ctx, event, now);
            }
        }
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.ctx.timers.next_deadline()
    }

    /// Next finished encode job, for callers driving the loop by hand.
    pub async fn next_loop_event(&mut self) -> Option<LoopEvent> {
        self.events_rx.recv().await
    }

    pub fn try_loop_event(&mut self) -> Option<LoopEvent> {
        self.events_rx.try_recv().ok()
    }

    // ── Recalculation ────────────────────────────────────────────

    /// Recalculate the windows that have enough new acks.
    pub fn recalculate_due(&mut self, now: Instant) {
        let due: Vec<u32> = self
            .windows
            .iter()
            .filter(|(_, w)| w.should_recalculate(now))
            .map(|(wid, _)| *wid)
            .collect();
        if due.is_empty() {
            return;
        }
        self.ctx.global.lock().update_averages(now);
        for wid in due {
            let fullscreen = self.windows.iter().any(|(id, w)| *id != wid && w.fullscreen);
            let maximized = self.windows.iter().any(|(id, w)| *id != wid && w.maximized);
            if let Some(source) = self.windows.get_mut(&wid) {
                let mut state = source.window_state();
                state.other_is_fullscreen = fullscreen;
                state.other_is_maximized = maximized;
                source.recalculate_delays(&mut self.ctx, state, now);
            }
        }
        self.update_delay_per_megapixel(now);
        self.update_bandwidth_limits(now);
    }

    /// Size and recency weighted average delay, normalised to one megapixel.
    fn update_delay_per_megapixel(&mut self, now: Instant) {
        let mut total_weight = 0.0;
        let mut total = 0.0;
        for source in self.windows.values() {
            let Some(updated) = source.batch.last_updated else {
                continue;
            };
            let (w, h) = source.dimensions();
            let pixels = f64::from(w) * f64::from(h);
            if pixels <= 0.0 {
                continue;
            }
            let age = now.saturating_duration_since(updated).as_secs_f64();
            let weight = pixels / (1.0 + age);
            let normalised = f64::from(source.batch.delay) / (1_000_000.0 / pixels).sqrt().sqrt();
            total += normalised * weight;
            total_weight += weight;
        }
        if total_weight > 0.0 {
            let dpm = total / total_weight;
            self.ctx.delay_per_megapixel = Some(dpm);
            for source in self.windows.values_mut() {
                source.batch.delay_per_megapixel = Some(dpm);
            }
        }
    }

    /// Share the soft bandwidth limit out over the windows.
    pub fn update_bandwidth_limits(&mut self, now: Instant) {
        let min_bw = self.ctx.cfg.congestion.min_bandwidth;
        let detected = if self.congestion.detection() {
            self.ctx.global.lock().avg_congestion_send_speed
        } else {
            0.0
        };
        let limit = if self.mmap.is_some() {
            0
        } else {
            estimator::soft_bandwidth_limit(self.bandwidth_limit, detected, min_bw)
        };
        if limit == 0 {
            for source in self.windows.values_mut() {
                source.bandwidth_limit = 0;
            }
            return;
        }
        let weights: Vec<(u32, u64)> = self
            .windows
            .iter()
            .map(|(wid, w)| (*wid, w.bandwidth_weight(now)))
            .collect();
        for (wid, share) in estimator::distribute_bandwidth(limit, &weights, min_bw) {
            if let Some(source) = self.windows.get_mut(&wid) {
                source.bandwidth_limit = share;
            }
        }
    }

    // ── Event loop ───────────────────────────────────────────────

    /// Drive the connection until either channel closes.
    pub async fn run(
        mut self,
        mut client: mpsc::Receiver<ClientPacket>,
        mut windows: mpsc::Receiver<WindowEvent>,
    ) -> Result<(), StreamError> {
        let mut tick = tokio::time::interval(RECALCULATE_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let result = loop {
            let deadline = self.next_deadline();
            tokio::select! {
                packet = client.recv() => match packet {
                    Some(packet) => {
                        if let Err(e) = self.handle_client_packet(packet, Instant::now()) {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                event = windows.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_window_event(event, Instant::now()) {
                            tracing::warn!(error = %e, "window event failed");
                        }
                    }
                    None => break Ok(()),
                },
                Some(event) = self.events_rx.recv() => self.on_loop_event(event, Instant::now()),
                _ = sleep_until(deadline) => self.fire_timers(Instant::now()),
                _ = tick.tick() => self.recalculate_due(Instant::now()),
            }
        };
        self.close();
        result
    }

    /// Cancel everything and stop the worker and the queue.
    pub fn close(&mut self) {
        for source in self.windows.values_mut() {
            source.cleanup(&mut self.ctx);
        }
        self.windows.clear();
        self.ctx.worker.stop();
        self.queue.close();
        tracing::debug!("connection closed");
    }

    pub fn get_info(&self) -> Value {
        let windows: serde_json::Map<String, Value> = self
            .windows
            .iter()
            .map(|(wid, w)| (wid.to_string(), w.get_info()))
            .collect();
        json!({
            "hello": {
                "encoding": self.hello.encoding,
                "encodings": self.hello.encodings,
            },
            "bandwidth_limit": self.bandwidth_limit,
            "congestion_detection": self.congestion.detection(),
            "delay_per_megapixel": self.ctx.delay_per_megapixel.map(|d| d as u64),
            "suspended": self.suspended,
            "mmap": self.mmap.is_some(),
            "encode_queue": self.ctx.worker.qsize(),
            "packet_queue": self.queue.len(),
            "statistics": self.ctx.global.lock().get_info(),
            "windows": windows,
        })
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSource")
            .field("windows", &self.windows.len())
            .field("bandwidth_limit", &self.bandwidth_limit)
            .field("suspended", &self.suspended)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::WindowFlags;
    use crate::pipeline::stats::GlobalStatistics;
    use crate::window::MemoryWindow;
    use crate::pixels::PixelFormat;
    use crate::wire::{DamageAck, PropertyUpdate};

    fn caps(encodings: &[&str]) -> ClientCapabilities {
        ClientCapabilities {
            encodings: encodings.iter().map(|e| e.to_string()).collect(),
            rgb_formats: vec!["BGRX".into()],
            ..Default::default()
        }
    }

    fn connection(caps: &ClientCapabilities) -> Result<ConnectionSource, StreamError> {
        let global = GlobalStatistics::shared();
        ConnectionSource::new(
            Arc::new(PipelineConfig::default()),
            caps,
            Arc::new(CodecRegistry::with_defaults()),
            PacketQueue::new(Arc::clone(&global)),
            global,
        )
    }

    #[test]
    fn no_common_encoding_is_rejected() {
        let err = connection(&caps(&["h264", "vp8"])).unwrap_err();
        assert!(matches!(err, StreamError::NoCommonEncodings { .. }));
    }

    #[test]
    fn hello_lists_common_encodings() {
        let conn = connection(&caps(&["jpeg", "png", "rgb24"])).unwrap();
        let hello = conn.hello();
        assert_eq!(hello.encodings, vec!["png", "rgb", "rgb24", "jpeg"]);
        assert_eq!(hello.encoding, "png");
        conn.send_hello();
        assert!(matches!(conn.queue().try_pop().unwrap().packet, ServerPacket::Hello(_)));
    }

    #[test]
    fn windows_come_and_go() {
        let mut conn = connection(&caps(&["png", "rgb24"])).unwrap();
        let now = Instant::now();
        let window = Arc::new(MemoryWindow::new(64, 64, WindowFlags::empty()));
        conn.add_window(3, window, now).unwrap();
        assert!(matches!(conn.queue().try_pop().unwrap().packet, ServerPacket::NewWindow { wid: 3, .. }));
        conn.remove_window(3, now);
        assert!(matches!(conn.queue().try_pop().unwrap().packet, ServerPacket::LostWindow { wid: 3 }));
        assert_eq!(conn.window_count(), 0);
        // unknown windows are ignored
        conn.damage(3, Rect::full(10, 10), DamageOptions::default(), now);
        let ack = DamageAck {
            damage_packet_sequence: 1,
            wid: 3,
            width: 1,
            height: 1,
            decode_time: 10,
            message: String::new(),
        };
        conn.handle_client_packet(ClientPacket::DamageAck(ack), now).unwrap();
    }

    #[test]
    fn second_hello_is_a_protocol_violation() {
        let mut conn = connection(&caps(&["png"])).unwrap();
        let err = conn
            .handle_client_packet(ClientPacket::Hello(ClientCapabilities::default()), Instant::now())
            .unwrap_err();
        assert!(matches!(err, StreamError::ProtocolViolation(_)));
    }

    #[test]
    fn bandwidth_is_shared_between_windows() {
        let mut c = caps(&["png"]);
        c.bandwidth_limit = 10_000_000;
        let mut conn = connection(&c).unwrap();
        let now = Instant::now();
        conn.add_window(1, Arc::new(MemoryWindow::new(100, 100, WindowFlags::empty())), now)
            .unwrap();
        conn.add_window(2, Arc::new(MemoryWindow::new(300, 100, WindowFlags::empty())), now)
            .unwrap();
        let a = conn.window(1).unwrap().bandwidth_limit;
        let b = conn.window(2).unwrap().bandwidth_limit;
        assert!(a + b <= 10_000_000);
        assert!(b > a);
        conn.handle_client_packet(ClientPacket::LowerBandwidth, now).unwrap();
        assert_eq!(conn.bandwidth_limit(), 5_000_000.max(PipelineConfig::default().congestion.min_bandwidth));
    }

    #[test]
    fn focus_goes_to_one_window() {
        let mut conn = connection(&caps(&["png"])).unwrap();
        let now = Instant::now();
        for wid in [1, 2] {
            conn.add_window(wid, Arc::new(MemoryWindow::new(10, 10, WindowFlags::empty())), now)
                .unwrap();
        }
        conn.handle_client_packet(ClientPacket::Focus { wid: Some(2) }, now).unwrap();
        assert!(!conn.window(1).unwrap().has_focus);
        assert!(conn.window(2).unwrap().has_focus);
    }

    #[test]
    fn events_for_unknown_windows_are_errors() {
        let mut conn = connection(&caps(&["png"])).unwrap();
        let err = conn
            .handle_window_event(WindowEvent::Unmap { wid: 9 }, Instant::now())
            .unwrap_err();
        assert!(matches!(err, StreamError::UnknownWindow(9)));
        let property = WindowEvent::Property {
            wid: 9,
            property: WindowProperty::Maximized(true),
        };
        assert!(matches!(
            conn.handle_window_event(property, Instant::now()),
            Err(StreamError::UnknownWindow(9))
        ));
    }

    #[test]
    fn quality_and_speed_are_fixed_by_the_client() {
        let mut conn = connection(&caps(&["png", "jpeg"])).unwrap();
        let now = Instant::now();
        conn.add_window(1, Arc::new(MemoryWindow::new(10, 10, WindowFlags::empty())), now)
            .unwrap();
        let quality = ClientPacket::Quality {
            quality: Some(85),
            min_quality: None,
        };
        conn.handle_client_packet(quality, now).unwrap();
        let speed = ClientPacket::Speed {
            speed: Some(20),
            min_speed: Some(10),
        };
        conn.handle_client_packet(speed, now).unwrap();
        let window = conn.window(1).unwrap();
        assert_eq!(window.quality(), 85);
        assert_eq!(window.speed(), 20);
    }

    #[test]
    fn client_properties_renegotiate_one_window() {
        let mut c = caps(&["png", "rgb24", "jpeg"]);
        c.transparency = true;
        c.rgb_formats = vec!["BGRA".into(), "BGRX".into()];
        let mut conn = connection(&c).unwrap();
        let now = Instant::now();
        conn.add_window(1, Arc::new(MemoryWindow::new(10, 10, WindowFlags::HAS_ALPHA)), now)
            .unwrap();
        assert!(conn.window(1).unwrap().rgb_formats().contains(&PixelFormat::Bgra));
        let packet = ClientPacket::ClientProperties {
            wid: 1,
            properties: PropertyUpdate {
                transparency: Some(false),
                ..Default::default()
            },
        };
        conn.handle_client_packet(packet, now).unwrap();
        assert_eq!(conn.window(1).unwrap().rgb_formats(), &[PixelFormat::Bgrx]);
        // unknown windows are skipped
        let packet = ClientPacket::ClientProperties {
            wid: 5,
            properties: PropertyUpdate::default(),
        };
        conn.handle_client_packet(packet, now).unwrap();
    }

    #[test]
    fn set_encoding_applies_to_every_window() {
        let mut conn = connection(&caps(&["png", "jpeg"])).unwrap();
        let now = Instant::now();
        conn.add_window(1, Arc::new(MemoryWindow::new(10, 10, WindowFlags::empty())), now)
            .unwrap();
        let packet = ClientPacket::SetEncoding {
            encoding: "jpeg".into(),
            strict: true,
        };
        conn.handle_client_packet(packet, now).unwrap();
        assert_eq!(conn.window(1).unwrap().encoding(), Encoding::Jpeg);
    }
}
