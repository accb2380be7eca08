//! Integration tests: whole connections driven by hand or over a real
//! TCP socket on localhost.

use std::io::Read;
use std::sync::{Arc, Mutex as StdMutex, mpsc as std_mpsc};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use winstream_core::codec::PictureEncoder;
use winstream_core::pipeline::EncodeOutcome;
use winstream_core::pipeline::LoopEvent;
use winstream_core::pipeline::estimator::distribute_bandwidth;
use winstream_core::wire::OptionsExt;
use winstream_core::{
    ClientCapabilities, ClientCodec, ClientPacket, CodecRegistry, Connection, ConnectionSource, DamageAck,
    DamageOptions, DrawPacket, EncodeError, EncodeParams, EncodedImage, Encoder, Encoding, GlobalStatistics,
    ImageWrapper, MemoryWindow, PacketQueue, Payload, PipelineConfig, Rect, ServerPacket, WindowEvent, WindowFlags,
};

// ── Helpers ──────────────────────────────────────────────────────

fn caps(encodings: &[&str]) -> ClientCapabilities {
    ClientCapabilities {
        encodings: encodings.iter().map(|e| e.to_string()).collect(),
        rgb_formats: vec!["BGRX".into(), "BGRA".into(), "RGB".into()],
        ..Default::default()
    }
}

fn connection_with(caps: &ClientCapabilities, registry: CodecRegistry) -> ConnectionSource {
    let global = GlobalStatistics::shared();
    ConnectionSource::new(
        Arc::new(PipelineConfig::default()),
        caps,
        Arc::new(registry),
        PacketQueue::new(Arc::clone(&global)),
        global,
    )
    .unwrap()
}

fn connection(caps: &ClientCapabilities) -> ConnectionSource {
    connection_with(caps, CodecRegistry::with_defaults())
}

/// Add one window and drop the `NewWindow` packet it queues.
fn map_window(conn: &mut ConnectionSource, wid: u32, window: Arc<MemoryWindow>, now: Instant) {
    conn.add_window(wid, window, now).unwrap();
    let packet = conn.queue().try_pop().unwrap().packet;
    assert!(matches!(packet, ServerPacket::NewWindow { .. }));
}

/// Packets whose acks are overdue, sent five seconds before `now`.
fn fake_backlog(conn: &ConnectionSource, wid: u32, sequences: &[u64], now: Instant) {
    let source = conn.window(wid).unwrap();
    let mut stats = source.stats().lock();
    let long_ago = now.checked_sub(Duration::from_secs(5)).unwrap_or(now);
    for &seq in sequences {
        stats.record_send_start(seq, long_ago, 0, 100);
        stats.record_send_end(seq, long_ago, 1000, None);
    }
}

fn ack(wid: u32, sequence: u64, width: u32, height: u32) -> ClientPacket {
    ClientPacket::DamageAck(DamageAck {
        damage_packet_sequence: sequence,
        wid,
        width,
        height,
        decode_time: 2000,
        message: String::new(),
    })
}

/// Wait for the worker to finish one job.
async fn encoded(conn: &mut ConnectionSource) -> (u64, EncodeOutcome) {
    let event = tokio::time::timeout(Duration::from_secs(5), conn.next_loop_event())
        .await
        .expect("timeout")
        .expect("worker gone");
    let LoopEvent::Encoded { sequence, outcome, .. } = event;
    (sequence, outcome)
}

fn next_draw(conn: &ConnectionSource) -> DrawPacket {
    match conn.queue().try_pop().map(|item| item.packet) {
        Some(ServerPacket::Draw(draw)) => draw,
        other => panic!("expected a draw packet, got {other:?}"),
    }
}

fn unzlib(payload: &Payload) -> Vec<u8> {
    let mut out = Vec::new();
    let bytes = payload.as_bytes().unwrap();
    flate2::read::ZlibDecoder::new(bytes).read_to_end(&mut out).unwrap();
    out
}

/// Stands in for a video codec: whole frames only.
struct FakeVideo;

impl Encoder for FakeVideo {
    fn name(&self) -> &'static str {
        "fake-video"
    }

    fn encodings(&self) -> &[Encoding] {
        &[Encoding::H264]
    }

    fn whole_frame_only(&self) -> bool {
        true
    }

    fn encode(&self, encoding: Encoding, image: &ImageWrapper, _: &EncodeParams) -> Result<EncodedImage, EncodeError> {
        Ok(EncodedImage {
            encoding,
            payload: Payload::Raw(Bytes::from_static(b"frame")),
            client_options: Default::default(),
            width: image.width(),
            height: image.height(),
            stride: 0,
            bpp: 24,
        })
    }
}

/// png that waits for the test to release it.
struct GatedPng {
    inner: PictureEncoder,
    gate: StdMutex<std_mpsc::Receiver<()>>,
}

impl Encoder for GatedPng {
    fn name(&self) -> &'static str {
        "gated-png"
    }

    fn encodings(&self) -> &[Encoding] {
        &[Encoding::Png]
    }

    fn encode(&self, encoding: Encoding, image: &ImageWrapper, params: &EncodeParams) -> Result<EncodedImage, EncodeError> {
        if let Ok(gate) = self.gate.lock() {
            let _ = gate.recv();
        }
        self.inner.encode(encoding, image, params)
    }
}

// ── Damage to draw ───────────────────────────────────────────────

#[tokio::test]
async fn idle_window_is_encoded_immediately() {
    let mut conn = connection(&caps(&["png", "rgb24", "jpeg"]));
    let now = Instant::now();
    let window = Arc::new(MemoryWindow::new(100, 100, WindowFlags::empty()));
    window.fill(Rect::new(10, 10, 30, 30), [0, 0, 255, 0]);
    map_window(&mut conn, 1, window, now);

    conn.damage(1, Rect::full(100, 100), DamageOptions::default(), now);
    assert!(conn.window(1).unwrap().delayed().is_none());
    let (sequence, outcome) = encoded(&mut conn).await;
    assert_eq!(sequence, 1);
    assert!(matches!(outcome, EncodeOutcome::Sent(_)));

    let draw = next_draw(&conn);
    assert_eq!((draw.x, draw.y, draw.width, draw.height), (0, 0, 100, 100));
    assert_eq!(draw.encoding, "png");
    assert_eq!(draw.damage_packet_sequence, 1);
    let png = image::load_from_memory(draw.payload.as_bytes().unwrap()).unwrap();
    assert_eq!((png.width(), png.height()), (100, 100));
}

#[tokio::test]
async fn backlog_merges_damage_into_one_flush() {
    let mut conn = connection(&caps(&["png", "rgb24"]));
    let now = Instant::now();
    map_window(&mut conn, 1, Arc::new(MemoryWindow::new(100, 100, WindowFlags::empty())), now);
    fake_backlog(&conn, 1, &[1001, 1002, 1003], now);

    for i in 0..5 {
        conn.damage(1, Rect::new(i * 10, 0, 10, 10), DamageOptions::default(), now);
    }
    let source = conn.window(1).unwrap();
    assert_eq!(source.delayed().unwrap().regions.len(), 5);
    assert_eq!(source.sequence(), 0);

    // the batch delay expires, the backlog holds the region back
    conn.fire_timers(now + Duration::from_millis(60));
    assert!(conn.window(1).unwrap().delayed().is_some());

    let later = now + Duration::from_millis(70);
    for seq in [1001, 1002, 1003] {
        conn.handle_client_packet(ack(1, seq, 10, 10), later).unwrap();
    }
    let source = conn.window(1).unwrap();
    assert!(source.delayed().is_none());
    assert_eq!(source.sequence(), 1);

    encoded(&mut conn).await;
    let draw = next_draw(&conn);
    assert_eq!((draw.x, draw.y, draw.width, draw.height), (0, 0, 50, 10));
    assert!(conn.queue().is_empty());
}

#[tokio::test]
async fn delayed_region_never_waits_past_max_delay() {
    let mut conn = connection(&caps(&["png"]));
    let now = Instant::now();
    map_window(&mut conn, 1, Arc::new(MemoryWindow::new(100, 100, WindowFlags::empty())), now);
    fake_backlog(&conn, 1, &[500], now);

    conn.damage(1, Rect::new(0, 0, 20, 20), DamageOptions::default(), now);
    let max_delay = conn.window(1).unwrap().batch.max_delay_duration();
    let mut t = now;
    while conn.window(1).unwrap().delayed().is_some() {
        t = conn.next_deadline().expect("a pending timer");
        assert!(t <= now + max_delay, "timer past max delay");
        conn.fire_timers(t);
    }
    let source = conn.window(1).unwrap();
    assert_eq!(source.sequence(), 1);
    let waited = source.batch.last_actual_delays.last().unwrap().1;
    assert!(u64::from(waited) <= max_delay.as_millis() as u64);
    assert!(t <= now + max_delay);
    encoded(&mut conn).await;
}

// ── Encoding selection ───────────────────────────────────────────

#[tokio::test]
async fn tray_gets_lossless_alpha_despite_video_encoding() {
    let mut registry = CodecRegistry::with_defaults();
    registry.register(Arc::new(FakeVideo));
    let mut c = caps(&["h264", "png", "rgb32"]);
    c.encoding = Some("h264".into());
    c.transparency = true;
    let mut conn = connection_with(&c, registry);
    let now = Instant::now();

    map_window(&mut conn, 1, Arc::new(MemoryWindow::new(64, 64, WindowFlags::empty())), now);
    map_window(&mut conn, 2, Arc::new(MemoryWindow::new(24, 24, WindowFlags::TRAY | WindowFlags::HAS_ALPHA)), now);

    conn.damage(1, Rect::new(0, 0, 8, 8), DamageOptions::default(), now);
    encoded(&mut conn).await;
    let video = next_draw(&conn);
    assert_eq!(video.encoding, "h264");
    assert_eq!((video.width, video.height), (64, 64));

    conn.damage(2, Rect::new(2, 2, 4, 4), DamageOptions::default(), now);
    encoded(&mut conn).await;
    let tray = next_draw(&conn);
    let encoding = Encoding::from_name(&tray.encoding).unwrap();
    assert!(encoding.is_lossless() && encoding.supports_alpha(), "{encoding}");
    assert_eq!((tray.width, tray.height), (24, 24));
}

// ── Acks and cancellation ────────────────────────────────────────

#[tokio::test]
async fn unknown_ack_is_a_no_op() {
    let mut conn = connection(&caps(&["png"]));
    let now = Instant::now();
    map_window(&mut conn, 1, Arc::new(MemoryWindow::new(32, 32, WindowFlags::empty())), now);
    let before = conn.window(1).unwrap().get_info();
    conn.handle_client_packet(ack(1, 77, 32, 32), now).unwrap();
    conn.handle_client_packet(ack(9, 1, 32, 32), now).unwrap();
    assert_eq!(conn.window(1).unwrap().get_info(), before);
    assert_eq!(conn.global().lock().decode_errors, 0);
}

#[tokio::test]
async fn removed_window_never_emits_a_packet() {
    let (release, gate) = std_mpsc::channel();
    let mut registry = CodecRegistry::with_defaults();
    registry.register(Arc::new(GatedPng {
        inner: PictureEncoder::new(),
        gate: StdMutex::new(gate),
    }));
    let mut conn = connection_with(&caps(&["png"]), registry);
    let now = Instant::now();
    map_window(&mut conn, 1, Arc::new(MemoryWindow::new(80, 80, WindowFlags::empty())), now);

    conn.damage(1, Rect::full(80, 80), DamageOptions::default(), now);
    conn.remove_window(1, now);
    release.send(()).unwrap();

    let (sequence, outcome) = encoded(&mut conn).await;
    assert_eq!(sequence, 1);
    assert!(matches!(outcome, EncodeOutcome::Cancelled));
    assert!(matches!(conn.queue().try_pop().unwrap().packet, ServerPacket::LostWindow { wid: 1 }));
    assert!(conn.queue().is_empty());
}

// ── Delta ────────────────────────────────────────────────────────

#[tokio::test]
async fn delta_frame_xors_back_to_the_window() {
    let mut c = caps(&["rgb24"]);
    c.encoding = Some("rgb24".into());
    c.supports_delta = vec!["rgb24".into()];
    c.delta_buckets = 5;
    c.rgb_formats = vec!["BGRX".into()];
    let mut conn = connection(&c);
    let now = Instant::now();
    let window = Arc::new(MemoryWindow::new(64, 64, WindowFlags::empty()));
    window.fill(Rect::full(64, 64), [10, 20, 30, 0]);
    map_window(&mut conn, 1, Arc::clone(&window), now);

    conn.damage(1, Rect::full(64, 64), DamageOptions::default(), now);
    encoded(&mut conn).await;
    let first = next_draw(&conn);
    assert_eq!(first.options.get_int("store"), Some(1));
    assert_eq!(first.options.get_int("delta"), None);
    let first_pixels = unzlib(&first.payload);

    window.fill(Rect::new(8, 8, 16, 16), [200, 100, 50, 0]);
    conn.damage(1, Rect::full(64, 64), DamageOptions::default(), now + Duration::from_millis(100));
    encoded(&mut conn).await;
    let second = next_draw(&conn);
    assert_eq!(second.options.get_int("delta"), Some(1));
    assert_eq!(second.options.get_int("store"), Some(2));

    let delta = unzlib(&second.payload);
    let rebuilt: Vec<u8> = delta.iter().zip(&first_pixels).map(|(d, r)| d ^ r).collect();
    let expected = winstream_core::WindowModel::get_image(&*window, Rect::full(64, 64)).unwrap();
    assert_eq!(rebuilt, expected.pixels);
}

// ── Bandwidth ────────────────────────────────────────────────────

#[test]
fn bandwidth_shares_sum_to_the_limit() {
    let cfg = PipelineConfig::default();
    let min_bw = cfg.congestion.min_bandwidth;
    let limit = 8 * 1024 * 1024;
    let windows = [(1, 1_000_000), (2, 10), (3, 250_000), (4, 0)];
    let shares = distribute_bandwidth(limit, &windows, min_bw);
    let floor = (min_bw / 10).min(limit / windows.len() as u64);
    assert!(shares.iter().map(|(_, s)| s).sum::<u64>() <= limit);
    assert!(shares.iter().all(|&(_, s)| s >= floor));
}

// ── Over TCP ─────────────────────────────────────────────────────

/// Serve one client: hello exchange, one 100x100 window, then the event loop.
async fn serve(listener: TcpListener, window_rx: mpsc::Receiver<WindowEvent>) {
    let (stream, _) = listener.accept().await.unwrap();
    let global = GlobalStatistics::shared();
    let queue = PacketQueue::new(Arc::clone(&global));
    let (conn, mut client_rx) = Connection::spawn(stream, queue.clone(), Arc::clone(&global));
    let Some(ClientPacket::Hello(caps)) = client_rx.recv().await else {
        panic!("expected a hello");
    };
    let mut source = ConnectionSource::new(
        Arc::new(PipelineConfig::default()),
        &caps,
        Arc::new(CodecRegistry::with_defaults()),
        queue,
        global,
    )
    .unwrap();
    source.send_hello();
    source
        .add_window(1, Arc::new(MemoryWindow::new(100, 100, WindowFlags::empty())), Instant::now())
        .unwrap();
    source.run(client_rx, window_rx).await.unwrap();
    conn.finish().await.unwrap();
}

async fn recv(framed: &mut Framed<TcpStream, ClientCodec>) -> ServerPacket {
    tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timeout")
        .expect("server closed")
        .unwrap()
}

#[tokio::test]
async fn tcp_hello_damage_and_ack() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (window_tx, window_rx) = mpsc::channel(16);
    let server = tokio::spawn(serve(listener, window_rx));

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, ClientCodec::new());
    framed.send(ClientPacket::Hello(caps(&["png", "jpeg"]))).await.unwrap();

    let ServerPacket::Hello(hello) = recv(&mut framed).await else {
        panic!("expected the server hello");
    };
    assert_eq!(hello.encoding, "png");
    assert!(matches!(recv(&mut framed).await, ServerPacket::NewWindow { wid: 1, width: 100, height: 100, .. }));

    for expected_seq in [1, 2] {
        let damage = WindowEvent::Damage {
            wid: 1,
            rect: Rect::full(100, 100),
            options: DamageOptions::default(),
        };
        window_tx.send(damage).await.unwrap();
        let ServerPacket::Draw(draw) = recv(&mut framed).await else {
            panic!("expected a draw packet");
        };
        assert_eq!(draw.damage_packet_sequence, expected_seq);
        assert_eq!(draw.encoding, "png");
        framed.send(ack(1, expected_seq, 100, 100)).await.unwrap();
    }

    drop(framed);
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap();
}
