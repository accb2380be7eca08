//! Streaming service core logic.
//!
//! Accepts TCP clients, negotiates capabilities and runs one
//! [`ConnectionSource`] per client with a synthetic [`PatternWindow`]
//! animated by a companion task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use winstream_core::{
    ClientPacket, CodecRegistry, Connection, ConnectionSource, DamageOptions, GlobalStatistics, PacketQueue,
    StreamError, WindowEvent,
};

use crate::config::ServerConfig;
use crate::pattern::PatternWindow;

/// The only window each client gets.
const PATTERN_WID: u32 = 1;

/// How long a client has to send its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

// ── StreamService ────────────────────────────────────────────────

/// The top-level streaming service.
pub struct StreamService {
    config: Arc<ServerConfig>,
    registry: Arc<CodecRegistry>,
    running: Arc<AtomicBool>,
}

impl StreamService {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(CodecRegistry::with_defaults()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Bind the configured address and serve until stopped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let addr: SocketAddr = self.config.network.listen.parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", listener.local_addr()?);
        self.serve(listener).await;
        Ok(())
    }

    /// Accept clients on `listener` until stopped.
    pub async fn serve(&self, listener: TcpListener) {
        self.running.store(true, Ordering::SeqCst);
        let slots = Arc::new(Semaphore::new(self.config.network.max_connections.max(1)));

        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = Self::wait_for_stop(&self.running) => break,
            };

            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                warn!("refusing {peer}: {} clients connected", self.config.network.max_connections);
                continue;
            };

            info!("client connected from {peer}");
            let config = Arc::clone(&self.config);
            let registry = Arc::clone(&self.registry);
            let running = Arc::clone(&self.running);
            tokio::spawn(async move {
                match serve_client(stream, config, registry, running).await {
                    Ok(bytes) => info!("session with {peer} ended, {bytes} bytes sent"),
                    Err(e) => warn!("session with {peer} failed: {e}"),
                }
                drop(permit);
            });
        }

        self.running.store(false, Ordering::SeqCst);
        info!("streaming service stopped");
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Async helper: resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

// ── Sessions ─────────────────────────────────────────────────────

/// Run one client session to completion. Returns the bytes written.
async fn serve_client(
    stream: TcpStream,
    config: Arc<ServerConfig>,
    registry: Arc<CodecRegistry>,
    running: Arc<AtomicBool>,
) -> Result<u64, StreamError> {
    stream.set_nodelay(true)?;
    let global = GlobalStatistics::shared();
    let queue = PacketQueue::new(Arc::clone(&global));
    let (conn, mut client_rx) = Connection::spawn(stream, queue.clone(), Arc::clone(&global));

    let caps = match tokio::time::timeout(HELLO_TIMEOUT, client_rx.recv()).await {
        Ok(Some(ClientPacket::Hello(caps))) => caps,
        Ok(Some(_)) => {
            queue.close();
            conn.finish().await?;
            return Err(StreamError::ProtocolViolation("first packet must be a hello"));
        }
        Ok(None) | Err(_) => {
            queue.close();
            conn.finish().await?;
            return Err(StreamError::ProtocolViolation("no hello received"));
        }
    };
    debug!(encodings = ?caps.encodings, "client hello");

    let source = match ConnectionSource::new(
        Arc::new(config.pipeline.clone()),
        &caps,
        registry,
        queue.clone(),
        global,
    ) {
        Ok(source) => source,
        Err(e) => {
            queue.close();
            conn.finish().await?;
            return Err(e);
        }
    };
    source.send_hello();

    let window = Arc::new(PatternWindow::new(config.pattern.width, config.pattern.height));
    let (window_tx, window_rx) = mpsc::channel(64);
    let _ = window_tx
        .send(WindowEvent::Map {
            wid: PATTERN_WID,
            window: Arc::clone(&window) as _,
        })
        .await;
    let _ = window_tx
        .send(WindowEvent::Damage {
            wid: PATTERN_WID,
            rect: window.bounds(),
            options: DamageOptions::default(),
        })
        .await;
    let animator = tokio::spawn(animate(window, window_tx, config.frame_interval(), running));

    let result = source.run(client_rx, window_rx).await;
    animator.abort();
    let bytes = conn.finish().await;
    if let Err(e) = &result {
        error!("pipeline stopped: {e}");
    }
    result.and(bytes)
}

/// Feed the window's damage to the pipeline every `interval`.
///
/// Dropping the sender on stop makes the pipeline loop exit.
async fn animate(
    window: Arc<PatternWindow>,
    tx: mpsc::Sender<WindowEvent>,
    interval: Duration,
    running: Arc<AtomicBool>,
) {
    let mut tick = tokio::time::interval_at((Instant::now() + interval).into(), interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    while running.load(Ordering::SeqCst) {
        tick.tick().await;
        for rect in window.advance() {
            let event = WindowEvent::Damage {
                wid: PATTERN_WID,
                rect,
                options: DamageOptions::default(),
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
    let _ = tx.send(WindowEvent::Remove { wid: PATTERN_WID }).await;
}

// ── Tests ────────────────────────────────────────────────────────
