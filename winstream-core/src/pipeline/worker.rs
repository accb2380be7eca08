//! Encode worker: one thread per connection running encode jobs in order.
//!
//! The event loop hands closures to [`EncodeWorker::call`]; the thread
//! runs them strictly FIFO. This is the only place pixel compression
//! happens for a connection, so a client never uses more than one core
//! and the per window delta state needs no further ordering.
//!
//! [`EncodeWorker::stop`] queues a `None` sentinel: the thread drains what
//! is already queued, skipping the items marked `optional_when_closing`,
//! then exits.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::error::StreamError;
use crate::pipeline::stats::SharedGlobalStatistics;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkItem {
    name: &'static str,
    optional_when_closing: bool,
    job: Job,
}

pub struct EncodeWorker {
    tx: mpsc::UnboundedSender<Option<WorkItem>>,
    qsize: Arc<AtomicUsize>,
    closing: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    global: SharedGlobalStatistics,
}

impl EncodeWorker {
    /// Spawn the worker thread.
    pub fn spawn(name: &str, global: SharedGlobalStatistics) -> Result<Self, StreamError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let qsize = Arc::new(AtomicUsize::new(0));
        let closing = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new().name(name.to_string()).spawn({
            let qsize = Arc::clone(&qsize);
            let closing = Arc::clone(&closing);
            move || run(rx, qsize, closing)
        })?;
        Ok(Self {
            tx,
            qsize,
            closing,
            handle: Some(handle),
            global,
        })
    }

    /// Queue `job`. Jobs marked `optional_when_closing` are dropped once
    /// [`stop`](Self::stop) has been called.
    pub fn call<F>(&self, name: &'static str, optional_when_closing: bool, job: F) -> Result<(), StreamError>
    where
        F: FnOnce() + Send + 'static,
    {
        if optional_when_closing && self.is_closing() {
            tracing::trace!(item = name, "encode worker closing, item dropped");
            return Ok(());
        }
        let item = WorkItem {
            name,
            optional_when_closing,
            job: Box::new(job),
        };
        let size = self.qsize.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(Some(item)).is_err() {
            self.qsize.fetch_sub(1, Ordering::SeqCst);
            return Err(StreamError::ChannelClosed);
        }
        self.global
            .lock()
            .compression_work_qsizes
            .push((Instant::now(), size as f64));
        Ok(())
    }

    /// Items queued or running.
    pub fn qsize(&self) -> usize {
        self.qsize.load(Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Ask the thread to exit once the queue is drained.
    pub fn stop(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            tracing::debug!(pending = self.qsize(), "stopping encode worker");
            let _ = self.tx.send(None);
        }
    }

    /// Stop and wait for the thread. Must not be called from async code.
    pub fn join(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("encode worker thread panicked");
            }
        }
    }
}

impl Drop for EncodeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for EncodeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeWorker")
            .field("qsize", &self.qsize())
            .field("closing", &self.is_closing())
            .finish()
    }
}

fn run(mut rx: mpsc::UnboundedReceiver<Option<WorkItem>>, qsize: Arc<AtomicUsize>, closing: Arc<AtomicBool>) {
    tracing::debug!("encode worker started");
    while let Some(Some(item)) = rx.blocking_recv() {
        if item.optional_when_closing && closing.load(Ordering::SeqCst) {
            tracing::trace!(item = item.name, "skipped while closing");
        } else if panic::catch_unwind(AssertUnwindSafe(item.job)).is_err() {
            tracing::error!(item = item.name, "encode job panicked");
        }
        qsize.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!("encode worker exiting");
}

// ── Tests ────────────────────────────────────────────────────────
