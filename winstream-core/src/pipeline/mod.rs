//! # pipeline: damage in, draw packets out
//!
//! Everything between "this rectangle of a window changed" and "these
//! bytes go on the socket".
//!
//! ## Architecture
//!
//! ```text
//! EVENT LOOP (one per connection)                      ENCODE THREAD
//! ┌──────────────────────────────┐                    ┌───────────────────┐
//! │ ConnectionSource             │                    │ EncodeWorker      │
//! │   ↓ damage / acks / timers   │   FnOnce jobs      │   ↓               │
//! │ WindowSource (per window)    │ ─────────────────► │ WindowEncoder     │
//! │   ├ DelayedRegion            │                    │   ├ CodecRegistry │
//! │   ├ BatchConfig              │                    │   └ DeltaBuckets  │
//! │   ├ EncodingSelector         │   LoopEvent        │   ↓               │
//! │   ├ QualitySpeed             │ ◄───────────────── │ PacketQueue::push │
//! │   └ AutoRefresh              │                    └───────────────────┘
//! └──────────────────────────────┘                              ↓
//!                                      network writer ◄── ordinary / bulk lanes
//! ```
//!
//! ## Sub-modules
//!
//! | Module          | Purpose                                             |
//! |-----------------|-----------------------------------------------------|
//! | `damage`        | Damage options and the delayed region accumulator   |
//! | `batch`         | Batch delay config and the delay calculator         |
//! | `selector`      | Encoding negotiation, selection and flush planning  |
//! | `worker`        | Single thread FIFO encode worker                    |
//! | `encoder`       | Worker side of a window: encode, delta, packetize   |
//! | `delta`         | Delta buckets and XOR deltas                        |
//! | `queue`         | Ordinary / bulk packet queue with send hooks        |
//! | `estimator`     | Quality, speed, congestion and bandwidth targets    |
//! | `refresh`       | Auto-refresh region tracking                        |
//! | `stats`         | Ring buffers of per window and global statistics    |
//! | `maths`         | Weighted averages and factor helpers                |
//! | `timer`         | Cancellable deadline queue for the event loop       |
//! | `window_source` | Per window state machine                            |
//! | `connection`    | Per connection event loop and policies              |

pub mod batch;
pub mod connection;
pub mod damage;
pub mod delta;
pub mod encoder;
pub mod estimator;
pub mod maths;
pub mod queue;
pub mod refresh;
pub mod selector;
pub mod stats;
pub mod timer;
pub mod window_source;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────

pub use batch::{BatchConfig, WindowState};
pub use connection::{ConnectionSource, WindowEvent};
pub use damage::{DamageOptions, DelayedRegion};
pub use delta::DeltaBuckets;
pub use encoder::{EncodeOutcome, LoopEvent, WindowEncoder};
pub use estimator::{CongestionTracker, QualitySpeed};
pub use queue::{PacketQueue, QueuedPacket};
pub use refresh::{AutoRefresh, SentUpdate};
pub use selector::{EncodingSelector, PlannedRegion, Strategy};
pub use stats::{GlobalStatistics, SharedGlobalStatistics, SharedWindowStatistics, WindowStatistics};
pub use timer::{TimerId, TimerQueue};
pub use window_source::{ClientSettings, Context, TimerEvent, WindowSource};
pub use worker::EncodeWorker;
