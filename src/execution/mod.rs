//! Process Execution Module
//!
//! Drives processes through their workflow steps, persisting every
//! transition, and continues them after restarts or crashes.
//!
//! # Architecture
//!
//! - [`engine`]: Trigger operations and the step loop
//! - [`replay`]: Rebuilding process state from the step log
//! - [`retry`]: Backoff policy for transient step failures
//! - [`lock`]: Per-resource locks with heartbeats
//! - [`recovery`]: Takeover of processes orphaned by a crashed instance
//! - [`worker`]: Thread pool running processes in the background

pub mod engine;
pub mod lock;
pub mod recovery;
pub mod replay;
pub mod retry;
pub mod worker;

pub use engine::Engine;
pub use lock::{LockManager, LockSettings};
pub use recovery::RecoveryReport;
pub use replay::{replay, PendingInput, Replay};
pub use retry::RetryPolicy;
pub use worker::{Job, JobResult, WorkerPool};
