//! # scheduler-core
//!
//! A distributed job scheduler built on one primitive: conditional
//! writes against a key/value table addressed by `(PK, SK)`.
//!
//! ## Architecture
//!
//! ```text
//! SchedulerLoop (leader process)
//!     │
//!     ├─► LeaderLease ── acquire/refresh/release, one lease row
//!     │
//!     ├─► DeduplicationIndex ── reserve (logical_id, bucket) before insert
//!     │
//!     └─► JobTable.put_job() ── due-time-indexed rows, PK = "job"
//!                │
//!                ▼
//! Worker (any process, many per fleet)
//!     │
//!     ├─► JobTable.get_due_jobs(now) ── range query up to `now`
//!     ├─► try_claim() ── conditional update: pending + no/expired lock
//!     ├─► Dispatcher.dispatch() ── job_type -> JobHandler::handle()
//!     └─► update_job_status() ── completed / failed+retry-row / dead_letter
//! ```
//!
//! ## Key invariants
//!
//! 1. **The KV store is the only coordination point.** No in-process
//!    lock is shared across workers; every cross-worker guarantee comes
//!    from a conditional write.
//! 2. **Claims are conditional, not advisory.** A worker that reads a
//!    job as eligible still loses the claim if another worker's
//!    conditional update lands first.
//! 3. **Retries are new rows, never in-place mutations.** The due-time
//!    index stays append-only; a job's failure history is reconstructable
//!    from its chain of rows sharing one `job_id`.
//! 4. **A reservation is written before its job row, never after.** A
//!    crash between the two leaves an orphan reservation, never an
//!    orphan job.
//!
//! This crate has no dependency on any backend. [`kv::KvStore`] is the
//! seam; `scheduler-dynamodb` is one implementation of it, `mem_kv` is
//! another — public, not `#[cfg(test)]`-gated, since `scheduler-testing`
//! and small deployments both need it outside of this crate's own tests.

pub mod collab;
pub mod config;
pub mod dedup;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod job;
pub mod key_codec;
pub mod kv;
pub mod lease;
pub mod mem_kv;
pub mod retry;
pub mod scheduler_loop;
pub mod worker;

pub use collab::{ChatClient, LlmClient, ObservabilitySink, TimezoneResolver, UserSettingsStore};
pub use config::SchedulerConfig;
pub use dedup::DeduplicationIndex;
pub use error::SchedulerError;
pub use handler::{Dispatcher, HandlerRegistry, JobHandler};
pub use job::{JobStatus, JobTable, ScheduledJob};
pub use kv::KvStore;
pub use lease::{LeaderLease, LeaseState};
pub use mem_kv::MemoryKv;
pub use retry::RetryPolicy;
pub use scheduler_loop::{SchedulerLoop, SchedulerLoopBuilder};
pub use worker::{Outcome, Worker, WorkerConfig};
