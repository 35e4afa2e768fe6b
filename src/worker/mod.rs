//! Worker runtime.
//!
//! A worker owns at most one job at a time and coordinates with other
//! workers only through the shared job store and work queues:
//! - **Dequeue loop**: pulls ids from the queues in strict priority order
//! - **Leasing**: claims each id before touching it, abandons it on `LeaseLost`
//! - **Heartbeat**: renews the lease while the pipeline runs
//! - **Orphan sweep**: on startup and periodically, requeues in-flight jobs
//!   whose lease has expired
//!
//! # Components
//!
//! - [`Worker`]: the dequeue → acquire → run → release loop
//! - [`heartbeat`]: lease renewal on a fixed timer
//! - [`sweep`]: orphan detection and requeue

pub mod heartbeat;
pub mod runtime;
pub mod sweep;

pub use heartbeat::{Heartbeat, HeartbeatHandle};
pub use runtime::Worker;
pub use sweep::{sweep_orphans, SweepReport};
