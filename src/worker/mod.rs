//! Worker descriptors and process pools.
//!
//! Each worker type is described once by a [`WorkerSpec`] and run by a
//! [`WorkerPool`] as `count` forked replicas. Replicas talk only through
//! [`BoundedChannel`](crate::channel::BoundedChannel)s and observe one
//! [`ControlSignal`](crate::control::ControlSignal).
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │ Owning process  │
//!                     │ (ControlSignal) │
//!                     └────────┬────────┘
//!                              │ fork
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Replica 0 │  │ Replica 1 │  │ Replica N │
//!         │  body()   │  │  body()   │  │  body()   │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Replica lifecycle
//!
//! - **RUNNING**: check exit, honour pause, one unit of work, repeat
//! - **EXITED**: exit was requested, an input delivered end-of-stream, or
//!   an output was drained; the process leaves with a reserved exit code

mod lifecycle;
mod pool;
mod proc;
mod signals;
mod spawn;
mod spec;

pub use lifecycle::{ExitCause, LoopExit, Step, run_until_exit};
pub use pool::{JoinReport, ManagedPool, WorkerPool};
pub use signals::{
    EXIT_COMPLETED, EXIT_PANICKED, EXIT_SETUP_FAILED, ReplicaExit, TerminationReason,
};
pub use spec::{WorkerBody, WorkerSpec, WorkerSpecBuilder};
