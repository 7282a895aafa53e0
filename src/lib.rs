//! procflow - process orchestration for long-running worker pipelines.
//!
//! Workers run as forked OS processes, exchange data through bounded
//! cross-process channels and are paused, cancelled and torn down from one
//! [`ControlSignal`]. Shutdown is cooperative and deadlock-free: exit is
//! requested, every channel is drained end-to-start, then every pool is
//! joined (see [`Pipeline::shutdown`]).
//!
//! ```no_run
//! use procflow::{BoundedChannel, Pipeline, Step, WorkerPool, WorkerSpec, run_until_exit};
//!
//! # fn main() -> procflow::Result<()> {
//! let mut pipeline = Pipeline::new()?;
//! let numbers: BoundedChannel<u64> = pipeline.channel("numbers", 8)?;
//!
//! let spec = WorkerSpec::builder("counter", 1u64)
//!     .body(|step: &u64, _: &[BoundedChannel<()>], outputs: &[BoundedChannel<u64>], control| {
//!         let mut n = 0;
//!         run_until_exit(control, || {
//!             n += step;
//!             outputs[0].put(n)?;
//!             Ok(Step::Continue)
//!         });
//!     })
//!     .output(numbers.clone())
//!     .control(pipeline.control())
//!     .build()?;
//! pipeline.add_pool(WorkerPool::create(spec)?);
//!
//! pipeline.start()?;
//! let first = numbers.recv()?;
//! let report = pipeline.shutdown();
//! # let _ = (first, report);
//! # Ok(())
//! # }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("procflow relies on fork and process-shared POSIX semaphores and supports Linux only");

pub mod channel;
pub mod control;
pub mod error;
pub mod logging;
pub mod pipeline;
mod shm;
pub mod worker;

pub use channel::{BoundedChannel, Capacity, ChannelConfig, DrainReport, Message};
pub use control::ControlSignal;
pub use error::{ProcflowError, Result};
pub use pipeline::{Drainable, Pipeline, ShutdownReport};
pub use worker::{
    ExitCause, JoinReport, LoopExit, ManagedPool, ReplicaExit, Step, TerminationReason,
    WorkerPool, WorkerSpec, run_until_exit,
};
