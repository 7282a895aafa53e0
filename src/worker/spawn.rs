//! Replica process creation.
//!
//! Replicas are created with `fork()`: the child inherits the spec (body,
//! arguments, channel mappings, control signal) by copy and never returns
//! into the caller. It runs the body under its own logging dispatcher,
//! then leaves through `_exit` with one of the reserved exit codes, so no
//! destructor of the parent's state (pools, handles, mappings) runs twice.

use super::lifecycle::panic_message;
use super::proc::Proc;
use super::signals::{EXIT_COMPLETED, EXIT_PANICKED, EXIT_SETUP_FAILED};
use super::spec::WorkerSpec;
use crate::error::{ProcflowError, Result};
use crate::logging;
use nix::unistd::{ForkResult, Pid, fork, getpid};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, info, info_span};

/// Fork one replica of `spec`.
///
/// Returns the parent's handle to the child. The child side of the fork
/// does not return.
///
/// The owner is assumed to fork from a single thread. The child allocates
/// and logs, so a lock that another owner thread held at fork time (the
/// allocator's, an `EnvFilter`'s, a log writer's) stays held in the child
/// and can deadlock it.
pub fn spawn_replica<A, I, O>(spec: &WorkerSpec<A, I, O>, replica: usize) -> Result<Proc> {
    // Safety: the child only runs `replica_main`, which ends in `_exit`.
    // Locks inherited from other owner threads are the caller's concern
    // (see above).
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            debug!(
                worker = spec.name(),
                replica,
                pid = child.as_raw(),
                "Spawned replica"
            );
            Ok(Proc::new(child, replica))
        }
        Ok(ForkResult::Child) => replica_main(spec, replica),
        Err(e) => Err(ProcflowError::Spawn(format!(
            "fork of {}[{}] failed: {}",
            spec.name(),
            replica,
            e
        ))),
    }
}

/// Child-side entry point.
fn replica_main<A, I, O>(spec: &WorkerSpec<A, I, O>, replica: usize) -> ! {
    let pid = getpid();
    let code = match logging::replica_dispatch(spec.name(), pid.as_raw(), spec.logging()) {
        Ok(dispatch) => {
            tracing::dispatcher::with_default(&dispatch, || run_body(spec, replica, pid))
        }
        Err(e) => {
            // Only this replica is affected; siblings have their own setup.
            error!(
                worker = spec.name(),
                replica,
                pid = pid.as_raw(),
                error = %e,
                "Replica setup failed"
            );
            EXIT_SETUP_FAILED
        }
    };
    exit_now(code)
}

fn run_body<A, I, O>(spec: &WorkerSpec<A, I, O>, replica: usize, pid: Pid) -> i32 {
    let span = info_span!("worker", name = spec.name(), replica, pid = pid.as_raw());
    let _guard = span.enter();
    info!("Replica started");

    let body = spec.body();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        body(spec.args(), spec.inputs(), spec.outputs(), spec.control())
    }));

    match outcome {
        Ok(()) => {
            info!("Replica exited");
            EXIT_COMPLETED
        }
        Err(payload) => {
            error!(panic = %panic_message(payload.as_ref()), "Replica body panicked");
            EXIT_PANICKED
        }
    }
}

/// Flush stdio and leave without running the parent's destructors.
fn exit_now(code: i32) -> ! {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    // Safety: _exit has no preconditions.
    unsafe { libc::_exit(code) }
}
