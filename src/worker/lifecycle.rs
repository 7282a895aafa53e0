//! The replica work loop.
//!
//! Every body drives the same state machine: RUNNING until exit is
//! requested or an input ends, then EXITED. [`run_until_exit`] implements
//! it so bodies only supply one unit of work.

use crate::control::ControlSignal;
use crate::error::{ProcflowError, Result};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};

/// What a unit of work tells the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep going.
    Continue,
    /// An input delivered the sentinel; stop without further output.
    EndOfStream,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    ExitRequested,
    EndOfStream,
    /// An output channel was drained under the body; nobody will read again.
    ChannelClosed,
}

/// Summary of one replica's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopExit {
    pub cause: ExitCause,
    /// Units that completed, successfully or not.
    pub units: u64,
    /// Units that returned an error or panicked.
    pub failures: u64,
}

/// Run `unit` until exit is requested, an input ends or an output closes.
///
/// Before every unit the exit flag is checked and the pause flag honoured.
/// A unit that returns an error or panics is logged and counted; the loop
/// carries on with the next unit.
pub fn run_until_exit<F>(control: &ControlSignal, mut unit: F) -> LoopExit
where
    F: FnMut() -> Result<Step>,
{
    let mut units = 0u64;
    let mut failures = 0u64;
    let finish = |cause, units, failures| {
        debug!(?cause, units, failures, "Work loop finished");
        LoopExit {
            cause,
            units,
            failures,
        }
    };

    loop {
        if control.is_exit_requested() {
            return finish(ExitCause::ExitRequested, units, failures);
        }
        control.check_pause();
        if control.is_exit_requested() {
            return finish(ExitCause::ExitRequested, units, failures);
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(&mut unit));
        units += 1;
        match outcome {
            Ok(Ok(Step::Continue)) => {}
            Ok(Ok(Step::EndOfStream)) => {
                return finish(ExitCause::EndOfStream, units, failures);
            }
            Ok(Err(ProcflowError::ChannelClosed)) => {
                return finish(ExitCause::ChannelClosed, units, failures);
            }
            Ok(Err(e)) => {
                failures += 1;
                warn!(error = %e, failures, "Unit of work failed");
            }
            Err(payload) => {
                failures += 1;
                error!(panic = %panic_message(payload.as_ref()), failures, "Unit of work panicked");
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
