//! The exit/pause flag pair shared by every process of a run.
//!
//! A [`ControlSignal`] is created by the owning process before any worker is
//! started. Its two flags live in a shared mapping, so a replica forked
//! afterwards observes every change at its next check point.

use crate::error::Result;
use crate::shm::SharedRegion;
use std::mem::size_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How often a paused replica re-reads the flags.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The instant `timeout` from now.
///
/// `None` when it is past what `Instant` can represent, which every caller
/// treats as "no deadline".
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

#[repr(C)]
struct Flags {
    exit_requested: AtomicBool,
    paused: AtomicBool,
}

/// Cooperative cancellation and pause signal.
///
/// Cloning is cheap; all clones (and all forked copies) refer to the same
/// flags. After construction no operation can fail.
#[derive(Clone)]
pub struct ControlSignal {
    region: Arc<SharedRegion>,
}

impl ControlSignal {
    /// Allocate a fresh signal with both flags cleared.
    pub fn new() -> Result<Self> {
        // The mapping is zero-filled, which is `false` for both flags.
        let region = SharedRegion::new(size_of::<Flags>())?;
        Ok(Self {
            region: Arc::new(region),
        })
    }

    fn flags(&self) -> &Flags {
        // Safety: the region is at least size_of::<Flags>() bytes, page
        // aligned, zero-initialized, and lives as long as `self`.
        unsafe { &*self.region.as_ptr().cast::<Flags>() }
    }

    /// Ask every worker to exit at its next check point. Idempotent.
    pub fn request_exit(&self) {
        self.flags().exit_requested.store(true, Ordering::SeqCst);
    }

    /// Reset the exit flag so the signal can drive another run.
    pub fn clear_exit(&self) {
        self.flags().exit_requested.store(false, Ordering::SeqCst);
    }

    pub fn is_exit_requested(&self) -> bool {
        self.flags().exit_requested.load(Ordering::SeqCst)
    }

    /// Hold every worker at its next `check_pause`.
    pub fn pause(&self) {
        self.flags().paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags().paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.flags().paused.load(Ordering::SeqCst)
    }

    /// Block while the pause flag is set.
    ///
    /// Returns immediately when not paused. Also returns once exit has been
    /// requested, so a paused run can still be shut down; callers re-check
    /// [`is_exit_requested`](Self::is_exit_requested) afterwards. Resume
    /// latency is bounded by [`PAUSE_POLL_INTERVAL`].
    pub fn check_pause(&self) {
        while self.is_paused() && !self.is_exit_requested() {
            std::thread::sleep(PAUSE_POLL_INTERVAL);
        }
    }

    /// Sleep for up to `period`, waking early if exit is requested.
    ///
    /// Returns `true` if exit was requested. Periodic workers use this in
    /// place of a plain sleep so shutdown never waits a full period.
    pub fn wait_for_exit(&self, period: Duration) -> bool {
        let deadline = deadline_after(period);
        loop {
            if self.is_exit_requested() {
                return true;
            }
            let nap = match deadline {
                None => PAUSE_POLL_INTERVAL,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(PAUSE_POLL_INTERVAL)
                }
            };
            std::thread::sleep(nap);
        }
    }
}

impl std::fmt::Debug for ControlSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSignal")
            .field("exit_requested", &self.is_exit_requested())
            .field("paused", &self.is_paused())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_signal_is_clear() {
        let signal = ControlSignal::new().unwrap();
        assert!(!signal.is_exit_requested());
        assert!(!signal.is_paused());
    }

    #[test]
    fn test_request_and_clear_exit() {
        let signal = ControlSignal::new().unwrap();
        signal.request_exit();
        signal.request_exit(); // idempotent
        assert!(signal.is_exit_requested());

        signal.clear_exit();
        assert!(!signal.is_exit_requested());
    }

    #[test]
    fn test_clones_share_flags() {
        let signal = ControlSignal::new().unwrap();
        let other = signal.clone();
        other.pause();
        assert!(signal.is_paused());
        signal.request_exit();
        assert!(other.is_exit_requested());
    }

    #[test]
    fn test_check_pause_returns_when_not_paused() {
        let signal = ControlSignal::new().unwrap();
        let start = Instant::now();
        signal.check_pause();
        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn test_check_pause_blocks_until_resume() {
        let signal = ControlSignal::new().unwrap();
        signal.pause();

        let waiter = signal.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            waiter.check_pause();
            start.elapsed()
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished());
        signal.resume();

        let waited = handle.join().unwrap();
        assert!(waited >= Duration::from_millis(90));
    }

    #[test]
    fn test_check_pause_releases_on_exit() {
        let signal = ControlSignal::new().unwrap();
        signal.pause();

        let waiter = signal.clone();
        let handle = thread::spawn(move || waiter.check_pause());

        thread::sleep(Duration::from_millis(50));
        signal.request_exit();
        handle.join().unwrap();
        assert!(signal.is_paused());
    }

    #[test]
    fn test_wait_for_exit_times_out() {
        let signal = ControlSignal::new().unwrap();
        assert!(!signal.wait_for_exit(Duration::from_millis(30)));
    }

    #[test]
    fn test_wait_for_exit_wakes_early() {
        let signal = ControlSignal::new().unwrap();
        let setter = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            setter.request_exit();
        });

        let start = Instant::now();
        assert!(signal.wait_for_exit(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_exit_without_representable_deadline() {
        let signal = ControlSignal::new().unwrap();
        signal.request_exit();
        assert!(signal.wait_for_exit(Duration::MAX));

        signal.clear_exit();
        let setter = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            setter.request_exit();
        });
        assert!(signal.wait_for_exit(Duration::MAX));
        handle.join().unwrap();
    }

    #[test]
    fn test_deadline_after() {
        assert!(deadline_after(Duration::from_secs(1)).is_some());
        assert!(deadline_after(Duration::MAX).is_none());
    }

    #[test]
    fn test_debug_shows_flags() {
        let signal = ControlSignal::new().unwrap();
        signal.pause();
        let debug = format!("{:?}", signal);
        assert!(debug.contains("paused: true"));
        assert!(debug.contains("exit_requested: false"));
    }
}
