//! Shared memory primitives that survive `fork()`.
//!
//! The control signal and every channel header live in anonymous
//! `MAP_SHARED` mappings created by the owning process before any replica is
//! forked, so all replicas address the same physical pages. Channel slots
//! live in a [`SharedFile`] instead: a memfd whose descriptor every replica
//! inherits, so the file can grow after the fork and each process maps the
//! new length itself. Synchronization inside a mapping uses atomics and
//! process-shared POSIX semaphores.

use crate::error::{ProcflowError, Result};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, mmap_anonymous, munmap};
use std::cell::UnsafeCell;
use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::time::Duration;

/// An anonymous shared mapping, zero-filled on creation.
pub(crate) struct SharedRegion {
    ptr: NonNull<u8>,
    len: NonZeroUsize,
}

// Safety: the region is plain memory. Every concurrent access to its contents
// goes through atomics or semaphores placed inside it.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map `len` bytes of zeroed memory shared with future children.
    pub(crate) fn new(len: usize) -> Result<Self> {
        let len = NonZeroUsize::new(len)
            .ok_or_else(|| ProcflowError::SharedMemory("mapping length must be non-zero".into()))?;

        // Safety: a fresh anonymous mapping does not alias any existing memory.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| ProcflowError::SharedMemory(format!("mmap of {} bytes failed: {}", len, e)))?;

        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    /// Map the first `len` bytes of `file`, shared with every other mapping of it.
    pub(crate) fn map_file(file: &SharedFile, len: usize) -> Result<Self> {
        let len = NonZeroUsize::new(len)
            .ok_or_else(|| ProcflowError::SharedMemory("mapping length must be non-zero".into()))?;

        // Safety: the mapping is backed by our own memfd; nobody truncates it
        // below a length that is still mapped.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file.fd,
                0,
            )
        }
        .map_err(|e| ProcflowError::SharedMemory(format!("mmap of {} file bytes failed: {}", len, e)))?;

        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len.get()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // Safety: ptr and len come from mmap and are unmapped once.
        if let Err(e) = unsafe { munmap(self.ptr.cast(), self.len.get()) } {
            tracing::warn!(error = %e, len = self.len.get(), "Failed to unmap shared region");
        }
    }
}

/// An anonymous in-memory file (`memfd_create`) that only ever grows.
///
/// The descriptor is inherited across `fork()`, so a length set by any
/// process is visible to all of them.
pub(crate) struct SharedFile {
    fd: OwnedFd,
}

impl SharedFile {
    pub(crate) fn create(name: &CStr, len: usize) -> Result<Self> {
        // Safety: `name` is a valid C string.
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(ProcflowError::SharedMemory(format!(
                "memfd_create failed: {}",
                io::Error::last_os_error()
            )));
        }
        // Safety: memfd_create returned a fresh descriptor that nothing else owns.
        let file = Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        };
        file.set_len(len)?;
        Ok(file)
    }

    /// Resize the file. New bytes read as zero and take no memory until touched.
    pub(crate) fn set_len(&self, len: usize) -> Result<()> {
        let len = libc::off_t::try_from(len).map_err(|_| {
            ProcflowError::SharedMemory(format!("file length {} is out of range", len))
        })?;
        loop {
            // Safety: the descriptor is owned and open.
            if unsafe { libc::ftruncate(self.fd.as_raw_fd(), len) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(ProcflowError::SharedMemory(format!(
                    "ftruncate to {} bytes failed: {}",
                    len, err
                )));
            }
        }
    }
}

/// A process-shared counting semaphore living inside a [`SharedRegion`].
///
/// All waits retry on `EINTR`.
#[repr(transparent)]
pub(crate) struct Semaphore(UnsafeCell<libc::sem_t>);

impl Semaphore {
    /// Initialize a semaphore in place with `pshared = 1`.
    ///
    /// # Safety
    /// `slot` must point to writable shared memory, suitably aligned for
    /// `sem_t`, that no other process or thread is using yet.
    pub(crate) unsafe fn init_in_place(slot: *mut Semaphore, value: u32) -> Result<()> {
        let rc = unsafe { libc::sem_init(slot.cast::<libc::sem_t>(), 1, value) };
        if rc != 0 {
            return Err(ProcflowError::Semaphore(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn raw(&self) -> *mut libc::sem_t {
        self.0.get()
    }

    /// Decrement, blocking while the count is zero.
    pub(crate) fn wait(&self) -> Result<()> {
        loop {
            // Safety: the semaphore was initialized by init_in_place.
            if unsafe { libc::sem_wait(self.raw()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue; // Retry on interrupt
            }
            return Err(ProcflowError::Semaphore(err));
        }
    }

    /// Decrement without blocking. Returns `false` if the count was zero.
    pub(crate) fn try_wait(&self) -> Result<bool> {
        loop {
            // Safety: the semaphore was initialized by init_in_place.
            if unsafe { libc::sem_trywait(self.raw()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(false),
                _ => return Err(ProcflowError::Semaphore(err)),
            }
        }
    }

    /// Decrement, blocking for at most `timeout`. Returns `false` on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = realtime_deadline(timeout)?;
        loop {
            // Safety: the semaphore was initialized by init_in_place.
            if unsafe { libc::sem_timedwait(self.raw(), &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(ProcflowError::Semaphore(err)),
            }
        }
    }

    /// Increment, waking one waiter if any.
    pub(crate) fn post(&self) -> Result<()> {
        // Safety: the semaphore was initialized by init_in_place.
        if unsafe { libc::sem_post(self.raw()) } != 0 {
            return Err(ProcflowError::Semaphore(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Current count (a snapshot; may be stale immediately).
    pub(crate) fn value(&self) -> Result<i32> {
        let mut value: libc::c_int = 0;
        // Safety: the semaphore was initialized by init_in_place.
        if unsafe { libc::sem_getvalue(self.raw(), &mut value) } != 0 {
            return Err(ProcflowError::Semaphore(io::Error::last_os_error()));
        }
        Ok(value)
    }
}

/// Absolute `CLOCK_REALTIME` deadline `timeout` from now, as `sem_timedwait` expects.
fn realtime_deadline(timeout: Duration) -> Result<libc::timespec> {
    // Safety: timespec is plain data; an all-zero value is valid.
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    // Safety: `now` is a valid out-pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(ProcflowError::Semaphore(io::Error::last_os_error()));
    }

    const NANOS_PER_SEC: i64 = 1_000_000_000;
    let nanos = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    let secs = (now.tv_sec as i64)
        .saturating_add(i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX / 2))
        .saturating_add(nanos / NANOS_PER_SEC);

    let mut deadline = now;
    deadline.tv_sec = secs as libc::time_t;
    deadline.tv_nsec = (nanos % NANOS_PER_SEC) as libc::c_long;
    Ok(deadline)
}
