//! Cross-process bounded channel.
//!
//! A channel is a ring of fixed-size slots in a shared memfd, guarded by
//! three process-shared semaphores living in a separate header mapping:
//!
//! ```text
//!   items  ── filled slots, consumers wait on it
//!   slots  ── free slots, producers wait on it
//!   lock   ── binary, protects the cursors and the ring size
//! ```
//!
//! Messages are JSON-encoded into a slot behind an 8-byte header
//! (`kind`, padding, little-endian payload length). The `EndOfStream`
//! sentinel is a slot with no payload.
//!
//! An unbounded channel starts at [`UNBOUNDED_INITIAL_SLOTS`] and doubles its
//! ring whenever a producer finds it full. Every process remaps the file
//! lazily, the next time it takes the lock.
//!
//! # Shutdown
//!
//! [`BoundedChannel::fill_and_drain`] marks the channel closed, fills the
//! remaining capacity with sentinels and discards the backlog. Every blocking
//! wait is sliced into [`POLL_SLICE`] steps that re-check the closed flag, so
//! no producer or consumer can stay blocked on a drained channel:
//!
//! - `put` on a closed channel fails with [`ProcflowError::ChannelClosed`];
//! - `get` on a closed, empty channel returns [`Message::EndOfStream`].
//!
//! The lock is held only while a slot is copied. A replica killed inside
//! that window leaves it taken, and later operations on the channel from
//! any process block; replicas are expected to exit through the control
//! signal.

use crate::control::deadline_after;
use crate::error::{ProcflowError, Result};
use crate::shm::{Semaphore, SharedFile, SharedRegion};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::size_of;
use std::num::NonZeroUsize;
use std::ptr::addr_of_mut;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default slot size in bytes, header included.
pub const DEFAULT_SLOT_SIZE: usize = 4096;

/// Ring size an unbounded channel starts with.
pub const UNBOUNDED_INITIAL_SLOTS: usize = 64;

/// Most slots a ring can hold, bounded or not: the range of a semaphore count.
pub const MAX_SLOTS: usize = i32::MAX as usize;

/// Longest uninterrupted semaphore wait before the closed flag is re-checked.
pub const POLL_SLICE: Duration = Duration::from_millis(50);

const SLOT_HEADER: usize = 8;
const KIND_ITEM: u8 = 1;
const KIND_END: u8 = 2;

/// Channel capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// At most this many messages are queued; `put` blocks when full.
    Bounded(NonZeroUsize),
    /// `put` never waits for a consumer; the ring grows instead, up to
    /// [`MAX_SLOTS`] queued messages.
    Unbounded,
}

impl Capacity {
    /// The bound, or `None` when unbounded.
    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::Bounded(n) => Some(n.get()),
            Self::Unbounded => None,
        }
    }

    fn initial_slots(&self) -> usize {
        self.limit().unwrap_or(UNBOUNDED_INITIAL_SLOTS)
    }
}

/// `0` means unbounded.
impl From<usize> for Capacity {
    fn from(max: usize) -> Self {
        NonZeroUsize::new(max).map_or(Self::Unbounded, Self::Bounded)
    }
}

impl std::fmt::Display for Capacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bounded(n) => write!(f, "{}", n),
            Self::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Channel construction parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub capacity: Capacity,
    /// Bytes per slot including the 8-byte header; bounds the encoded message size.
    pub slot_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: Capacity::Unbounded,
            slot_size: DEFAULT_SLOT_SIZE,
        }
    }
}

impl ChannelConfig {
    pub fn with_capacity(capacity: impl Into<Capacity>) -> Self {
        Self {
            capacity: capacity.into(),
            ..Self::default()
        }
    }

    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }
}

/// What a consumer receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Message<T> {
    Item(T),
    /// The reserved sentinel: no further input will arrive.
    EndOfStream,
}

impl<T> Message<T> {
    pub fn into_item(self) -> Option<T> {
        match self {
            Self::Item(value) => Some(value),
            Self::EndOfStream => None,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

/// Outcome of [`BoundedChannel::fill_and_drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Sentinels pushed into free slots.
    pub filled: usize,
    /// Undelivered data messages thrown away.
    pub discarded: usize,
}

#[repr(C)]
struct Header {
    items: Semaphore,
    slots: Semaphore,
    lock: Semaphore,
    closed: AtomicBool,
    /// Current ring size. Changed under `lock` only.
    slot_count: AtomicUsize,
    head: UnsafeCell<usize>,
    tail: UnsafeCell<usize>,
    /// Written slots not yet taken.
    used: UnsafeCell<usize>,
}

/// The shared ring behind every clone of a channel.
struct Ring {
    header: SharedRegion,
    store: SharedFile,
    /// This process's mapping of `store`. Read and replaced under `lock` only.
    view: UnsafeCell<SharedRegion>,
    capacity: Capacity,
    slot_size: usize,
}

// Safety: `view` is only touched while holding the cross-process `lock`,
// which also serializes the threads of this process.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

fn data_len(slot_count: usize, slot_size: usize) -> Option<usize> {
    slot_count.checked_mul(slot_size)
}

impl Ring {
    fn create(config: ChannelConfig) -> Result<Self> {
        if config.slot_size <= SLOT_HEADER {
            return Err(ProcflowError::InvalidChannel(format!(
                "slot size must exceed {} header bytes, got {}",
                SLOT_HEADER, config.slot_size
            )));
        }
        let slot_count = config.capacity.initial_slots();
        if slot_count > MAX_SLOTS {
            return Err(ProcflowError::InvalidChannel(format!(
                "capacity {} exceeds the {} slot limit",
                slot_count, MAX_SLOTS
            )));
        }
        let len = data_len(slot_count, config.slot_size).ok_or_else(|| {
            ProcflowError::InvalidChannel(format!(
                "{} slots of {} bytes overflow the address space",
                slot_count, config.slot_size
            ))
        })?;

        let header = SharedRegion::new(size_of::<Header>())?;
        let store = SharedFile::create(c"procflow-channel", len)?;
        let view = SharedRegion::map_file(&store, len)?;

        let raw = header.as_ptr().cast::<Header>();
        // Safety: the mapping is fresh, page aligned and large enough for the
        // header. Cursors and the closed flag are valid as zero bytes.
        unsafe {
            Semaphore::init_in_place(addr_of_mut!((*raw).items), 0)?;
            Semaphore::init_in_place(addr_of_mut!((*raw).slots), slot_count as u32)?;
            Semaphore::init_in_place(addr_of_mut!((*raw).lock), 1)?;
            (*raw).slot_count.store(slot_count, Ordering::SeqCst);
        }

        Ok(Self {
            header,
            store,
            view: UnsafeCell::new(view),
            capacity: config.capacity,
            slot_size: config.slot_size,
        })
    }

    fn header(&self) -> &Header {
        // Safety: initialized in create, lives as long as the region.
        unsafe { &*self.header.as_ptr().cast::<Header>() }
    }

    fn max_payload(&self) -> usize {
        self.slot_size - SLOT_HEADER
    }

    fn slot_count(&self) -> usize {
        self.header().slot_count.load(Ordering::SeqCst)
    }

    /// Base of this process's view, remapped first if another process grew
    /// the ring since the last look.
    ///
    /// # Safety
    /// The caller holds `lock`.
    unsafe fn mapped(&self, slot_count: usize) -> Result<*mut u8> {
        // Validated by whichever process set `slot_count`.
        let needed = slot_count * self.slot_size;
        // Safety: exclusive under `lock`.
        let view = unsafe { &mut *self.view.get() };
        if view.len() < needed {
            *view = SharedRegion::map_file(&self.store, needed)?;
            trace!(slot_count, mapped_bytes = needed, "Remapped channel ring");
        }
        Ok(view.as_ptr())
    }

    /// Write one slot at the tail. The caller must hold a `slots` permit.
    fn push(&self, kind: u8, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= self.max_payload());
        let header = self.header();
        header.lock.wait()?;
        let count = self.slot_count();
        // Safety: `lock` is held.
        let base = match unsafe { self.mapped(count) } {
            Ok(base) => base,
            Err(e) => {
                header.lock.post()?;
                header.slots.post()?;
                return Err(e);
            }
        };
        // Safety: cursors and slot contents are only touched under `lock`,
        // and the held `slots` permit guarantees the tail slot is free.
        unsafe {
            let index = *header.tail.get();
            let slot = base.add(index * self.slot_size);
            let len = payload.len() as u32;
            slot.write(kind);
            std::ptr::copy_nonoverlapping(len.to_le_bytes().as_ptr(), slot.add(4), 4);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), slot.add(SLOT_HEADER), payload.len());
            *header.tail.get() = (index + 1) % count;
            *header.used.get() += 1;
        }
        header.lock.post()?;
        header.items.post()
    }

    /// Take one slot from the head. The caller must hold an `items` permit.
    fn pop(&self) -> Result<(u8, Vec<u8>)> {
        let header = self.header();
        header.lock.wait()?;
        let count = self.slot_count();
        // Safety: `lock` is held.
        let base = match unsafe { self.mapped(count) } {
            Ok(base) => base,
            Err(e) => {
                header.lock.post()?;
                header.items.post()?;
                return Err(e);
            }
        };
        // Safety: see push; the held `items` permit guarantees the head slot is filled.
        let popped = unsafe {
            let index = *header.head.get();
            let slot = base.add(index * self.slot_size);
            let kind = slot.read();
            let mut len_bytes = [0u8; 4];
            std::ptr::copy_nonoverlapping(slot.add(4), len_bytes.as_mut_ptr(), 4);
            let len = u32::from_le_bytes(len_bytes) as usize;
            *header.head.get() = (index + 1) % count;
            *header.used.get() -= 1;
            if len > self.max_payload() {
                Err(ProcflowError::CorruptSlot(format!(
                    "slot {} claims {} payload bytes",
                    index, len
                )))
            } else {
                let mut payload = vec![0u8; len];
                std::ptr::copy_nonoverlapping(slot.add(SLOT_HEADER), payload.as_mut_ptr(), len);
                Ok((kind, payload))
            }
        };
        header.lock.post()?;
        header.slots.post()?;
        popped
    }

    /// Double a ring that a producer found full at `seen` slots.
    ///
    /// Does nothing if another producer already grew it or a slot has been
    /// freed since.
    fn grow(&self, seen: usize) -> Result<()> {
        let header = self.header();
        header.lock.wait()?;
        // Safety: `lock` is held.
        let grown = unsafe { self.grow_locked(seen) };
        header.lock.post()?;
        grown
    }

    /// # Safety
    /// The caller holds `lock`.
    unsafe fn grow_locked(&self, seen: usize) -> Result<()> {
        let header = self.header();
        let count = self.slot_count();
        if count != seen || header.slots.value()? > 0 {
            return Ok(());
        }
        let new_count = count
            .checked_mul(2)
            .filter(|n| *n <= MAX_SLOTS)
            .ok_or_else(|| {
                ProcflowError::InvalidChannel(format!(
                    "unbounded channel cannot grow past {} slots",
                    count
                ))
            })?;
        let new_len = data_len(new_count, self.slot_size).ok_or_else(|| {
            ProcflowError::InvalidChannel(format!(
                "{} slots of {} bytes overflow the address space",
                new_count, self.slot_size
            ))
        })?;

        self.store.set_len(new_len)?;
        // Safety: `lock` is held; the length set above covers `new_count`.
        let base = unsafe { self.mapped(new_count) }?;
        // Safety: cursors are only touched under `lock`. Queued slots run from
        // `head` for `used` slots, wrapping at `count`; the wrapped part moves
        // to just past the old end so the run is contiguous again.
        unsafe {
            let head = *header.head.get();
            let end = head + *header.used.get();
            if end > count {
                let wrapped = end - count;
                std::ptr::copy_nonoverlapping(
                    base,
                    base.add(count * self.slot_size),
                    wrapped * self.slot_size,
                );
            }
            *header.tail.get() = end % new_count;
        }
        header.slot_count.store(new_count, Ordering::SeqCst);
        for _ in count..new_count {
            header.slots.post()?;
        }
        debug!(from = count, to = new_count, "Grew unbounded channel");
        Ok(())
    }
}

/// An ordered, cross-process message channel.
///
/// Clones (and forked copies) share the same queue. With several consumers
/// each message is delivered to exactly one of them. Order is FIFO per
/// producer.
pub struct BoundedChannel<T> {
    ring: Arc<Ring>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Clone for BoundedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("capacity", &self.ring.capacity)
            .field("slot_size", &self.ring.slot_size)
            .field("closed", &self.ring.header().closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T> BoundedChannel<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create a channel with the default slot size. `0` means unbounded.
    pub fn new(capacity: impl Into<Capacity>) -> Result<Self> {
        Self::with_config(ChannelConfig::with_capacity(capacity))
    }

    pub fn with_config(config: ChannelConfig) -> Result<Self> {
        let ring = Ring::create(config)?;
        trace!(
            capacity = %config.capacity,
            slot_size = config.slot_size,
            slots = ring.slot_count(),
            "Created channel"
        );
        Ok(Self {
            ring: Arc::new(ring),
            _marker: PhantomData,
        })
    }

    pub fn capacity(&self) -> Capacity {
        self.ring.capacity
    }

    /// Largest encoded message a slot can carry.
    pub fn max_message_size(&self) -> usize {
        self.ring.max_payload()
    }

    /// Number of queued slots, sentinels included. A snapshot.
    pub fn len(&self) -> usize {
        self.ring
            .header()
            .items
            .value()
            .map(|n| n.max(0) as usize)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`fill_and_drain`](Self::fill_and_drain) has run since the last reopen.
    pub fn is_closed(&self) -> bool {
        self.ring.header().closed.load(Ordering::SeqCst)
    }

    /// Enqueue at the tail, blocking while the channel is full.
    ///
    /// Fails with [`ProcflowError::ChannelClosed`] once the channel has been
    /// drained, including while blocked.
    pub fn put(&self, value: T) -> Result<()> {
        let payload = self.encode(&value)?;
        self.send(KIND_ITEM, &payload, None).map(|_| ())
    }

    /// Like [`put`](Self::put) but gives up after `timeout`.
    ///
    /// Returns `Ok(false)` if no slot became free in time; the value is dropped.
    /// A timeout too large to form a deadline waits like `put`.
    pub fn put_timeout(&self, value: T, timeout: Duration) -> Result<bool> {
        let payload = self.encode(&value)?;
        self.send(KIND_ITEM, &payload, deadline_after(timeout))
    }

    /// Enqueue the end-of-stream sentinel, blocking while full.
    pub fn put_end_of_stream(&self) -> Result<()> {
        self.send(KIND_END, &[], None).map(|_| ())
    }

    /// Dequeue the head, waiting up to `timeout` (forever when `None`).
    ///
    /// `Ok(None)` means the timeout elapsed with nothing to read. A closed,
    /// empty channel yields [`Message::EndOfStream`] without waiting.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Option<Message<T>>> {
        let deadline = timeout.and_then(deadline_after);
        let header = self.ring.header();
        loop {
            if header.items.try_wait()? {
                return self.take().map(Some);
            }
            if self.is_closed() {
                return Ok(Some(Message::EndOfStream));
            }
            let slice = match deadline {
                None => POLL_SLICE,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(POLL_SLICE)
                }
            };
            if header.items.wait_timeout(slice)? {
                return self.take().map(Some);
            }
        }
    }

    /// Dequeue the head, blocking until a message or the sentinel arrives.
    pub fn recv(&self) -> Result<Message<T>> {
        Ok(self.get(None)?.unwrap_or(Message::EndOfStream))
    }

    /// Dequeue without waiting.
    pub fn try_get(&self) -> Result<Option<Message<T>>> {
        self.get(Some(Duration::ZERO))
    }

    /// Shutdown primitive: close, fill with sentinels, then discard the backlog.
    ///
    /// Filling wakes consumers already blocked in `get`; closing releases
    /// producers blocked in `put` and turns later reads into
    /// `EndOfStream`. Runs in time bounded by the capacity, whether or not
    /// any consumer is alive and whatever the current fill level.
    pub fn fill_and_drain(&self) -> Result<DrainReport> {
        let header = self.ring.header();
        header.closed.store(true, Ordering::SeqCst);

        let mut report = DrainReport::default();
        // An unbounded ring has no "remaining capacity"; one sentinel is
        // enough to wake a waiter, the closed flag covers the rest.
        let fill_limit = self.ring.capacity.limit().unwrap_or(1);
        while report.filled < fill_limit && header.slots.try_wait()? {
            self.ring.push(KIND_END, &[])?;
            report.filled += 1;
        }

        while header.items.try_wait()? {
            let (kind, _) = self.ring.pop()?;
            if kind == KIND_ITEM {
                report.discarded += 1;
            }
        }

        debug!(
            capacity = %self.ring.capacity,
            filled = report.filled,
            discarded = report.discarded,
            "Channel drained"
        );
        Ok(report)
    }

    /// Discard leftovers and reopen a drained channel for another run.
    ///
    /// Must not race with live producers or consumers.
    pub fn reopen(&self) -> Result<DrainReport> {
        let header = self.ring.header();
        let mut report = DrainReport::default();
        while header.items.try_wait()? {
            let (kind, _) = self.ring.pop()?;
            if kind == KIND_ITEM {
                report.discarded += 1;
            }
        }
        header.closed.store(false, Ordering::SeqCst);
        Ok(report)
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(value)?;
        let max = self.ring.max_payload();
        if payload.len() > max {
            return Err(ProcflowError::MessageTooLarge {
                size: payload.len(),
                max,
            });
        }
        Ok(payload)
    }

    /// Wait for a free slot in closed-flag-aware slices, then push.
    ///
    /// An unbounded ring is grown instead of waited on.
    fn send(&self, kind: u8, payload: &[u8], deadline: Option<Instant>) -> Result<bool> {
        let header = self.ring.header();
        loop {
            if self.is_closed() {
                return Err(ProcflowError::ChannelClosed);
            }
            if self.ring.capacity == Capacity::Unbounded {
                let seen = self.ring.slot_count();
                if header.slots.try_wait()? {
                    return self.push_claimed(kind, payload);
                }
                self.ring.grow(seen)?;
                continue;
            }
            let slice = match deadline {
                None => POLL_SLICE,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    (deadline - now).min(POLL_SLICE)
                }
            };
            if header.slots.wait_timeout(slice)? {
                return self.push_claimed(kind, payload);
            }
        }
    }

    /// Push into the slot a `slots` permit was just taken for.
    fn push_claimed(&self, kind: u8, payload: &[u8]) -> Result<bool> {
        if self.is_closed() {
            // Hand the permit on so another blocked producer wakes too.
            self.ring.header().slots.post()?;
            return Err(ProcflowError::ChannelClosed);
        }
        self.ring.push(kind, payload)?;
        Ok(true)
    }

    fn take(&self) -> Result<Message<T>> {
        let (kind, payload) = self.ring.pop()?;
        match kind {
            KIND_ITEM => Ok(Message::Item(serde_json::from_slice(&payload)?)),
            KIND_END => Ok(Message::EndOfStream),
            other => Err(ProcflowError::CorruptSlot(format!(
                "unknown slot kind {}",
                other
            ))),
        }
    }
}
