//! Streaming plumbing: buffer pool, stream geometry, lifecycle state and
//! the cancellation handle.

use crate::convert::BYTES_PER_SAMPLE;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

/// Bulk transfers in flight when the caller passes 0.
pub const DEFAULT_BUF_COUNT: u32 = 16;
pub const MAX_BUF_COUNT: u32 = 64;
/// Complex samples per buffer when the caller passes 0.
pub const DEFAULT_BUF_LENGTH: u32 = 16 * 32 * 512;
/// Buffer lengths are rounded down to a multiple of this.
pub const BUF_LENGTH_ALIGN: u32 = 128;

/// Buffer count and size of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamGeometry {
    pub buf_count: usize,
    /// Complex samples per buffer.
    pub buf_length: usize,
    /// Bytes per bulk transfer.
    pub transfer_size: usize,
}

impl StreamGeometry {
    /// Resolve the caller's request: 0 picks the default, the count is
    /// capped at [`MAX_BUF_COUNT`] and the length aligned down to
    /// [`BUF_LENGTH_ALIGN`] (never below one block).
    pub fn new(buf_count: u32, buf_length: u32) -> Self {
        let buf_count = match buf_count {
            0 => DEFAULT_BUF_COUNT,
            n => n.min(MAX_BUF_COUNT),
        };
        let buf_length = match buf_length {
            0 => DEFAULT_BUF_LENGTH,
            n => (n / BUF_LENGTH_ALIGN * BUF_LENGTH_ALIGN).max(BUF_LENGTH_ALIGN),
        };
        StreamGeometry {
            buf_count: buf_count as usize,
            buf_length: buf_length as usize,
            transfer_size: buf_length as usize * BYTES_PER_SAMPLE,
        }
    }
}

/// Fixed set of transfer buffers. A slot is empty while its buffer is
/// owned by the transport.
#[derive(Debug)]
pub struct BufferPool {
    slots: Vec<Option<Vec<u8>>>,
    size: usize,
}

impl BufferPool {
    pub fn allocate(count: usize, size: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count)
            .map_err(|_| Error::AllocationFailure)?;
        for _ in 0..count {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(size)
                .map_err(|_| Error::AllocationFailure)?;
            buffer.resize(size, 0);
            slots.push(Some(buffer));
        }
        Ok(BufferPool { slots, size })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn take(&mut self, slot: usize) -> Option<Vec<u8>> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub fn put(&mut self, slot: usize, buffer: Vec<u8>) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = Some(buffer);
        }
    }

    /// Buffers currently held by the transport.
    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }
}

/// Lifecycle of the streaming loop.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Canceling = 3,
}

impl AsyncStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AsyncStatus::Starting,
            2 => AsyncStatus::Running,
            3 => AsyncStatus::Canceling,
            _ => AsyncStatus::Idle,
        }
    }
}

/// Stream state shared between the streaming thread and cancel handles.
#[derive(Debug)]
pub struct StreamControl {
    status: AtomicU8,
    cancel: AtomicBool,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl Default for StreamControl {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamControl {
    pub fn new() -> Self {
        StreamControl {
            status: AtomicU8::new(AsyncStatus::Idle as u8),
            cancel: AtomicBool::new(false),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
        }
    }

    pub fn status(&self) -> AsyncStatus {
        AsyncStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Claim the stream: Idle to Starting. Fails if a stream is active.
    pub(crate) fn try_start(&self) -> bool {
        self.cancel.store(false, Ordering::Release);
        self.status
            .compare_exchange(
                AsyncStatus::Idle as u8,
                AsyncStatus::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Starting to Running, unless a cancel got there first.
    pub(crate) fn mark_running(&self) -> bool {
        self.status
            .compare_exchange(
                AsyncStatus::Starting as u8,
                AsyncStatus::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_canceling(&self) {
        self.status
            .store(AsyncStatus::Canceling as u8, Ordering::Release);
    }

    pub(crate) fn mark_idle(&self) {
        let _guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cancel.store(false, Ordering::Release);
        self.status.store(AsyncStatus::Idle as u8, Ordering::Release);
        self.idle.notify_all();
    }

    /// Ask a running stream to stop. Returns whether a stream was active.
    pub fn request_cancel(&self) -> bool {
        match self.status() {
            AsyncStatus::Idle => false,
            AsyncStatus::Starting => {
                self.cancel.store(true, Ordering::Release);
                true
            }
            AsyncStatus::Running | AsyncStatus::Canceling => {
                self.cancel.store(true, Ordering::Release);
                let _ = self.status.compare_exchange(
                    AsyncStatus::Running as u8,
                    AsyncStatus::Canceling as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                true
            }
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Block until the stream is idle, at most `timeout` when given.
    /// Returns whether the stream is idle.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.status() != AsyncStatus::Idle {
            match deadline {
                None => {
                    guard = self
                        .idle
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    guard = self
                        .idle
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }
}

/// Stops a stream from another thread or from inside the sample callback.
///
/// The handle does not keep the device alive; once the device is dropped
/// every call reports [`Error::InvalidHandle`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    control: Weak<StreamControl>,
}

impl CancelHandle {
    pub(crate) fn new(control: &Arc<StreamControl>) -> Self {
        CancelHandle {
            control: Arc::downgrade(control),
        }
    }

    fn upgrade(&self) -> Result<Arc<StreamControl>> {
        self.control.upgrade().ok_or(Error::InvalidHandle)
    }

    /// Request cancellation. Not an error when no stream is running.
    pub fn cancel(&self) -> Result<()> {
        let control = self.upgrade()?;
        if control.request_cancel() {
            tracing::debug!("Stream cancel requested");
        }
        Ok(())
    }

    pub fn status(&self) -> Result<AsyncStatus> {
        Ok(self.upgrade()?.status())
    }

    /// Wait for the stream to wind down, at most `timeout` when given.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> Result<bool> {
        Ok(self.upgrade()?.wait_idle(timeout))
    }
}

/// Counters of the last (or current) stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Full buffers received, calibration buffers included.
    pub buffers: u64,
    /// Buffers delivered to the callback.
    pub delivered: u64,
    /// Transfers that completed with fewer bytes than requested.
    pub short_transfers: u64,
    /// Failed transfers since the last successful one.
    pub transfer_errors: u32,
    pub device_lost: bool,
}
