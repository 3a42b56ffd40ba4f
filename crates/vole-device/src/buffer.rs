use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use vole_core::{Error, Result};

use crate::queue::Event;
use crate::{lock, ContextInner};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct BufferState {
    released: bool,
    /// Completion event of the most recent launch that touched the buffer.
    last_use: Option<Event>,
    /// Kernel name and reason, if the launch that produced the contents failed.
    failure: Option<(String, String)>,
}

/// A region of device memory holding `len` f32 values.
///
/// Lifecycle: allocated by [`DeviceBuffer::alloc`], released exactly once,
/// either by [`DeviceBuffer::release`] or, as a backstop, when the last
/// reference drops. Release waits for the last launch that touched the
/// buffer; launches hold a reference for as long as they are outstanding, so
/// the drop backstop can never run under a kernel.
pub struct DeviceBuffer {
    id: u64,
    len: usize,
    ctx: Arc<ContextInner>,
    state: Mutex<BufferState>,
    data: RwLock<Vec<f32>>,
}

impl DeviceBuffer {
    pub(crate) fn alloc(ctx: &Arc<ContextInner>, len: usize) -> Result<Arc<DeviceBuffer>> {
        let data = ctx.memory.alloc(len)?;
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        log::trace!("device {} alloc buffer {id} ({len} f32)", ctx.ordinal);
        Ok(Arc::new(DeviceBuffer {
            id,
            len,
            ctx: Arc::clone(ctx),
            state: Mutex::new(BufferState::default()),
            data: RwLock::new(data),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_released(&self) -> bool {
        lock(&self.state).released
    }

    /// Free the buffer. Idempotent. Blocks until the last launch that
    /// touched the buffer has completed.
    pub fn release(&self) {
        let pending = {
            let mut state = lock(&self.state);
            if state.released {
                return;
            }
            state.released = true;
            state.last_use.take()
        };
        if let Some(event) = pending {
            event.wait();
        }
        self.free();
        log::trace!("device {} released buffer {}", self.ctx.ordinal, self.id);
    }

    fn free(&self) {
        let mem = {
            let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *data)
        };
        self.ctx.memory.reclaim(mem);
    }

    /// Register a launch on every buffer in `buffers` (sorted by id, no
    /// duplicates). All states are locked together and checked first, so
    /// either every buffer records `done` or none does. Returns the previous
    /// launch events so the caller can fence against them.
    pub(crate) fn begin_use_all(
        buffers: &[&Arc<DeviceBuffer>],
        done: &Event,
    ) -> Result<Vec<(u64, Event)>> {
        let mut states: Vec<MutexGuard<'_, BufferState>> =
            buffers.iter().map(|b| lock(&b.state)).collect();
        for (buffer, state) in buffers.iter().zip(&states) {
            if state.released {
                return Err(Error::BufferReleased { buffer: buffer.id });
            }
            if let Some((kernel, reason)) = &state.failure {
                return Err(Error::DeviceKernelFailure {
                    kernel: kernel.clone(),
                    reason: reason.clone(),
                });
            }
        }
        Ok(buffers
            .iter()
            .zip(states.iter_mut())
            .filter_map(|(buffer, state)| {
                state
                    .last_use
                    .replace(done.clone())
                    .map(|prev| (buffer.id, prev))
            })
            .collect())
    }

    pub(crate) fn mark_failed(&self, kernel: &str, reason: &str) {
        let mut state = lock(&self.state);
        if state.failure.is_none() {
            state.failure = Some((kernel.to_string(), reason.to_string()));
        }
    }

    pub(crate) fn failure(&self) -> Option<(String, String)> {
        lock(&self.state).failure.clone()
    }

    /// Read access for kernels.
    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Vec<f32>>> {
        let guard = self.data.read().unwrap_or_else(|e| e.into_inner());
        if guard.len() != self.len {
            return Err(Error::BufferReleased { buffer: self.id });
        }
        Ok(guard)
    }

    /// Write access for kernels.
    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<f32>>> {
        let guard = self.data.write().unwrap_or_else(|e| e.into_inner());
        if guard.len() != self.len {
            return Err(Error::BufferReleased { buffer: self.id });
        }
        Ok(guard)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if !state.released {
            state.released = true;
            log::debug!("device buffer {} reclaimed by drop guard", self.id);
            self.free();
        }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceBuffer(id={}, len={}, released={})",
            self.id,
            self.len,
            self.is_released()
        )
    }
}
