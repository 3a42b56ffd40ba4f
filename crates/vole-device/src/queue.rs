// Execution queues
//
// A queue is a FIFO of commands served by one worker thread. Commands are
// sent over a flume channel and executed strictly in order, so a launch that
// reads what an earlier launch on the same queue wrote needs no barrier.
//
// Across queues there is no ordering. Every buffer remembers the completion
// event of the last launch that touched it; when a launch on queue Q uses a
// buffer whose last event belongs to another queue, Q first waits on that
// event. Two queues therefore never touch one buffer without a fence.
// Launches register all their buffers at once under a global order, so the
// fences always point at earlier launches and cannot form a cycle.
//
// Kernel failures are contained: a failing (or panicking) kernel marks the
// buffers it writes as failed, its completion event still fires, and the
// failure surfaces on the next host read or launch involving those buffers.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use vole_core::{BackendDevice, BackendKind, Error, Result};

use crate::buffer::DeviceBuffer;
use crate::{lock, ContextInner, DeviceContext};

/// Serializes buffer registration and enqueue across all queues.
static LAUNCH_ORDER: Mutex<()> = Mutex::new(());

/// A completion marker recorded on a queue.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

struct EventInner {
    queue: usize,
    done: Mutex<bool>,
    cv: Condvar,
}

impl Event {
    fn new(queue: usize) -> Self {
        Event {
            inner: Arc::new(EventInner {
                queue,
                done: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    /// Id of the queue that signals this event.
    pub fn queue_id(&self) -> usize {
        self.inner.queue
    }

    pub fn is_complete(&self) -> bool {
        *lock(&self.inner.done)
    }

    /// Block until the event fires.
    pub fn wait(&self) {
        let mut done = lock(&self.inner.done);
        while !*done {
            done = self.inner.cv.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub(crate) fn signal(&self) {
        *lock(&self.inner.done) = true;
        self.inner.cv.notify_all();
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event(queue={}, complete={})",
            self.inner.queue,
            self.is_complete()
        )
    }
}

/// Launch geometry: a grid of work-groups of `block` work-items each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub x: usize,
    pub y: usize,
    pub z: usize,
    pub block: usize,
}

impl Grid {
    /// One dimension of `ceil(n / block)` groups.
    pub fn linear(n: usize, block: usize) -> Grid {
        Grid {
            x: n.div_ceil(block).max(1),
            y: 1,
            z: 1,
            block,
        }
    }

    /// `ceil(cols / tile) × ceil(rows / tile) × batch` groups of tile² items.
    pub fn tiled(rows: usize, cols: usize, batch: usize, tile: usize) -> Grid {
        Grid {
            x: cols.div_ceil(tile).max(1),
            y: rows.div_ceil(tile).max(1),
            z: batch.max(1),
            block: tile * tile,
        }
    }

    pub fn groups(&self) -> usize {
        self.x * self.y * self.z
    }
}

type KernelBody = Box<dyn FnOnce() -> Result<()> + Send>;

/// A unit of device work.
pub struct Kernel {
    name: &'static str,
    grid: Grid,
    body: KernelBody,
}

impl Kernel {
    pub fn new(
        name: &'static str,
        grid: Grid,
        body: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Self {
        Kernel {
            name,
            grid,
            body: Box::new(body),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }
}

enum Command {
    Launch {
        kernel: Kernel,
        reads: Vec<Arc<DeviceBuffer>>,
        writes: Vec<Arc<DeviceBuffer>>,
        done: Event,
    },
    Wait(Event),
    Signal(Event),
    Shutdown,
}

static NEXT_QUEUE_ID: AtomicUsize = AtomicUsize::new(0);

/// An in-order execution queue on a device.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    id: usize,
    ctx: DeviceContext,
    sender: flume::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Queue {
    pub(crate) fn spawn(ctx: DeviceContext) -> Result<Queue> {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = flume::unbounded();
        let device = Arc::clone(&ctx.inner);
        let worker = std::thread::Builder::new()
            .name(format!("vole-queue-{id}"))
            .spawn(move || serve(id, &device, receiver))
            .map_err(|e| Error::DeviceUnavailable(format!("cannot start queue worker: {e}")))?;
        log::debug!("device {} opened queue {id}", ctx.inner.ordinal);
        Ok(Queue {
            inner: Arc::new(QueueInner {
                id,
                ctx,
                sender,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn context(&self) -> &DeviceContext {
        &self.inner.ctx
    }

    pub(crate) fn ctx_inner(&self) -> &Arc<ContextInner> {
        &self.inner.ctx.inner
    }

    /// Whether two handles refer to the same queue.
    pub fn same_queue(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Allocate a buffer on this queue's device.
    pub fn alloc(&self, len: usize) -> Result<Arc<DeviceBuffer>> {
        DeviceBuffer::alloc(self.ctx_inner(), len)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inner.sender.send(command).map_err(|_| {
            Error::DeviceUnavailable(format!("queue {} worker has stopped", self.inner.id))
        })
    }

    /// Enqueue `kernel`. `reads` and `writes` are the buffers it touches;
    /// they stay alive until the launch completes. Fences against other
    /// queues are inserted as needed.
    ///
    /// Registration and enqueue happen under one process-wide lock, so
    /// launches are totally ordered and a fence only ever waits on a launch
    /// that was enqueued before it.
    pub fn launch(
        &self,
        kernel: Kernel,
        reads: &[&Arc<DeviceBuffer>],
        writes: &[&Arc<DeviceBuffer>],
    ) -> Result<()> {
        let mut touched: Vec<&Arc<DeviceBuffer>> = reads.iter().chain(writes).copied().collect();
        touched.sort_by_key(|b| b.id());
        touched.dedup_by_key(|b| b.id());

        let _order = lock(&LAUNCH_ORDER);
        let done = Event::new(self.inner.id);
        let mut fences = Vec::new();
        for (buffer, prev) in DeviceBuffer::begin_use_all(&touched, &done)? {
            if prev.queue_id() != self.inner.id && !prev.is_complete() {
                log::trace!(
                    "queue {} fences on queue {} for buffer {buffer}",
                    self.inner.id,
                    prev.queue_id()
                );
                fences.push(prev);
            }
        }

        // Once registered, `done` must fire even if the worker is gone, or
        // release of these buffers would block forever.
        for fence in fences {
            if let Err(e) = self.send(Command::Wait(fence)) {
                done.signal();
                return Err(e);
            }
        }
        log::trace!(
            "queue {} launch {} grid {:?}",
            self.inner.id,
            kernel.name,
            kernel.grid
        );
        let launch = Command::Launch {
            kernel,
            reads: reads.iter().map(|b| Arc::clone(b)).collect(),
            writes: writes.iter().map(|b| Arc::clone(b)).collect(),
            done: done.clone(),
        };
        if let Err(e) = self.send(launch) {
            done.signal();
            return Err(e);
        }
        Ok(())
    }

    /// Enqueue a marker that fires once everything before it has run.
    pub fn record(&self) -> Result<Event> {
        let event = Event::new(self.inner.id);
        self.send(Command::Signal(event.clone()))?;
        Ok(event)
    }

    /// Make this queue wait for `event` before running later commands.
    pub fn wait_for(&self, event: &Event) -> Result<()> {
        self.send(Command::Wait(event.clone()))
    }

    /// Block until every command enqueued so far has run.
    pub fn finish(&self) -> Result<()> {
        self.record()?.wait();
        Ok(())
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        let worker = self.worker.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = worker {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                log::error!("queue {} worker panicked", self.id);
            }
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue({})", self.name())
    }
}

impl BackendDevice for Queue {
    fn kind(&self) -> BackendKind {
        BackendKind::Device
    }

    fn name(&self) -> String {
        format!("device:{}/queue:{}", self.inner.ctx.inner.ordinal, self.inner.id)
    }
}

fn serve(id: usize, device: &ContextInner, receiver: flume::Receiver<Command>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Launch {
                kernel,
                reads,
                writes,
                done,
            } => {
                execute(id, device, kernel, &reads, &writes);
                done.signal();
            }
            Command::Wait(event) => event.wait(),
            Command::Signal(event) => event.signal(),
            Command::Shutdown => break,
        }
    }
    log::debug!("queue {id} worker stopped");
}

fn execute(
    id: usize,
    device: &ContextInner,
    kernel: Kernel,
    reads: &[Arc<DeviceBuffer>],
    writes: &[Arc<DeviceBuffer>],
) {
    let Kernel { name, body, .. } = kernel;

    // Inputs produced by a failed launch poison everything downstream.
    let upstream = reads.iter().find_map(|b| b.failure());
    let outcome = match upstream {
        Some((kernel, reason)) => Err(format!("input from failed kernel `{kernel}`: {reason}")),
        None => match catch_unwind(AssertUnwindSafe(|| device.compute.install(body))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "kernel panicked".to_string())),
        },
    };

    if let Err(reason) = outcome {
        log::error!("queue {id}: kernel `{name}` failed: {reason}");
        for buffer in writes {
            buffer.mark_failed(name, &reason);
        }
    }
}
