//! # vole-device
//!
//! The device kernel: tensors whose storage lives in device memory and whose
//! operations run as kernel launches on in-order execution [`Queue`]s.
//!
//! The device is emulated in-process. It has a fixed memory budget, a pool
//! of compute units (its own scheduler, separate from the CPU kernel's),
//! queues served by dedicated workers, and tiled launch geometry, so it
//! exhibits the same ordering, fencing and lifetime rules a discrete
//! accelerator imposes.
//!
//! ```ignore
//! let ctx = DeviceContext::open(&DeviceConfig::default())?;
//! let queue = ctx.queue()?;
//! let a = DeviceBackend::from_vec(vec![1.0, 2.0], &queue)?;
//! ```

mod buffer;
mod kernels;
mod memory;
mod queue;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use vole_core::{
    Backend, BackendStorage, BinaryOp, Conv2dGeometry, Error, Layout, MatmulDims, ReduceOp,
    Result, Shape, UnaryOp,
};

pub use buffer::DeviceBuffer;
pub use memory::PoolStats;
pub use queue::{Event, Grid, Kernel, Queue};

/// Lock a mutex, recovering the data if a kernel panicked while holding it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Device tuning and availability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// When false, [`DeviceContext::open`] reports `DeviceUnavailable`.
    pub enabled: bool,
    /// Device memory budget in bytes.
    pub memory_limit: usize,
    /// Compute units. `None` uses one per available core.
    pub compute_units: Option<usize>,
    /// Matmul tile edge.
    pub tile: usize,
    /// Work-items per work-group for elementwise launches.
    pub block_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            enabled: true,
            memory_limit: 1 << 30,
            compute_units: None,
            tile: 16,
            block_size: 256,
        }
    }
}

static NEXT_ORDINAL: AtomicUsize = AtomicUsize::new(0);

pub(crate) struct ContextInner {
    pub(crate) ordinal: usize,
    pub(crate) config: DeviceConfig,
    pub(crate) memory: memory::MemoryPool,
    pub(crate) compute: rayon::ThreadPool,
}

/// An opened device. Cheap to clone.
#[derive(Clone)]
pub struct DeviceContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl DeviceContext {
    /// Open a device. Fails with the recoverable `DeviceUnavailable` when the
    /// device is disabled or cannot start.
    pub fn open(config: &DeviceConfig) -> Result<DeviceContext> {
        if !config.enabled {
            return Err(Error::DeviceUnavailable(
                "device disabled by configuration".to_string(),
            ));
        }
        if config.tile == 0 || config.block_size == 0 || config.memory_limit == 0 {
            return Err(Error::DeviceUnavailable(format!(
                "invalid device configuration: {config:?}"
            )));
        }
        let ordinal = NEXT_ORDINAL.fetch_add(1, Ordering::Relaxed);
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(move |i| format!("vole-dev{ordinal}-cu{i}"));
        if let Some(units) = config.compute_units {
            builder = builder.num_threads(units);
        }
        let compute = builder
            .build()
            .map_err(|e| Error::DeviceUnavailable(format!("cannot start compute units: {e}")))?;
        log::debug!(
            "opened device {ordinal}: {} compute units, {} bytes, tile {}",
            compute.current_num_threads(),
            config.memory_limit,
            config.tile
        );
        Ok(DeviceContext {
            inner: Arc::new(ContextInner {
                ordinal,
                config: config.clone(),
                memory: memory::MemoryPool::new(config.memory_limit),
                compute,
            }),
        })
    }

    /// Create a new, independent execution queue.
    pub fn queue(&self) -> Result<Queue> {
        Queue::spawn(self.clone())
    }

    pub fn ordinal(&self) -> usize {
        self.inner.ordinal
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn memory_stats(&self) -> PoolStats {
        self.inner.memory.stats()
    }

    /// Drop every cached (freed but not returned) allocation.
    pub fn empty_cache(&self) {
        self.inner.memory.empty_cache()
    }

    pub fn same_device(&self, other: &DeviceContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceContext({})", self.inner.ordinal)
    }
}

/// Device-resident storage: a buffer plus the queue its work is issued on.
#[derive(Debug, Clone)]
pub struct DeviceStorage {
    buffer: Arc<DeviceBuffer>,
    queue: Queue,
}

impl DeviceStorage {
    pub fn buffer(&self) -> &Arc<DeviceBuffer> {
        &self.buffer
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Release the device memory now. Idempotent; later use fails with
    /// `BufferReleased`.
    pub fn release(&self) {
        self.buffer.release()
    }

    pub fn is_released(&self) -> bool {
        self.buffer.is_released()
    }

    fn alloc_like(&self, len: usize) -> Result<DeviceStorage> {
        Ok(DeviceStorage {
            buffer: self.queue.alloc(len)?,
            queue: self.queue.clone(),
        })
    }

    fn block(&self) -> usize {
        self.queue.context().config().block_size
    }
}

impl BackendStorage for DeviceStorage {
    fn len(&self) -> usize {
        self.buffer.len()
    }
}

fn same_device(op: &'static str, a: &DeviceStorage, b: &DeviceStorage) -> Result<()> {
    if a.queue.context().same_device(b.queue.context()) {
        return Ok(());
    }
    Err(Error::msg(format!(
        "{op}: operands live on different devices ({} and {})",
        a.queue.context().ordinal(),
        b.queue.context().ordinal()
    )))
}

/// Contiguous copy when needed, otherwise the storage itself.
fn ensure_contiguous(storage: &DeviceStorage, layout: &Layout) -> Result<DeviceStorage> {
    if layout.is_contiguous() && storage.len() == layout.elem_count() {
        return Ok(storage.clone());
    }
    DeviceBackend::to_contiguous(storage, layout)
}

fn launch_map(
    name: &'static str,
    storage: &DeviceStorage,
    layout: &Layout,
    f: impl Fn(f32) -> f32 + Send + Sync + 'static,
) -> Result<DeviceStorage> {
    let out = storage.alloc_like(layout.elem_count())?;
    let kernel = kernels::map(
        name,
        Arc::clone(&storage.buffer),
        layout.clone(),
        Arc::clone(&out.buffer),
        storage.block(),
        f,
    );
    storage
        .queue
        .launch(kernel, &[&storage.buffer], &[&out.buffer])?;
    Ok(out)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceBackend;

impl Backend for DeviceBackend {
    type Device = Queue;
    type Storage = DeviceStorage;

    fn full(shape: &Shape, value: f32, queue: &Queue) -> Result<DeviceStorage> {
        let layout = Layout::contiguous(shape.clone());
        let out = DeviceStorage {
            buffer: queue.alloc(shape.elem_count())?,
            queue: queue.clone(),
        };
        let kernel = kernels::fill(Arc::clone(&out.buffer), layout, value, out.block());
        queue.launch(kernel, &[], &[&out.buffer])?;
        Ok(out)
    }

    fn from_vec(data: Vec<f32>, queue: &Queue) -> Result<DeviceStorage> {
        let out = DeviceStorage {
            buffer: queue.alloc(data.len())?,
            queue: queue.clone(),
        };
        let kernel = kernels::upload(Arc::clone(&out.buffer), data);
        queue.launch(kernel, &[], &[&out.buffer])?;
        Ok(out)
    }

    fn to_vec(storage: &DeviceStorage, layout: &Layout) -> Result<Vec<f32>> {
        let (tx, rx) = flume::bounded(1);
        let kernel = kernels::download(Arc::clone(&storage.buffer), layout.clone(), tx);
        storage.queue.launch(kernel, &[&storage.buffer], &[])?;
        // Blocks until the queue has drained up to the download.
        match rx.recv() {
            Ok(host) => Ok(host),
            Err(_) => Err(match storage.buffer.failure() {
                Some((kernel, reason)) => Error::DeviceKernelFailure { kernel, reason },
                None => Error::DeviceKernelFailure {
                    kernel: "download".to_string(),
                    reason: format!("buffer {} could not be read", storage.buffer.id()),
                },
            }),
        }
    }

    fn to_contiguous(storage: &DeviceStorage, layout: &Layout) -> Result<DeviceStorage> {
        launch_map("copy_strided", storage, layout, |x| x)
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &DeviceStorage,
        lhs_layout: &Layout,
        rhs: &DeviceStorage,
        rhs_layout: &Layout,
    ) -> Result<DeviceStorage> {
        same_device(op.name(), lhs, rhs)?;
        let shape = Shape::broadcast_shape(lhs_layout.shape(), rhs_layout.shape())
            .map_err(|_| Error::shape(op.name(), lhs_layout.shape(), rhs_layout.shape()))?;
        let lb = lhs_layout.broadcast_as(&shape)?;
        let rb = rhs_layout.broadcast_as(&shape)?;
        let out = lhs.alloc_like(shape.elem_count())?;
        let kernel = kernels::binary(
            op,
            Arc::clone(&lhs.buffer),
            lb,
            Arc::clone(&rhs.buffer),
            rb,
            Arc::clone(&out.buffer),
            lhs.block(),
        );
        lhs.queue
            .launch(kernel, &[&lhs.buffer, &rhs.buffer], &[&out.buffer])?;
        Ok(out)
    }

    fn unary_op(op: UnaryOp, storage: &DeviceStorage, layout: &Layout) -> Result<DeviceStorage> {
        launch_map(op.name(), storage, layout, move |x| op.apply(x))
    }

    fn affine(
        storage: &DeviceStorage,
        layout: &Layout,
        mul: f32,
        add: f32,
    ) -> Result<DeviceStorage> {
        launch_map("affine", storage, layout, move |x| x.mul_add(mul, add))
    }

    fn powf(storage: &DeviceStorage, layout: &Layout, exponent: f32) -> Result<DeviceStorage> {
        launch_map("powf", storage, layout, move |x| x.powf(exponent))
    }

    fn reduce_op(
        op: ReduceOp,
        storage: &DeviceStorage,
        layout: &Layout,
        dim: Option<usize>,
    ) -> Result<DeviceStorage> {
        let out_len = match dim {
            None => 1,
            Some(d) => layout.elem_count() / layout.shape().dim(d)?,
        };
        let src = ensure_contiguous(storage, layout)?;
        let out = storage.alloc_like(out_len)?;
        let kernel = kernels::reduce(
            op,
            Arc::clone(&src.buffer),
            layout.dims().to_vec(),
            dim,
            Arc::clone(&out.buffer),
            storage.block(),
        );
        storage
            .queue
            .launch(kernel, &[&src.buffer], &[&out.buffer])?;
        Ok(out)
    }

    fn softmax_last_dim(
        storage: &DeviceStorage,
        layout: &Layout,
        temperature: f32,
    ) -> Result<DeviceStorage> {
        let cols = layout.dims().last().copied().unwrap_or(1);
        let rows = layout.elem_count() / cols;
        let src = ensure_contiguous(storage, layout)?;
        let out = storage.alloc_like(layout.elem_count())?;
        let kernel = kernels::softmax(
            Arc::clone(&src.buffer),
            rows,
            cols,
            temperature,
            Arc::clone(&out.buffer),
        );
        storage
            .queue
            .launch(kernel, &[&src.buffer], &[&out.buffer])?;
        Ok(out)
    }

    fn matmul(
        lhs: &DeviceStorage,
        lhs_layout: &Layout,
        rhs: &DeviceStorage,
        rhs_layout: &Layout,
        dims: &MatmulDims,
    ) -> Result<DeviceStorage> {
        same_device("matmul", lhs, rhs)?;
        if lhs_layout.elem_count() != dims.lhs_batch * dims.m * dims.k
            || rhs_layout.elem_count() != dims.rhs_batch * dims.k * dims.n
        {
            return Err(Error::shape("matmul", lhs_layout.shape(), rhs_layout.shape()));
        }
        let a = ensure_contiguous(lhs, lhs_layout)?;
        let b = ensure_contiguous(rhs, rhs_layout)?;
        let out = lhs.alloc_like(dims.batch * dims.m * dims.n)?;
        let tile = lhs.queue.context().config().tile;
        let kernel = kernels::matmul_tiled(
            Arc::clone(&a.buffer),
            Arc::clone(&b.buffer),
            *dims,
            Arc::clone(&out.buffer),
            tile,
        );
        lhs.queue
            .launch(kernel, &[&a.buffer, &b.buffer], &[&out.buffer])?;
        Ok(out)
    }

    fn im2col(
        storage: &DeviceStorage,
        layout: &Layout,
        geometry: &Conv2dGeometry,
    ) -> Result<DeviceStorage> {
        let src = ensure_contiguous(storage, layout)?;
        let out = storage.alloc_like(geometry.col_shape().elem_count())?;
        let kernel = kernels::im2col(
            Arc::clone(&src.buffer),
            *geometry,
            Arc::clone(&out.buffer),
            storage.block(),
        );
        storage
            .queue
            .launch(kernel, &[&src.buffer], &[&out.buffer])?;
        Ok(out)
    }

    fn col2im(
        storage: &DeviceStorage,
        layout: &Layout,
        geometry: &Conv2dGeometry,
    ) -> Result<DeviceStorage> {
        let src = ensure_contiguous(storage, layout)?;
        let out = storage.alloc_like(geometry.input_shape().elem_count())?;
        let kernel = kernels::col2im(
            Arc::clone(&src.buffer),
            *geometry,
            Arc::clone(&out.buffer),
            storage.block(),
        );
        storage
            .queue
            .launch(kernel, &[&src.buffer], &[&out.buffer])?;
        Ok(out)
    }

    fn assign(
        dst: &mut DeviceStorage,
        dst_layout: &Layout,
        src: &DeviceStorage,
        src_layout: &Layout,
    ) -> Result<()> {
        same_device("assign", dst, src)?;
        if dst_layout.shape() != src_layout.shape() {
            return Err(Error::shape("assign", dst_layout.shape(), src_layout.shape()));
        }
        let kernel = kernels::assign(
            Arc::clone(&dst.buffer),
            dst_layout.clone(),
            Arc::clone(&src.buffer),
            src_layout.clone(),
            dst.block(),
        );
        dst.queue.launch(kernel, &[&src.buffer], &[&dst.buffer])
    }

    fn fill(storage: &mut DeviceStorage, layout: &Layout, value: f32) -> Result<()> {
        let kernel = kernels::fill(
            Arc::clone(&storage.buffer),
            layout.clone(),
            value,
            storage.block(),
        );
        storage.queue.launch(kernel, &[], &[&storage.buffer])
    }

    fn affine_in_place(
        storage: &mut DeviceStorage,
        layout: &Layout,
        mul: f32,
        add: f32,
    ) -> Result<()> {
        if !layout.is_contiguous() {
            // Compute out of place, then write back through the view.
            let updated = Self::affine(storage, layout, mul, add)?;
            let contiguous = Layout::contiguous(layout.shape().clone());
            return Self::assign(storage, layout, &updated, &contiguous);
        }
        let kernel = kernels::map(
            "affine_in_place",
            Arc::clone(&storage.buffer),
            layout.clone(),
            Arc::clone(&storage.buffer),
            storage.block(),
            move |x| x.mul_add(mul, add),
        );
        storage
            .queue
            .launch(kernel, &[&storage.buffer], &[&storage.buffer])
    }

    fn read_at(storage: &DeviceStorage, offset: usize) -> Result<f32> {
        if offset >= storage.len() {
            return Err(Error::Index {
                index: vec![offset],
                shape: Shape::from(storage.len()),
            });
        }
        let layout = Layout::new(Shape::scalar(), Vec::new(), offset);
        Ok(Self::to_vec(storage, &layout)?[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Queue {
        DeviceContext::open(&DeviceConfig::default())
            .unwrap()
            .queue()
            .unwrap()
    }

    #[test]
    fn test_upload_download() {
        let q = queue();
        let s = DeviceBackend::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &q).unwrap();
        let t = Layout::contiguous((2, 3)).transpose(0, 1).unwrap();
        assert_eq!(
            DeviceBackend::to_vec(&s, &t).unwrap(),
            vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );
        assert_eq!(DeviceBackend::read_at(&s, 4).unwrap(), 5.0);
    }

    #[test]
    fn test_disabled_device_is_recoverable() {
        let config = DeviceConfig {
            enabled: false,
            ..DeviceConfig::default()
        };
        let err = DeviceContext::open(&config).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_reduce_all_and_per_dim() {
        let q = queue();
        let data: Vec<f32> = (0..1000).map(|i| (i % 17) as f32).collect();
        let s = DeviceBackend::from_vec(data.clone(), &q).unwrap();
        let layout = Layout::contiguous((10, 100));
        let sum = DeviceBackend::reduce_op(ReduceOp::Sum, &s, &layout, None).unwrap();
        let expected: f32 = data.iter().sum();
        assert_eq!(
            DeviceBackend::to_vec(&sum, &Layout::contiguous(1usize)).unwrap(),
            vec![expected]
        );

        let argmax = DeviceBackend::reduce_op(ReduceOp::ArgMax, &s, &layout, None).unwrap();
        assert_eq!(DeviceBackend::read_at(&argmax, 0).unwrap(), 16.0);

        let rows = DeviceBackend::reduce_op(ReduceOp::Max, &s, &layout, Some(1)).unwrap();
        assert_eq!(
            DeviceBackend::to_vec(&rows, &Layout::contiguous(10usize)).unwrap(),
            vec![16.0; 10]
        );
    }

    #[test]
    fn test_fill_view_in_place() {
        let q = queue();
        let mut s = DeviceBackend::zeros(&Shape::from((2, 3)), &q).unwrap();
        let col = Layout::contiguous((2, 3)).narrow(1, 2, 1).unwrap();
        DeviceBackend::fill(&mut s, &col, 7.0).unwrap();
        DeviceBackend::affine_in_place(&mut s, &col, 2.0, 0.0).unwrap();
        assert_eq!(
            DeviceBackend::to_vec(&s, &Layout::contiguous((2, 3))).unwrap(),
            vec![0.0, 0.0, 14.0, 0.0, 0.0, 14.0]
        );
    }
}
