use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use vole_core::{BackendKind, Error, Layout, Result, Shape};

use crate::backprop;
use crate::device::Device;
use crate::grad_mode;
use crate::op::{GradContext, TensorId};
use crate::storage::Storage;

// Tensor — the handle every caller works with
//
// A Tensor is an Arc around TensorInner, so cloning is O(1) and the autograd
// graph can hold its inputs without copying data. Views (transpose, narrow,
// expand, reshape of contiguous data) share the inner `Arc<SharedStorage>`
// and differ only in layout.
//
// AUTOGRAD STATE:
//
//   requires_grad = false              → Untracked (constants)
//   requires_grad, grad slot empty     → Pending
//   requires_grad, grad slot filled    → Resolved (after a backward pass)
//
//   Leaves get `requires_grad` from `with_grad()`. Results of recorded
//   operations get it from their inputs, together with a GradContext that
//   names the backward rule. The context is taken out and dropped when a
//   backward pass visits the node.
//
// Every in-place write bumps a version counter shared by all views of the
// storage. Contexts remember the versions they saw, so a graph whose saved
// data was overwritten fails at backward instead of using the new values.

/// Where a tensor is in the autograd lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradState {
    /// No gradient flows to this tensor.
    Untracked,
    /// Tracked, no backward pass has reached it yet.
    Pending,
    /// Tracked, holds an accumulated gradient.
    Resolved,
}

struct SharedStorage {
    data: RwLock<Storage>,
    version: AtomicU64,
}

impl SharedStorage {
    fn new(storage: Storage) -> Arc<SharedStorage> {
        Arc::new(SharedStorage {
            data: RwLock::new(storage),
            version: AtomicU64::new(0),
        })
    }
}

struct TensorInner {
    id: TensorId,
    storage: Arc<SharedStorage>,
    layout: Layout,
    device: Device,
    requires_grad: bool,
    ctx: Mutex<Option<GradContext>>,
    grad: Mutex<Option<Tensor>>,
}

/// An N-dimensional array of f32 on the CPU or on a device queue.
///
/// ```ignore
/// let dev = Device::Cpu;
/// let a = Tensor::from_data(vec![1.0, 2.0, 3.0, 4.0], (2, 2), &dev)?;
/// let w = Tensor::ones((2, 2), &dev)?.with_grad();
/// let loss = a.matmul(&w)?.sum_all()?;
/// loss.backward()?;
/// let dw = w.grad().unwrap();
/// ```
pub struct Tensor {
    inner: Arc<TensorInner>,
}

impl Clone for Tensor {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, device={}, grad={:?})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.device,
            self.grad_state(),
        )
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Tensor {
    // Internal constructors

    pub(crate) fn from_storage(storage: Storage, layout: Layout, device: Device) -> Tensor {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: SharedStorage::new(storage),
                layout,
                device,
                requires_grad: false,
                ctx: Mutex::new(None),
                grad: Mutex::new(None),
            }),
        }
    }

    /// Untracked view sharing this tensor's storage.
    pub(crate) fn with_layout(&self, layout: Layout) -> Tensor {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                device: self.inner.device.clone(),
                requires_grad: false,
                ctx: Mutex::new(None),
                grad: Mutex::new(None),
            }),
        }
    }

    /// Attach a graph node to a freshly computed result. The id is minted
    /// here, so it is newer than every input's.
    pub(crate) fn tracked(self, ctx: GradContext) -> Tensor {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                device: self.inner.device.clone(),
                requires_grad: true,
                ctx: Mutex::new(Some(ctx)),
                grad: Mutex::new(None),
            }),
        }
    }

    /// Fresh contiguous copy, untracked.
    pub(crate) fn copy(&self) -> Result<Tensor> {
        let storage = self.storage().to_contiguous(self.layout())?;
        Ok(Tensor::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.device().clone(),
        ))
    }

    // Construction

    pub fn full(shape: impl Into<Shape>, value: f32, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        shape.check_positive("full")?;
        let storage = Storage::full(&shape, value, device)?;
        Ok(Tensor::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    pub fn zeros(shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        Self::full(shape, 0.0, device)
    }

    pub fn ones(shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        Self::full(shape, 1.0, device)
    }

    pub fn zeros_like(&self) -> Result<Tensor> {
        Self::zeros(self.shape(), self.device())
    }

    pub fn ones_like(&self) -> Result<Tensor> {
        Self::ones(self.shape(), self.device())
    }

    /// A rank-0 tensor.
    pub fn scalar(value: f32, device: &Device) -> Result<Tensor> {
        Self::full(Shape::scalar(), value, device)
    }

    /// Build a tensor from row-major data.
    pub fn from_data(data: Vec<f32>, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        shape.check_positive("from_data")?;
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCount {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = Storage::from_vec(data, device)?;
        Ok(Tensor::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    /// Uniform samples in `[0, 1)`. A seed makes the values reproducible
    /// across backends.
    pub fn random(shape: impl Into<Shape>, seed: Option<u64>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let mut rng = rng(seed);
        let data = (0..shape.elem_count()).map(|_| rng.gen::<f32>()).collect();
        Self::from_data(data, shape, device)
    }

    /// Standard normal samples.
    pub fn randn(shape: impl Into<Shape>, seed: Option<u64>, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let normal = Normal::new(0.0f32, 1.0).map_err(|e| Error::msg(e.to_string()))?;
        let mut rng = rng(seed);
        let data = (0..shape.elem_count())
            .map(|_| normal.sample(&mut rng))
            .collect();
        Self::from_data(data, shape, device)
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn strides(&self) -> &[usize] {
        self.inner.layout.strides()
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.device.kind()
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// Whether two handles read the same storage (one is a view of the other).
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    pub(crate) fn storage(&self) -> RwLockReadGuard<'_, Storage> {
        self.inner
            .storage
            .data
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Write access. Counts as a modification of every view of the storage.
    fn storage_mut(&self) -> RwLockWriteGuard<'_, Storage> {
        self.inner.storage.version.fetch_add(1, Ordering::AcqRel);
        self.inner
            .storage
            .data
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Number of in-place writes the storage has seen.
    pub(crate) fn version(&self) -> u64 {
        self.inner.storage.version.load(Ordering::Acquire)
    }

    /// Run `f` over both operands' storages, locking once when they share it.
    pub(crate) fn read_pair<R>(
        &self,
        other: &Tensor,
        f: impl FnOnce(&Storage, &Storage) -> Result<R>,
    ) -> Result<R> {
        if self.shares_storage(other) {
            let s = self.storage();
            f(&s, &s)
        } else {
            let a = self.storage();
            let b = other.storage();
            f(&a, &b)
        }
    }

    // Reading

    /// Logical elements in row-major order. Blocks on device tensors until
    /// their queue has produced the data.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        self.storage().to_vec(self.layout())
    }

    /// The single value of a one-element tensor.
    pub fn to_scalar(&self) -> Result<f32> {
        if self.elem_count() != 1 {
            return Err(Error::shape("to_scalar", self.shape(), &Shape::scalar()));
        }
        self.get(&vec![0; self.rank()])
    }

    /// Element at a multi-index (respects strides and offset).
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        let offset = self.layout().offset_of(index)?;
        self.storage().read_at(offset)
    }

    // In-place

    fn check_writable(&self, op: &'static str) -> Result<()> {
        if self.inner.requires_grad && grad_mode::is_grad_enabled() {
            return Err(Error::InPlaceOnTracked { op });
        }
        if !self.layout().has_unique_offsets() {
            return Err(Error::msg(format!(
                "{op}: cannot write through a broadcast view of shape {}",
                self.shape()
            )));
        }
        Ok(())
    }

    /// Write one element. Views sharing the storage observe the change.
    pub fn set(&self, index: &[usize], value: f32) -> Result<()> {
        self.check_writable("set")?;
        let offset = self.layout().offset_of(index)?;
        let cell = Layout::new(Shape::scalar(), Vec::new(), offset);
        self.storage_mut().fill(&cell, value)
    }

    /// Overwrite every element. Views sharing the storage observe the change.
    pub fn fill_(&self, value: f32) -> Result<()> {
        self.check_writable("fill_")?;
        self.storage_mut().fill(self.layout(), value)
    }

    pub fn add_scalar_(&self, value: f32) -> Result<()> {
        self.check_writable("add_scalar_")?;
        self.storage_mut().affine_in_place(self.layout(), 1.0, value)
    }

    pub fn mul_scalar_(&self, value: f32) -> Result<()> {
        self.check_writable("mul_scalar_")?;
        self.storage_mut().affine_in_place(self.layout(), value, 0.0)
    }

    /// Copy `src` into the elements this handle's layout addresses.
    pub(crate) fn assign_from(&self, src: &Tensor) -> Result<()> {
        if src.shape() != self.shape() {
            return Err(Error::shape("assign", self.shape(), src.shape()));
        }
        let src = if self.shares_storage(src) {
            src.copy()?
        } else {
            src.clone()
        };
        let values = src.storage();
        self.storage_mut()
            .assign(self.layout(), &values, src.layout())
    }

    // Transfer and lifetime

    /// Copy to another device in bulk. The result does not track gradients;
    /// on the same device it is a detached handle to the same storage.
    pub fn to(&self, device: &Device) -> Result<Tensor> {
        if device == self.device() {
            return Ok(self.detach());
        }
        let data = self.to_vec()?;
        log::trace!(
            "transfer {} elements {} -> {}",
            data.len(),
            self.device(),
            device
        );
        Tensor::from_data(data, self.shape().clone(), device)
    }

    /// Free device memory now instead of waiting for the last handle to drop.
    /// Idempotent. Every view of the storage becomes unusable and later
    /// operations on it fail with `BufferReleased`. A no-op on the CPU.
    pub fn release(&self) {
        self.storage().release()
    }

    pub fn is_released(&self) -> bool {
        self.storage().is_released()
    }

    // Autograd

    /// A new leaf that accumulates gradients, sharing this tensor's data.
    /// Each call yields a distinct graph node.
    pub fn with_grad(self) -> Tensor {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                device: self.inner.device.clone(),
                requires_grad: true,
                ctx: Mutex::new(None),
                grad: Mutex::new(None),
            }),
        }
    }

    /// Same data, cut from the graph.
    pub fn detach(&self) -> Tensor {
        self.with_layout(self.layout().clone())
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    pub fn grad_state(&self) -> GradState {
        if !self.inner.requires_grad {
            GradState::Untracked
        } else if lock(&self.inner.grad).is_some() {
            GradState::Resolved
        } else {
            GradState::Pending
        }
    }

    /// The accumulated gradient, if a backward pass has reached this tensor.
    pub fn grad(&self) -> Option<Tensor> {
        lock(&self.inner.grad).clone()
    }

    pub fn zero_grad(&self) {
        lock(&self.inner.grad).take();
    }

    /// Whether this tensor still carries the node that produced it.
    pub fn has_grad_context(&self) -> bool {
        lock(&self.inner.ctx).is_some()
    }

    pub(crate) fn accumulate_grad(&self, grad: &Tensor) -> Result<()> {
        let mut slot = lock(&self.inner.grad);
        let sum = match slot.as_ref() {
            Some(existing) => existing.add(grad)?,
            None => grad.clone(),
        };
        *slot = Some(sum);
        Ok(())
    }

    pub(crate) fn ctx_inputs(&self) -> Vec<Tensor> {
        lock(&self.inner.ctx)
            .as_ref()
            .map(|ctx| ctx.inputs().to_vec())
            .unwrap_or_default()
    }

    pub(crate) fn take_ctx(&self) -> Option<GradContext> {
        lock(&self.inner.ctx).take()
    }

    /// Backpropagate from this tensor with an upstream gradient of ones.
    ///
    /// A no-op on tensors without an autograd context.
    pub fn backward(&self) -> Result<()> {
        if !self.has_grad_context() {
            return Ok(());
        }
        let seed = Tensor::ones(self.shape(), self.device())?;
        backprop::backward(self, &seed)
    }

    /// Backpropagate with an explicit upstream gradient of this tensor's
    /// shape.
    pub fn backward_with(&self, grad: &Tensor) -> Result<()> {
        if !self.has_grad_context() {
            return Ok(());
        }
        backprop::backward(self, grad)
    }
}

fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}
