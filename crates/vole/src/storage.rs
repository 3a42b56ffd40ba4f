// Storage — backend dispatch
//
// A tensor's data is either a CPU vector or a device buffer. Every operation
// matches on the tag exactly once here and forwards to the corresponding
// `Backend` implementation. Operands on different backends are rejected with
// BackendMismatch; moving data is always an explicit `Tensor::to`.

use vole_core::{
    Backend, BackendKind, BackendStorage, BinaryOp, Conv2dGeometry, Error, Layout, MatmulDims,
    ReduceOp, Result, Shape, UnaryOp,
};
use vole_cpu::{CpuBackend, CpuDevice, CpuStorage};
use vole_device::{DeviceBackend, DeviceStorage};

use crate::device::Device;

#[derive(Debug, Clone)]
pub enum Storage {
    Cpu(CpuStorage),
    Device(DeviceStorage),
}

/// Forward a single-operand call to whichever backend holds the storage.
macro_rules! dispatch {
    ($storage:expr, $method:ident($($arg:expr),*)) => {
        match $storage {
            Storage::Cpu(s) => CpuBackend::$method(s, $($arg),*).map(Storage::Cpu),
            Storage::Device(s) => DeviceBackend::$method(s, $($arg),*).map(Storage::Device),
        }
    };
}

fn mismatch(op: &'static str, lhs: &Storage, rhs: &Storage) -> Error {
    Error::BackendMismatch {
        op,
        lhs: lhs.kind(),
        rhs: rhs.kind(),
    }
}

impl Storage {
    pub fn kind(&self) -> BackendKind {
        match self {
            Storage::Cpu(_) => BackendKind::Cpu,
            Storage::Device(_) => BackendKind::Device,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Storage::Cpu(s) => s.len(),
            Storage::Device(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn full(shape: &Shape, value: f32, device: &Device) -> Result<Storage> {
        match device {
            Device::Cpu => CpuBackend::full(shape, value, &CpuDevice).map(Storage::Cpu),
            Device::Device(q) => DeviceBackend::full(shape, value, q).map(Storage::Device),
        }
    }

    pub(crate) fn from_vec(data: Vec<f32>, device: &Device) -> Result<Storage> {
        match device {
            Device::Cpu => CpuBackend::from_vec(data, &CpuDevice).map(Storage::Cpu),
            Device::Device(q) => DeviceBackend::from_vec(data, q).map(Storage::Device),
        }
    }

    pub(crate) fn to_vec(&self, layout: &Layout) -> Result<Vec<f32>> {
        match self {
            Storage::Cpu(s) => CpuBackend::to_vec(s, layout),
            Storage::Device(s) => DeviceBackend::to_vec(s, layout),
        }
    }

    pub(crate) fn read_at(&self, offset: usize) -> Result<f32> {
        match self {
            Storage::Cpu(s) => CpuBackend::read_at(s, offset),
            Storage::Device(s) => DeviceBackend::read_at(s, offset),
        }
    }

    pub(crate) fn to_contiguous(&self, layout: &Layout) -> Result<Storage> {
        dispatch!(self, to_contiguous(layout))
    }

    pub(crate) fn unary(&self, op: UnaryOp, layout: &Layout) -> Result<Storage> {
        match self {
            Storage::Cpu(s) => CpuBackend::unary_op(op, s, layout).map(Storage::Cpu),
            Storage::Device(s) => DeviceBackend::unary_op(op, s, layout).map(Storage::Device),
        }
    }

    pub(crate) fn affine(&self, layout: &Layout, mul: f32, add: f32) -> Result<Storage> {
        dispatch!(self, affine(layout, mul, add))
    }

    pub(crate) fn powf(&self, layout: &Layout, exponent: f32) -> Result<Storage> {
        dispatch!(self, powf(layout, exponent))
    }

    pub(crate) fn reduce(
        &self,
        op: ReduceOp,
        layout: &Layout,
        dim: Option<usize>,
    ) -> Result<Storage> {
        match self {
            Storage::Cpu(s) => CpuBackend::reduce_op(op, s, layout, dim).map(Storage::Cpu),
            Storage::Device(s) => DeviceBackend::reduce_op(op, s, layout, dim).map(Storage::Device),
        }
    }

    pub(crate) fn softmax_last_dim(&self, layout: &Layout, temperature: f32) -> Result<Storage> {
        dispatch!(self, softmax_last_dim(layout, temperature))
    }

    pub(crate) fn im2col(&self, layout: &Layout, geometry: &Conv2dGeometry) -> Result<Storage> {
        dispatch!(self, im2col(layout, geometry))
    }

    pub(crate) fn col2im(&self, layout: &Layout, geometry: &Conv2dGeometry) -> Result<Storage> {
        dispatch!(self, col2im(layout, geometry))
    }

    pub(crate) fn binary(
        &self,
        op: BinaryOp,
        lhs_layout: &Layout,
        rhs: &Storage,
        rhs_layout: &Layout,
    ) -> Result<Storage> {
        match (self, rhs) {
            (Storage::Cpu(a), Storage::Cpu(b)) => {
                CpuBackend::binary_op(op, a, lhs_layout, b, rhs_layout).map(Storage::Cpu)
            }
            (Storage::Device(a), Storage::Device(b)) => {
                DeviceBackend::binary_op(op, a, lhs_layout, b, rhs_layout).map(Storage::Device)
            }
            _ => Err(mismatch(op.name(), self, rhs)),
        }
    }

    pub(crate) fn matmul(
        &self,
        lhs_layout: &Layout,
        rhs: &Storage,
        rhs_layout: &Layout,
        dims: &MatmulDims,
    ) -> Result<Storage> {
        match (self, rhs) {
            (Storage::Cpu(a), Storage::Cpu(b)) => {
                CpuBackend::matmul(a, lhs_layout, b, rhs_layout, dims).map(Storage::Cpu)
            }
            (Storage::Device(a), Storage::Device(b)) => {
                DeviceBackend::matmul(a, lhs_layout, b, rhs_layout, dims).map(Storage::Device)
            }
            _ => Err(mismatch("matmul", self, rhs)),
        }
    }

    pub(crate) fn assign(
        &mut self,
        dst_layout: &Layout,
        src: &Storage,
        src_layout: &Layout,
    ) -> Result<()> {
        match (&mut *self, src) {
            (Storage::Cpu(d), Storage::Cpu(s)) => CpuBackend::assign(d, dst_layout, s, src_layout),
            (Storage::Device(d), Storage::Device(s)) => {
                DeviceBackend::assign(d, dst_layout, s, src_layout)
            }
            _ => Err(mismatch("assign", self, src)),
        }
    }

    pub(crate) fn fill(&mut self, layout: &Layout, value: f32) -> Result<()> {
        match self {
            Storage::Cpu(s) => CpuBackend::fill(s, layout, value),
            Storage::Device(s) => DeviceBackend::fill(s, layout, value),
        }
    }

    pub(crate) fn affine_in_place(&mut self, layout: &Layout, mul: f32, add: f32) -> Result<()> {
        match self {
            Storage::Cpu(s) => CpuBackend::affine_in_place(s, layout, mul, add),
            Storage::Device(s) => DeviceBackend::affine_in_place(s, layout, mul, add),
        }
    }

    /// Free device memory now. A no-op for CPU storage.
    pub(crate) fn release(&self) {
        if let Storage::Device(s) = self {
            s.release()
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        match self {
            Storage::Cpu(_) => false,
            Storage::Device(s) => s.is_released(),
        }
    }
}
