use std::fmt;

use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// Backend — the capability set every kernel implements
//
// A backend owns two concepts:
//   - Device:  where computation happens (the CPU, or a device queue)
//   - Storage: a flat f32 buffer living on that device
//
// Every operation receives storages together with their layouts, so kernels
// can read strided views without the façade copying first. Outputs are always
// fresh contiguous storages unless the method says it mutates in place.

/// Which kernel backs a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Cpu,
    Device,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "cpu"),
            BackendKind::Device => write!(f, "device"),
        }
    }
}

/// Elementwise binary operations (with broadcasting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Maximum,
    /// 1.0 where equal, 0.0 elsewhere.
    Eq,
}

impl BinaryOp {
    #[inline]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Maximum => a.max(b),
            BinaryOp::Eq => f32::from(a == b),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Eq => "eq",
        }
    }
}

/// Elementwise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
    Silu,
    /// Heaviside step: 1.0 for x > 0, else 0.0. Derivative of relu.
    Step,
    Sign,
    /// d/dx gelu(x), tanh approximation.
    GeluGrad,
    /// d/dx silu(x).
    SiluGrad,
}

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEFF: f32 = 0.044_715;

impl UnaryOp {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Gelu => {
                let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
                0.5 * x * (1.0 + inner.tanh())
            }
            UnaryOp::Silu => x / (1.0 + (-x).exp()),
            UnaryOp::Step => f32::from(x > 0.0),
            UnaryOp::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            UnaryOp::GeluGrad => {
                let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
                let t = inner.tanh();
                let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x * x);
                0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
            }
            UnaryOp::SiluGrad => {
                let s = 1.0 / (1.0 + (-x).exp());
                s * (1.0 + x * (1.0 - s))
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Gelu => "gelu",
            UnaryOp::Silu => "silu",
            UnaryOp::Step => "step",
            UnaryOp::Sign => "sign",
            UnaryOp::GeluGrad => "gelu_grad",
            UnaryOp::SiluGrad => "silu_grad",
        }
    }
}

/// Reductions over one dimension or the whole tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
    /// Index of the maximum, stored as f32.
    ArgMax,
    ArgMin,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Mean => "mean",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
            ReduceOp::ArgMax => "argmax",
            ReduceOp::ArgMin => "argmin",
        }
    }

    /// Fold a run of values (the reduced axis for one output element).
    pub fn fold(self, values: impl Iterator<Item = f32>) -> f32 {
        match self {
            ReduceOp::Sum => values.sum(),
            ReduceOp::Mean => {
                let (sum, n) = values.fold((0.0f32, 0usize), |(s, n), v| (s + v, n + 1));
                sum / n.max(1) as f32
            }
            ReduceOp::Max => values.fold(f32::NEG_INFINITY, f32::max),
            ReduceOp::Min => values.fold(f32::INFINITY, f32::min),
            ReduceOp::ArgMax => arg_best(values, |v, best| v > best),
            ReduceOp::ArgMin => arg_best(values, |v, best| v < best),
        }
    }
}

fn arg_best(values: impl Iterator<Item = f32>, better: impl Fn(f32, f32) -> bool) -> f32 {
    let mut best_idx = 0usize;
    let mut best = None;
    for (i, v) in values.enumerate() {
        match best {
            Some(b) if !better(v, b) => {}
            _ => {
                best = Some(v);
                best_idx = i;
            }
        }
    }
    best_idx as f32
}

/// Logical batched matmul geometry: `[lhs_batch, m, k] @ [rhs_batch, k, n]`
/// producing `[batch, m, n]`. A batch of 1 on either side is broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulDims {
    pub batch: usize,
    pub lhs_batch: usize,
    pub rhs_batch: usize,
    pub m: usize,
    pub k: usize,
    pub n: usize,
}

impl MatmulDims {
    /// Validate two operand shapes (rank >= 2) and derive the geometry plus
    /// the output shape. Leading (batch) dims are flattened; after left-padding
    /// with ones they must match exactly or one side must have a single batch.
    /// The output keeps the longer batch prefix.
    pub fn from_shapes(lhs: &Shape, rhs: &Shape) -> Result<(MatmulDims, Shape)> {
        if lhs.rank() < 2 || rhs.rank() < 2 {
            return Err(Error::Rank {
                op: "matmul",
                expected: 2,
                got: lhs.rank().min(rhs.rank()),
            });
        }
        let (l_batch_dims, l_mat) = lhs.dims().split_at(lhs.rank() - 2);
        let (r_batch_dims, r_mat) = rhs.dims().split_at(rhs.rank() - 2);
        let (m, k) = (l_mat[0], l_mat[1]);
        let (k2, n) = (r_mat[0], r_mat[1]);
        if k != k2 {
            return Err(Error::shape("matmul", lhs, rhs));
        }

        let lhs_batch: usize = l_batch_dims.iter().product();
        let rhs_batch: usize = r_batch_dims.iter().product();
        // Left-pad the shorter prefix with ones so both have the same rank.
        let batch_rank = l_batch_dims.len().max(r_batch_dims.len());
        let pad = |d: &[usize]| -> Vec<usize> {
            std::iter::repeat(1)
                .take(batch_rank - d.len())
                .chain(d.iter().copied())
                .collect()
        };
        let (l_padded, r_padded) = (pad(l_batch_dims), pad(r_batch_dims));
        let mut out = if l_padded == r_padded || rhs_batch == 1 {
            l_padded
        } else if lhs_batch == 1 {
            r_padded
        } else {
            return Err(Error::shape("matmul", lhs, rhs));
        };
        out.extend([m, n]);
        let dims = MatmulDims {
            batch: lhs_batch.max(rhs_batch),
            lhs_batch,
            rhs_batch,
            m,
            k,
            n,
        };
        Ok((dims, Shape::new(out)))
    }

    /// Batch index into an operand with `operand_batch` matrices.
    #[inline]
    pub fn clamp(b: usize, operand_batch: usize) -> usize {
        if operand_batch == 1 {
            0
        } else {
            b
        }
    }

    /// Multiply-adds performed.
    pub fn flops(&self) -> usize {
        self.batch * self.m * self.k * self.n
    }
}

/// Geometry of a 2D convolution lowered to im2col.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dGeometry {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride: [usize; 2],
    pub padding: [usize; 2],
}

impl Conv2dGeometry {
    pub fn out_h(&self) -> usize {
        (self.height + 2 * self.padding[0] - self.kernel_h) / self.stride[0] + 1
    }

    pub fn out_w(&self) -> usize {
        (self.width + 2 * self.padding[1] - self.kernel_w) / self.stride[1] + 1
    }

    /// Rows of one column matrix: `channels * kernel_h * kernel_w`.
    pub fn col_rows(&self) -> usize {
        self.channels * self.kernel_h * self.kernel_w
    }

    /// Shape of the im2col output: `[batch, C*kh*kw, out_h*out_w]`.
    pub fn col_shape(&self) -> Shape {
        Shape::new(vec![
            self.batch,
            self.col_rows(),
            self.out_h() * self.out_w(),
        ])
    }

    pub fn input_shape(&self) -> Shape {
        Shape::new(vec![self.batch, self.channels, self.height, self.width])
    }

    /// Source position in the (unpadded) image for column entry
    /// `(c, ki, kj)` at output pixel `(oh, ow)`, or None inside padding.
    #[inline]
    pub fn source(&self, ki: usize, kj: usize, oh: usize, ow: usize) -> Option<(usize, usize)> {
        let h = (oh * self.stride[0] + ki).checked_sub(self.padding[0])?;
        let w = (ow * self.stride[1] + kj).checked_sub(self.padding[1])?;
        (h < self.height && w < self.width).then_some((h, w))
    }
}

/// Identifies a compute device.
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Human-readable name (e.g. "cpu", "device:0/queue:1").
    fn name(&self) -> String;
}

/// A flat buffer of f32 owned by a backend.
pub trait BackendStorage: Clone + fmt::Debug + Send + Sync + 'static {
    /// Number of f32 slots.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The operation set both kernels implement.
///
/// Static methods on a marker type: the tensor façade matches on its backend
/// tag once and calls the corresponding implementation. Outputs are
/// contiguous in the row-major layout of the result shape.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    // Creation

    fn zeros(shape: &Shape, device: &Self::Device) -> Result<Self::Storage> {
        Self::full(shape, 0.0, device)
    }

    fn full(shape: &Shape, value: f32, device: &Self::Device) -> Result<Self::Storage>;

    /// Upload host data (already laid out row-major).
    fn from_vec(data: Vec<f32>, device: &Self::Device) -> Result<Self::Storage>;

    /// Download the logical elements of `layout` in row-major order.
    fn to_vec(storage: &Self::Storage, layout: &Layout) -> Result<Vec<f32>>;

    /// Strided copy into a fresh contiguous storage.
    fn to_contiguous(storage: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    // Elementwise

    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    fn unary_op(op: UnaryOp, storage: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// `x * mul + add`.
    fn affine(storage: &Self::Storage, layout: &Layout, mul: f32, add: f32)
        -> Result<Self::Storage>;

    fn powf(storage: &Self::Storage, layout: &Layout, exponent: f32) -> Result<Self::Storage>;

    // Reductions

    /// Reduce over `dim`, or over everything when `dim` is None. The output
    /// holds `outer * inner` elements (one when reducing everything).
    fn reduce_op(
        op: ReduceOp,
        storage: &Self::Storage,
        layout: &Layout,
        dim: Option<usize>,
    ) -> Result<Self::Storage>;

    /// Numerically stable softmax over the last dimension with temperature.
    fn softmax_last_dim(
        storage: &Self::Storage,
        layout: &Layout,
        temperature: f32,
    ) -> Result<Self::Storage>;

    // Linear algebra

    /// Batched matmul over operands whose layouts hold `[.., m, k]` and
    /// `[.., k, n]`. Batch broadcasting follows `dims`.
    fn matmul(
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
        dims: &MatmulDims,
    ) -> Result<Self::Storage>;

    /// `[N, C, H, W]` → `[N, C*kh*kw, out_h*out_w]`.
    fn im2col(
        storage: &Self::Storage,
        layout: &Layout,
        geometry: &Conv2dGeometry,
    ) -> Result<Self::Storage>;

    /// Adjoint of im2col: scatter-add columns back to `[N, C, H, W]`.
    fn col2im(
        storage: &Self::Storage,
        layout: &Layout,
        geometry: &Conv2dGeometry,
    ) -> Result<Self::Storage>;

    // In place

    /// Copy `src` (read through `src_layout`) into the positions of `dst`
    /// described by `dst_layout`. Both layouts must have the same shape.
    fn assign(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        src: &Self::Storage,
        src_layout: &Layout,
    ) -> Result<()>;

    fn fill(storage: &mut Self::Storage, layout: &Layout, value: f32) -> Result<()>;

    fn affine_in_place(
        storage: &mut Self::Storage,
        layout: &Layout,
        mul: f32,
        add: f32,
    ) -> Result<()>;

    /// Read one storage slot.
    fn read_at(storage: &Self::Storage, offset: usize) -> Result<f32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_dims_batched() {
        let (dims, out) =
            MatmulDims::from_shapes(&Shape::from((4, 2, 3)), &Shape::from((3, 5))).unwrap();
        assert_eq!(out.dims(), &[4, 2, 5]);
        assert_eq!((dims.batch, dims.lhs_batch, dims.rhs_batch), (4, 4, 1));

        let (dims, out) =
            MatmulDims::from_shapes(&Shape::from((2, 3)), &Shape::from((6, 3, 5))).unwrap();
        assert_eq!(out.dims(), &[6, 2, 5]);
        assert_eq!(dims.lhs_batch, 1);
    }

    #[test]
    fn test_matmul_dims_keeps_longer_unit_prefix() {
        let (dims, out) =
            MatmulDims::from_shapes(&Shape::from((3, 4, 5)), &Shape::from((1, 1, 5, 6))).unwrap();
        assert_eq!(out.dims(), &[1, 3, 4, 6]);
        assert_eq!((dims.batch, dims.lhs_batch, dims.rhs_batch), (3, 3, 1));

        let (dims, out) =
            MatmulDims::from_shapes(&Shape::from((1, 1, 4, 5)), &Shape::from((3, 5, 6))).unwrap();
        assert_eq!(out.dims(), &[1, 3, 4, 6]);
        assert_eq!((dims.batch, dims.lhs_batch, dims.rhs_batch), (3, 1, 3));

        let (_, out) =
            MatmulDims::from_shapes(&Shape::from((1, 2, 3)), &Shape::from((1, 1, 3, 2))).unwrap();
        assert_eq!(out.dims(), &[1, 1, 2, 2]);

        let (_, out) =
            MatmulDims::from_shapes(&Shape::from((1, 3, 2, 4)), &Shape::from((3, 4, 2))).unwrap();
        assert_eq!(out.dims(), &[1, 3, 2, 2]);
    }

    #[test]
    fn test_matmul_dims_rejects_inner_mismatch() {
        let err = MatmulDims::from_shapes(&Shape::from((2, 3)), &Shape::from((4, 5))).unwrap_err();
        assert!(matches!(err, Error::Shape { op: "matmul", .. }));
        assert!(
            MatmulDims::from_shapes(&Shape::from((2, 2, 3)), &Shape::from((4, 3, 5))).is_err()
        );
    }

    #[test]
    fn test_reduce_fold() {
        let v = [3.0, -1.0, 7.0, 2.0];
        assert_eq!(ReduceOp::Sum.fold(v.into_iter()), 11.0);
        assert_eq!(ReduceOp::Mean.fold(v.into_iter()), 2.75);
        assert_eq!(ReduceOp::Max.fold(v.into_iter()), 7.0);
        assert_eq!(ReduceOp::Min.fold(v.into_iter()), -1.0);
        assert_eq!(ReduceOp::ArgMax.fold(v.into_iter()), 2.0);
        assert_eq!(ReduceOp::ArgMin.fold(v.into_iter()), 1.0);
    }

    #[test]
    fn test_conv_geometry() {
        let g = Conv2dGeometry {
            batch: 1,
            channels: 1,
            height: 4,
            width: 4,
            kernel_h: 3,
            kernel_w: 3,
            stride: [1, 1],
            padding: [1, 1],
        };
        assert_eq!((g.out_h(), g.out_w()), (4, 4));
        assert_eq!(g.source(0, 0, 0, 0), None);
        assert_eq!(g.source(1, 1, 0, 0), Some((0, 0)));
    }
}
