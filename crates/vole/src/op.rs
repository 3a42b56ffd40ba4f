// Op — graph nodes and their backward rules
//
// Every recorded operation is one Op variant. The variant carries the
// operation's parameters (shapes, dims, exponents); the input tensors live
// beside it in the GradContext, so a node points only at its inputs and the
// graph is a DAG by construction.
//
// Each variant implements exactly two functions:
//
//   forward(inputs)                      → the result, computed on whatever
//                                          backend holds the inputs
//   backward(grad, inputs, output)       → one optional gradient per input,
//                                          shaped like that input
//
// `apply` runs forward and, when recording is on and some input requires a
// gradient, attaches a GradContext to the result.
//
// BACKWARD RULES:
//
//   Add:        ga = g,          gb = g
//   Sub:        ga = g,          gb = -g
//   Mul:        ga = g * b,      gb = g * a
//   Div:        ga = g / b,      gb = -g * a / b²
//   Matmul:     ga = g @ bᵀ,     gb = aᵀ @ g
//   Reshape:    reshape(g, input shape)
//   Activation: g * f'(x) for relu, gelu, silu (derivative at the input)
//               g * y(1 - y) for sigmoid, g * (1 - y²) for tanh (from the output)
//   Concat:     the slice of g each input contributed
//
// Broadcasting binary ops and batch-broadcast matmul sum the gradient over
// the broadcast dimensions before handing it to the smaller input.

use std::sync::atomic::{AtomicU64, Ordering};

use vole_core::{
    BinaryOp, Conv2dGeometry, Error, Layout, MatmulDims, ReduceOp, Result, Shape, SliceRange,
    UnaryOp,
};

use crate::grad_mode;
use crate::storage::Storage;
use crate::tensor::Tensor;

/// Unique, monotonically increasing tensor identifier. A result is always
/// created after its inputs, so a higher id never feeds a lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(u64);

impl TensorId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Activations whose backward rule is `g * f'(·)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
    Silu,
}

impl Activation {
    fn unary(self) -> UnaryOp {
        match self {
            Activation::Relu => UnaryOp::Relu,
            Activation::Sigmoid => UnaryOp::Sigmoid,
            Activation::Tanh => UnaryOp::Tanh,
            Activation::Gelu => UnaryOp::Gelu,
            Activation::Silu => UnaryOp::Silu,
        }
    }

    /// f' at `x` (input) or expressed through `y` (output).
    fn derivative(self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Relu => x.map_unary(UnaryOp::Step),
            Activation::Gelu => x.map_unary(UnaryOp::GeluGrad),
            Activation::Silu => x.map_unary(UnaryOp::SiluGrad),
            Activation::Sigmoid => y.mul(&y.affine(-1.0, 1.0)?),
            Activation::Tanh => y.mul(y)?.affine(-1.0, 1.0),
        }
    }
}

/// The operation that produced a tracked tensor.
#[derive(Debug, Clone)]
pub enum Op {
    Binary(BinaryOp),
    Matmul,
    Reshape { dst: Shape },
    Squeeze { dim: usize },
    Unsqueeze { dim: usize },
    Activation(Activation),
    /// Neg, Abs, Exp, Log, Sqrt.
    Unary(UnaryOp),
    Concat { dim: usize, sizes: Vec<usize> },
    Affine { mul: f32, add: f32 },
    Powf { exponent: f32 },
    Transpose { dim0: usize, dim1: usize },
    Permute { perm: Vec<usize> },
    Expand { dst: Shape },
    Narrow { dim: usize, start: usize, len: usize },
    Slice { ranges: Vec<SliceRange> },
    Contiguous,
    Reduce {
        op: ReduceOp,
        dim: Option<usize>,
        keep_dim: bool,
    },
    Softmax { temperature: f32 },
    Im2Col { geometry: Conv2dGeometry },
}

/// A tracked tensor's node: the rule plus shared handles to its inputs.
///
/// The storage versions of the inputs and the output are captured when the
/// node is recorded; backward refuses to run a rule over data written since.
#[derive(Debug)]
pub struct GradContext {
    op: Op,
    inputs: Vec<Tensor>,
    versions: Vec<u64>,
    output_version: u64,
}

impl GradContext {
    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    /// Fails when an input or the output was written in place after the
    /// node was recorded.
    pub(crate) fn check_unmodified(&self, output: &Tensor) -> Result<()> {
        let inputs_changed = self
            .inputs
            .iter()
            .zip(&self.versions)
            .any(|(t, &v)| t.version() != v);
        if inputs_changed || output.version() != self.output_version {
            return Err(Error::ModifiedAfterRecord {
                op: self.op.name(),
            });
        }
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Op, Vec<Tensor>) {
        (self.op, self.inputs)
    }
}

// Untracked kernels shared by forward rules and non-differentiable ops.

fn output(storage: Storage, shape: Shape, like: &Tensor) -> Tensor {
    Tensor::from_storage(storage, Layout::contiguous(shape), like.device().clone())
}

pub(crate) fn binary(op: BinaryOp, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let shape = Shape::broadcast_shape(lhs.shape(), rhs.shape())
        .map_err(|_| Error::shape(op.name(), lhs.shape(), rhs.shape()))?;
    let storage = lhs.read_pair(rhs, |a, b| a.binary(op, lhs.layout(), b, rhs.layout()))?;
    Ok(output(storage, shape, lhs))
}

pub(crate) fn unary(op: UnaryOp, x: &Tensor) -> Result<Tensor> {
    let storage = x.storage().unary(op, x.layout())?;
    Ok(output(storage, x.shape().clone(), x))
}

pub(crate) fn reduce(
    op: ReduceOp,
    x: &Tensor,
    dim: Option<usize>,
    keep_dim: bool,
) -> Result<Tensor> {
    let shape = match dim {
        Some(d) => x.shape().reduced(d, keep_dim)?,
        None if keep_dim => Shape::new(vec![1; x.rank()]),
        None => Shape::scalar(),
    };
    let storage = x.storage().reduce(op, x.layout(), dim)?;
    Ok(output(storage, shape, x))
}

pub(crate) fn col2im(cols: &Tensor, geometry: &Conv2dGeometry) -> Result<Tensor> {
    let storage = cols.storage().col2im(cols.layout(), geometry)?;
    Ok(output(storage, geometry.input_shape(), cols))
}

/// Reshape sharing storage when the data is row-major, copying otherwise.
fn reshaped(x: &Tensor, dst: &Shape) -> Result<Tensor> {
    match x.layout().contiguous_offset() {
        Some(offset) => Ok(x.with_layout(Layout::new(
            dst.clone(),
            dst.stride_contiguous(),
            offset,
        ))),
        None => {
            let copy = x.copy()?;
            Ok(copy.with_layout(Layout::contiguous(dst.clone())))
        }
    }
}

fn expect_inputs<'a, const N: usize>(op: &Op, inputs: &[&'a Tensor]) -> Result<[&'a Tensor; N]> {
    inputs.try_into().map_err(|_| {
        Error::msg(format!(
            "{}: expected {N} inputs, got {}",
            op.name(),
            inputs.len()
        ))
    })
}

/// Sum `grad` over the dimensions that broadcasting stretched so that it
/// matches `target`.
///
///   target [1, 4], grad [3, 4] → sum dim 0 (kept)      → [1, 4]
///   target [4],    grad [3, 4] → sum dim 0, reshape    → [4]
pub(crate) fn reduce_broadcast_grad(grad: &Tensor, target: &Shape) -> Result<Tensor> {
    if grad.shape() == target {
        return Ok(grad.clone());
    }
    let grad_dims = grad.dims().to_vec();
    if target.rank() > grad_dims.len() {
        return Err(Error::GradientShape {
            op: "broadcast",
            expected: target.clone(),
            got: grad.shape().clone(),
        });
    }
    let lead = grad_dims.len() - target.rank();
    let mut result = grad.clone();
    for d in (0..grad_dims.len()).rev() {
        let t = if d < lead { 1 } else { target.dims()[d - lead] };
        if t == 1 && grad_dims[d] > 1 {
            result = result.sum(d, true)?;
        }
    }
    if result.elem_count() != target.elem_count() {
        return Err(Error::GradientShape {
            op: "broadcast",
            expected: target.clone(),
            got: grad.shape().clone(),
        });
    }
    result.reshape(target)
}

/// Broadcast a reduction's gradient back over the reduced dimension(s).
fn expand_reduced(
    g: &Tensor,
    input: &Shape,
    dim: Option<usize>,
    keep_dim: bool,
) -> Result<Tensor> {
    let kept = match dim {
        Some(d) if !keep_dim => g.unsqueeze(d)?,
        Some(_) => g.clone(),
        None => g.reshape(Shape::new(vec![1; input.rank()]))?,
    };
    kept.expand(input)?.contiguous()
}

/// Zeros shaped like `input` with `grad` written through `view` of it.
fn scatter_into_zeros(
    grad: &Tensor,
    input: &Tensor,
    view: impl FnOnce(&Layout) -> Result<Layout>,
) -> Result<Tensor> {
    let zeros = Tensor::zeros(input.shape(), grad.device())?;
    let target = zeros.with_layout(view(zeros.layout())?);
    target.assign_from(grad)?;
    Ok(zeros)
}

fn last_two(t: &Tensor) -> Result<Tensor> {
    let r = t.rank();
    t.transpose(r - 2, r - 1)
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Binary(op) => op.name(),
            Op::Matmul => "matmul",
            Op::Reshape { .. } => "reshape",
            Op::Squeeze { .. } => "squeeze",
            Op::Unsqueeze { .. } => "unsqueeze",
            Op::Activation(a) => a.unary().name(),
            Op::Unary(op) => op.name(),
            Op::Concat { .. } => "cat",
            Op::Affine { .. } => "affine",
            Op::Powf { .. } => "powf",
            Op::Transpose { .. } => "transpose",
            Op::Permute { .. } => "permute",
            Op::Expand { .. } => "expand",
            Op::Narrow { .. } => "narrow",
            Op::Slice { .. } => "slice",
            Op::Contiguous => "contiguous",
            Op::Reduce { op, .. } => op.name(),
            Op::Softmax { .. } => "softmax",
            Op::Im2Col { .. } => "im2col",
        }
    }

    /// Whether the op has a backward rule. Comparisons and arg-reductions
    /// produce constants.
    fn differentiable(&self) -> bool {
        !matches!(
            self,
            Op::Binary(BinaryOp::Maximum | BinaryOp::Eq)
                | Op::Reduce {
                    op: ReduceOp::ArgMax | ReduceOp::ArgMin,
                    ..
                }
        )
    }

    /// Compute the result and record the node when a gradient can flow.
    pub(crate) fn apply(self, inputs: &[&Tensor]) -> Result<Tensor> {
        let out = self.forward(inputs)?;
        let record = grad_mode::is_grad_enabled()
            && self.differentiable()
            && inputs.iter().any(|t| t.requires_grad());
        if !record {
            return Ok(out);
        }
        let ctx = GradContext {
            op: self,
            inputs: inputs.iter().map(|t| (*t).clone()).collect(),
            versions: inputs.iter().map(|t| t.version()).collect(),
            output_version: out.version(),
        };
        Ok(out.tracked(ctx))
    }

    /// The ordinary computation, never recorded.
    pub fn forward(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        match self {
            Op::Binary(op) => {
                let [a, b] = expect_inputs(self, inputs)?;
                binary(*op, a, b)
            }
            Op::Matmul => {
                let [a, b] = expect_inputs(self, inputs)?;
                let (dims, shape) = MatmulDims::from_shapes(a.shape(), b.shape())?;
                let storage = a.read_pair(b, |l, r| l.matmul(a.layout(), r, b.layout(), &dims))?;
                Ok(output(storage, shape, a))
            }
            Op::Reshape { dst } => {
                let [x] = expect_inputs(self, inputs)?;
                reshaped(x, dst)
            }
            Op::Squeeze { dim } => {
                let [x] = expect_inputs(self, inputs)?;
                Ok(x.with_layout(x.layout().squeeze(*dim)?))
            }
            Op::Unsqueeze { dim } => {
                let [x] = expect_inputs(self, inputs)?;
                Ok(x.with_layout(x.layout().unsqueeze(*dim)?))
            }
            Op::Activation(a) => {
                let [x] = expect_inputs(self, inputs)?;
                unary(a.unary(), x)
            }
            Op::Unary(op) => {
                let [x] = expect_inputs(self, inputs)?;
                unary(*op, x)
            }
            Op::Concat { dim, .. } => {
                let first = inputs
                    .first()
                    .ok_or_else(|| Error::msg("cat: no inputs"))?;
                let mut dims = first.dims().to_vec();
                dims[*dim] = inputs.iter().map(|t| t.dims()[*dim]).sum();
                let out = Tensor::zeros(dims, first.device())?;
                let mut offset = 0;
                for t in inputs {
                    let len = t.dims()[*dim];
                    out.with_layout(out.layout().narrow(*dim, offset, len)?)
                        .assign_from(t)?;
                    offset += len;
                }
                Ok(out)
            }
            Op::Affine { mul, add } => {
                let [x] = expect_inputs(self, inputs)?;
                let storage = x.storage().affine(x.layout(), *mul, *add)?;
                Ok(output(storage, x.shape().clone(), x))
            }
            Op::Powf { exponent } => {
                let [x] = expect_inputs(self, inputs)?;
                let storage = x.storage().powf(x.layout(), *exponent)?;
                Ok(output(storage, x.shape().clone(), x))
            }
            Op::Transpose { dim0, dim1 } => {
                let [x] = expect_inputs(self, inputs)?;
                Ok(x.with_layout(x.layout().transpose(*dim0, *dim1)?))
            }
            Op::Permute { perm } => {
                let [x] = expect_inputs(self, inputs)?;
                Ok(x.with_layout(x.layout().permute(perm)?))
            }
            Op::Expand { dst } => {
                let [x] = expect_inputs(self, inputs)?;
                Ok(x.with_layout(x.layout().broadcast_as(dst)?))
            }
            Op::Narrow { dim, start, len } => {
                let [x] = expect_inputs(self, inputs)?;
                Ok(x.with_layout(x.layout().narrow(*dim, *start, *len)?))
            }
            Op::Slice { ranges } => {
                let [x] = expect_inputs(self, inputs)?;
                x.with_layout(x.layout().slice(ranges)?).copy()
            }
            Op::Contiguous => {
                let [x] = expect_inputs(self, inputs)?;
                x.copy()
            }
            Op::Reduce { op, dim, keep_dim } => {
                let [x] = expect_inputs(self, inputs)?;
                reduce(*op, x, *dim, *keep_dim)
            }
            Op::Softmax { temperature } => {
                let [x] = expect_inputs(self, inputs)?;
                let storage = x.storage().softmax_last_dim(x.layout(), *temperature)?;
                Ok(output(storage, x.shape().clone(), x))
            }
            Op::Im2Col { geometry } => {
                let [x] = expect_inputs(self, inputs)?;
                let storage = x.storage().im2col(x.layout(), geometry)?;
                Ok(output(storage, geometry.col_shape(), x))
            }
        }
    }

    /// Gradients for each input given the gradient of the output. Runs with
    /// recording disabled.
    pub fn backward(
        &self,
        grad: &Tensor,
        inputs: &[Tensor],
        output: &Tensor,
    ) -> Result<Vec<Option<Tensor>>> {
        let x = inputs
            .first()
            .ok_or_else(|| Error::msg(format!("{}: node has no inputs", self.name())))?;
        let single = |g: Tensor| Ok(vec![Some(g)]);

        match self {
            Op::Binary(op) => {
                let b = inputs
                    .get(1)
                    .ok_or_else(|| Error::msg(format!("{}: missing rhs", op.name())))?;
                let (ga, gb) = match op {
                    BinaryOp::Add => (grad.clone(), grad.clone()),
                    BinaryOp::Sub => (grad.clone(), grad.neg()?),
                    BinaryOp::Mul => (grad.mul(b)?, grad.mul(x)?),
                    BinaryOp::Div => {
                        let ga = grad.div(b)?;
                        let gb = grad.neg()?.mul(x)?.div(&b.mul(b)?)?;
                        (ga, gb)
                    }
                    BinaryOp::Maximum | BinaryOp::Eq => return Ok(vec![None, None]),
                };
                Ok(vec![
                    Some(reduce_broadcast_grad(&ga, x.shape())?),
                    Some(reduce_broadcast_grad(&gb, b.shape())?),
                ])
            }
            Op::Matmul => {
                let b = inputs
                    .get(1)
                    .ok_or_else(|| Error::msg("matmul: missing rhs"))?;
                let ga = grad.matmul(&last_two(b)?)?;
                let gb = last_two(x)?.matmul(grad)?;
                Ok(vec![
                    Some(reduce_broadcast_grad(&ga, x.shape())?),
                    Some(reduce_broadcast_grad(&gb, b.shape())?),
                ])
            }
            Op::Reshape { .. } | Op::Squeeze { .. } | Op::Unsqueeze { .. } => {
                single(grad.reshape(x.shape())?)
            }
            Op::Activation(a) => single(grad.mul(&a.derivative(x, output)?)?),
            Op::Unary(op) => {
                let g = match op {
                    UnaryOp::Neg => grad.neg()?,
                    UnaryOp::Abs => grad.mul(&x.map_unary(UnaryOp::Sign)?)?,
                    UnaryOp::Exp => grad.mul(output)?,
                    UnaryOp::Log => grad.div(x)?,
                    UnaryOp::Sqrt => grad.div(&output.mul_scalar(2.0)?)?,
                    other => {
                        return Err(Error::msg(format!(
                            "{}: no backward rule",
                            other.name()
                        )))
                    }
                };
                single(g)
            }
            Op::Concat { dim, sizes } => {
                let mut offset = 0;
                let mut grads = Vec::with_capacity(sizes.len());
                for &len in sizes {
                    grads.push(Some(grad.narrow(*dim, offset, len)?.contiguous()?));
                    offset += len;
                }
                Ok(grads)
            }
            Op::Affine { mul, .. } => single(grad.mul_scalar(*mul)?),
            Op::Powf { exponent } => {
                let dx = x.powf(*exponent - 1.0)?.mul_scalar(*exponent)?;
                single(grad.mul(&dx)?)
            }
            Op::Transpose { dim0, dim1 } => single(grad.transpose(*dim0, *dim1)?),
            Op::Permute { perm } => {
                let mut inverse = vec![0; perm.len()];
                for (i, &p) in perm.iter().enumerate() {
                    inverse[p] = i;
                }
                single(grad.permute(&inverse)?)
            }
            Op::Expand { .. } => single(reduce_broadcast_grad(grad, x.shape())?),
            Op::Narrow { dim, start, len } => single(scatter_into_zeros(grad, x, |l| {
                l.narrow(*dim, *start, *len)
            })?),
            Op::Slice { ranges } => single(scatter_into_zeros(grad, x, |l| l.slice(ranges))?),
            Op::Contiguous => single(grad.clone()),
            Op::Reduce { op, dim, keep_dim } => {
                let expanded = expand_reduced(grad, x.shape(), *dim, *keep_dim)?;
                let g = match op {
                    ReduceOp::Sum => expanded,
                    ReduceOp::Mean => {
                        let count = match dim {
                            Some(d) => x.dims()[*d],
                            None => x.elem_count(),
                        };
                        expanded.mul_scalar(1.0 / count as f32)?
                    }
                    ReduceOp::Max | ReduceOp::Min => {
                        let best = expand_reduced(output, x.shape(), *dim, *keep_dim)?;
                        let mask = binary(BinaryOp::Eq, x, &best)?;
                        expanded.mul(&mask)?
                    }
                    ReduceOp::ArgMax | ReduceOp::ArgMin => return Ok(vec![None]),
                };
                single(g)
            }
            Op::Softmax { temperature } => {
                let last = output.rank().saturating_sub(1);
                let dot = grad.mul(output)?.sum(last, true)?;
                let g = output.mul(&grad.sub(&dot)?)?.mul_scalar(1.0 / *temperature)?;
                single(g)
            }
            Op::Im2Col { geometry } => single(col2im(grad, geometry)?),
        }
    }
}
