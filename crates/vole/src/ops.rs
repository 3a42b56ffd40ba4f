// Tensor operations — arithmetic, activations, reductions, matmul, softmax,
// convolution
//
// Every method here builds the matching Op and applies it, so the result is
// recorded in the autograd graph whenever an input requires a gradient.
// Binary ops broadcast NumPy-style; operands must live on the same backend.

use vole_core::{BinaryOp, Conv2dGeometry, Error, ReduceOp, Result, Shape, UnaryOp};

use crate::op::{self, Activation, Op};
use crate::tensor::Tensor;

impl Tensor {
    // Elementwise binary

    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        Op::Binary(BinaryOp::Add).apply(&[self, rhs])
    }

    pub fn sub(&self, rhs: &Tensor) -> Result<Tensor> {
        Op::Binary(BinaryOp::Sub).apply(&[self, rhs])
    }

    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        Op::Binary(BinaryOp::Mul).apply(&[self, rhs])
    }

    pub fn div(&self, rhs: &Tensor) -> Result<Tensor> {
        Op::Binary(BinaryOp::Div).apply(&[self, rhs])
    }

    /// Elementwise maximum. Not differentiable.
    pub fn maximum(&self, rhs: &Tensor) -> Result<Tensor> {
        op::binary(BinaryOp::Maximum, self, rhs)
    }

    /// 1.0 where the operands are equal, 0.0 elsewhere.
    pub fn eq_mask(&self, rhs: &Tensor) -> Result<Tensor> {
        op::binary(BinaryOp::Eq, self, rhs)
    }

    // Scalar

    /// `self * mul + add`.
    pub fn affine(&self, mul: f32, add: f32) -> Result<Tensor> {
        Op::Affine { mul, add }.apply(&[self])
    }

    pub fn add_scalar(&self, value: f32) -> Result<Tensor> {
        self.affine(1.0, value)
    }

    pub fn sub_scalar(&self, value: f32) -> Result<Tensor> {
        self.affine(1.0, -value)
    }

    pub fn mul_scalar(&self, value: f32) -> Result<Tensor> {
        self.affine(value, 0.0)
    }

    pub fn div_scalar(&self, value: f32) -> Result<Tensor> {
        self.affine(1.0 / value, 0.0)
    }

    pub fn powf(&self, exponent: f32) -> Result<Tensor> {
        Op::Powf { exponent }.apply(&[self])
    }

    // Unary math

    pub fn neg(&self) -> Result<Tensor> {
        Op::Unary(UnaryOp::Neg).apply(&[self])
    }

    pub fn abs(&self) -> Result<Tensor> {
        Op::Unary(UnaryOp::Abs).apply(&[self])
    }

    pub fn exp(&self) -> Result<Tensor> {
        Op::Unary(UnaryOp::Exp).apply(&[self])
    }

    pub fn log(&self) -> Result<Tensor> {
        Op::Unary(UnaryOp::Log).apply(&[self])
    }

    pub fn sqrt(&self) -> Result<Tensor> {
        Op::Unary(UnaryOp::Sqrt).apply(&[self])
    }

    /// Untracked elementwise map, used by backward rules.
    pub(crate) fn map_unary(&self, op: UnaryOp) -> Result<Tensor> {
        op::unary(op, self)
    }

    // Activations

    pub fn relu(&self) -> Result<Tensor> {
        Op::Activation(Activation::Relu).apply(&[self])
    }

    pub fn sigmoid(&self) -> Result<Tensor> {
        Op::Activation(Activation::Sigmoid).apply(&[self])
    }

    pub fn tanh(&self) -> Result<Tensor> {
        Op::Activation(Activation::Tanh).apply(&[self])
    }

    /// GELU, tanh approximation.
    pub fn gelu(&self) -> Result<Tensor> {
        Op::Activation(Activation::Gelu).apply(&[self])
    }

    pub fn silu(&self) -> Result<Tensor> {
        Op::Activation(Activation::Silu).apply(&[self])
    }

    // Linear algebra

    /// Batched matrix product over the last two dimensions.
    ///
    /// `[.., m, k] @ [.., k, n] → [.., m, n]`. Leading dimensions must match,
    /// or one side may have a single matrix, which is reused for every batch.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        Op::Matmul.apply(&[self, rhs])
    }

    // Reductions

    fn reduce(&self, op: ReduceOp, dim: Option<usize>, keep_dim: bool) -> Result<Tensor> {
        Op::Reduce { op, dim, keep_dim }.apply(&[self])
    }

    pub fn sum_all(&self) -> Result<Tensor> {
        self.reduce(ReduceOp::Sum, None, false)
    }

    pub fn mean_all(&self) -> Result<Tensor> {
        self.reduce(ReduceOp::Mean, None, false)
    }

    pub fn max_all(&self) -> Result<Tensor> {
        self.reduce(ReduceOp::Max, None, false)
    }

    pub fn min_all(&self) -> Result<Tensor> {
        self.reduce(ReduceOp::Min, None, false)
    }

    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::Sum, Some(dim), keep_dim)
    }

    pub fn mean(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::Mean, Some(dim), keep_dim)
    }

    pub fn max(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::Max, Some(dim), keep_dim)
    }

    pub fn min(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::Min, Some(dim), keep_dim)
    }

    /// Flat row-major index of the largest element, as a rank-0 tensor.
    /// Ties resolve to the first occurrence.
    pub fn argmax(&self) -> Result<Tensor> {
        self.reduce(ReduceOp::ArgMax, None, false)
    }

    pub fn argmin(&self) -> Result<Tensor> {
        self.reduce(ReduceOp::ArgMin, None, false)
    }

    /// Index of the largest element along `dim`.
    pub fn argmax_dim(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::ArgMax, Some(dim), keep_dim)
    }

    pub fn argmin_dim(&self, dim: usize, keep_dim: bool) -> Result<Tensor> {
        self.reduce(ReduceOp::ArgMin, Some(dim), keep_dim)
    }

    // Softmax

    /// Softmax over the last dimension.
    pub fn softmax(&self) -> Result<Tensor> {
        self.softmax_with_temperature(1.0)
    }

    /// `softmax(x / temperature)` over the last dimension. The row maximum is
    /// subtracted before exponentiating.
    pub fn softmax_with_temperature(&self, temperature: f32) -> Result<Tensor> {
        if self.rank() == 0 {
            return Err(Error::Rank {
                op: "softmax",
                expected: 1,
                got: 0,
            });
        }
        if !(temperature > 0.0 && temperature.is_finite()) {
            return Err(Error::msg(format!(
                "softmax: temperature must be positive and finite, got {temperature}"
            )));
        }
        Op::Softmax { temperature }.apply(&[self])
    }

    // Convolution

    /// Unfold `[N, C, H, W]` into columns `[N, C*kh*kw, out_h*out_w]`.
    pub fn im2col(
        &self,
        kernel: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Tensor> {
        let geometry = conv_geometry(self.shape(), kernel, stride, padding)?;
        Op::Im2Col { geometry }.apply(&[self])
    }

    /// 2D convolution: input `[N, C, H, W]`, weight `[O, C, kh, kw]`, optional
    /// bias `[O]` → `[N, O, out_h, out_w]`.
    ///
    /// Lowered to im2col followed by one batched matmul, so gradients flow
    /// through the im2col, matmul and reshape rules.
    pub fn conv2d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Tensor> {
        let &[out_channels, in_channels, kh, kw] = weight.dims() else {
            return Err(Error::Rank {
                op: "conv2d",
                expected: 4,
                got: weight.rank(),
            });
        };
        if self.rank() == 4 && self.dims()[1] != in_channels {
            return Err(Error::shape("conv2d", self.shape(), weight.shape()));
        }
        let geometry = conv_geometry(self.shape(), [kh, kw], stride, padding)?;

        let cols = Op::Im2Col { geometry }.apply(&[self])?;
        let w = weight.reshape(Shape::from((out_channels, geometry.col_rows())))?;
        let out = w.matmul(&cols)?.reshape(Shape::from((
            geometry.batch,
            out_channels,
            geometry.out_h(),
            geometry.out_w(),
        )))?;
        match bias {
            None => Ok(out),
            Some(b) => {
                if b.dims() != [out_channels] {
                    return Err(Error::shape("conv2d bias", b.shape(), weight.shape()));
                }
                out.add(&b.reshape(Shape::from((1, out_channels, 1, 1)))?)
            }
        }
    }
}

fn conv_geometry(
    input: &Shape,
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
) -> Result<Conv2dGeometry> {
    let &[batch, channels, height, width] = input.dims() else {
        return Err(Error::Rank {
            op: "conv2d",
            expected: 4,
            got: input.rank(),
        });
    };
    if stride.contains(&0) || kernel.contains(&0) {
        return Err(Error::msg(format!(
            "conv2d: kernel {kernel:?} and stride {stride:?} must be positive"
        )));
    }
    if kernel[0] > height + 2 * padding[0] || kernel[1] > width + 2 * padding[1] {
        return Err(Error::msg(format!(
            "conv2d: kernel {kernel:?} larger than padded input {input}"
        )));
    }
    Ok(Conv2dGeometry {
        batch,
        channels,
        height,
        width,
        kernel_h: kernel[0],
        kernel_w: kernel[1],
        stride,
        padding,
    })
}
