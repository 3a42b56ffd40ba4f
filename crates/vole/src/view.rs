// Shape operations
//
// View or copy, per operation:
//
//   reshape      view when the data is row-major (possibly offset), copy otherwise
//   view         view; fails on non-contiguous input instead of copying
//   transpose, t, permute, narrow, squeeze, unsqueeze, expand
//                views, sharing storage with the source
//   slice        always copies
//   cat          new storage
//   contiguous   copy unless already contiguous
//
// Writing through a view (`set`, `fill_`, ...) is visible in the source.
// `expand` views alias storage slots and refuse in-place writes.

use vole_core::{Error, Result, Shape, ShapeRequest, SliceRange};

use crate::op::Op;
use crate::tensor::Tensor;

impl Tensor {
    /// Reshape to `shape`; at most one dimension may be `-1`.
    pub fn reshape(&self, shape: impl Into<ShapeRequest>) -> Result<Tensor> {
        let dst = shape.into().resolve(self.elem_count())?;
        if &dst == self.shape() {
            return Ok(self.clone());
        }
        Op::Reshape { dst }.apply(&[self])
    }

    /// Reshape that never copies. Fails on non-contiguous input.
    pub fn view(&self, shape: impl Into<ShapeRequest>) -> Result<Tensor> {
        let dst = shape.into().resolve(self.elem_count())?;
        if self.layout().contiguous_offset().is_none() {
            return Err(Error::shape("view", self.shape(), &dst));
        }
        if &dst == self.shape() {
            return Ok(self.clone());
        }
        Op::Reshape { dst }.apply(&[self])
    }

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Tensor> {
        Op::Transpose { dim0, dim1 }.apply(&[self])
    }

    /// Matrix transpose of a rank-2 tensor.
    pub fn t(&self) -> Result<Tensor> {
        if self.rank() != 2 {
            return Err(Error::Rank {
                op: "t",
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(0, 1)
    }

    /// Output dimension `i` is input dimension `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Tensor> {
        Op::Permute {
            perm: perm.to_vec(),
        }
        .apply(&[self])
    }

    /// Copy of the sub-tensor selected by one range per leading dimension.
    ///
    /// ```ignore
    /// let rows = t.slice(&[(1..3).into(), SliceRange::full().step_by(2)])?;
    /// ```
    pub fn slice(&self, ranges: &[SliceRange]) -> Result<Tensor> {
        Op::Slice {
            ranges: ranges.to_vec(),
        }
        .apply(&[self])
    }

    /// View of `len` entries of `dim` starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Tensor> {
        Op::Narrow { dim, start, len }.apply(&[self])
    }

    pub fn squeeze(&self, dim: usize) -> Result<Tensor> {
        Op::Squeeze { dim }.apply(&[self])
    }

    pub fn unsqueeze(&self, dim: usize) -> Result<Tensor> {
        Op::Unsqueeze { dim }.apply(&[self])
    }

    /// Broadcast view: size-1 dimensions stretch, missing leading
    /// dimensions are added.
    pub fn expand(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let dst = shape.into();
        if &dst == self.shape() {
            return Ok(self.clone());
        }
        Op::Expand { dst }.apply(&[self])
    }

    pub fn contiguous(&self) -> Result<Tensor> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        Op::Contiguous.apply(&[self])
    }

    /// Concatenate along `dim`. Every other dimension must agree and all
    /// tensors must live on the same backend.
    pub fn cat(tensors: &[&Tensor], dim: usize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("cat: no tensors given"))?;
        let rank = first.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        for t in &tensors[1..] {
            if t.kind() != first.kind() {
                return Err(Error::BackendMismatch {
                    op: "cat",
                    lhs: first.kind(),
                    rhs: t.kind(),
                });
            }
            let compatible = t.rank() == rank
                && t.dims()
                    .iter()
                    .zip(first.dims())
                    .enumerate()
                    .all(|(d, (a, b))| d == dim || a == b);
            if !compatible {
                return Err(Error::shape("cat", first.shape(), t.shape()));
            }
        }
        let sizes = tensors.iter().map(|t| t.dims()[dim]).collect();
        Op::Concat { dim, sizes }.apply(tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Device;

    fn arange(n: usize, shape: &[usize]) -> Tensor {
        let data = (0..n).map(|i| i as f32).collect();
        Tensor::from_data(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_reshape_infers_hole() {
        let x = arange(12, &[3, 4]);
        let y = x.reshape([-1, 6]).unwrap();
        assert_eq!(y.dims(), &[2, 6]);
        assert!(y.shares_storage(&x));
        assert!(x.reshape([-1, -1]).is_err());
        assert!(x.reshape([5, -1]).is_err());
    }

    #[test]
    fn test_view_refuses_transposed() {
        let x = arange(6, &[2, 3]).t().unwrap();
        assert!(matches!(x.view([6]), Err(Error::Shape { op: "view", .. })));
        let r = x.reshape([6]).unwrap();
        assert_eq!(r.to_vec().unwrap(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(!r.shares_storage(&x));
    }

    #[test]
    fn test_slice_copies() {
        let x = arange(12, &[3, 4]);
        let s = x
            .slice(&[(1..3).into(), SliceRange::full().step_by(2)])
            .unwrap();
        assert_eq!(s.to_vec().unwrap(), vec![4.0, 6.0, 8.0, 10.0]);
        assert!(!s.shares_storage(&x));
    }

    #[test]
    fn test_narrow_is_a_view() {
        let x = arange(12, &[3, 4]);
        let n = x.narrow(1, 1, 2).unwrap();
        n.fill_(-1.0).unwrap();
        assert_eq!(x.get(&[2, 2]).unwrap(), -1.0);
        assert_eq!(x.get(&[2, 3]).unwrap(), 11.0);
    }

    #[test]
    fn test_expand_refuses_writes() {
        let x = arange(3, &[1, 3]).expand((4, 3)).unwrap();
        assert_eq!(x.strides(), &[0, 1]);
        assert!(x.fill_(0.0).is_err());
    }

    #[test]
    fn test_cat_checks_shapes() {
        let a = arange(6, &[2, 3]);
        let b = arange(4, &[2, 2]);
        let c = Tensor::cat(&[&a, &b], 1).unwrap();
        assert_eq!(c.dims(), &[2, 5]);
        assert_eq!(
            c.to_vec().unwrap(),
            vec![0.0, 1.0, 2.0, 0.0, 1.0, 3.0, 4.0, 5.0, 2.0, 3.0]
        );
        assert!(Tensor::cat(&[&a, &b], 0).is_err());
    }
}
