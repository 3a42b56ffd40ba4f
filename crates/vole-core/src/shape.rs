use std::fmt;

use crate::error::{Error, Result};

// Shape — N-dimensional extent of a tensor
//
//   Scalar: Shape([])          0 dimensions, 1 element
//   Vector: Shape([5])         1 dimension, 5 elements
//   Batch:  Shape([2, 3, 4])   3 dimensions, 24 elements
//
// Strides derived from a shape are always row-major: the last dimension is
// contiguous. Broadcasting aligns shapes from the right.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// Scalar shape (rank 0, one element).
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Product of all dimensions. A scalar shape has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major strides: `strides[i] = product(dims[i+1..])`.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        let mut acc = 1;
        for (stride, &dim) in strides.iter_mut().zip(self.0.iter()).rev() {
            *stride = acc;
            acc *= dim;
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// Reject zero-sized dimensions. Every tensor dimension must be positive.
    pub fn check_positive(&self, op: &'static str) -> Result<()> {
        if self.0.contains(&0) {
            return Err(Error::ZeroDim {
                op,
                shape: self.clone(),
            });
        }
        Ok(())
    }

    /// Dimensions with `dim` removed, or replaced by 1 when `keep_dim` is set.
    pub fn reduced(&self, dim: usize, keep_dim: bool) -> Result<Shape> {
        self.dim(dim)?;
        let mut dims = self.0.clone();
        if keep_dim {
            dims[dim] = 1;
        } else {
            dims.remove(dim);
        }
        Ok(Shape(dims))
    }

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// Shapes are aligned from the right; a pair of dimensions is compatible
    /// when they are equal or one of them is 1. Missing leading dimensions
    /// count as 1.
    ///
    ///   [3, 4] and [4]       → [3, 4]
    ///   [2, 1] and [1, 3]    → [2, 3]
    ///   [3] and [4]          → ShapeError
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let rank = l.len().max(r.len());
        let mut out = vec![0usize; rank];

        for (i, slot) in out.iter_mut().rev().enumerate() {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };
            *slot = match (ld, rd) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => return Err(Error::shape("broadcast", lhs, rhs)),
            };
        }
        Ok(Shape(out))
    }

    /// Resolve a reshape request that may contain a single `-1`.
    ///
    /// The `-1` entry absorbs whatever element count the other dimensions
    /// leave over. Every other entry must be positive.
    pub fn infer(request: &[isize], elem_count: usize) -> Result<Shape> {
        let describe = || format!("{request:?}");
        let mut hole = None;
        let mut known = 1usize;
        for (i, &d) in request.iter().enumerate() {
            match d {
                -1 if hole.is_none() => hole = Some(i),
                d if d > 0 => known *= d as usize,
                _ => {
                    return Err(Error::Reshape {
                        src: Shape::new(vec![elem_count]),
                        dst: describe(),
                    })
                }
            }
        }

        let mut dims: Vec<usize> = request.iter().map(|&d| d.max(0) as usize).collect();
        match hole {
            Some(i) => {
                if known == 0 || elem_count % known != 0 {
                    return Err(Error::Reshape {
                        src: Shape::new(vec![elem_count]),
                        dst: describe(),
                    });
                }
                dims[i] = elem_count / known;
            }
            None if known != elem_count => {
                return Err(Error::Reshape {
                    src: Shape::new(vec![elem_count]),
                    dst: describe(),
                })
            }
            None => {}
        }
        Ok(Shape(dims))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape::scalar()
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape(dims.to_vec())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}

/// A reshape target: concrete dimensions, or dimensions with one `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest(Vec<isize>);

impl ShapeRequest {
    pub fn resolve(&self, elem_count: usize) -> Result<Shape> {
        Shape::infer(&self.0, elem_count)
    }
}

impl<const N: usize> From<[isize; N]> for ShapeRequest {
    fn from(dims: [isize; N]) -> Self {
        ShapeRequest(dims.to_vec())
    }
}

impl From<Vec<isize>> for ShapeRequest {
    fn from(dims: Vec<isize>) -> Self {
        ShapeRequest(dims)
    }
}

impl From<&Shape> for ShapeRequest {
    fn from(shape: &Shape) -> Self {
        ShapeRequest(shape.dims().iter().map(|&d| d as isize).collect())
    }
}

impl From<Shape> for ShapeRequest {
    fn from(shape: Shape) -> Self {
        ShapeRequest::from(&shape)
    }
}
