use crate::error::{Error, Result};
use crate::range::SliceRange;
use crate::shape::Shape;

// Layout — shape + strides + offset
//
// The layout decouples a tensor's logical shape from how its elements sit in
// storage. Views (transpose, permute, narrow, squeeze, unsqueeze, expand) only
// rewrite the layout:
//
//   transpose:  [2, 3] strides [3, 1]  →  [3, 2] strides [1, 3]
//   narrow:     offset += start * stride[dim], dims[dim] = len
//   expand:     size-1 dims get stride 0 and repeat their single element
//
// Kernels read any layout through `strided_indices`; a layout is contiguous
// when its strides are the row-major strides of its shape and offset is 0.

/// How a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    /// Storage position of the first logical element.
    offset: usize,
}

impl Layout {
    /// Row-major layout starting at offset 0.
    pub fn contiguous(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Contiguous rows starting at some offset (e.g. a narrow on dim 0).
    pub fn contiguous_offset(&self) -> Option<usize> {
        (self.strides == self.shape.stride_contiguous()).then_some(self.offset)
    }

    /// False when two logical indices share a storage slot (stride 0 on a
    /// dimension larger than 1). Such layouts must never be written through.
    pub fn has_unique_offsets(&self) -> bool {
        self.dims()
            .iter()
            .zip(&self.strides)
            .all(|(&d, &s)| d == 1 || s != 0)
    }

    /// One past the largest storage position this layout can touch.
    pub fn storage_span(&self) -> usize {
        if self.elem_count() == 0 {
            return self.offset;
        }
        self.offset
            + self
                .dims()
                .iter()
                .zip(&self.strides)
                .map(|(&d, &s)| (d - 1) * s)
                .sum::<usize>()
            + 1
    }

    /// Swap two dimensions. No data moves.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1),
                rank,
            });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// Reorder dimensions: output dim `i` is input dim `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Layout> {
        let rank = self.rank();
        if perm.len() != rank {
            return Err(Error::Rank {
                op: "permute",
                expected: rank,
                got: perm.len(),
            });
        }
        let mut seen = vec![false; rank];
        for &p in perm {
            if p >= rank {
                return Err(Error::DimOutOfRange { dim: p, rank });
            }
            if std::mem::replace(&mut seen[p], true) {
                return Err(Error::msg(format!("permute: dimension {p} repeated in {perm:?}")));
            }
        }
        let dims = perm.iter().map(|&p| self.dims()[p]).collect();
        let strides = perm.iter().map(|&p| self.strides[p]).collect();
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// View of `len` elements of `dim` starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        let size = self.shape.dim(dim)?;
        if len == 0 || start + len > size {
            return Err(Error::RangeOutOfBounds {
                dim,
                start,
                stop: start + len,
                step: 1,
                size,
            });
        }
        let mut dims = self.dims().to_vec();
        dims[dim] = len;
        Ok(Layout::new(
            Shape::new(dims),
            self.strides.clone(),
            self.offset + start * self.strides[dim],
        ))
    }

    /// Strided selection with one range per leading dimension. Dimensions
    /// without a range are kept whole.
    pub fn slice(&self, ranges: &[SliceRange]) -> Result<Layout> {
        if ranges.len() > self.rank() {
            return Err(Error::Rank {
                op: "slice",
                expected: self.rank(),
                got: ranges.len(),
            });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        let mut offset = self.offset;
        for (d, range) in ranges.iter().enumerate() {
            let (start, len) = range.resolve(d, dims[d])?;
            offset += start * strides[d];
            dims[d] = len;
            strides[d] *= range.step;
        }
        Ok(Layout::new(Shape::new(dims), strides, offset))
    }

    /// Insert a size-1 dimension at `dim` (`0..=rank`).
    pub fn unsqueeze(&self, dim: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        let stride = if dim < rank {
            strides[dim] * dims[dim]
        } else {
            1
        };
        dims.insert(dim, 1);
        strides.insert(dim, stride);
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// Remove a size-1 dimension.
    pub fn squeeze(&self, dim: usize) -> Result<Layout> {
        let size = self.shape.dim(dim)?;
        if size != 1 {
            return Err(Error::msg(format!(
                "squeeze: dim {dim} of {} has size {size}, expected 1",
                self.shape
            )));
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.remove(dim);
        strides.remove(dim);
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// View this layout as `target` under broadcasting: missing leading dims
    /// and stretched size-1 dims get stride 0.
    pub fn broadcast_as(&self, target: &Shape) -> Result<Layout> {
        let src = self.dims();
        let dst = target.dims();
        if dst.len() < src.len() {
            return Err(Error::shape("broadcast_as", &self.shape, target));
        }
        let lead = dst.len() - src.len();
        let mut strides = vec![0usize; dst.len()];
        for (i, (&s, &stride)) in src.iter().zip(&self.strides).enumerate() {
            let t = dst[lead + i];
            strides[lead + i] = if s == t {
                stride
            } else if s == 1 {
                0
            } else {
                return Err(Error::shape("broadcast_as", &self.shape, target));
            };
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Storage position of a multi-index, checked against the shape.
    pub fn offset_of(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.rank() || index.iter().zip(self.dims()).any(|(&i, &d)| i >= d) {
            return Err(Error::Index {
                index: index.to_vec(),
                shape: self.shape.clone(),
            });
        }
        Ok(self.flat_index(index))
    }

    /// `offset + sum(index[i] * stride[i])`, unchecked.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        self.offset
            + index
                .iter()
                .zip(&self.strides)
                .map(|(i, s)| i * s)
                .sum::<usize>()
    }

    /// Storage positions of every logical element, in row-major logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self, 0)
    }

    /// Like [`Layout::strided_indices`] but starting at logical element `start`.
    /// Parallel kernels use this to give each chunk its own cursor.
    pub fn strided_indices_from(&self, start: usize) -> StridedIter {
        StridedIter::new(self, start)
    }
}

/// Iterator over the storage positions of a [`Layout`].
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    next_offset: usize,
    remaining: usize,
}

impl StridedIter {
    fn new(layout: &Layout, start: usize) -> Self {
        let dims = layout.dims().to_vec();
        let total = layout.elem_count();
        let start = start.min(total);

        // Unravel `start` into a multi-index.
        let mut current = vec![0usize; dims.len()];
        let mut rest = start;
        for (slot, &d) in current.iter_mut().zip(&dims).rev() {
            *slot = rest % d.max(1);
            rest /= d.max(1);
        }
        let next_offset = layout.flat_index(&current);

        StridedIter {
            current,
            dims,
            strides: layout.strides().to_vec(),
            next_offset,
            remaining: total - start,
        }
    }

    /// Odometer step: bump the last dimension, carrying leftwards.
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            self.next_offset += self.strides[i];
            if self.current[i] < self.dims[i] {
                return;
            }
            self.next_offset -= self.current[i] * self.strides[i];
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let out = self.next_offset;
        self.remaining -= 1;
        if self.remaining > 0 {
            self.advance();
        }
        Some(out)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}
