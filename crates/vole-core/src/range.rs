use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use crate::error::{Error, Result};

/// Index selector for one dimension: half-open `[start, stop)` with a step.
///
/// `stop: None` means "to the end of the dimension". Conversions exist for
/// the standard range types, so `t.slice(&[(0..2).into(), (..).into()])`
/// reads like indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceRange {
    pub start: usize,
    pub stop: Option<usize>,
    pub step: usize,
}

impl SliceRange {
    pub fn new(start: usize, stop: usize) -> Self {
        SliceRange {
            start,
            stop: Some(stop),
            step: 1,
        }
    }

    /// The whole dimension.
    pub fn full() -> Self {
        SliceRange {
            start: 0,
            stop: None,
            step: 1,
        }
    }

    pub fn step_by(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    /// Resolve against a dimension of `size`, returning `(start, len)` where
    /// `len` counts the selected elements.
    pub fn resolve(&self, dim: usize, size: usize) -> Result<(usize, usize)> {
        let stop = self.stop.unwrap_or(size);
        if self.step == 0 || self.start >= stop || stop > size {
            return Err(Error::RangeOutOfBounds {
                dim,
                start: self.start,
                stop,
                step: self.step,
                size,
            });
        }
        let len = (stop - self.start).div_ceil(self.step);
        Ok((self.start, len))
    }
}

impl From<Range<usize>> for SliceRange {
    fn from(r: Range<usize>) -> Self {
        SliceRange::new(r.start, r.end)
    }
}

impl From<RangeFrom<usize>> for SliceRange {
    fn from(r: RangeFrom<usize>) -> Self {
        SliceRange {
            start: r.start,
            stop: None,
            step: 1,
        }
    }
}

impl From<RangeTo<usize>> for SliceRange {
    fn from(r: RangeTo<usize>) -> Self {
        SliceRange::new(0, r.end)
    }
}

impl From<RangeFull> for SliceRange {
    fn from(_: RangeFull) -> Self {
        SliceRange::full()
    }
}

/// A single index keeps the dimension with size 1.
impl From<usize> for SliceRange {
    fn from(i: usize) -> Self {
        SliceRange::new(i, i + 1)
    }
}
