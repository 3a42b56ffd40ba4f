use std::borrow::Cow;

use rayon::prelude::*;
use vole_core::{BinaryOp, Conv2dGeometry, Error, Layout, ReduceOp, Result, Shape};

use crate::pool;

// Host kernels over flat f32 slices. Every kernel accepts an arbitrary
// (strided, offset, broadcast) layout for its inputs and produces a fresh
// row-major output. Work is split into `chunk_len` sized tasks; a task that
// reads a strided input starts its own cursor with `strided_indices_from`.

/// Fail unless `layout` stays inside a buffer of `len` slots.
pub(crate) fn check_span(len: usize, layout: &Layout) -> Result<()> {
    if layout.storage_span() > len {
        return Err(Error::msg(format!(
            "layout {:?} reaches slot {} of a {len}-element buffer",
            layout.dims(),
            layout.storage_span()
        )));
    }
    Ok(())
}

/// Apply `f` to every logical element of `layout`.
pub(crate) fn map_layout(data: &[f32], layout: &Layout, f: impl Fn(f32) -> f32 + Sync) -> Vec<f32> {
    let n = layout.elem_count();
    let chunk = pool::chunk_len();
    let mut out = vec![0.0f32; n];
    pool::install(|| match layout.contiguous_offset() {
        Some(off) => out
            .par_chunks_mut(chunk)
            .zip(data[off..off + n].par_chunks(chunk))
            .for_each(|(dst, src)| {
                for (d, &s) in dst.iter_mut().zip(src) {
                    *d = f(s);
                }
            }),
        None => out.par_chunks_mut(chunk).enumerate().for_each(|(ci, dst)| {
            let idx = layout.strided_indices_from(ci * chunk);
            for (d, i) in dst.iter_mut().zip(idx) {
                *d = f(data[i]);
            }
        }),
    });
    out
}

/// Borrow the logical elements when they already sit contiguously,
/// otherwise gather them.
pub(crate) fn contiguous<'a>(data: &'a [f32], layout: &Layout) -> Cow<'a, [f32]> {
    match layout.contiguous_offset() {
        Some(off) => Cow::Borrowed(&data[off..off + layout.elem_count()]),
        None => Cow::Owned(map_layout(data, layout, |x| x)),
    }
}

pub(crate) fn binary(
    op: BinaryOp,
    lhs: &[f32],
    lhs_layout: &Layout,
    rhs: &[f32],
    rhs_layout: &Layout,
) -> Result<Vec<f32>> {
    let shape = Shape::broadcast_shape(lhs_layout.shape(), rhs_layout.shape())
        .map_err(|_| Error::shape(op.name(), lhs_layout.shape(), rhs_layout.shape()))?;
    let n = shape.elem_count();
    let chunk = pool::chunk_len();
    let mut out = vec![0.0f32; n];

    if let (Some(lo), Some(ro), true) = (
        lhs_layout.contiguous_offset(),
        rhs_layout.contiguous_offset(),
        lhs_layout.shape() == rhs_layout.shape(),
    ) {
        let (a, b) = (&lhs[lo..lo + n], &rhs[ro..ro + n]);
        pool::install(|| {
            out.par_chunks_mut(chunk)
                .zip(a.par_chunks(chunk).zip(b.par_chunks(chunk)))
                .for_each(|(dst, (a, b))| match op {
                    // Spelled out so the common ops vectorize.
                    BinaryOp::Add => dst
                        .iter_mut()
                        .zip(a.iter().zip(b))
                        .for_each(|(d, (x, y))| *d = x + y),
                    BinaryOp::Sub => dst
                        .iter_mut()
                        .zip(a.iter().zip(b))
                        .for_each(|(d, (x, y))| *d = x - y),
                    BinaryOp::Mul => dst
                        .iter_mut()
                        .zip(a.iter().zip(b))
                        .for_each(|(d, (x, y))| *d = x * y),
                    _ => dst
                        .iter_mut()
                        .zip(a.iter().zip(b))
                        .for_each(|(d, (&x, &y))| *d = op.apply(x, y)),
                })
        });
        return Ok(out);
    }

    let lb = lhs_layout.broadcast_as(&shape)?;
    let rb = rhs_layout.broadcast_as(&shape)?;
    pool::install(|| {
        out.par_chunks_mut(chunk).enumerate().for_each(|(ci, dst)| {
            let li = lb.strided_indices_from(ci * chunk);
            let ri = rb.strided_indices_from(ci * chunk);
            for ((d, i), j) in dst.iter_mut().zip(li).zip(ri) {
                *d = op.apply(lhs[i], rhs[j]);
            }
        })
    });
    Ok(out)
}

/// Reduce over `dim` (outer × size × inner) or over everything.
pub(crate) fn reduce(
    op: ReduceOp,
    data: &[f32],
    layout: &Layout,
    dim: Option<usize>,
) -> Result<Vec<f32>> {
    let src = contiguous(data, layout);
    let Some(dim) = dim else {
        return Ok(vec![op.fold(src.iter().copied())]);
    };
    let dims = layout.dims();
    let size = layout.shape().dim(dim)?;
    let outer: usize = dims[..dim].iter().product();
    let inner: usize = dims[dim + 1..].iter().product();

    let mut out = vec![0.0f32; outer * inner];
    pool::install(|| {
        out.par_chunks_mut(inner).enumerate().for_each(|(o, row)| {
            let base = o * size * inner;
            for (i, slot) in row.iter_mut().enumerate() {
                *slot = op.fold((0..size).map(|j| src[base + j * inner + i]));
            }
        })
    });
    Ok(out)
}

pub(crate) fn softmax_last_dim(data: &[f32], layout: &Layout, temperature: f32) -> Vec<f32> {
    let src = contiguous(data, layout);
    let last = layout.dims().last().copied().unwrap_or(1);
    let mut out = vec![0.0f32; src.len()];
    pool::install(|| {
        out.par_chunks_mut(last)
            .zip(src.par_chunks(last))
            .for_each(|(dst, row)| {
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0f32;
                for (d, &x) in dst.iter_mut().zip(row) {
                    *d = ((x - max) / temperature).exp();
                    sum += *d;
                }
                let inv = sum.recip();
                dst.iter_mut().for_each(|d| *d *= inv);
            })
    });
    out
}

pub(crate) fn im2col(data: &[f32], layout: &Layout, g: &Conv2dGeometry) -> Vec<f32> {
    let src = contiguous(data, layout);
    let (oh_n, ow_n) = (g.out_h(), g.out_w());
    let cols = oh_n * ow_n;
    let image = g.channels * g.height * g.width;
    let mut out = vec![0.0f32; g.batch * g.col_rows() * cols];
    pool::install(|| {
        out.par_chunks_mut(g.col_rows() * cols)
            .zip(src.par_chunks(image))
            .for_each(|(col, img)| {
                for c in 0..g.channels {
                    let plane = &img[c * g.height * g.width..(c + 1) * g.height * g.width];
                    for ki in 0..g.kernel_h {
                        for kj in 0..g.kernel_w {
                            let row = (c * g.kernel_h + ki) * g.kernel_w + kj;
                            let dst = &mut col[row * cols..(row + 1) * cols];
                            for oh in 0..oh_n {
                                for ow in 0..ow_n {
                                    dst[oh * ow_n + ow] = g
                                        .source(ki, kj, oh, ow)
                                        .map_or(0.0, |(h, w)| plane[h * g.width + w]);
                                }
                            }
                        }
                    }
                }
            })
    });
    out
}

pub(crate) fn col2im(data: &[f32], layout: &Layout, g: &Conv2dGeometry) -> Vec<f32> {
    let src = contiguous(data, layout);
    let (oh_n, ow_n) = (g.out_h(), g.out_w());
    let cols = oh_n * ow_n;
    let image = g.channels * g.height * g.width;
    let mut out = vec![0.0f32; g.batch * image];
    pool::install(|| {
        out.par_chunks_mut(image)
            .zip(src.par_chunks(g.col_rows() * cols))
            .for_each(|(img, col)| {
                for c in 0..g.channels {
                    for ki in 0..g.kernel_h {
                        for kj in 0..g.kernel_w {
                            let row = (c * g.kernel_h + ki) * g.kernel_w + kj;
                            for oh in 0..oh_n {
                                for ow in 0..ow_n {
                                    if let Some((h, w)) = g.source(ki, kj, oh, ow) {
                                        img[(c * g.height + h) * g.width + w] +=
                                            col[row * cols + oh * ow_n + ow];
                                    }
                                }
                            }
                        }
                    }
                }
            })
    });
    out
}

/// Write `values` (in logical order) through `layout`.
pub(crate) fn scatter(
    dst: &mut [f32],
    layout: &Layout,
    values: impl Iterator<Item = f32>,
) -> Result<()> {
    check_span(dst.len(), layout)?;
    if !layout.has_unique_offsets() {
        return Err(Error::msg(format!(
            "cannot write through broadcast layout {:?} (strides {:?})",
            layout.dims(),
            layout.strides()
        )));
    }
    for (pos, v) in layout.strided_indices().zip(values) {
        dst[pos] = v;
    }
    Ok(())
}
