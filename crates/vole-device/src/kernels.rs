// Device kernels
//
// Each function builds a Kernel whose body runs on the device's compute
// pool when the queue worker reaches it. Work is expressed per work-group:
// elementwise kernels give each group `block` consecutive outputs, reductions
// give each work-item one output element, softmax gives each group one row,
// and matmul gives each group one tile×tile output tile.
//
// Kernels validate their own arguments (buffer spans, sizes) and report
// problems as errors, which the queue turns into a kernel failure on the
// output buffers.

use std::sync::Arc;

use rayon::prelude::*;
use vole_core::{BinaryOp, Conv2dGeometry, Error, Layout, MatmulDims, ReduceOp, Result};

use crate::buffer::DeviceBuffer;
use crate::queue::{Grid, Kernel};

fn check_span(buffer: &DeviceBuffer, layout: &Layout, kernel: &str) -> Result<()> {
    if layout.storage_span() > buffer.len() {
        return Err(Error::msg(format!(
            "{kernel}: layout {:?} reaches slot {} of buffer {} ({} slots)",
            layout.dims(),
            layout.storage_span(),
            buffer.id(),
            buffer.len()
        )));
    }
    Ok(())
}

/// Copy host data into a buffer.
pub(crate) fn upload(out: Arc<DeviceBuffer>, data: Vec<f32>) -> Kernel {
    Kernel::new("upload", Grid::linear(data.len(), 1), move || {
        let mut dst = out.write()?;
        if dst.len() != data.len() {
            return Err(Error::msg(format!(
                "upload: {} values into a {}-slot buffer",
                data.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(&data);
        Ok(())
    })
}

/// Copy the logical elements of `layout` back to the host.
pub(crate) fn download(
    input: Arc<DeviceBuffer>,
    layout: Layout,
    tx: flume::Sender<Vec<f32>>,
) -> Kernel {
    Kernel::new("download", Grid::linear(layout.elem_count(), 1), move || {
        check_span(&input, &layout, "download")?;
        let src = input.read()?;
        let host: Vec<f32> = layout.strided_indices().map(|i| src[i]).collect();
        tx.send(host)
            .map_err(|_| Error::msg("download: host side hung up"))
    })
}

/// `out[i] = f(input[layout[i]])` for every logical element.
pub(crate) fn map(
    name: &'static str,
    input: Arc<DeviceBuffer>,
    layout: Layout,
    out: Arc<DeviceBuffer>,
    block: usize,
    f: impl Fn(f32) -> f32 + Send + Sync + 'static,
) -> Kernel {
    let grid = Grid::linear(layout.elem_count(), block);
    Kernel::new(name, grid, move || {
        check_span(&input, &layout, name)?;
        // The read guard is dropped before writing, so in-place launches
        // (input == out) are fine.
        let staged = {
            let src = input.read()?;
            let mut staged = vec![0.0f32; layout.elem_count()];
            staged
                .par_chunks_mut(block)
                .enumerate()
                .for_each(|(group, dst)| {
                    let idx = layout.strided_indices_from(group * block);
                    for (d, i) in dst.iter_mut().zip(idx) {
                        *d = f(src[i]);
                    }
                });
            staged
        };
        let mut dst = out.write()?;
        if dst.len() < staged.len() {
            return Err(Error::msg(format!("{name}: output buffer too small")));
        }
        dst[..staged.len()].copy_from_slice(&staged);
        Ok(())
    })
}

/// Broadcasting binary op. Both layouts are already broadcast to the
/// output shape.
pub(crate) fn binary(
    op: BinaryOp,
    lhs: Arc<DeviceBuffer>,
    lhs_layout: Layout,
    rhs: Arc<DeviceBuffer>,
    rhs_layout: Layout,
    out: Arc<DeviceBuffer>,
    block: usize,
) -> Kernel {
    let n = lhs_layout.elem_count();
    Kernel::new("binary", Grid::linear(n, block), move || {
        check_span(&lhs, &lhs_layout, op.name())?;
        check_span(&rhs, &rhs_layout, op.name())?;
        let a = lhs.read()?;
        let b = rhs.read()?;
        let mut staged = vec![0.0f32; n];
        staged
            .par_chunks_mut(block)
            .enumerate()
            .for_each(|(group, dst)| {
                let li = lhs_layout.strided_indices_from(group * block);
                let ri = rhs_layout.strided_indices_from(group * block);
                for ((d, i), j) in dst.iter_mut().zip(li).zip(ri) {
                    *d = op.apply(a[i], b[j]);
                }
            });
        drop((a, b));
        out.write()?.copy_from_slice(&staged);
        Ok(())
    })
}

/// Write `value` at every position of `layout`.
pub(crate) fn fill(out: Arc<DeviceBuffer>, layout: Layout, value: f32, block: usize) -> Kernel {
    Kernel::new("fill", Grid::linear(layout.elem_count(), block), move || {
        check_span(&out, &layout, "fill")?;
        let mut dst = out.write()?;
        match layout.contiguous_offset() {
            Some(off) => dst[off..off + layout.elem_count()].fill(value),
            None => layout.strided_indices().for_each(|i| dst[i] = value),
        }
        Ok(())
    })
}

/// Copy `src` (read through `src_layout`) into `dst` at `dst_layout`.
pub(crate) fn assign(
    dst: Arc<DeviceBuffer>,
    dst_layout: Layout,
    src: Arc<DeviceBuffer>,
    src_layout: Layout,
    block: usize,
) -> Kernel {
    Kernel::new(
        "assign",
        Grid::linear(dst_layout.elem_count(), block),
        move || {
            check_span(&src, &src_layout, "assign")?;
            check_span(&dst, &dst_layout, "assign")?;
            if !dst_layout.has_unique_offsets() {
                return Err(Error::msg("assign: destination layout aliases itself"));
            }
            let values: Vec<f32> = {
                let s = src.read()?;
                src_layout.strided_indices().map(|i| s[i]).collect()
            };
            let mut d = dst.write()?;
            for (pos, v) in dst_layout.strided_indices().zip(values) {
                d[pos] = v;
            }
            Ok(())
        },
    )
}

/// Reduction over `dim` (one work-item per output) or over everything
/// (per-group partials, then a final combine). Input must be contiguous.
pub(crate) fn reduce(
    op: ReduceOp,
    input: Arc<DeviceBuffer>,
    dims: Vec<usize>,
    dim: Option<usize>,
    out: Arc<DeviceBuffer>,
    block: usize,
) -> Kernel {
    let n: usize = dims.iter().product();
    Kernel::new("reduce", Grid::linear(n, block), move || {
        let src = input.read()?;
        let src = &src[..n];
        let result = match dim {
            None => vec![reduce_all(op, src, block)],
            Some(d) => {
                let size = dims[d];
                let outer: usize = dims[..d].iter().product();
                let inner: usize = dims[d + 1..].iter().product();
                let mut staged = vec![0.0f32; outer * inner];
                staged
                    .par_chunks_mut(block)
                    .enumerate()
                    .for_each(|(group, dst)| {
                        for (lane, slot) in dst.iter_mut().enumerate() {
                            let item = group * block + lane;
                            let (o, i) = (item / inner, item % inner);
                            let base = o * size * inner + i;
                            *slot = op.fold((0..size).map(|j| src[base + j * inner]));
                        }
                    });
                staged
            }
        };
        out.write()?[..result.len()].copy_from_slice(&result);
        Ok(())
    })
}

fn reduce_all(op: ReduceOp, src: &[f32], block: usize) -> f32 {
    // Stage 1: each group folds its block. Stage 2: combine in group order.
    let partials: Vec<(f32, usize)> = src
        .par_chunks(block)
        .enumerate()
        .map(|(group, chunk)| match op {
            ReduceOp::Sum | ReduceOp::Mean => (chunk.iter().sum(), 0),
            ReduceOp::Max => (ReduceOp::Max.fold(chunk.iter().copied()), 0),
            ReduceOp::Min => (ReduceOp::Min.fold(chunk.iter().copied()), 0),
            ReduceOp::ArgMax | ReduceOp::ArgMin => {
                let local = op.fold(chunk.iter().copied()) as usize;
                (chunk[local], group * block + local)
            }
        })
        .collect();

    match op {
        ReduceOp::Sum => partials.iter().map(|p| p.0).sum(),
        ReduceOp::Mean => partials.iter().map(|p| p.0).sum::<f32>() / src.len() as f32,
        ReduceOp::Max => ReduceOp::Max.fold(partials.iter().map(|p| p.0)),
        ReduceOp::Min => ReduceOp::Min.fold(partials.iter().map(|p| p.0)),
        ReduceOp::ArgMax | ReduceOp::ArgMin => {
            let best = op.fold(partials.iter().map(|p| p.0)) as usize;
            partials[best].1 as f32
        }
    }
}

/// Stable softmax, one work-group per row of the last dimension.
pub(crate) fn softmax(
    input: Arc<DeviceBuffer>,
    rows: usize,
    cols: usize,
    temperature: f32,
    out: Arc<DeviceBuffer>,
) -> Kernel {
    Kernel::new("softmax", Grid::linear(rows, 1), move || {
        let src = input.read()?;
        let mut staged = vec![0.0f32; rows * cols];
        staged
            .par_chunks_mut(cols)
            .zip(src[..rows * cols].par_chunks(cols))
            .for_each(|(dst, row)| {
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0f32;
                for (d, &x) in dst.iter_mut().zip(row) {
                    *d = ((x - max) / temperature).exp();
                    sum += *d;
                }
                dst.iter_mut().for_each(|d| *d /= sum);
            });
        drop(src);
        out.write()?.copy_from_slice(&staged);
        Ok(())
    })
}

/// Tiled batched matmul over contiguous operands. Each work-group loads a
/// tile of A and a tile of B per step along k (zero padded at the edges) and
/// accumulates its output tile with fused multiply-add.
pub(crate) fn matmul_tiled(
    lhs: Arc<DeviceBuffer>,
    rhs: Arc<DeviceBuffer>,
    dims: MatmulDims,
    out: Arc<DeviceBuffer>,
    tile: usize,
) -> Kernel {
    let grid = Grid::tiled(dims.m, dims.n, dims.batch, tile);
    Kernel::new("matmul_tiled", grid, move || {
        let MatmulDims {
            m,
            k,
            n,
            lhs_batch,
            rhs_batch,
            ..
        } = dims;
        let a = lhs.read()?;
        let b = rhs.read()?;
        if a.len() < lhs_batch * m * k || b.len() < rhs_batch * k * n {
            return Err(Error::msg("matmul_tiled: operand smaller than its geometry"));
        }

        let tiles: Vec<(usize, Vec<f32>)> = (0..grid.groups())
            .into_par_iter()
            .map(|group| {
                let z = group / (grid.x * grid.y);
                let ty = group / grid.x % grid.y;
                let tx = group % grid.x;
                let a_base = MatmulDims::clamp(z, lhs_batch) * m * k;
                let b_base = MatmulDims::clamp(z, rhs_batch) * k * n;

                let mut ta = vec![0.0f32; tile * tile];
                let mut tb = vec![0.0f32; tile * tile];
                let mut acc = vec![0.0f32; tile * tile];
                for t0 in (0..k).step_by(tile) {
                    for r in 0..tile {
                        for c in 0..tile {
                            let (i, p) = (ty * tile + r, t0 + c);
                            ta[r * tile + c] = if i < m && p < k {
                                a[a_base + i * k + p]
                            } else {
                                0.0
                            };
                            let (p, j) = (t0 + r, tx * tile + c);
                            tb[r * tile + c] = if p < k && j < n {
                                b[b_base + p * n + j]
                            } else {
                                0.0
                            };
                        }
                    }
                    for r in 0..tile {
                        for p in 0..tile {
                            let av = ta[r * tile + p];
                            for c in 0..tile {
                                acc[r * tile + c] = av.mul_add(tb[p * tile + c], acc[r * tile + c]);
                            }
                        }
                    }
                }
                (group, acc)
            })
            .collect();
        drop((a, b));

        let mut c = out.write()?;
        for (group, acc) in tiles {
            let z = group / (grid.x * grid.y);
            let ty = group / grid.x % grid.y;
            let tx = group % grid.x;
            for r in 0..tile {
                let i = ty * tile + r;
                if i >= m {
                    break;
                }
                for col in 0..tile {
                    let j = tx * tile + col;
                    if j >= n {
                        break;
                    }
                    c[(z * m + i) * n + j] = acc[r * tile + col];
                }
            }
        }
        Ok(())
    })
}

/// One work-item per column-matrix entry. Input must be contiguous.
pub(crate) fn im2col(
    input: Arc<DeviceBuffer>,
    g: Conv2dGeometry,
    out: Arc<DeviceBuffer>,
    block: usize,
) -> Kernel {
    let total = g.col_shape().elem_count();
    Kernel::new("im2col", Grid::linear(total, block), move || {
        let src = input.read()?;
        let (ow_n, cols) = (g.out_w(), g.out_h() * g.out_w());
        let rows = g.col_rows();
        let mut staged = vec![0.0f32; total];
        staged
            .par_chunks_mut(block)
            .enumerate()
            .for_each(|(group, dst)| {
                for (lane, slot) in dst.iter_mut().enumerate() {
                    let item = group * block + lane;
                    let (nb, row, col) = (item / (rows * cols), item / cols % rows, item % cols);
                    let window = g.kernel_h * g.kernel_w;
                    let (c, kk) = (row / window, row % window);
                    let (ki, kj) = (kk / g.kernel_w, kk % g.kernel_w);
                    let (oh, ow) = (col / ow_n, col % ow_n);
                    *slot = g.source(ki, kj, oh, ow).map_or(0.0, |(h, w)| {
                        src[((nb * g.channels + c) * g.height + h) * g.width + w]
                    });
                }
            });
        drop(src);
        out.write()?.copy_from_slice(&staged);
        Ok(())
    })
}

/// Adjoint of im2col as a gather: one work-item per image pixel sums every
/// column entry that reads it, so no two items write the same slot.
pub(crate) fn col2im(
    input: Arc<DeviceBuffer>,
    g: Conv2dGeometry,
    out: Arc<DeviceBuffer>,
    block: usize,
) -> Kernel {
    let total = g.input_shape().elem_count();
    Kernel::new("col2im", Grid::linear(total, block), move || {
        let src = input.read()?;
        let (oh_n, ow_n) = (g.out_h(), g.out_w());
        let cols = oh_n * ow_n;
        let rows = g.col_rows();
        let mut staged = vec![0.0f32; total];
        staged
            .par_chunks_mut(block)
            .enumerate()
            .for_each(|(group, dst)| {
                for (lane, slot) in dst.iter_mut().enumerate() {
                    let item = group * block + lane;
                    let w = item % g.width;
                    let h = item / g.width % g.height;
                    let c = item / (g.width * g.height) % g.channels;
                    let nb = item / (g.width * g.height * g.channels);
                    let mut acc = 0.0f32;
                    for ki in 0..g.kernel_h {
                        let Some(y) = (h + g.padding[0]).checked_sub(ki) else { continue };
                        if y % g.stride[0] != 0 || y / g.stride[0] >= oh_n {
                            continue;
                        }
                        for kj in 0..g.kernel_w {
                            let Some(x) = (w + g.padding[1]).checked_sub(kj) else { continue };
                            if x % g.stride[1] != 0 || x / g.stride[1] >= ow_n {
                                continue;
                            }
                            let row = (c * g.kernel_h + ki) * g.kernel_w + kj;
                            let col = (y / g.stride[0]) * ow_n + x / g.stride[1];
                            acc += src[(nb * rows + row) * cols + col];
                        }
                    }
                    *slot = acc;
                }
            });
        drop(src);
        out.write()?.copy_from_slice(&staged);
        Ok(())
    })
}
