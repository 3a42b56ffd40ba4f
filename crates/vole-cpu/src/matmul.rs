use std::ops::Range;

use vole_core::MatmulDims;
use wide::f32x8;

use crate::pool;

// Batched matmul on the CPU
//
// C[b] = A[b] @ B[b], with A: [lhs_batch, m, k], B: [rhs_batch, k, n] and
// C: [batch, m, n], all contiguous.
//
// The batch*m output rows form one row space. A row range is split in half
// and both halves run under rayon::join while its work (rows * k * n) is at
// or above the threshold, so the pool balances ragged batches by stealing.
// Halves own disjoint slices of C.
//
// Base case loop order is row → k → col: the col loop walks one row of B and
// one row of C contiguously (an axpy), which is what the SIMD path wants.
// k is blocked so a K_BLOCK × n panel of B stays hot across the rows of a
// range. A batch of 1 on either side is read through a clamped batch index.

const K_BLOCK: usize = 256;

struct RowKernel<'a> {
    a: &'a [f32],
    b: &'a [f32],
    dims: MatmulDims,
    threshold: usize,
}

impl RowKernel<'_> {
    fn split(&self, rows: Range<usize>, out: &mut [f32]) {
        let work = rows.len() * self.dims.k * self.dims.n;
        if rows.len() < 2 || work < self.threshold {
            self.run(rows, out);
            return;
        }
        let mid = rows.start + rows.len() / 2;
        let (lo, hi) = out.split_at_mut((mid - rows.start) * self.dims.n);
        rayon::join(
            || self.split(rows.start..mid, lo),
            || self.split(mid..rows.end, hi),
        );
    }

    fn run(&self, rows: Range<usize>, out: &mut [f32]) {
        let MatmulDims {
            m,
            k,
            n,
            lhs_batch,
            rhs_batch,
            ..
        } = self.dims;

        for kb in (0..k).step_by(K_BLOCK) {
            let k_end = (kb + K_BLOCK).min(k);
            for (row, c_row) in rows.clone().zip(out.chunks_exact_mut(n)) {
                let (batch, i) = (row / m, row % m);
                let a_base = (MatmulDims::clamp(batch, lhs_batch) * m + i) * k;
                let b_base = MatmulDims::clamp(batch, rhs_batch) * k * n;
                let a_row = &self.a[a_base..a_base + k];
                for kk in kb..k_end {
                    let b_row = &self.b[b_base + kk * n..b_base + (kk + 1) * n];
                    axpy(a_row[kk], b_row, c_row);
                }
            }
        }
    }
}

/// `y += alpha * x`, eight lanes at a time.
pub fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());
    let split = x.len() - x.len() % 8;
    let (x_head, x_tail) = x.split_at(split);
    let (y_head, y_tail) = y.split_at_mut(split);

    let av = f32x8::splat(alpha);
    let xs: &[[f32; 8]] = bytemuck::cast_slice(x_head);
    let ys: &mut [[f32; 8]] = bytemuck::cast_slice_mut(y_head);
    for (yv, xv) in ys.iter_mut().zip(xs) {
        *yv = (f32x8::from(*xv) * av + f32x8::from(*yv)).to_array();
    }
    for (yv, xv) in y_tail.iter_mut().zip(x_tail) {
        *yv += alpha * xv;
    }
}

/// Multiply contiguous operands with an explicit bisection threshold.
pub fn matmul_contiguous(a: &[f32], b: &[f32], dims: &MatmulDims, threshold: usize) -> Vec<f32> {
    let rows = dims.batch * dims.m;
    let mut c = vec![0.0f32; rows * dims.n];
    if c.is_empty() {
        return c;
    }
    let kernel = RowKernel {
        a,
        b,
        dims: *dims,
        threshold,
    };
    pool::install(|| kernel.split(0..rows, &mut c));
    c
}
