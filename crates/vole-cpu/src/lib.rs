//! # vole-cpu
//!
//! The CPU kernel: dense `Vec<f32>` storage with rayon-parallel elementwise,
//! reduction and convolution kernels, and a divide-and-conquer batched
//! matmul with a SIMD inner loop.

pub mod matmul;
mod ops;
pub mod pool;

use vole_core::{
    Backend, BackendDevice, BackendKind, BackendStorage, BinaryOp, Conv2dGeometry, Error, Layout,
    MatmulDims, ReduceOp, Result, Shape, UnaryOp,
};

pub use pool::{configure, CpuConfig};

/// The host. There is only one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// A host buffer of f32.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CpuStorage(Vec<f32>);

impl CpuStorage {
    pub fn new(data: Vec<f32>) -> Self {
        CpuStorage(data)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.0
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }
}

impl BackendStorage for CpuStorage {
    fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

fn checked<'a>(storage: &'a CpuStorage, layout: &Layout) -> Result<&'a [f32]> {
    ops::check_span(storage.len(), layout)?;
    Ok(storage.as_slice())
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn full(shape: &Shape, value: f32, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage(vec![value; shape.elem_count()]))
    }

    fn from_vec(data: Vec<f32>, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage(data))
    }

    fn to_vec(storage: &CpuStorage, layout: &Layout) -> Result<Vec<f32>> {
        Ok(ops::contiguous(checked(storage, layout)?, layout).into_owned())
    }

    fn to_contiguous(storage: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Self::to_vec(storage, layout).map(CpuStorage)
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let a = checked(lhs, lhs_layout)?;
        let b = checked(rhs, rhs_layout)?;
        ops::binary(op, a, lhs_layout, b, rhs_layout).map(CpuStorage)
    }

    fn unary_op(op: UnaryOp, storage: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let data = checked(storage, layout)?;
        Ok(CpuStorage(ops::map_layout(data, layout, |x| op.apply(x))))
    }

    fn affine(storage: &CpuStorage, layout: &Layout, mul: f32, add: f32) -> Result<CpuStorage> {
        let data = checked(storage, layout)?;
        Ok(CpuStorage(ops::map_layout(data, layout, |x| x * mul + add)))
    }

    fn powf(storage: &CpuStorage, layout: &Layout, exponent: f32) -> Result<CpuStorage> {
        let data = checked(storage, layout)?;
        Ok(CpuStorage(ops::map_layout(data, layout, |x| x.powf(exponent))))
    }

    fn reduce_op(
        op: ReduceOp,
        storage: &CpuStorage,
        layout: &Layout,
        dim: Option<usize>,
    ) -> Result<CpuStorage> {
        let data = checked(storage, layout)?;
        ops::reduce(op, data, layout, dim).map(CpuStorage)
    }

    fn softmax_last_dim(
        storage: &CpuStorage,
        layout: &Layout,
        temperature: f32,
    ) -> Result<CpuStorage> {
        let data = checked(storage, layout)?;
        Ok(CpuStorage(ops::softmax_last_dim(data, layout, temperature)))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
        dims: &MatmulDims,
    ) -> Result<CpuStorage> {
        let a = ops::contiguous(checked(lhs, lhs_layout)?, lhs_layout);
        let b = ops::contiguous(checked(rhs, rhs_layout)?, rhs_layout);
        if a.len() != dims.lhs_batch * dims.m * dims.k
            || b.len() != dims.rhs_batch * dims.k * dims.n
        {
            return Err(Error::shape("matmul", lhs_layout.shape(), rhs_layout.shape()));
        }
        Ok(CpuStorage(matmul::matmul_contiguous(
            &a,
            &b,
            dims,
            pool::matmul_threshold(),
        )))
    }

    fn im2col(
        storage: &CpuStorage,
        layout: &Layout,
        geometry: &Conv2dGeometry,
    ) -> Result<CpuStorage> {
        let data = checked(storage, layout)?;
        Ok(CpuStorage(ops::im2col(data, layout, geometry)))
    }

    fn col2im(
        storage: &CpuStorage,
        layout: &Layout,
        geometry: &Conv2dGeometry,
    ) -> Result<CpuStorage> {
        let data = checked(storage, layout)?;
        Ok(CpuStorage(ops::col2im(data, layout, geometry)))
    }

    fn assign(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
    ) -> Result<()> {
        if dst_layout.shape() != src_layout.shape() {
            return Err(Error::shape("assign", dst_layout.shape(), src_layout.shape()));
        }
        let values = ops::contiguous(checked(src, src_layout)?, src_layout);
        ops::scatter(&mut dst.0, dst_layout, values.iter().copied())
    }

    fn fill(storage: &mut CpuStorage, layout: &Layout, value: f32) -> Result<()> {
        if let Some(off) = layout.contiguous_offset() {
            ops::check_span(storage.len(), layout)?;
            storage.0[off..off + layout.elem_count()].fill(value);
            return Ok(());
        }
        ops::scatter(&mut storage.0, layout, std::iter::repeat(value))
    }

    fn affine_in_place(
        storage: &mut CpuStorage,
        layout: &Layout,
        mul: f32,
        add: f32,
    ) -> Result<()> {
        ops::check_span(storage.len(), layout)?;
        let positions: Vec<usize> = layout.strided_indices().collect();
        let values: Vec<f32> = positions.iter().map(|&p| storage.0[p] * mul + add).collect();
        ops::scatter(&mut storage.0, layout, values.into_iter())
    }

    fn read_at(storage: &CpuStorage, offset: usize) -> Result<f32> {
        storage.0.get(offset).copied().ok_or_else(|| Error::Index {
            index: vec![offset],
            shape: Shape::from(storage.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(data: &[f32]) -> CpuStorage {
        CpuBackend::from_vec(data.to_vec(), &CpuDevice).unwrap()
    }

    #[test]
    fn test_transposed_to_vec() {
        let s = storage(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let layout = Layout::contiguous((2, 3)).transpose(0, 1).unwrap();
        let v = CpuBackend::to_vec(&s, &layout).unwrap();
        assert_eq!(v, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_matmul_transposed_operand() {
        // [[1,2],[3,4]] @ [[1,2],[3,4]]^T
        let s = storage(&[1.0, 2.0, 3.0, 4.0]);
        let l = Layout::contiguous((2, 2));
        let t = l.transpose(0, 1).unwrap();
        let (dims, _) = MatmulDims::from_shapes(l.shape(), t.shape()).unwrap();
        let out = CpuBackend::matmul(&s, &l, &s, &t, &dims).unwrap();
        assert_eq!(out.as_slice(), &[5.0, 11.0, 11.0, 25.0]);
    }

    #[test]
    fn test_assign_into_view() {
        let mut dst = CpuBackend::zeros(&Shape::from((2, 3)), &CpuDevice).unwrap();
        let view = Layout::contiguous((2, 3)).narrow(1, 1, 2).unwrap();
        let src = storage(&[1.0, 2.0, 3.0, 4.0]);
        CpuBackend::assign(&mut dst, &view, &src, &Layout::contiguous((2, 2))).unwrap();
        assert_eq!(dst.as_slice(), &[0.0, 1.0, 2.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_fill_and_affine_in_place_on_view() {
        let mut s = storage(&[1.0; 6]);
        let col = Layout::contiguous((2, 3)).narrow(1, 0, 1).unwrap();
        CpuBackend::fill(&mut s, &col, 5.0).unwrap();
        CpuBackend::affine_in_place(&mut s, &Layout::contiguous((2, 3)), 2.0, 1.0).unwrap();
        assert_eq!(s.as_slice(), &[11.0, 3.0, 3.0, 11.0, 3.0, 3.0]);
    }

    #[test]
    fn test_span_checked() {
        let s = storage(&[1.0; 4]);
        assert!(CpuBackend::to_vec(&s, &Layout::contiguous((2, 3))).is_err());
        assert!(CpuBackend::read_at(&s, 4).is_err());
    }
}
