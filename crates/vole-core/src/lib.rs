//! # vole-core
//!
//! Backend-independent building blocks shared by every vole crate:
//!
//! - [`Shape`] / [`Layout`]: shape, strides, offsets and broadcasting
//! - [`SliceRange`]: per-dimension index selectors
//! - [`Backend`]: the capability set implemented by the CPU and device kernels
//! - [`Error`] / [`Result`]: the single error type used across the workspace

pub mod backend;
pub mod error;
pub mod layout;
pub mod range;
pub mod shape;

pub use backend::{
    Backend, BackendDevice, BackendKind, BackendStorage, BinaryOp, Conv2dGeometry, MatmulDims,
    ReduceOp, UnaryOp,
};
pub use error::{Error, Result};
pub use layout::{Layout, StridedIter};
pub use range::SliceRange;
pub use shape::{Shape, ShapeRequest};
