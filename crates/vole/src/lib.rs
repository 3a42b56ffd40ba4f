//! # vole
//!
//! N-dimensional f32 tensors with two interchangeable backends and
//! reverse-mode automatic differentiation.
//!
//! ## Usage
//!
//! ```ignore
//! use vole::prelude::*;
//!
//! let config = Config::from_env()?;
//! vole::init(&config);
//! let dev = Device::best_available(&config);
//!
//! let x = Tensor::random((4, 3), Some(0), &dev)?;
//! let w = Tensor::randn((3, 2), Some(1), &dev)?.with_grad();
//! let loss = x.matmul(&w)?.relu()?.sum_all()?;
//! loss.backward()?;
//! let dw = w.grad();
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `vole-core` | Shape, Layout, SliceRange, Error, Backend trait |
//! | `vole-cpu` | CPU backend: rayon parallelism, SIMD batched matmul |
//! | `vole-device` | Device backend: queues, events, budgeted buffers, tiled kernels |
//! | `vole` | Tensor façade, autograd, serialization, configuration |
//!
//! ## Modules
//!
//! - [`tensor`] — the [`Tensor`] handle, construction, in-place ops, transfer
//! - [`op`] — graph nodes ([`Op`]) and their forward/backward rules
//! - [`grad_mode`] — [`no_grad`] scoping
//! - [`config`] — [`Config`] from defaults or the environment

mod backprop;
pub mod config;
pub mod device;
pub mod grad_mode;
mod io;
pub mod op;
mod ops;
pub mod storage;
pub mod tensor;
mod view;

pub use config::{init, Config};
pub use device::Device;
pub use grad_mode::{is_grad_enabled, no_grad, NoGradGuard};
pub use op::{Activation, GradContext, Op, TensorId};
pub use storage::Storage;
pub use tensor::{GradState, Tensor};

pub use vole_core::{BackendKind, Error, Layout, Result, Shape, ShapeRequest, SliceRange};
pub use vole_cpu::CpuConfig;
pub use vole_device::{DeviceConfig, DeviceContext, Event, PoolStats, Queue};

/// Everything needed to build and train with tensors.
pub mod prelude {
    pub use crate::{
        no_grad, BackendKind, Config, Device, Error, GradState, Result, Shape, SliceRange, Tensor,
    };
}
