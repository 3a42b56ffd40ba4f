use crate::backend::BackendKind;
use crate::shape::Shape;

/// All errors that can occur within vole.
///
/// One enum covers every layer: shape algebra, indexing, backend dispatch,
/// the device runtime, autograd and serialization. Only
/// [`Error::DeviceUnavailable`] is meant to be recovered from (by falling back
/// to the CPU backend); everything else aborts the current operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two shapes are incompatible for an operation (e.g. adding [2, 3] and [4]).
    #[error("{op}: incompatible shapes {lhs} and {rhs}")]
    Shape {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// A shape has a zero-sized dimension; every dimension must be positive.
    #[error("{op}: shape {shape} has a zero-sized dimension")]
    ZeroDim { op: &'static str, shape: Shape },

    /// A reshape target cannot hold the source's elements.
    #[error("cannot reshape {src} into {dst}")]
    Reshape { src: Shape, dst: String },

    /// Operation requires a specific rank.
    #[error("{op}: expected rank {expected}, got {got}")]
    Rank {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension {dim} out of range for tensor of rank {rank}")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Element count mismatch when creating from data.
    #[error("shape {shape} requires {expected} elements, got {got}")]
    ElementCount {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Out-of-bounds multi-index.
    #[error("index {index:?} out of bounds for shape {shape}")]
    Index { index: Vec<usize>, shape: Shape },

    /// A slice range does not fit inside its dimension.
    #[error("range {start}..{stop} (step {step}) out of bounds for dim {dim} of size {size}")]
    RangeOutOfBounds {
        dim: usize,
        start: usize,
        stop: usize,
        step: usize,
        size: usize,
    },

    /// CPU and device operands mixed without an explicit transfer.
    #[error(
        "{op}: operands live on different backends ({lhs} vs {rhs}), transfer one with `to` first"
    )]
    BackendMismatch {
        op: &'static str,
        lhs: BackendKind,
        rhs: BackendKind,
    },

    /// The compute device could not be opened. Callers may fall back to the CPU.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A kernel launch failed. Fatal for the operation that issued it.
    #[error("device kernel `{kernel}` failed: {reason}")]
    DeviceKernelFailure { kernel: String, reason: String },

    /// The device allocation budget is exhausted.
    #[error("device out of memory: requested {requested} bytes, {available} available")]
    DeviceOutOfMemory { requested: usize, available: usize },

    /// A device buffer was used after it was released.
    #[error("device buffer {buffer} used after release")]
    BufferReleased { buffer: u64 },

    /// A backward rule produced (or received) a gradient of the wrong shape.
    #[error("gradient shape error in {op}: expected {expected}, got {got}")]
    GradientShape {
        op: &'static str,
        expected: Shape,
        got: Shape,
    },

    /// In-place mutation of a tensor that is part of a recorded graph.
    #[error("in-place {op} on a tensor that requires grad")]
    InPlaceOnTracked { op: &'static str },

    /// Data a recorded node depends on was overwritten before backward ran.
    #[error("{op}: a tensor saved for backward was modified in place")]
    ModifiedAfterRecord { op: &'static str },

    /// Malformed serialized tensor.
    #[error("invalid tensor encoding: {0}")]
    Format(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Shorthand for [`Error::Shape`].
    pub fn shape(op: &'static str, lhs: &Shape, rhs: &Shape) -> Self {
        Error::Shape {
            op,
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        }
    }

    /// Whether the caller is expected to recover (by choosing another backend).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::DeviceUnavailable(_))
    }
}

/// Convenience Result type used throughout vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted [`Error::Msg`].
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
