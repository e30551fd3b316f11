use thiserror::Error;

use pixelpipe_operator::gpu::DeviceError;
use pixelpipe_operator::OperatorError;

/// Errors surfaced by the pipeline driver.
#[derive(Error, Debug)]
pub enum Error {
    /// A cancellation predicate fired mid-run. Unwinds silently; the
    /// previously published backbuffer is left unchanged.
    #[error("run cancelled")]
    Cancelled,
    /// GPU allocation or an image-fit check failed. Triggers CPU fallback
    /// for the current node only.
    #[error("device out of memory")]
    DeviceOom,
    /// A GPU kernel returned a non-success code. Triggers CPU fallback for
    /// the current node and increments the per-session error counter.
    #[error("transient device error")]
    DeviceTransient,
    /// A host<->device copy-back failed. Fatal to the current run; the run
    /// restarts once with GPU disabled.
    #[error("late device error during copy-back")]
    DeviceLate,
    /// A cache allocation failed. Fatal to the current run.
    #[error("host allocation failure")]
    #[allow(clippy::enum_variant_names)]
    HostOom(#[from] pixelpipe_cache::Error),
    /// An internal impossibility (e.g. an unreachable CFA branch). Fatal to
    /// the run.
    #[error("internal invariant violated: {0}")]
    Invariant(&'static str),
    /// The named operator does not exist in the registry.
    #[error("no such operator: '{0}'")]
    UnknownOperator(String),
    /// No input has been installed via `set_input`.
    #[error("pipeline has no input installed")]
    NoInput,
}

impl From<OperatorError> for Error {
    fn from(err: OperatorError) -> Self {
        match err {
            OperatorError::NotSupported => Self::Invariant("operator path not supported"),
            OperatorError::Invariant(msg) => Self::Invariant(msg),
            OperatorError::Device(DeviceError::OutOfMemory) => Self::DeviceOom,
            OperatorError::Device(DeviceError::KernelFailed) => Self::DeviceTransient,
            OperatorError::Device(DeviceError::CopyFailed) => Self::DeviceLate,
        }
    }
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfMemory => Self::DeviceOom,
            DeviceError::KernelFailed => Self::DeviceTransient,
            DeviceError::CopyFailed => Self::DeviceLate,
        }
    }
}
