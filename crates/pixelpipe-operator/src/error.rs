use thiserror::Error;

use crate::gpu::DeviceError;

/// Errors an operator's CPU or GPU path can report.
#[derive(Error, Debug)]
pub enum OperatorError {
    /// The operator has no implementation of the path that was invoked
    /// (e.g. `process_tiling` when `tiling_ready() == false`).
    #[error("path not supported by this operator")]
    NotSupported,
    /// A GPU-side failure; carries the underlying device error so the
    /// driver can classify it (`DeviceOOM`/`DeviceTransient`/
    /// `DeviceLate`).
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    /// An internal impossibility inside operator code (e.g. an
    /// unreachable CFA branch).
    #[error("operator invariant violated: {0}")]
    Invariant(&'static str),
}
