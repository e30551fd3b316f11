//! The GPU device/buffer boundary operators dispatch through.
//!
//! This crate defines only the boundary: concrete GPU backends (OpenCL,
//! Vulkan compute, ...) are operator-implementation concerns and are out of
//! scope here. The driver crate supplies a concrete `GpuDevice`
//! for tests and leaves production backends to the operators that actually
//! need one.

use thiserror::Error;

/// Opaque handle to a device-resident pixel buffer. Device buffers are
/// owned by the node that allocated them and released on every return path,
/// success or error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuBufferHandle(pub u64);

/// Raw device-level failure categories. The driver classifies these into
/// the `DeviceOOM` / `DeviceTransient` / `DeviceLate` error kinds
/// depending on which operation produced them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// Allocation or fit-check failed: the buffer does not fit on the
    /// device. Drives CPU fallback for the current node.
    #[error("device out of memory")]
    OutOfMemory,
    /// A kernel launch returned a non-success status. Drives CPU fallback
    /// plus the per-session error counter.
    #[error("device kernel failed")]
    KernelFailed,
    /// A host<->device copy failed. Fatal to the current run.
    #[error("device copy failed")]
    CopyFailed,
}

/// An abstract GPU device handle. The driver locks one of these (or none)
/// at the start of a run and passes it to every node whose operator has a
/// GPU path.
pub trait GpuDevice: Send + Sync {
    /// A stable identifier for logging.
    fn id(&self) -> u64;

    /// Bytes of free device memory, used by `tiling_callback`-driven path
    /// selection to decide whether a direct (untiled) GPU dispatch fits.
    fn free_bytes(&self) -> usize;

    /// Allocates a device buffer of `bytes` size.
    ///
    /// # Errors
    /// Returns [`DeviceError::OutOfMemory`] if the allocation does not fit.
    fn alloc(&self, bytes: usize) -> Result<GpuBufferHandle, DeviceError>;

    /// Releases a device buffer. Safe to call more than once; a double
    /// release is a no-op, which keeps every error-path `free` in the
    /// driver unconditional.
    fn free(&self, handle: GpuBufferHandle);

    /// Uploads `host` into a freshly allocated device buffer.
    ///
    /// # Errors
    /// Returns [`DeviceError::OutOfMemory`] if allocation fails.
    fn copy_to_device(&self, host: &[u8]) -> Result<GpuBufferHandle, DeviceError>;

    /// Downloads a device buffer's contents into `host`.
    ///
    /// # Errors
    /// Returns [`DeviceError::CopyFailed`] on a transfer fault; this is
    /// fatal to the current run (`DeviceLate`), not a path for CPU
    /// fallback.
    fn copy_to_host(&self, handle: GpuBufferHandle, host: &mut [u8]) -> Result<(), DeviceError>;

    /// Waits for outstanding device work to complete (synchronization
    /// contract, distinct from [`GpuDevice::end_of_batch`], which only fires
    /// once per forward pass).
    ///
    /// # Errors
    /// Returns [`DeviceError::KernelFailed`] if a previously queued kernel
    /// reported a late failure.
    fn finish(&self) -> Result<(), DeviceError>;

    /// Called once after the whole forward pass completes, independent of
    /// `finish`; used only to decide whether an async pipeline should wait
    /// before publishing the backbuffer.
    fn end_of_batch(&self) {}
}
