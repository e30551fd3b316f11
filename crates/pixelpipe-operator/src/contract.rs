//! The `Operator` trait: the polymorphic capability set every IOP
//! implements.

use std::any::Any;

use pixelpipe_cache::{ImageBufferDescriptor, Roi};

use crate::descriptor::{Colorspace, OperationTags};
use crate::error::OperatorError;
use crate::gpu::{GpuBufferHandle, GpuDevice};
use crate::params::ParamsBlob;
use crate::tiling::TilingEstimate;

/// Per-node context passed into every `Operator` method.
///
/// `scratch` is whatever `Operator::commit` produced for this node; the
/// driver owns its storage and lifetime but never interprets it. Pure
/// methods (`output_format`, `modify_roi_in`, `modify_roi_out`) only ever
/// read it.
pub struct NodeContext<'a> {
    /// This node's committed scratch state, as produced by the last call to
    /// [`Operator::commit`].
    pub scratch: &'a (dyn Any + Send + Sync),
}

impl<'a> NodeContext<'a> {
    /// Creates a context wrapping `scratch`.
    #[must_use]
    pub fn new(scratch: &'a (dyn Any + Send + Sync)) -> Self {
        Self { scratch }
    }

    /// Downcasts the scratch to a concrete type. Operators should only ever
    /// downcast to the type their own `commit` produced.
    #[must_use]
    pub fn scratch_as<T: 'static>(&self) -> Option<&T> {
        self.scratch.downcast_ref::<T>()
    }
}

/// The capability set every image-processing operator implements.
///
/// Implementations must be `Send + Sync`: a single operator descriptor may
/// back nodes used concurrently by several pipelines (full/preview/export)
/// running on different threads.
pub trait Operator: Send + Sync {
    /// Pure. Describes how this operator changes the buffer format (e.g.
    /// demosaicing expands a 1-channel CFA input to 4-channel RGBA).
    fn output_format(
        &self,
        ctx: &NodeContext<'_>,
        in_dsc: &ImageBufferDescriptor,
    ) -> ImageBufferDescriptor;

    /// Pure. Describes what this operator needs to read from its input to
    /// produce `roi_out`. Must be monotone: shrinking `roi_out` must never
    /// enlarge the returned ROI.
    fn modify_roi_in(&self, ctx: &NodeContext<'_>, roi_out: &Roi) -> Roi;

    /// Pure. The inverse of `modify_roi_in`, used to compute total
    /// processed dimensions from the source forward.
    fn modify_roi_out(&self, ctx: &NodeContext<'_>, roi_in: &Roi) -> Roi;

    /// Prepares per-node scratch state from the node's typed parameter
    /// blobs. Idempotent: calling it twice with the same blobs must leave
    /// the node in the same observable state.
    fn commit(
        &self,
        params: &ParamsBlob,
        blend_params: &ParamsBlob,
    ) -> Box<dyn Any + Send + Sync>;

    /// The CPU path. Must not spoil `input` even on failure.
    ///
    /// # Errors
    /// Returns [`OperatorError::Invariant`] on an internal impossibility.
    fn process(
        &self,
        ctx: &NodeContext<'_>,
        input: &[u8],
        output: &mut [u8],
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<(), OperatorError>;

    /// The CPU tiled path, present iff [`Operator::tiling_ready`] is true.
    /// `in_bpp` is the input's bytes-per-pixel, needed to address
    /// sub-tiles of `input` directly.
    ///
    /// # Errors
    /// Returns [`OperatorError::NotSupported`] by default.
    fn process_tiling(
        &self,
        _ctx: &NodeContext<'_>,
        _input: &[u8],
        _output: &mut [u8],
        _roi_in: &Roi,
        _roi_out: &Roi,
        _in_bpp: usize,
    ) -> Result<(), OperatorError> {
        Err(OperatorError::NotSupported)
    }

    /// The GPU path, present iff [`Operator::cl_ready`] is true. Must not
    /// spoil `input` on failure.
    ///
    /// # Errors
    /// Returns [`OperatorError::NotSupported`] by default, or
    /// [`OperatorError::Device`] on a device-side failure.
    fn process_cl(
        &self,
        _ctx: &NodeContext<'_>,
        _device: &dyn GpuDevice,
        _input: GpuBufferHandle,
        _output: GpuBufferHandle,
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), OperatorError> {
        Err(OperatorError::NotSupported)
    }

    /// The GPU tiled variant.
    ///
    /// # Errors
    /// Returns [`OperatorError::NotSupported`] by default, or
    /// [`OperatorError::Device`] on a device-side failure.
    fn process_tiling_cl(
        &self,
        _ctx: &NodeContext<'_>,
        _device: &dyn GpuDevice,
        _input: GpuBufferHandle,
        _output: GpuBufferHandle,
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), OperatorError> {
        Err(OperatorError::NotSupported)
    }

    /// Memory estimate used both to pick between direct and tiled execution
    /// and to decide if the device has room.
    fn tiling_callback(&self, ctx: &NodeContext<'_>, roi_in: &Roi, roi_out: &Roi)
        -> TilingEstimate;

    /// Static tag bitset (distortion, preview-only, ...).
    fn operation_tags(&self) -> OperationTags;

    /// Preferred input colorspace.
    fn colorspace(&self) -> Colorspace;

    /// Whether this operator has a working `process_tiling`/
    /// `process_tiling_cl` implementation.
    fn tiling_ready(&self) -> bool {
        false
    }

    /// Whether this operator has a working `process_cl`/`process_tiling_cl`
    /// implementation.
    fn cl_ready(&self) -> bool {
        false
    }
}
