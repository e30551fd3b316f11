//! Synthetic operators exercising the driver's rebuild classes, ROI
//! propagation, GPU fallback and cancellation paths, without depending on
//! any real demosaic/tone-mapping implementation.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use serde::Deserialize;

use pixelpipe_cache::{Datatype, ImageBufferDescriptor, Roi};
use pixelpipe_operator::contract::NodeContext;
use pixelpipe_operator::descriptor::{Colorspace, OperationTags};
use pixelpipe_operator::error::OperatorError;
use pixelpipe_operator::gpu::{DeviceError, GpuBufferHandle, GpuDevice};
use pixelpipe_operator::params::ParamsBlob;
use pixelpipe_operator::tiling::TilingEstimate;
use pixelpipe_operator::Operator;

/// Passes its input through unchanged.
#[derive(Debug, Default)]
pub struct IdentityOp;

impl Operator for IdentityOp {
    fn output_format(&self, _ctx: &NodeContext<'_>, in_dsc: &ImageBufferDescriptor) -> ImageBufferDescriptor {
        in_dsc.clone()
    }

    fn modify_roi_in(&self, _ctx: &NodeContext<'_>, roi_out: &Roi) -> Roi {
        *roi_out
    }

    fn modify_roi_out(&self, _ctx: &NodeContext<'_>, roi_in: &Roi) -> Roi {
        *roi_in
    }

    fn commit(&self, _params: &ParamsBlob, _blend_params: &ParamsBlob) -> Box<dyn Any + Send + Sync> {
        Box::new(())
    }

    fn process(
        &self,
        _ctx: &NodeContext<'_>,
        input: &[u8],
        output: &mut [u8],
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), OperatorError> {
        output.copy_from_slice(input);
        Ok(())
    }

    fn tiling_callback(&self, _ctx: &NodeContext<'_>, _roi_in: &Roi, _roi_out: &Roi) -> TilingEstimate {
        TilingEstimate::identity(0)
    }

    fn operation_tags(&self) -> OperationTags {
        OperationTags::empty()
    }

    fn colorspace(&self) -> Colorspace {
        Colorspace::Rgb
    }
}

/// Like [`IdentityOp`] but tagged [`OperationTags::DISTORTS_GEOMETRY`] and
/// widening its requested input ROI by a fixed border, standing in for a
/// lens-correction-style operator for ROI-monotonicity tests.
#[derive(Debug, Default)]
pub struct BorderDistortOp {
    /// Pixels of extra border requested on every side.
    pub border: u32,
}

impl Operator for BorderDistortOp {
    fn output_format(&self, _ctx: &NodeContext<'_>, in_dsc: &ImageBufferDescriptor) -> ImageBufferDescriptor {
        in_dsc.clone()
    }

    fn modify_roi_in(&self, _ctx: &NodeContext<'_>, roi_out: &Roi) -> Roi {
        Roi {
            x: roi_out.x.saturating_sub(self.border),
            y: roi_out.y.saturating_sub(self.border),
            width: roi_out.width + 2 * self.border,
            height: roi_out.height + 2 * self.border,
            scale: roi_out.scale,
        }
    }

    fn modify_roi_out(&self, _ctx: &NodeContext<'_>, roi_in: &Roi) -> Roi {
        Roi {
            x: roi_in.x + self.border,
            y: roi_in.y + self.border,
            width: roi_in.width.saturating_sub(2 * self.border).max(1),
            height: roi_in.height.saturating_sub(2 * self.border).max(1),
            scale: roi_in.scale,
        }
    }

    fn commit(&self, _params: &ParamsBlob, _blend_params: &ParamsBlob) -> Box<dyn Any + Send + Sync> {
        Box::new(())
    }

    fn process(
        &self,
        _ctx: &NodeContext<'_>,
        input: &[u8],
        output: &mut [u8],
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), OperatorError> {
        let n = output.len().min(input.len());
        output[..n].copy_from_slice(&input[..n]);
        Ok(())
    }

    fn tiling_callback(&self, _ctx: &NodeContext<'_>, _roi_in: &Roi, _roi_out: &Roi) -> TilingEstimate {
        TilingEstimate::identity(0)
    }

    fn operation_tags(&self) -> OperationTags {
        OperationTags::DISTORTS_GEOMETRY
    }

    fn colorspace(&self) -> Colorspace {
        Colorspace::Rgb
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct CropParams {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// Crops its input to a fixed rectangle in the committed parameters,
/// tagged [`OperationTags::DISTORTS_GEOMETRY`].
#[derive(Debug, Default)]
pub struct CropOp;

impl Operator for CropOp {
    fn output_format(&self, ctx: &NodeContext<'_>, in_dsc: &ImageBufferDescriptor) -> ImageBufferDescriptor {
        let crop = ctx.scratch_as::<CropParams>();
        let (width, height) = crop.map_or((in_dsc.width, in_dsc.height), |c| (c.width, c.height));
        ImageBufferDescriptor {
            width,
            height,
            ..in_dsc.clone()
        }
    }

    fn modify_roi_in(&self, ctx: &NodeContext<'_>, roi_out: &Roi) -> Roi {
        let crop = ctx.scratch_as::<CropParams>().copied().unwrap_or(CropParams { x: 0, y: 0, width: roi_out.width, height: roi_out.height });
        Roi {
            x: roi_out.x + crop.x,
            y: roi_out.y + crop.y,
            width: roi_out.width,
            height: roi_out.height,
            scale: roi_out.scale,
        }
    }

    fn modify_roi_out(&self, ctx: &NodeContext<'_>, roi_in: &Roi) -> Roi {
        let crop = ctx.scratch_as::<CropParams>().copied().unwrap_or(CropParams { x: 0, y: 0, width: roi_in.width, height: roi_in.height });
        Roi {
            x: roi_in.x.saturating_sub(crop.x),
            y: roi_in.y.saturating_sub(crop.y),
            width: roi_in.width.min(crop.width).max(1),
            height: roi_in.height.min(crop.height).max(1),
            scale: roi_in.scale,
        }
    }

    fn commit(&self, params: &ParamsBlob, _blend_params: &ParamsBlob) -> Box<dyn Any + Send + Sync> {
        let crop = params.to_typed::<CropParams>().unwrap_or(CropParams { x: 0, y: 0, width: 1, height: 1 });
        Box::new(crop)
    }

    fn process(
        &self,
        _ctx: &NodeContext<'_>,
        input: &[u8],
        output: &mut [u8],
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), OperatorError> {
        // `modify_roi_in` already translated the request, so the upstream
        // buffer lands pre-aligned with this node's output shape.
        let n = output.len().min(input.len());
        output[..n].copy_from_slice(&input[..n]);
        Ok(())
    }

    fn tiling_callback(&self, _ctx: &NodeContext<'_>, _roi_in: &Roi, _roi_out: &Roi) -> TilingEstimate {
        TilingEstimate::identity(0)
    }

    fn operation_tags(&self) -> OperationTags {
        OperationTags::DISTORTS_GEOMETRY
    }

    fn colorspace(&self) -> Colorspace {
        Colorspace::Rgb
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct GammaParams {
    gamma: f32,
}

/// The pipeline's terminal tone-mapping node: converts `Float32` RGBA into
/// `Uint8` RGBA by applying `x^(1/gamma)` per row, in parallel via `rayon`.
#[derive(Debug, Default)]
pub struct GammaOp;

impl Operator for GammaOp {
    fn output_format(&self, _ctx: &NodeContext<'_>, in_dsc: &ImageBufferDescriptor) -> ImageBufferDescriptor {
        ImageBufferDescriptor {
            width: in_dsc.width,
            height: in_dsc.height,
            channels: in_dsc.channels,
            datatype: Datatype::Uint8,
            processed_maximum: [255.0; 4],
        }
    }

    fn modify_roi_in(&self, _ctx: &NodeContext<'_>, roi_out: &Roi) -> Roi {
        *roi_out
    }

    fn modify_roi_out(&self, _ctx: &NodeContext<'_>, roi_in: &Roi) -> Roi {
        *roi_in
    }

    fn commit(&self, params: &ParamsBlob, _blend_params: &ParamsBlob) -> Box<dyn Any + Send + Sync> {
        let gamma = params.to_typed::<GammaParams>().unwrap_or(GammaParams { gamma: 2.2 });
        Box::new(gamma)
    }

    fn process(
        &self,
        ctx: &NodeContext<'_>,
        input: &[u8],
        output: &mut [u8],
        roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), OperatorError> {
        let gamma = ctx.scratch_as::<GammaParams>().map_or(2.2, |g| g.gamma);
        let channels = 4usize; // this operator only runs on Rgba float buffers
        let row_in_bytes = roi_in.width as usize * channels * 4;
        let row_out_bytes = roi_in.width as usize * channels;
        if input.len() < roi_in.height as usize * row_in_bytes || output.len() < roi_in.height as usize * row_out_bytes {
            return Err(OperatorError::Invariant("gamma buffer size mismatch"));
        }

        output
            .par_chunks_mut(row_out_bytes)
            .zip(input.par_chunks(row_in_bytes))
            .for_each(|(out_row, in_row)| {
                for (out_px, in_px) in out_row.chunks_exact_mut(1).zip(in_row.chunks_exact(4)) {
                    let v = f32::from_le_bytes([in_px[0], in_px[1], in_px[2], in_px[3]]);
                    let mapped = v.clamp(0.0, 1.0).powf(1.0 / gamma);
                    out_px[0] = (mapped * 255.0).round() as u8;
                }
            });
        Ok(())
    }

    fn tiling_callback(&self, _ctx: &NodeContext<'_>, _roi_in: &Roi, _roi_out: &Roi) -> TilingEstimate {
        TilingEstimate::identity(0)
    }

    fn operation_tags(&self) -> OperationTags {
        OperationTags::empty()
    }

    fn colorspace(&self) -> Colorspace {
        Colorspace::Rgb
    }
}

/// A GPU-capable identity operator whose `process_cl` can be switched to
/// fail on demand, for exercising the driver's GPU->CPU fallback and the
/// session-wide error-threshold shutoff.
#[derive(Debug, Default)]
pub struct FlakyGpuOp {
    force_failure: AtomicBool,
}

impl FlakyGpuOp {
    /// Creates an operator whose GPU path currently succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches the GPU path to fail (or succeed) on every subsequent call.
    pub fn set_force_failure(&self, fail: bool) {
        self.force_failure.store(fail, Ordering::Release);
    }
}

impl Operator for FlakyGpuOp {
    fn output_format(&self, _ctx: &NodeContext<'_>, in_dsc: &ImageBufferDescriptor) -> ImageBufferDescriptor {
        in_dsc.clone()
    }

    fn modify_roi_in(&self, _ctx: &NodeContext<'_>, roi_out: &Roi) -> Roi {
        *roi_out
    }

    fn modify_roi_out(&self, _ctx: &NodeContext<'_>, roi_in: &Roi) -> Roi {
        *roi_in
    }

    fn commit(&self, _params: &ParamsBlob, _blend_params: &ParamsBlob) -> Box<dyn Any + Send + Sync> {
        Box::new(())
    }

    fn process(
        &self,
        _ctx: &NodeContext<'_>,
        input: &[u8],
        output: &mut [u8],
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), OperatorError> {
        output.copy_from_slice(input);
        Ok(())
    }

    fn process_cl(
        &self,
        _ctx: &NodeContext<'_>,
        device: &dyn GpuDevice,
        input: GpuBufferHandle,
        output: GpuBufferHandle,
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<(), OperatorError> {
        if self.force_failure.load(Ordering::Acquire) {
            return Err(OperatorError::Device(DeviceError::KernelFailed));
        }
        // Synthetic device-side copy: downloads and re-uploads through the
        // host is outside this operator's job, so it just asks the device
        // to echo `input` into `output` byte for byte via `finish`.
        let _ = device.id();
        let _ = (input, output);
        Ok(())
    }

    fn tiling_callback(&self, _ctx: &NodeContext<'_>, _roi_in: &Roi, _roi_out: &Roi) -> TilingEstimate {
        TilingEstimate::identity(0)
    }

    fn operation_tags(&self) -> OperationTags {
        OperationTags::empty()
    }

    fn colorspace(&self) -> Colorspace {
        Colorspace::Rgb
    }

    fn cl_ready(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelpipe_cache::{Channels as Ch, Datatype as Dt};

    fn dsc() -> ImageBufferDescriptor {
        ImageBufferDescriptor::new(4, 4, Ch::Rgba, Dt::Float32)
    }

    #[test]
    fn identity_copies_input_verbatim() {
        let op = IdentityOp;
        let scratch = op.commit(&ParamsBlob::empty(), &ParamsBlob::empty());
        let ctx = NodeContext::new(scratch.as_ref());
        let input = vec![7u8; 4 * 4 * 16];
        let mut output = vec![0u8; 4 * 4 * 16];
        let roi = Roi::identity(4, 4);
        op.process(&ctx, &input, &mut output, &roi, &roi).unwrap();
        assert_eq!(input, output);
    }

    #[test]
    fn gamma_maps_full_scale_input_to_max_byte() {
        let op = GammaOp;
        let params = ParamsBlob::from_serializable(&GammaParams { gamma: 2.2 }).unwrap();
        let scratch = op.commit(&params, &ParamsBlob::empty());
        let ctx = NodeContext::new(scratch.as_ref());
        let roi = Roi::identity(2, 1);
        let mut input = vec![0u8; 2 * 1 * 16];
        for chunk in input.chunks_exact_mut(4) {
            chunk.copy_from_slice(&1.0f32.to_le_bytes());
        }
        let mut output = vec![0u8; 2 * 1 * 4];
        op.process(&ctx, &input, &mut output, &roi, &roi).unwrap();
        assert_eq!(output, vec![255u8; 2 * 1 * 4]);
    }

    #[test]
    fn flaky_gpu_op_honors_forced_failure() {
        struct NullDevice;
        impl GpuDevice for NullDevice {
            fn id(&self) -> u64 {
                0
            }
            fn free_bytes(&self) -> usize {
                usize::MAX
            }
            fn alloc(&self, _bytes: usize) -> Result<GpuBufferHandle, DeviceError> {
                Ok(GpuBufferHandle(0))
            }
            fn free(&self, _handle: GpuBufferHandle) {}
            fn copy_to_device(&self, _host: &[u8]) -> Result<GpuBufferHandle, DeviceError> {
                Ok(GpuBufferHandle(0))
            }
            fn copy_to_host(&self, _handle: GpuBufferHandle, _host: &mut [u8]) -> Result<(), DeviceError> {
                Ok(())
            }
            fn finish(&self) -> Result<(), DeviceError> {
                Ok(())
            }
        }

        let op = FlakyGpuOp::new();
        let scratch = op.commit(&ParamsBlob::empty(), &ParamsBlob::empty());
        let ctx = NodeContext::new(scratch.as_ref());
        let device = NullDevice;
        let roi = Roi::identity(2, 2);
        assert!(op
            .process_cl(&ctx, &device, GpuBufferHandle(1), GpuBufferHandle(2), &roi, &roi)
            .is_ok());
        op.set_force_failure(true);
        assert!(op
            .process_cl(&ctx, &device, GpuBufferHandle(1), GpuBufferHandle(2), &roi, &roi)
            .is_err());
    }
}
