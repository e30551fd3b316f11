//! The recursive backward-ROI / forward-execute algorithm, GPU↔CPU
//! dispatch and fallback, and session-wide GPU health tracking.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::{debug, warn};

use pixelpipe_cache::{
    CacheEntryHandle, ChainHash, Fingerprint, FingerprintHasher, ImageBufferDescriptor, Roi,
};
use pixelpipe_operator::contract::NodeContext;
use pixelpipe_operator::descriptor::OperationTags;
use pixelpipe_operator::gpu::GpuDevice;

use crate::error::Error;
use crate::pipeline::{Backbuffer, BusyState, CancelSnapshot, Pipeline};
use crate::sampler;

/// Session-wide GPU health, shared by every [`Pipeline`] constructed with the
/// same `Arc<GpuSession>` (typically one per process). A run that
/// accumulates [`crate::config::PipelineConfig::gpu_error_threshold`]
/// consecutive kernel failures disables GPU for every pipeline sharing this
/// session, not just the one that hit the threshold.
#[derive(Debug, Default)]
pub struct GpuSession {
    consecutive_errors: AtomicU32,
    disabled: AtomicBool,
}

impl GpuSession {
    /// A fresh session with GPU enabled and no recorded failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether GPU has been disabled for the rest of this session.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Records a kernel failure, disabling GPU session-wide once
    /// `threshold` consecutive failures have been seen.
    pub fn record_failure(&self, threshold: u32) {
        let count = self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= threshold {
            warn!(threshold, "GPU disabled for the remainder of the session");
            self.disabled.store(true, Ordering::Release);
        }
    }

    /// Resets the consecutive-failure counter after a clean run.
    pub fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::Release);
    }
}

/// One fully-materialized node output: a handle into the pipeline's buffer
/// cache plus the fingerprint and descriptor it was stored under.
struct RecurseOutput {
    handle: CacheEntryHandle,
    fingerprint: Fingerprint,
    descriptor: ImageBufferDescriptor,
}

enum ExecPath {
    GpuDirect,
    GpuTiled,
    CpuTiled,
    CpuDirect,
}

impl Pipeline {
    /// Entry point: `run(x, y, w, h, scale) -> ok`.
    ///
    /// # Errors
    /// Returns [`Error::NoInput`] if no source image has been installed,
    /// [`Error::Cancelled`] if a cancellation predicate fired mid-run, or
    /// any other [`Error`] variant surfaced by an operator or the cache.
    pub fn run(&self, x: u32, y: u32, w: u32, h: u32, scale: f32) -> Result<(), Error> {
        let roi_out = Roi::new(x, y, w, h, scale);
        loop {
            if self.take_cache_obsolete() {
                self.busy.lock().expect("busy mutex poisoned").cache.flush();
            }

            let snapshot = self.take_cancel_snapshot();
            let mut nan_offenders: Vec<&'static str> = Vec::new();
            let mut busy = self.busy.lock().expect("busy mutex poisoned");

            if Pipeline::input(&busy).is_none() {
                return Err(Error::NoInput);
            }
            if busy.nodes.is_empty() {
                return Err(Error::Invariant("pipeline has no nodes"));
            }
            let last = busy.nodes.len() - 1;

            let gpu_live = self.config.gpu_enabled && !self.gpu_session.is_disabled();
            let device = if gpu_live { self.device.as_deref() } else { None };

            let outcome = self.recurse(&mut busy, device, &snapshot, last, roi_out, &mut nan_offenders);

            if let Some(device) = device {
                let _ = device.finish();
                device.end_of_batch();
            }

            match outcome {
                Ok(result) => {
                    if !nan_offenders.is_empty() {
                        warn!(?nan_offenders, "non-finite values produced this run");
                    }
                    self.gpu_session.record_success();
                    let buffer = busy.cache.buffer(result.handle).to_vec();
                    let descriptor = result.descriptor;
                    let fingerprint = result.fingerprint;
                    drop(busy);
                    self.publish_backbuffer(Backbuffer { fingerprint, descriptor, buffer });
                    return Ok(());
                }
                Err(Error::DeviceLate) => {
                    warn!("late device error, restarting with GPU disabled for this pipeline");
                    self.mark_cache_obsolete();
                    drop(busy);
                    continue;
                }
                Err(other) => {
                    drop(busy);
                    return Err(other);
                }
            }
        }
    }

    fn recurse(
        &self,
        busy: &mut BusyState,
        device: Option<&dyn GpuDevice>,
        snapshot: &CancelSnapshot,
        position: usize,
        roi_out: Roi,
        nan_offenders: &mut Vec<&'static str>,
    ) -> Result<RecurseOutput, Error> {
        // (a) disabled/filtered nodes are transparent: fall through to the
        // predecessor with the same requested ROI.
        if busy.nodes[position].is_noop() {
            let Some(predecessor) = position.checked_sub(1) else {
                return Err(Error::Invariant("source node cannot be disabled"));
            };
            return self.recurse(busy, device, snapshot, predecessor, roi_out, nan_offenders);
        }

        // (b) fingerprint + cache lookup.
        let image_id = self.image_id.load(Ordering::Acquire);
        let fingerprint = FingerprintHasher::hash(
            image_id,
            &roi_out,
            self.config.kind,
            position,
            busy.nodes[position].committed_hash,
        );
        if let Some(handle) = busy.cache.lookup(fingerprint) {
            let descriptor = busy
                .cache
                .descriptor(handle)
                .cloned()
                .ok_or(Error::Invariant("cache hit with no descriptor"))?;
            return Ok(RecurseOutput { handle, fingerprint, descriptor });
        }

        // (c) cancellation.
        if self.cancelled_since(snapshot) {
            return Err(Error::Cancelled);
        }

        let is_final = position == busy.nodes.len() - 1;

        // (d) source node: materialize directly from the installed input.
        if position == 0 {
            let (input_buffer, input_dsc) = Pipeline::input(busy).ok_or(Error::NoInput)?;
            let (bytes, descriptor) = materialize_source(input_buffer, input_dsc, &roi_out);
            let (handle, _hit) = busy.cache.reserve(fingerprint, bytes.len(), descriptor.clone())?;
            busy.cache.buffer_mut(handle)[..bytes.len()].copy_from_slice(&bytes);
            if is_final {
                busy.cache.mark_important(handle);
            }
            self.run_sampler_hooks(busy, position, handle, &descriptor, &roi_out);
            return Ok(RecurseOutput { handle, fingerprint, descriptor });
        }

        // (e) ask for the upstream ROI, then recurse.
        let roi_in = {
            let ctx = NodeContext::new(busy.nodes[position].scratch.as_ref());
            let Some((_, operator)) = self.registry.at(busy.nodes[position].operator_position) else {
                return Err(Error::UnknownOperator(busy.nodes[position].operator_name.to_string()));
            };
            operator.modify_roi_in(&ctx, &roi_out)
        };
        let input = self.recurse(busy, device, snapshot, position - 1, roi_in, nan_offenders)?;

        if self.cancelled_since(snapshot) {
            return Err(Error::Cancelled);
        }

        let in_dsc = input.descriptor.clone();
        let input_bytes = busy.cache.buffer(input.handle).to_vec();

        let (out_dsc, operation_tags, cl_ready, tiling_ready) = {
            let ctx = NodeContext::new(busy.nodes[position].scratch.as_ref());
            let Some((_, operator)) = self.registry.at(busy.nodes[position].operator_position) else {
                return Err(Error::UnknownOperator(busy.nodes[position].operator_name.to_string()));
            };
            // `output_format` only speaks to channel/datatype conversion
            // (e.g. demosaic expanding a 1-channel CFA input to RGBA); the
            // buffer's actual width/height are dictated by `roi_out`, the
            // rectangle this node was asked to produce.
            let format = operator.output_format(&ctx, &in_dsc);
            let dsc = ImageBufferDescriptor {
                width: roi_out.width,
                height: roi_out.height,
                ..format
            };
            (
                dsc,
                operator.operation_tags(),
                operator.cl_ready(),
                operator.tiling_ready(),
            )
        };

        let required_bytes = out_dsc.width as usize * out_dsc.height as usize * out_dsc.bytes_per_pixel();
        let (out_handle, _hit) = busy.cache.reserve(fingerprint, required_bytes, out_dsc.clone())?;
        if is_final {
            busy.cache.mark_important(out_handle);
        }

        // (f) mask-display short-circuit: draw-channel overlays need the
        // input verbatim, which is only meaningful when the operator
        // doesn't distort geometry and the formats already agree.
        let mask_display = busy.mask_display_node == Some(position);
        if mask_display && !operation_tags.contains(OperationTags::DISTORTS_GEOMETRY) && in_dsc == out_dsc {
            busy.cache.buffer_mut(out_handle)[..input_bytes.len()].copy_from_slice(&input_bytes);
            self.run_sampler_hooks(busy, position, out_handle, &out_dsc, &roi_out);
            if busy.focused_node == Some(position) {
                busy.cache.reweight(input.handle);
            }
            return Ok(RecurseOutput { handle: out_handle, fingerprint, descriptor: out_dsc });
        }

        // (g) path selection and execution, with GPU->CPU fallback.
        let mut output_bytes = vec![0u8; required_bytes];
        let path = {
            let ctx = NodeContext::new(busy.nodes[position].scratch.as_ref());
            let Some((_, operator)) = self.registry.at(busy.nodes[position].operator_position) else {
                return Err(Error::UnknownOperator(busy.nodes[position].operator_name.to_string()));
            };
            let estimate = operator.tiling_callback(&ctx, &roi_in, &roi_out);
            choose_path(device, cl_ready, tiling_ready, &estimate, input_bytes.len(), self.config.host_memory_limit_bytes)
        };

        let mut ran_on_gpu = false;
        if matches!(path, ExecPath::GpuDirect | ExecPath::GpuTiled) {
            match self.try_gpu(busy, position, device.expect("gpu path implies a device"), &input_bytes, &mut output_bytes, &roi_in, &roi_out, matches!(path, ExecPath::GpuTiled)) {
                Ok(()) => ran_on_gpu = true,
                Err(Error::DeviceOom) => {
                    // Allocation/fit failure: CPU fallback for this node
                    // only, no session-wide consequence.
                    debug!(node = busy.nodes[position].operator_name, "GPU out of memory, falling back to CPU");
                }
                Err(Error::DeviceTransient) => {
                    self.gpu_session.record_failure(self.config.gpu_error_threshold);
                    debug!(node = busy.nodes[position].operator_name, "GPU kernel failed, falling back to CPU");
                }
                Err(other) => return Err(other),
            }
        }

        if !ran_on_gpu {
            let ctx = NodeContext::new(busy.nodes[position].scratch.as_ref());
            let Some((_, operator)) = self.registry.at(busy.nodes[position].operator_position) else {
                return Err(Error::UnknownOperator(busy.nodes[position].operator_name.to_string()));
            };
            let use_tiling = matches!(path, ExecPath::CpuTiled) && tiling_ready;
            if use_tiling {
                operator.process_tiling(&ctx, &input_bytes, &mut output_bytes, &roi_in, &roi_out, in_dsc.bytes_per_pixel())?;
            } else {
                operator.process(&ctx, &input_bytes, &mut output_bytes, &roi_in, &roi_out)?;
            }
        }

        if self.config.nan_guard && scan_for_non_finite(&output_bytes, &out_dsc) {
            nan_offenders.push(busy.nodes[position].operator_name);
        }

        busy.cache.buffer_mut(out_handle)[..output_bytes.len()].copy_from_slice(&output_bytes);

        // (h) sampler hooks.
        self.run_sampler_hooks(busy, position, out_handle, &out_dsc, &roi_out);

        // (i) blend step: merge the operator's output back with its input
        // under the node's blend parameters, when shapes agree.
        if in_dsc == out_dsc {
            let blend_params = busy.nodes[position].blend_params.clone();
            blend_in_place(busy, out_handle, &input_bytes, &blend_params, &out_dsc);
        }

        // (j) keep the focused node's input buffer alive for responsive
        // interactive edits.
        if busy.focused_node == Some(position) {
            busy.cache.reweight(input.handle);
        }

        Ok(RecurseOutput { handle: out_handle, fingerprint, descriptor: out_dsc })
    }

    #[allow(clippy::too_many_arguments)]
    fn try_gpu(
        &self,
        busy: &mut BusyState,
        position: usize,
        device: &dyn GpuDevice,
        input_bytes: &[u8],
        output_bytes: &mut [u8],
        roi_in: &Roi,
        roi_out: &Roi,
        tiled: bool,
    ) -> Result<(), Error> {
        let input_handle = device.copy_to_device(input_bytes)?;
        let output_handle = device.alloc(output_bytes.len())?;
        let ctx = NodeContext::new(busy.nodes[position].scratch.as_ref());
        let Some((_, operator)) = self.registry.at(busy.nodes[position].operator_position) else {
            device.free(input_handle);
            device.free(output_handle);
            return Err(Error::UnknownOperator(busy.nodes[position].operator_name.to_string()));
        };
        let result = if tiled {
            operator.process_tiling_cl(&ctx, device, input_handle, output_handle, roi_in, roi_out)
        } else {
            operator.process_cl(&ctx, device, input_handle, output_handle, roi_in, roi_out)
        };
        let copy_result = result.map_err(Error::from).and_then(|()| {
            device.copy_to_host(output_handle, output_bytes).map_err(|_| Error::DeviceLate)
        });
        device.free(input_handle);
        device.free(output_handle);
        copy_result
    }

    fn run_sampler_hooks(
        &self,
        busy: &mut BusyState,
        position: usize,
        handle: CacheEntryHandle,
        descriptor: &ImageBufferDescriptor,
        roi: &Roi,
    ) {
        let is_float = descriptor.datatype == pixelpipe_cache::Datatype::Float32;

        if let Some(request) = busy.nodes[position].histogram_request {
            if is_float {
                let buffer = busy.cache.buffer(handle);
                let result = sampler::histogram(buffer, descriptor, roi, request.bin_count);
                debug!(
                    node = busy.nodes[position].operator_name,
                    channels = result.bins.len(),
                    "histogram collected"
                );
            }
        }

        if let Some(box_roi) = busy.nodes[position].pick_request {
            if is_float {
                let local_box = self.transform_box_down(busy, position, box_roi);
                let buffer = busy.cache.buffer(handle);
                match sampler::pick(buffer, descriptor, roi, &local_box) {
                    Some(result) => debug!(
                        node = busy.nodes[position].operator_name,
                        mean = ?result.mean,
                        "color picker sampled"
                    ),
                    None => debug!(
                        node = busy.nodes[position].operator_name,
                        "color picker box invalid for this node's ROI"
                    ),
                }
            }
        }

        let is_final = position == busy.nodes.len() - 1;
        if is_final && is_float && self.config.kind == pixelpipe_cache::PipelineKind::Preview {
            let (image_width, image_height) = Pipeline::input(busy)
                .map(|(_, dsc)| (dsc.width, dsc.height))
                .unwrap_or((descriptor.width, descriptor.height));
            let buffer = busy.cache.buffer(handle);
            let result = sampler::waveform(buffer, descriptor, roi, 256, 256, image_width, image_height);
            debug!(bins = result.bins.len(), "waveform collected for preview gamma node");
        }
    }

    /// Transforms `box_roi`, given in the coordinate frame of the
    /// pipeline's final requested output, down into `target`'s own output
    /// coordinate frame by chaining `modify_roi_in` from the last node down
    /// to `target` — the same transform `recurse` already applies to the
    /// real requested ROI, run here a second time against an arbitrary box.
    fn transform_box_down(&self, busy: &BusyState, target: usize, box_roi: Roi) -> Roi {
        let last = busy.nodes.len() - 1;
        let mut current = box_roi;
        for position in (target + 1..=last).rev() {
            if busy.nodes[position].is_noop() {
                continue;
            }
            let ctx = NodeContext::new(busy.nodes[position].scratch.as_ref());
            if let Some((_, operator)) = self.registry.at(busy.nodes[position].operator_position) {
                current = operator.modify_roi_in(&ctx, &current);
            }
        }
        current
    }
}

fn choose_path(
    device: Option<&dyn GpuDevice>,
    cl_ready: bool,
    tiling_ready: bool,
    estimate: &pixelpipe_operator::tiling::TilingEstimate,
    input_bytes: usize,
    host_memory_limit_bytes: usize,
) -> ExecPath {
    let total = estimate.total_bytes(input_bytes);
    if let Some(device) = device {
        if cl_ready && device.free_bytes() >= total {
            return ExecPath::GpuDirect;
        }
        if cl_ready && tiling_ready {
            return ExecPath::GpuTiled;
        }
    }
    if tiling_ready && !estimate.fits_direct(input_bytes, host_memory_limit_bytes) {
        return ExecPath::CpuTiled;
    }
    ExecPath::CpuDirect
}

/// Copies/resamples `input` into `roi`'s coordinate space, fast-pathing the
/// identity case (`scale == 1`, `roi` covering the whole canvas) with a bulk
/// copy instead of a per-pixel resample.
fn materialize_source(
    input: &[u8],
    input_dsc: &ImageBufferDescriptor,
    roi: &Roi,
) -> (Vec<u8>, ImageBufferDescriptor) {
    let bpp = input_dsc.bytes_per_pixel();
    let out_dsc = ImageBufferDescriptor {
        width: roi.width,
        height: roi.height,
        channels: input_dsc.channels,
        datatype: input_dsc.datatype,
        processed_maximum: input_dsc.processed_maximum,
    };

    let is_identity = (roi.scale - 1.0).abs() < f32::EPSILON
        && roi.x == 0
        && roi.y == 0
        && roi.width == input_dsc.width
        && roi.height == input_dsc.height;
    if is_identity {
        return (input.to_vec(), out_dsc);
    }

    let mut out = vec![0u8; roi.width as usize * roi.height as usize * bpp];
    for dy in 0..roi.height {
        let sy = (((roi.y + dy) as f32) / roi.scale)
            .round()
            .min((input_dsc.height.saturating_sub(1)) as f32) as u32;
        for dx in 0..roi.width {
            let sx = (((roi.x + dx) as f32) / roi.scale)
                .round()
                .min((input_dsc.width.saturating_sub(1)) as f32) as u32;
            let src_off = (sy as usize * input_dsc.width as usize + sx as usize) * bpp;
            let dst_off = (dy as usize * roi.width as usize + dx as usize) * bpp;
            out[dst_off..dst_off + bpp].copy_from_slice(&input[src_off..src_off + bpp]);
        }
    }
    (out, out_dsc)
}

/// Whether `buffer` contains any NaN/±∞ value. The caller attaches the
/// scanned node's own canonical name to `nan_offenders`; this function
/// only answers "yes/no" for one buffer, so the per-pipeline summary
/// aggregates real node identities rather than a fixed placeholder.
fn scan_for_non_finite(buffer: &[u8], dsc: &ImageBufferDescriptor) -> bool {
    if dsc.datatype != pixelpipe_cache::Datatype::Float32 {
        return false;
    }
    buffer
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .any(|v| !v.is_finite())
}

fn blend_in_place(
    busy: &mut BusyState,
    out_handle: CacheEntryHandle,
    input_bytes: &[u8],
    blend_params: &pixelpipe_operator::ParamsBlob,
    dsc: &ImageBufferDescriptor,
) {
    if dsc.datatype != pixelpipe_cache::Datatype::Float32 {
        return;
    }
    #[derive(serde::Deserialize)]
    struct Blend {
        opacity: f32,
    }
    let Ok(blend) = blend_params.to_typed::<Blend>() else {
        return;
    };
    if blend.opacity >= 1.0 {
        return;
    }
    let output = busy.cache.buffer_mut(out_handle);
    for (out_chunk, in_chunk) in output.chunks_exact_mut(4).zip(input_bytes.chunks_exact(4)) {
        let out_v = f32::from_le_bytes([out_chunk[0], out_chunk[1], out_chunk[2], out_chunk[3]]);
        let in_v = f32::from_le_bytes([in_chunk[0], in_chunk[1], in_chunk[2], in_chunk[3]]);
        let blended = out_v * blend.opacity + in_v * (1.0 - blend.opacity);
        out_chunk.copy_from_slice(&blended.to_le_bytes());
    }
}

