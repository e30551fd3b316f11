//! The `Pipeline` aggregate and its public control surface.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, instrument};

use pixelpipe_cache::{BufferCache, Fingerprint, ImageBufferDescriptor, PipelineKind};
use pixelpipe_operator::contract::NodeContext;
use pixelpipe_operator::gpu::GpuDevice;
use pixelpipe_operator::registry::OperatorRegistry;

use crate::config::PipelineConfig;
use crate::error::Error;
use crate::history::{History, HistoryItem};
use crate::node::Node;
use crate::run::GpuSession;

/// Rendering intent carried alongside the output ICC binding. Only consumed
/// by the final colorout-equivalent operator; the driver just stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderingIntent {
    /// Preserve relative color relationships, clipping out-of-gamut colors.
    Perceptual,
    /// Preserve in-gamut colors exactly, clip the rest.
    RelativeColorimetric,
    /// Scale the whole gamut to fit.
    Saturation,
    /// Preserve absolute colorimetry, including the white point.
    AbsoluteColorimetric,
}

/// The output ICC profile binding, installed once via
/// [`Pipeline::set_output_profile`] and retained for the final operator.
#[derive(Debug, Clone)]
pub struct OutputProfile {
    /// Profile kind/name (e.g. `"srgb"`, `"file"`).
    pub kind: String,
    /// Path to an on-disk profile, required when `kind == "file"`.
    pub filename: Option<String>,
    /// Rendering intent.
    pub intent: RenderingIntent,
}

struct InputImage {
    buffer: Vec<u8>,
    descriptor: ImageBufferDescriptor,
}

/// The last buffer this pipeline published, plus the fingerprint it was
/// published under.
#[derive(Clone)]
pub struct Backbuffer {
    /// Content-addressed fingerprint of `buffer`.
    pub fingerprint: Fingerprint,
    /// Pixel layout of `buffer`.
    pub descriptor: ImageBufferDescriptor,
    /// Raw pixel bytes.
    pub buffer: Vec<u8>,
}

/// Mutable pipeline state touched while a run is in flight; conceptually
/// the data `busy_mutex` protects.
pub(crate) struct BusyState {
    pub(crate) nodes: Vec<Node>,
    pub(crate) cache: BufferCache,
    input: Option<InputImage>,
    output_profile: Option<OutputProfile>,
    pub(crate) focused_node: Option<usize>,
    pub(crate) mask_display_node: Option<usize>,
}

/// A dynamically-assembled chain of operators that turns a raw image plus an
/// edit history into an output buffer.
///
/// A registry-backed operator chain in the style of a `DataBuildOptions`-
/// configured compiler pipeline: the operator chain (`nodes`) is rebuilt
/// from `history` by the cheapest applicable rebuild class, and `run` walks
/// it recursively from the final node backward for ROI, then forward for
/// execution.
pub struct Pipeline {
    pub(crate) config: PipelineConfig,
    pub(crate) registry: Arc<OperatorRegistry>,
    pub(crate) gpu_session: Arc<GpuSession>,
    pub(crate) device: Option<Arc<dyn GpuDevice>>,
    pub(crate) image_id: AtomicU64,
    history_generation: AtomicU64,
    image_generation: AtomicU64,
    gui_teardown: AtomicBool,
    shutdown: AtomicBool,
    cache_obsolete: AtomicBool,
    pub(crate) busy: Mutex<BusyState>,
    backbuf: Mutex<Option<Backbuffer>>,
}

impl Pipeline {
    /// Builds a fresh pipeline of `kind`, with cache sizing and GPU policy
    /// from [`PipelineConfig::for_kind`], no shared GPU session (one is
    /// created privately) and every node at its registry defaults.
    #[must_use]
    pub fn init(kind: PipelineKind, registry: Arc<OperatorRegistry>) -> Self {
        let config = PipelineConfig::for_kind(kind);
        Self::init_cached(registry, config, Arc::new(GpuSession::new()), None)
    }

    /// Builds a pipeline with an explicit cache size (`entries` slots of at
    /// least `size` bytes) and an explicit, possibly process-shared, GPU
    /// session/device. Sharing a [`GpuSession`] across every pipeline in a
    /// process is what makes the per-session GPU error threshold meaningful.
    #[must_use]
    pub fn init_cached(
        registry: Arc<OperatorRegistry>,
        mut config: PipelineConfig,
        gpu_session: Arc<GpuSession>,
        device: Option<Arc<dyn GpuDevice>>,
    ) -> Self {
        if config.cache_entries == 0 {
            config.cache_entries = 1;
        }
        let nodes = Self::build_default_nodes(&registry);
        let cache = BufferCache::new(config.cache_entries, config.cache_min_bytes);
        Self {
            config,
            registry,
            gpu_session,
            device,
            image_id: AtomicU64::new(0),
            history_generation: AtomicU64::new(0),
            image_generation: AtomicU64::new(0),
            gui_teardown: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            cache_obsolete: AtomicBool::new(false),
            busy: Mutex::new(BusyState {
                nodes,
                cache,
                input: None,
                output_profile: None,
                focused_node: None,
                mask_display_node: None,
            }),
            backbuf: Mutex::new(None),
        }
    }

    fn build_default_nodes(registry: &OperatorRegistry) -> Vec<Node> {
        registry
            .iter()
            .enumerate()
            .map(|(position, (descriptor, operator))| {
                let params = descriptor.default_params.clone();
                let blend_params = descriptor.default_blend_params.clone();
                let scratch = operator.commit(&params, &blend_params);
                Node {
                    operator_position: position,
                    operator_name: descriptor.name,
                    params,
                    blend_params,
                    enabled: descriptor.default_enabled,
                    committed_hash: pixelpipe_cache::ChainHash::default(),
                    scratch,
                    dsc_in: None,
                    dsc_out: None,
                    histogram_request: None,
                    pick_request: None,
                    cl_ready: operator.cl_ready(),
                    tiling_ready: operator.tiling_ready(),
                }
            })
            .collect()
    }

    /// Installs the source image. `scale` is the display/export scale this
    /// pipeline runs at (1.0 for full/export).
    pub fn set_input(&self, buffer: Vec<u8>, descriptor: ImageBufferDescriptor) {
        let mut busy = self.busy.lock().expect("busy mutex poisoned");
        busy.input = Some(InputImage { buffer, descriptor });
        self.image_generation.fetch_add(1, Ordering::AcqRel);
        self.cache_obsolete.store(true, Ordering::Release);
    }

    /// Installs the output ICC profile binding, retained for the final
    /// colorout-equivalent operator.
    pub fn set_output_profile(&self, profile: OutputProfile) {
        self.busy.lock().expect("busy mutex poisoned").output_profile = Some(profile);
    }

    /// Marks `name`'s node as the one the GUI is currently editing;
    /// `recurse` reweights its input buffer to keep interactive edits of
    /// that node responsive.
    pub fn set_focused_node(&self, name: Option<&str>) {
        let mut busy = self.busy.lock().expect("busy mutex poisoned");
        busy.focused_node = name.and_then(|n| busy.nodes.iter().position(|node| node.operator_name == n));
    }

    /// Requests the mask-display short-circuit for `name`'s node.
    pub fn set_mask_display_node(&self, name: Option<&str>) {
        let mut busy = self.busy.lock().expect("busy mutex poisoned");
        busy.mask_display_node = name.and_then(|n| busy.nodes.iter().position(|node| node.operator_name == n));
    }

    /// Requests (or clears, via `request = None`) histogram collection on
    /// `name`'s node output for subsequent runs.
    ///
    /// # Errors
    /// Returns [`Error::UnknownOperator`] if no node has this name.
    pub fn set_histogram_request(&self, name: &str, request: Option<crate::node::HistogramRequest>) -> Result<(), Error> {
        let mut busy = self.busy.lock().expect("busy mutex poisoned");
        let node = busy
            .nodes
            .iter_mut()
            .find(|n| n.operator_name == name)
            .ok_or_else(|| Error::UnknownOperator(name.to_string()))?;
        node.histogram_request = request;
        Ok(())
    }

    /// Requests (or clears, via `box_roi = None`) color-picker sampling on
    /// `name`'s node output for subsequent runs. `box_roi` is given in the
    /// coordinate frame of the pipeline's final requested output; the
    /// driver transforms it down through every upstream operator's
    /// `modify_roi_in` to land it in `name`'s own output frame before
    /// sampling.
    ///
    /// # Errors
    /// Returns [`Error::UnknownOperator`] if no node has this name.
    pub fn set_pick_request(&self, name: &str, box_roi: Option<pixelpipe_cache::Roi>) -> Result<(), Error> {
        let mut busy = self.busy.lock().expect("busy mutex poisoned");
        let node = busy
            .nodes
            .iter_mut()
            .find(|n| n.operator_name == name)
            .ok_or_else(|| Error::UnknownOperator(name.to_string()))?;
        node.pick_request = box_roi;
        Ok(())
    }

    /// Disables every node from `name` onward (inclusive), used by callers
    /// that want a quick preview of the edit stack truncated at a point.
    ///
    /// # Errors
    /// Returns [`Error::UnknownOperator`] if no node has this name.
    pub fn disable_after(&self, name: &str) -> Result<(), Error> {
        let mut busy = self.busy.lock().expect("busy mutex poisoned");
        let position = busy
            .nodes
            .iter()
            .position(|n| n.operator_name == name)
            .ok_or_else(|| Error::UnknownOperator(name.to_string()))?;
        for node in &mut busy.nodes[position..] {
            node.enabled = false;
        }
        drop(busy);
        self.history_generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Incorporates the latest edit using the cheapest rebuild class that
    /// applies: top-changed (only the last history item differs: `commit`
    /// just that node), synch (topology unchanged, replay history onto
    /// defaulted nodes), or remove (the node set changed: full rebuild).
    #[instrument(skip(self, history))]
    pub fn change(&self, history: &History) {
        let mut busy = self.busy.lock().expect("busy mutex poisoned");
        let live = history.live_items();

        if Self::is_topology_unchanged(&busy.nodes, live) {
            if let Some(top_changed_at) = Self::top_changed_position(&busy.nodes, live) {
                debug!(position = top_changed_at, "top-changed rebuild");
                Self::commit_item(&self.registry, &mut busy.nodes, top_changed_at, &live[top_changed_at]);
            } else {
                debug!("synch rebuild");
                Self::reset_to_defaults(&self.registry, &mut busy.nodes);
                for (position, item) in live.iter().enumerate() {
                    Self::commit_item(&self.registry, &mut busy.nodes, position, item);
                }
            }
        } else {
            debug!("remove rebuild (node set changed)");
            busy.nodes = Self::build_default_nodes(&self.registry);
            for (position, item) in live.iter().enumerate() {
                Self::commit_item(&self.registry, &mut busy.nodes, position, item);
            }
        }

        drop(busy);
        self.history_generation.fetch_add(1, Ordering::AcqRel);
    }

    fn is_topology_unchanged(nodes: &[Node], live: &[HistoryItem]) -> bool {
        live.iter().all(|item| nodes.iter().any(|n| n.operator_name == item.operator_name))
    }

    /// Position of the single history item whose target node differs from
    /// its currently-committed state, if `live` differs from `nodes` by
    /// exactly one trailing item. `None` means more than the tail changed
    /// (callers fall back to a full synch).
    fn top_changed_position(nodes: &[Node], live: &[HistoryItem]) -> Option<usize> {
        let last = live.len().checked_sub(1)?;
        let item = &live[last];
        let node = nodes.iter().find(|n| n.operator_name == item.operator_name)?;
        let same_so_far = live[..last].iter().enumerate().all(|(i, prior)| {
            nodes
                .iter()
                .position(|n| n.operator_name == prior.operator_name)
                .map(|p| p == i)
                .unwrap_or(false)
        });
        let changed = node.params != item.params || node.blend_params != item.blend_params || node.enabled != item.enabled;
        (same_so_far && changed).then_some(last)
    }

    fn reset_to_defaults(registry: &OperatorRegistry, nodes: &mut [Node]) {
        for node in nodes.iter_mut() {
            if let Some((descriptor, operator, _)) = registry.find(node.operator_name) {
                node.params = descriptor.default_params.clone();
                node.blend_params = descriptor.default_blend_params.clone();
                node.enabled = descriptor.default_enabled;
                node.committed_hash = pixelpipe_cache::ChainHash::default();
                node.scratch = operator.commit(&node.params, &node.blend_params);
            }
        }
    }

    fn commit_item(registry: &Arc<OperatorRegistry>, nodes: &mut [Node], position: usize, item: &HistoryItem) {
        if position >= nodes.len() {
            return;
        }
        let Some((_, operator, _)) = registry.find(&item.operator_name) else {
            return;
        };
        nodes[position].params = item.params.clone();
        nodes[position].blend_params = item.blend_params.clone();
        nodes[position].enabled = item.enabled;
        nodes[position].scratch = operator.commit(&nodes[position].params, &nodes[position].blend_params);
        let predecessor_hash = if position == 0 {
            pixelpipe_cache::ChainHash::default()
        } else {
            nodes[position - 1].committed_hash
        };
        let own_hash = nodes[position].params.content_hash() ^ nodes[position].blend_params.content_hash();
        nodes[position].committed_hash = pixelpipe_cache::ChainHash::fold(predecessor_hash, own_hash, item.enabled);
    }

    /// Discards every intermediate buffer's fingerprint (keeps buffers
    /// allocated).
    pub fn flush_caches(&self) {
        self.busy.lock().expect("busy mutex poisoned").cache.flush();
    }

    /// Signals shutdown, so any in-flight or future `run` aborts promptly.
    /// Safe to call while a run may be in flight.
    pub fn cleanup(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// The last published backbuffer, if any run has completed.
    #[must_use]
    pub fn last_backbuffer(&self) -> Option<Backbuffer> {
        self.backbuf.lock().expect("backbuf mutex poisoned").clone()
    }

    pub(crate) fn publish_backbuffer(&self, backbuffer: Backbuffer) {
        info!(fingerprint = backbuffer.fingerprint.0, "published backbuffer");
        *self.backbuf.lock().expect("backbuf mutex poisoned") = Some(backbuffer);
    }

    pub(crate) fn take_cancel_snapshot(&self) -> CancelSnapshot {
        CancelSnapshot {
            history_generation: self.history_generation.load(Ordering::Acquire),
            image_generation: self.image_generation.load(Ordering::Acquire),
        }
    }

    pub(crate) fn cancelled_since(&self, snapshot: &CancelSnapshot) -> bool {
        self.gui_teardown.load(Ordering::Acquire)
            || self.is_shutdown()
            || self.history_generation.load(Ordering::Acquire) != snapshot.history_generation
            || self.image_generation.load(Ordering::Acquire) != snapshot.image_generation
    }

    /// Signals that the GUI is tearing down, another cancellation source.
    pub fn notify_gui_teardown(&self) {
        self.gui_teardown.store(true, Ordering::Release);
    }

    pub(crate) fn take_cache_obsolete(&self) -> bool {
        self.cache_obsolete.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn mark_cache_obsolete(&self) {
        self.cache_obsolete.store(true, Ordering::Release);
    }

    pub(crate) fn input(busy: &BusyState) -> Option<(&[u8], &ImageBufferDescriptor)> {
        busy.input.as_ref().map(|i| (i.buffer.as_slice(), &i.descriptor))
    }

    pub(crate) fn output_profile(busy: &BusyState) -> Option<&OutputProfile> {
        busy.output_profile.as_ref()
    }

    /// Recomputes total processed `(width, height)` by running
    /// `modify_roi_out` from the source node downstream. Called after any
    /// topology- or parameter-affecting `change`.
    #[must_use]
    pub fn total_output_dimensions(&self) -> Option<(u32, u32)> {
        let busy = self.busy.lock().expect("busy mutex poisoned");
        let (_, input_dsc) = Self::input(&busy)?;
        let mut roi = pixelpipe_cache::Roi::identity(input_dsc.width, input_dsc.height);
        for node in &busy.nodes {
            if node.is_noop() {
                continue;
            }
            if let Some((_, operator)) = self.registry.at(node.operator_position) {
                let ctx = NodeContext::new(node.scratch.as_ref());
                roi = operator.modify_roi_out(&ctx, &roi);
            }
        }
        Some((roi.width, roi.height))
    }
}

/// Generation counters captured at the start of a run, compared against
/// current state at every cancellation check inside `recurse`.
pub(crate) struct CancelSnapshot {
    history_generation: u64,
    image_generation: u64,
}
