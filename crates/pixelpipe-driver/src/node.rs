//! A node (pipeline piece): a concrete per-run instance of an operator
//!

use std::any::Any;

use pixelpipe_cache::{ChainHash, ImageBufferDescriptor, Roi};
use pixelpipe_operator::ParamsBlob;

/// A request to collect a histogram for this node's output.
#[derive(Debug, Clone, Copy)]
pub struct HistogramRequest {
    /// Number of bins per channel (typically 256).
    pub bin_count: u32,
}

/// A concrete per-run instance of an operator in the chain.
///
/// Created at pipeline build, mutated only by `commit`, destroyed at
/// pipeline teardown.
pub struct Node {
    /// Position of this node's operator in the registry / chain order.
    pub operator_position: usize,
    /// Canonical operator name, cached for logging without a registry
    /// round-trip.
    pub operator_name: &'static str,
    /// Current parameters.
    pub params: ParamsBlob,
    /// Current blend parameters.
    pub blend_params: ParamsBlob,
    /// Whether this node is enabled.
    pub enabled: bool,
    /// The folded hash of this node's own committed state with everything
    /// upstream of it.
    pub committed_hash: ChainHash,
    /// Per-node scratch state produced by the operator's `commit`.
    pub scratch: Box<dyn Any + Send + Sync>,
    /// Input buffer descriptor resolved during the last `build`.
    pub dsc_in: Option<ImageBufferDescriptor>,
    /// Output buffer descriptor resolved during the last `build`.
    pub dsc_out: Option<ImageBufferDescriptor>,
    /// Histogram collection request for this node's output, if any.
    pub histogram_request: Option<HistogramRequest>,
    /// Color-picker box request for this node's output, if any, expressed
    /// in the coordinate frame of the pipeline's final requested output
    /// (transformed down to this node's own frame at sample time).
    pub pick_request: Option<Roi>,
    /// Cached from the operator descriptor: whether a GPU path exists.
    pub cl_ready: bool,
    /// Cached from the operator descriptor: whether a tiled CPU/GPU path
    /// exists.
    pub tiling_ready: bool,
}

impl Node {
    /// Whether this node should be skipped by the driver (disabled, or
    /// filtered out by a GUI module mask — the latter is represented here
    /// simply as `!enabled` since the mask filter and the enable flag have
    /// identical driver-side handling).
    #[must_use]
    pub fn is_noop(&self) -> bool {
        !self.enabled
    }
}
