//! Pipeline configuration: cache sizing, GPU policy, and the session-wide
//! GPU error threshold. A small options struct in the style of a
//! `DataBuildOptions`/`CompilerRegistryOptions` builder.

pub use pixelpipe_cache::fingerprint::PipelineKind;

/// Default number of cache slots for a `full`/`export` pipeline.
pub const DEFAULT_CACHE_ENTRIES: usize = 5;
/// Default number of cache slots for `preview`/`thumbnail` pipelines, which
/// hold smaller buffers and run more often.
pub const DEFAULT_PREVIEW_CACHE_ENTRIES: usize = 2;
/// Default number of consecutive GPU kernel failures in one session before
/// GPU is disabled process-wide.
pub const DEFAULT_GPU_ERROR_THRESHOLD: u32 = 5;
/// Default host memory ceiling (bytes) for a direct, untiled CPU
/// invocation: 512 MiB, comfortably above a single full-resolution working
/// buffer but well short of holding several at once.
pub const DEFAULT_HOST_MEMORY_LIMIT_BYTES: usize = 512 * 1024 * 1024;

/// Configuration a [`crate::pipeline::Pipeline`] is constructed with.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// The kind of pipeline being built; governs defaults below.
    pub kind: PipelineKind,
    /// Number of buffer-cache slots.
    pub cache_entries: usize,
    /// Minimum size in bytes each cache slot is pre-allocated to.
    pub cache_min_bytes: usize,
    /// Whether this pipeline attempts GPU dispatch at all. `preview` and
    /// `thumbnail` pipelines commonly disable GPU to keep interaction
    /// latency predictable; `full`/`export` enable it by default.
    pub gpu_enabled: bool,
    /// Consecutive GPU failures before GPU is disabled for the rest of the
    /// process (shared across all pipelines, see [`crate::run::GpuSession`]).
    pub gpu_error_threshold: u32,
    /// Host memory ceiling (bytes) for a direct, untiled CPU invocation of
    /// a tiling-capable operator; above this, the tiled path is used
    /// instead.
    pub host_memory_limit_bytes: usize,
    /// When set, the NaN guard scans every node's output for
    /// non-finite values and logs the offending operator.
    pub nan_guard: bool,
}

impl PipelineConfig {
    /// Sensible defaults for a given pipeline kind: `preview` gets a
    /// smaller cache, runs the focus-driven reweight and waveform paths,
    /// and still attempts GPU; `thumbnail` disables GPU outright since
    /// thumbnails are rendered in batches where device contention isn't
    /// worth it.
    #[must_use]
    pub fn for_kind(kind: PipelineKind) -> Self {
        let (cache_entries, gpu_enabled) = match kind {
            PipelineKind::Full | PipelineKind::Export => (DEFAULT_CACHE_ENTRIES, true),
            PipelineKind::Preview => (DEFAULT_PREVIEW_CACHE_ENTRIES, true),
            PipelineKind::Thumbnail => (DEFAULT_PREVIEW_CACHE_ENTRIES, false),
        };
        Self {
            kind,
            cache_entries,
            cache_min_bytes: 0,
            gpu_enabled,
            gpu_error_threshold: DEFAULT_GPU_ERROR_THRESHOLD,
            host_memory_limit_bytes: DEFAULT_HOST_MEMORY_LIMIT_BYTES,
            nan_guard: false,
        }
    }

    /// Whether this pipeline kind drives the waveform histogram and the
    /// focus-driven buffer reweight (only `preview` does).
    #[must_use]
    pub fn is_interactive_preview(&self) -> bool {
        matches!(self.kind, PipelineKind::Preview)
    }
}
