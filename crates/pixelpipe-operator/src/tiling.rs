//! Memory estimate used to pick between direct and tiled execution.

/// The result of `Operator::tiling_callback`: an estimate of how much
/// memory a direct (untiled) invocation of `process`/`process_cl` would
/// need, expressed as a multiple of the input buffer's size plus a fixed
/// overhead, and the single largest buffer the operator needs at once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilingEstimate {
    /// Multiple of `roi_in`'s byte size the operator needs resident at
    /// once (e.g. an operator holding two working copies reports `2.0`).
    pub factor: f32,
    /// Fixed per-call overhead in bytes, independent of ROI size.
    pub overhead_bytes: usize,
    /// The single largest buffer (bytes) the operator will allocate, used
    /// to check against a hard per-allocation device limit.
    pub max_buffer_bytes: usize,
}

impl TilingEstimate {
    /// The typical case: one working copy, no fixed overhead.
    #[must_use]
    pub fn identity(input_bytes: usize) -> Self {
        Self {
            factor: 1.0,
            overhead_bytes: 0,
            max_buffer_bytes: input_bytes,
        }
    }

    /// Total bytes this estimate implies for an input of `input_bytes`.
    #[must_use]
    pub fn total_bytes(&self, input_bytes: usize) -> usize {
        (input_bytes as f32 * self.factor) as usize + self.overhead_bytes
    }

    /// Whether a direct (untiled) invocation over `input_bytes` fits under
    /// `limit_bytes` of host memory.
    #[must_use]
    pub fn fits_direct(&self, input_bytes: usize, limit_bytes: usize) -> bool {
        self.total_bytes(input_bytes) <= limit_bytes
    }
}
