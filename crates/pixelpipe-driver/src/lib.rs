//! The pipeline driver: owns the operator chain, the edit history replay,
//! the fixed-capacity buffer cache, GPU↔CPU dispatch, and the
//! backward-ROI / forward-execute recursion that turns a raw image plus an
//! edit history into a rendered output buffer.
//!
//! * [`config`] is the pipeline's construction-time configuration.
//! * [`error`] is this crate's error type.
//! * [`history`] is the externally-owned edit history the driver replays.
//! * [`node`] is one concrete per-run operator instance in the chain.
//! * [`pipeline`] is the `Pipeline` aggregate and its public control
//!   surface (`set_input`, `change`, `run`, ...).
//! * [`run`] is the recursive backward-ROI / forward-execute algorithm and
//!   GPU session health tracking.
//! * [`sampler`] is the histogram/waveform/color-picker sampling hooks run
//!   against a node's materialized output.

// crate-specific lint exceptions:
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod history;
pub mod node;
pub mod pipeline;
pub mod run;
pub mod sampler;

pub use config::{PipelineConfig, PipelineKind};
pub use error::Error;
pub use history::{History, HistoryItem};
pub use node::{HistogramRequest, Node};
pub use pipeline::{Backbuffer, OutputProfile, Pipeline, RenderingIntent};
pub use run::GpuSession;
pub use sampler::{histogram, pick, waveform, ColorPick, HistogramResult, WaveformResult};
