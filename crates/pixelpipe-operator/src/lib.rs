//! The operator (IOP) contract shared by every image-processing stage.
//!
//! * [`descriptor`] is static per-operator-kind metadata.
//! * [`params`] is the opaque, hashable parameter blob operators are
//!   configured with; the driver never interprets its contents.
//! * [`gpu`] is the device/buffer abstraction `process_cl` dispatches
//!   through; this crate only defines the boundary, it implements no actual
//!   GPU backend (operator implementations and their external codecs are
//!   out of scope here).
//! * [`contract`] is the `Operator` trait itself.
//! * [`registry`] is the read-only, by-name operator registry.

// crate-specific lint exceptions:
#![warn(missing_docs)]

pub mod contract;
pub mod descriptor;
pub mod error;
pub mod gpu;
pub mod params;
pub mod registry;
pub mod tiling;

pub use contract::{NodeContext, Operator};
pub use descriptor::{Colorspace, OperationTags, OperatorDescriptor};
pub use error::OperatorError;
pub use gpu::{GpuBufferHandle, GpuDevice};
pub use params::ParamsBlob;
pub use registry::{OperatorRegistry, OperatorRegistryBuilder};
pub use tiling::TilingEstimate;
