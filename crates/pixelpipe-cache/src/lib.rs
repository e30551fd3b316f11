//! Buffer descriptors, regions of interest, fingerprinting and the
//! fixed-capacity buffer cache used by the pixel pipeline driver.
//!
//! * [`buffer`] describes pixel layout and rectangular regions of interest.
//! * [`fingerprint`] derives the stable 64-bit hash that keys the cache.
//! * [`cache`] is the fixed-capacity pool of reusable pixel buffers.

// crate-specific lint exceptions:
#![warn(missing_docs)]

pub mod buffer;
pub mod cache;
pub mod error;
pub mod fingerprint;

pub use buffer::{Channels, Datatype, ImageBufferDescriptor, Roi, XTransPattern};
pub use cache::{BufferCache, CacheEntryHandle};
pub use error::Error;
pub use fingerprint::{ChainHash, Fingerprint, FingerprintHasher, PipelineKind};
