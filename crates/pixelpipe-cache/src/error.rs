use thiserror::Error;

/// Errors raised by the buffer cache.
#[derive(Error, Debug)]
pub enum Error {
    /// The cache could not grow a buffer to the requested size.
    #[error("host allocation of {requested} bytes failed")]
    HostOom {
        /// Bytes that were requested.
        requested: usize,
    },
    /// A `reserve` was attempted against a cache with zero slots.
    #[error("cache has no slots")]
    NoSlots,
}
