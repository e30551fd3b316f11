//! The fixed-capacity buffer cache.
//!
//! Sized at construction to a small number of slots (2-5 in practice). Maps
//! fingerprints to previously computed pixel buffers and guarantees
//! at-most-one concurrent materialization per fingerprint, because the
//! driver that owns this cache serializes all access behind its
//! `busy_mutex` — the cache itself performs no internal locking.

use tracing::debug;

use crate::buffer::ImageBufferDescriptor;
use crate::error::Error;
use crate::fingerprint::Fingerprint;

/// Opaque handle to a cache slot, returned by `reserve`/`lookup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntryHandle(usize);

struct Slot {
    fingerprint: Option<Fingerprint>,
    descriptor: Option<ImageBufferDescriptor>,
    buffer: Vec<u8>,
    last_use: u64,
    important: bool,
    insertion_order: u64,
}

/// A fixed-capacity pool of reusable pixel buffers keyed by fingerprint.
pub struct BufferCache {
    slots: Vec<Slot>,
    use_counter: u64,
    insertion_counter: u64,
}

impl BufferCache {
    /// Creates a cache with `capacity` slots, each pre-sized to at least
    /// `min_bytes`.
    #[must_use]
    pub fn new(capacity: usize, min_bytes: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                fingerprint: None,
                descriptor: None,
                buffer: vec![0u8; min_bytes],
                last_use: 0,
                important: false,
                insertion_order: 0,
            })
            .collect();
        Self {
            slots,
            use_counter: 0,
            insertion_counter: 0,
        }
    }

    /// Number of slots in the cache.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn tick(&mut self) -> u64 {
        self.use_counter += 1;
        self.use_counter
    }

    /// Looks up a fingerprint. O(entries).
    #[must_use]
    pub fn lookup(&self, fingerprint: Fingerprint) -> Option<CacheEntryHandle> {
        self.slots
            .iter()
            .position(|s| s.fingerprint == Some(fingerprint))
            .map(CacheEntryHandle)
    }

    /// Returns the buffer contents for a handle.
    #[must_use]
    pub fn buffer(&self, handle: CacheEntryHandle) -> &[u8] {
        &self.slots[handle.0].buffer
    }

    /// Returns the buffer contents for a handle, mutably.
    pub fn buffer_mut(&mut self, handle: CacheEntryHandle) -> &mut [u8] {
        &mut self.slots[handle.0].buffer
    }

    /// The descriptor an entry was reserved with, if any.
    #[must_use]
    pub fn descriptor(&self, handle: CacheEntryHandle) -> Option<&ImageBufferDescriptor> {
        self.slots[handle.0].descriptor.as_ref()
    }

    /// Returns an existing buffer on hit; on miss, selects a victim slot by
    /// `(important ascending, last_use ascending)` with ties broken by
    /// oldest insertion order, reallocates it to `required_bytes` if
    /// smaller, assigns it `fingerprint`, and returns it uninitialized with
    /// `hit == false`.
    pub fn reserve(
        &mut self,
        fingerprint: Fingerprint,
        required_bytes: usize,
        descriptor: ImageBufferDescriptor,
    ) -> Result<(CacheEntryHandle, bool), Error> {
        if let Some(handle) = self.lookup(fingerprint) {
            return Ok((handle, true));
        }
        if self.slots.is_empty() {
            return Err(Error::NoSlots);
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| (s.important, s.last_use, s.insertion_order))
            .map(|(i, _)| i)
            .expect("non-empty slots");

        let now = self.tick();
        self.insertion_counter += 1;
        let insertion_order = self.insertion_counter;
        let slot = &mut self.slots[victim];

        debug!(
            fingerprint = fingerprint.0,
            victim, required_bytes, "cache miss, evicting slot"
        );

        if slot.buffer.len() < required_bytes {
            slot.buffer.resize(required_bytes, 0);
        }
        slot.fingerprint = Some(fingerprint);
        slot.descriptor = Some(descriptor);
        slot.last_use = now;
        slot.important = false;
        slot.insertion_order = insertion_order;

        Ok((CacheEntryHandle(victim), false))
    }

    /// Pins an entry so normal eviction skips it. Currently used only for
    /// the final gamma node's output.
    pub fn mark_important(&mut self, handle: CacheEntryHandle) {
        self.slots[handle.0].important = true;
    }

    /// Bumps the use counter of an entry so it survives longer, used to
    /// favor keeping the input of the currently focused operator alive.
    pub fn reweight(&mut self, handle: CacheEntryHandle) {
        let now = self.tick();
        self.slots[handle.0].last_use = now;
    }

    /// Clears a slot's fingerprint so the next `reserve` can reclaim it
    /// without copying its contents.
    pub fn invalidate(&mut self, handle: CacheEntryHandle) {
        let slot = &mut self.slots[handle.0];
        slot.fingerprint = None;
        slot.important = false;
    }

    /// Clears every fingerprint; buffers remain allocated.
    pub fn flush(&mut self) {
        for slot in &mut self.slots {
            slot.fingerprint = None;
            slot.important = false;
        }
    }

    /// Fingerprints currently resident, for test assertions.
    #[must_use]
    pub fn resident_fingerprints(&self) -> Vec<Fingerprint> {
        self.slots.iter().filter_map(|s| s.fingerprint).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Channels, Datatype};

    fn dsc() -> ImageBufferDescriptor {
        ImageBufferDescriptor::new(4, 4, Channels::Rgba, Datatype::Float32)
    }

    #[test]
    fn hit_then_miss() {
        let mut cache = BufferCache::new(2, 64);
        let (h1, hit1) = cache.reserve(Fingerprint(1), 64, dsc()).unwrap();
        assert!(!hit1);
        let (h1b, hit1b) = cache.reserve(Fingerprint(1), 64, dsc()).unwrap();
        assert!(hit1b);
        assert_eq!(h1, h1b);
    }

    #[test]
    fn eviction_respects_important_flag() {
        let mut cache = BufferCache::new(2, 64);
        let (h1, _) = cache.reserve(Fingerprint(1), 64, dsc()).unwrap();
        cache.mark_important(h1);
        let (_h2, _) = cache.reserve(Fingerprint(2), 64, dsc()).unwrap();

        // Slot 1 (#1, important) would normally be evicted next by
        // last-use-ascending; the important flag protects it, so #2 must be
        // evicted first.
        let (_h3, _) = cache.reserve(Fingerprint(3), 64, dsc()).unwrap();
        let resident = cache.resident_fingerprints();
        assert!(resident.contains(&Fingerprint(1)));
        assert!(!resident.contains(&Fingerprint(2)));
    }

    #[test]
    fn reweight_keeps_buffer_alive_longer() {
        let mut cache = BufferCache::new(2, 64);
        let (h1, _) = cache.reserve(Fingerprint(1), 64, dsc()).unwrap();
        let (_h2, _) = cache.reserve(Fingerprint(2), 64, dsc()).unwrap();
        cache.reweight(h1);

        let (_h3, _) = cache.reserve(Fingerprint(3), 64, dsc()).unwrap();
        let resident = cache.resident_fingerprints();
        assert!(resident.contains(&Fingerprint(1)));
        assert!(!resident.contains(&Fingerprint(2)));
    }

    #[test]
    fn eviction_exactly_one_absent_for_n_plus_one_allocations() {
        let mut cache = BufferCache::new(3, 64);
        for i in 0..3u64 {
            cache.reserve(Fingerprint(i), 64, dsc()).unwrap();
        }
        cache.reserve(Fingerprint(100), 64, dsc()).unwrap();
        let resident = cache.resident_fingerprints();
        assert_eq!(resident.len(), 3);
        let missing = (0..3u64).filter(|i| !resident.contains(&Fingerprint(*i))).count();
        assert_eq!(missing, 1);
    }

    #[test]
    fn invalidate_allows_free_reclaim() {
        let mut cache = BufferCache::new(1, 64);
        let (h1, _) = cache.reserve(Fingerprint(1), 64, dsc()).unwrap();
        cache.invalidate(h1);
        let (_h2, hit) = cache.reserve(Fingerprint(2), 64, dsc()).unwrap();
        assert!(!hit);
    }

    #[test]
    fn flush_clears_all_fingerprints_but_keeps_buffers() {
        let mut cache = BufferCache::new(2, 64);
        cache.reserve(Fingerprint(1), 64, dsc()).unwrap();
        cache.reserve(Fingerprint(2), 64, dsc()).unwrap();
        cache.flush();
        assert!(cache.resident_fingerprints().is_empty());
        assert_eq!(cache.capacity(), 2);
    }
}
