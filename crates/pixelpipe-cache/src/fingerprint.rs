//! Stable 64-bit fingerprint hashing for cache keys.
//!
//! `hash(image_id, roi, pipeline_kind, node_position) = f(image_id,
//! quantized(roi), kind, node_position, chain_committed_hash[0..=node])`,
//! preserving a fixed argument order so that
//! the hash stays stable across versions that keep this order.

use std::hash::{Hash, Hasher};

use fxhash::FxHasher64;

use crate::buffer::Roi;

/// The kind of pipeline a fingerprint was computed for. Distinct kinds never
/// share cache entries even given identical upstream state, because a
/// `preview` run may use different default parameters than a `full` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    /// Full-resolution darkroom view.
    Full,
    /// Low-resolution, fast, interactive preview.
    Preview,
    /// Small thumbnail render.
    Thumbnail,
    /// Export/output render.
    Export,
}

/// A 64-bit hash identifying a cacheable intermediate buffer.
///
/// Collisions are assumed negligible and are not checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

/// The folded hash of a node's own committed state with everything
/// upstream of it, updated once per node into a running chain value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChainHash(pub u64);

impl ChainHash {
    /// Folds this node's own `(params_blob, blend_params_blob, enabled)`
    /// hash with the predecessor's chain hash, producing the node's own
    /// contribution to `chain_committed_hash[0..=node]`.
    #[must_use]
    pub fn fold(predecessor: Self, own_params_hash: u64, enabled: bool) -> Self {
        let mut hasher = FxHasher64::default();
        predecessor.0.hash(&mut hasher);
        own_params_hash.hash(&mut hasher);
        enabled.hash(&mut hasher);
        Self(hasher.finish())
    }
}

/// Derives stable fingerprints keying cache entries.
///
/// Uses a fixed-seed FNV-style hash (`fxhash`) rather than `std`'s
/// `RandomState`-seeded default hasher: the fingerprint needs to
/// be "stable across runs of the same program", which a per-process random
/// seed would violate.
#[derive(Debug, Default, Clone, Copy)]
pub struct FingerprintHasher;

/// Number of mantissa bits of `scale` kept before hashing; quantization
/// drops scale noise below 1 ulp so that floating point reformatting of an
/// otherwise-identical ROI does not cause a false cache miss.
const SCALE_QUANT_BITS: i32 = 20;

fn quantize_scale(scale: f32) -> u32 {
    let scaled = scale * f64::from(1u32 << SCALE_QUANT_BITS) as f32;
    scaled.round() as u32
}

impl FingerprintHasher {
    /// Computes the fingerprint for a node at `node_position` in the chain,
    /// given the image being processed, the requested output ROI, the
    /// pipeline kind, and the folded chain hash up to and including this
    /// node.
    #[must_use]
    pub fn hash(
        image_id: u64,
        roi: &Roi,
        kind: PipelineKind,
        node_position: usize,
        chain_hash_to_node: ChainHash,
    ) -> Fingerprint {
        let mut hasher = FxHasher64::default();
        image_id.hash(&mut hasher);
        roi.x.hash(&mut hasher);
        roi.y.hash(&mut hasher);
        roi.width.hash(&mut hasher);
        roi.height.hash(&mut hasher);
        quantize_scale(roi.scale).hash(&mut hasher);
        kind.hash(&mut hasher);
        node_position.hash(&mut hasher);
        chain_hash_to_node.0.hash(&mut hasher);
        Fingerprint(hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roi() -> Roi {
        Roi::identity(16, 16)
    }

    #[test]
    fn stable_across_calls() {
        let chain = ChainHash::fold(ChainHash::default(), 42, true);
        let a = FingerprintHasher::hash(1, &roi(), PipelineKind::Preview, 2, chain);
        let b = FingerprintHasher::hash(1, &roi(), PipelineKind::Preview, 2, chain);
        assert_eq!(a, b);
    }

    #[test]
    fn quantization_absorbs_ulp_noise() {
        let mut roi_a = roi();
        let mut roi_b = roi();
        roi_a.scale = 0.5;
        roi_b.scale = 0.5 + f32::EPSILON;
        let chain = ChainHash::default();
        let a = FingerprintHasher::hash(1, &roi_a, PipelineKind::Full, 0, chain);
        let b = FingerprintHasher::hash(1, &roi_b, PipelineKind::Full, 0, chain);
        assert_eq!(a, b);
    }

    #[test]
    fn different_node_position_differs() {
        let chain = ChainHash::default();
        let a = FingerprintHasher::hash(1, &roi(), PipelineKind::Full, 0, chain);
        let b = FingerprintHasher::hash(1, &roi(), PipelineKind::Full, 1, chain);
        assert_ne!(a, b);
    }

    #[test]
    fn chain_hash_commutativity_of_equal_final_params() {
        // Two different "permutations of history" that converge to the same
        // final per-node state must fold to the same chain hash regardless
        // of which path got there (commutativity of commit).
        let base = ChainHash::default();
        let via_direct = ChainHash::fold(base, 99, true);
        let intermediate = ChainHash::fold(base, 1, true);
        let via_overwrite = ChainHash::fold(intermediate, 1, true);
        // both paths leave the node in the "own_params_hash = 1" state, so a
        // second identical fold from the same predecessor must agree.
        let also_direct = ChainHash::fold(base, 1, true);
        assert_eq!(also_direct, via_overwrite);
        assert_ne!(via_direct, also_direct);
    }
}
