//! Static per-operator-kind metadata.

use bitflags::bitflags;

use crate::params::ParamsBlob;

bitflags! {
    /// Static capability/behavior flags for an operator kind.
    #[derive(Default)]
    pub struct OperationTags: u32 {
        /// The operator changes pixel geometry (crop, rotate, lens
        /// correction, ...). Distortion operators disqualify the
        /// mask-display short-circuit during node execution.
        const DISTORTS_GEOMETRY = 1 << 0;
        /// The operator is only meaningful in preview-quality renders.
        const PREVIEW_ONLY = 1 << 1;
        /// The operator only has a CPU implementation regardless of what
        /// `cl_ready` on individual nodes might otherwise suggest.
        const PREVIEW_ONLY_CPU = 1 << 2;
    }
}

/// Preferred working colorspace for an operator's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colorspace {
    /// Linear or gamma RGB.
    Rgb,
    /// CIE Lab.
    Lab,
    /// Pre-demosaic raw sensor data.
    Raw,
}

/// Static metadata describing an operator kind, independent of any
/// particular node instance.
#[derive(Debug, Clone)]
pub struct OperatorDescriptor {
    /// Canonical short name, e.g. `"gamma"`, `"colorout"`. Must be unique
    /// within a registry.
    pub name: &'static str,
    /// Preferred colorspace for this operator's input.
    pub colorspace: Colorspace,
    /// Static tag flags.
    pub tags: OperationTags,
    /// Default parameter blob assigned to a freshly built node.
    pub default_params: ParamsBlob,
    /// Default blend parameter blob assigned to a freshly built node.
    pub default_blend_params: ParamsBlob,
    /// Whether a freshly built node starts out enabled.
    pub default_enabled: bool,
}
