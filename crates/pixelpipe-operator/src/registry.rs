//! The read-only, by-name operator registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::contract::Operator;
use crate::descriptor::OperatorDescriptor;

struct Entry {
    descriptor: OperatorDescriptor,
    operator: Arc<dyn Operator>,
    /// Position in registration order: the chain is always built in this
    /// order, so this doubles as the node's position for fingerprinting.
    position: usize,
}

/// Builder for an [`OperatorRegistry`], mirroring the "register then
/// finalize" shape of a compiler registry builder.
#[derive(Default)]
pub struct OperatorRegistryBuilder {
    entries: Vec<Entry>,
}

impl OperatorRegistryBuilder {
    /// Registers an operator under its descriptor's canonical name.
    ///
    /// If a name is registered twice the later registration wins and a
    /// warning is logged, matching the registry's collision handling for
    /// the upstream `CompilerRegistry`.
    #[must_use]
    pub fn register(mut self, descriptor: OperatorDescriptor, operator: Arc<dyn Operator>) -> Self {
        if let Some(existing) = self.entries.iter().find(|e| e.descriptor.name == descriptor.name) {
            warn!(name = descriptor.name, "duplicate operator registration for '{}', overriding position {}", descriptor.name, existing.position);
        }
        let position = self.entries.len();
        self.entries.push(Entry {
            descriptor,
            operator,
            position,
        });
        self
    }

    /// Finalizes the registry.
    #[must_use]
    pub fn create(self) -> OperatorRegistry {
        let by_name = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.descriptor.name, i))
            .collect();
        OperatorRegistry {
            entries: self.entries,
            by_name,
        }
    }
}

/// A read-only collection of operators, keyed by canonical short name. The
/// registry's registration order is the chain order: the pipeline builds
/// one node per registered operator, in this order.
pub struct OperatorRegistry {
    entries: Vec<Entry>,
    by_name: HashMap<&'static str, usize>,
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("operators", &self.entries.iter().map(|e| e.descriptor.name).collect::<Vec<_>>())
            .finish()
    }
}

impl OperatorRegistry {
    /// Number of registered operators, i.e. the chain length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no operators.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an operator by canonical name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<(&OperatorDescriptor, &Arc<dyn Operator>, usize)> {
        self.by_name
            .get(name)
            .map(|&i| (&self.entries[i].descriptor, &self.entries[i].operator, i))
    }

    /// Iterates operators in chain order.
    pub fn iter(&self) -> impl Iterator<Item = (&OperatorDescriptor, &Arc<dyn Operator>)> {
        self.entries.iter().map(|e| (&e.descriptor, &e.operator))
    }

    /// The operator at a given chain position, if any.
    #[must_use]
    pub fn at(&self, position: usize) -> Option<(&OperatorDescriptor, &Arc<dyn Operator>)> {
        self.entries.get(position).map(|e| (&e.descriptor, &e.operator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::NodeContext;
    use crate::descriptor::{Colorspace, OperationTags};
    use crate::error::OperatorError;
    use crate::params::ParamsBlob;
    use crate::tiling::TilingEstimate;
    use pixelpipe_cache::{ImageBufferDescriptor, Roi};
    use std::any::Any;

    struct NoOp;
    impl Operator for NoOp {
        fn output_format(&self, _: &NodeContext<'_>, in_dsc: &ImageBufferDescriptor) -> ImageBufferDescriptor {
            in_dsc.clone()
        }
        fn modify_roi_in(&self, _: &NodeContext<'_>, roi_out: &Roi) -> Roi {
            *roi_out
        }
        fn modify_roi_out(&self, _: &NodeContext<'_>, roi_in: &Roi) -> Roi {
            *roi_in
        }
        fn commit(&self, _: &ParamsBlob, _: &ParamsBlob) -> Box<dyn Any + Send + Sync> {
            Box::new(())
        }
        fn process(&self, _: &NodeContext<'_>, input: &[u8], output: &mut [u8], _: &Roi, _: &Roi) -> Result<(), OperatorError> {
            output.copy_from_slice(input);
            Ok(())
        }
        fn tiling_callback(&self, _: &NodeContext<'_>, _: &Roi, _: &Roi) -> TilingEstimate {
            TilingEstimate::identity(0)
        }
        fn operation_tags(&self) -> OperationTags {
            OperationTags::empty()
        }
        fn colorspace(&self) -> Colorspace {
            Colorspace::Rgb
        }
    }

    fn descriptor(name: &'static str) -> OperatorDescriptor {
        OperatorDescriptor {
            name,
            colorspace: Colorspace::Rgb,
            tags: OperationTags::empty(),
            default_params: ParamsBlob::empty(),
            default_blend_params: ParamsBlob::empty(),
            default_enabled: true,
        }
    }

    #[test]
    fn chain_order_matches_registration_order() {
        let registry = OperatorRegistryBuilder::default()
            .register(descriptor("source"), Arc::new(NoOp))
            .register(descriptor("identity"), Arc::new(NoOp))
            .register(descriptor("gamma"), Arc::new(NoOp))
            .create();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.at(0).unwrap().0.name, "source");
        assert_eq!(registry.at(2).unwrap().0.name, "gamma");
        assert_eq!(registry.find("gamma").unwrap().2, 2);
    }
}
