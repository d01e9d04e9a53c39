use crate::classes::ClassKeyTable;
use crate::detect::ModelRegistry;

/// Immutable process-wide inference state, built once at startup and shared
/// by every pipeline through an `Arc`.
pub struct InferenceContext {
    registry: ModelRegistry,
    classes: ClassKeyTable,
}

impl InferenceContext {
    pub fn new(registry: ModelRegistry, classes: ClassKeyTable) -> Self {
        Self { registry, classes }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn classes(&self) -> &ClassKeyTable {
        &self.classes
    }
}
