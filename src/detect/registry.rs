use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::frame::InferenceView;

use super::backend::{DetectionModel, InferenceError, InferenceParams, ModelLoadError, ModelLoader};
use super::loader::ModelSource;
use super::result::DetectionSet;

/// What to do when a model cannot be loaded at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Abort startup.
    #[default]
    Fatal,
    /// Keep serving; affected requests fail with `model_not_loaded`.
    Degrade,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SlotError {
    #[error("model '{name}' not loaded: {source}")]
    NotLoaded {
        name: String,
        #[source]
        source: ModelLoadError,
    },

    #[error("model '{name}' inference failed: {source}")]
    Inference {
        name: String,
        #[source]
        source: InferenceError,
    },
}

enum SlotOrigin {
    Preloaded,
    Source {
        source: ModelSource,
        loader: Arc<dyn ModelLoader>,
    },
}

/// A named model, loaded at most once.
///
/// The first `ensure_loaded` call performs the load; concurrent callers block
/// on it and every later call observes the same cached result, including a
/// cached failure.
pub struct ModelSlot {
    name: String,
    origin: SlotOrigin,
    cell: OnceLock<Result<Arc<dyn DetectionModel>, ModelLoadError>>,
    gate: Mutex<()>,
}

impl ModelSlot {
    pub fn preloaded(name: &str, model: Arc<dyn DetectionModel>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Ok(model));
        Self {
            name: name.to_string(),
            origin: SlotOrigin::Preloaded,
            cell,
            gate: Mutex::new(()),
        }
    }

    pub fn lazy(name: &str, source: ModelSource, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            name: name.to_string(),
            origin: SlotOrigin::Source { source, loader },
            cell: OnceLock::new(),
            gate: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once a load attempt has succeeded.
    pub fn is_loaded(&self) -> bool {
        matches!(self.cell.get(), Some(Ok(_)))
    }

    /// Idempotent load. Safe to call from many threads at once.
    pub fn ensure_loaded(&self) -> Result<Arc<dyn DetectionModel>, ModelLoadError> {
        self.cell.get_or_init(|| self.load()).clone()
    }

    fn load(&self) -> Result<Arc<dyn DetectionModel>, ModelLoadError> {
        match &self.origin {
            SlotOrigin::Preloaded => Err(ModelLoadError::Unsupported(format!(
                "model '{}' has no source to load from",
                self.name
            ))),
            SlotOrigin::Source { source, loader } => {
                let (path, model) = source.load_first(loader.as_ref())?;
                log::info!("model '{}' loaded from {}", self.name, path.display());
                if let Err(err) = model.warm_up() {
                    log::warn!("model '{}' warm-up failed: {}", self.name, err);
                }
                Ok(model)
            }
        }
    }

    /// Run inference, serializing calls unless the model is reentrant.
    pub fn infer(
        &self,
        image: &InferenceView<'_>,
        params: &InferenceParams,
    ) -> Result<DetectionSet, SlotError> {
        let model = self.ensure_loaded().map_err(|source| SlotError::NotLoaded {
            name: self.name.clone(),
            source,
        })?;

        let result = if model.reentrant() {
            model.infer(image, params)
        } else {
            // A panic inside a previous call leaves nothing behind the gate.
            let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
            model.infer(image, params)
        };

        result.map_err(|source| SlotError::Inference {
            name: self.name.clone(),
            source,
        })
    }
}

/// Process-wide set of named models.
#[derive(Default)]
pub struct ModelRegistry {
    slots: BTreeMap<String, Arc<ModelSlot>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot. A later slot with the same name replaces the earlier one.
    pub fn insert(&mut self, slot: ModelSlot) {
        self.slots.insert(slot.name.clone(), Arc::new(slot));
    }

    pub fn register_preloaded(&mut self, name: &str, model: Arc<dyn DetectionModel>) {
        self.insert(ModelSlot::preloaded(name, model));
    }

    pub fn register_lazy(&mut self, name: &str, source: ModelSource, loader: Arc<dyn ModelLoader>) {
        self.insert(ModelSlot::lazy(name, source, loader));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelSlot>> {
        self.slots.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    /// Eagerly load every slot.
    ///
    /// Under `LoadPolicy::Fatal` the first failure is returned. Under
    /// `LoadPolicy::Degrade` failures are logged and the registry stays usable.
    pub fn preload(&self, policy: LoadPolicy) -> Result<(), SlotError> {
        for slot in self.slots.values() {
            if let Err(source) = slot.ensure_loaded() {
                let err = SlotError::NotLoaded {
                    name: slot.name.clone(),
                    source,
                };
                match policy {
                    LoadPolicy::Fatal => return Err(err),
                    LoadPolicy::Degrade => log::error!("{}; serving degraded", err),
                }
            }
        }
        Ok(())
    }
}
