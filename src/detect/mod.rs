mod backend;
mod backends;
mod loader;
mod nms;
mod registry;
mod result;

pub use backend::{
    DetectionModel, InferenceError, InferenceParams, ModelLoadError, ModelLoader,
    UnavailableLoader,
};
pub use backends::ScriptedModel;
#[cfg(feature = "backend-tract")]
pub use backends::{TractLoader, TractModel};
pub use loader::{validate_candidate_name, ModelSource};
pub use nms::{non_max_suppression, MAX_NMS_INPUTS};
pub use registry::{LoadPolicy, ModelRegistry, ModelSlot, SlotError};
pub use result::{BoundingBox, Detection, DetectionSet};

use std::sync::Arc;

/// Loader for the inference backend this build was compiled with.
pub fn default_loader(input_size: u32) -> Arc<dyn ModelLoader> {
    #[cfg(feature = "backend-tract")]
    {
        Arc::new(TractLoader { input_size })
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        let _ = input_size;
        Arc::new(UnavailableLoader)
    }
}
