use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::frame::InferenceView;

use super::result::DetectionSet;

/// Per-call inference parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InferenceParams {
    /// Candidates below this score are discarded by the model.
    pub confidence_threshold: f32,
    /// IoU above which overlapping same-class boxes are suppressed.
    pub iou_threshold: f32,
    /// Square model input edge in pixels.
    pub input_size: u32,
    /// Test-time augmentation.
    pub augment: bool,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.7,
            input_size: 640,
            augment: false,
        }
    }
}

impl InferenceParams {
    pub fn with_confidence(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("detection confidence {0} outside 0..=1")]
    InvalidConfidence(f32),

    #[error("incompatible input: {0}")]
    Shape(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ModelLoadError {
    #[error("model artifact not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("model artifact {} is unusable: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("no usable model among candidates {candidates:?} in {}", .dir.display())]
    NoCandidate { dir: PathBuf, candidates: Vec<String> },

    #[error("no model loader available: {0}")]
    Unsupported(String),
}

/// Detection model capability.
///
/// Implementations receive a borrowed view of the pixels and must not retain
/// it past `infer`. They may allocate working memory per call but must not
/// mutate persistent state observable by other requests.
pub trait DetectionModel: Send + Sync {
    /// Model identifier, for logs.
    fn name(&self) -> &str;

    /// Run the model on one image.
    fn infer(
        &self,
        image: &InferenceView<'_>,
        params: &InferenceParams,
    ) -> Result<DetectionSet, InferenceError>;

    /// Whether concurrent `infer` calls on the same instance are safe.
    ///
    /// When false the registry serializes calls with a per-model lock.
    fn reentrant(&self) -> bool {
        false
    }

    /// Optional warm-up hook.
    fn warm_up(&self) -> Result<(), InferenceError> {
        Ok(())
    }
}

/// Turns an artifact on disk into a ready model.
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn DetectionModel>, ModelLoadError>;
}

/// Loader used when the crate is built without an inference backend.
#[derive(Debug, Default)]
pub struct UnavailableLoader;

impl ModelLoader for UnavailableLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn DetectionModel>, ModelLoadError> {
        Err(ModelLoadError::Unsupported(format!(
            "cannot load {}: built without the backend-tract feature",
            path.display()
        )))
    }
}
