use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::backend::{DetectionModel, ModelLoadError, ModelLoader};

/// Where a model comes from: a directory and an ordered list of file names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSource {
    pub dir: PathBuf,
    pub candidates: Vec<String>,
}

impl ModelSource {
    pub fn new(dir: impl Into<PathBuf>, candidates: &[&str]) -> Self {
        Self {
            dir: dir.into(),
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Candidate paths that exist on disk, in search order.
    pub fn existing_candidates(&self) -> Vec<PathBuf> {
        self.candidates
            .iter()
            .map(|name| self.dir.join(name))
            .filter(|path| path.is_file())
            .collect()
    }

    /// First candidate present on disk, if any.
    pub fn resolve(&self) -> Option<PathBuf> {
        self.existing_candidates().into_iter().next()
    }

    /// Load the first candidate that both exists and loads cleanly.
    ///
    /// A corrupt artifact is logged and skipped in favour of the next name.
    pub fn load_first(
        &self,
        loader: &dyn ModelLoader,
    ) -> Result<(PathBuf, Arc<dyn DetectionModel>), ModelLoadError> {
        for path in self.existing_candidates() {
            match loader.load(&path) {
                Ok(model) => return Ok((path, model)),
                Err(err) => {
                    log::warn!("skipping model candidate {}: {}", path.display(), err);
                }
            }
        }
        Err(ModelLoadError::NoCandidate {
            dir: self.dir.clone(),
            candidates: self.candidates.clone(),
        })
    }
}

/// Reject paths that escape the model directory.
pub fn validate_candidate_name(name: &str) -> Result<(), String> {
    let path = Path::new(name);
    if name.trim().is_empty() {
        return Err("model candidate name must not be empty".to_string());
    }
    if path.is_absolute() || path.components().count() != 1 {
        return Err(format!(
            "model candidate '{}' must be a plain file name inside the model directory",
            name
        ));
    }
    Ok(())
}
