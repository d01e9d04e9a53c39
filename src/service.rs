//! Startup wiring: config -> models -> context -> one cascade per mode.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::cascade::{panic_message, CascadePipeline};
use crate::config::{BananaConfig, LoadingMode};
use crate::context::InferenceContext;
use crate::detect::{ModelLoader, ModelRegistry, ModelSource};
use crate::outcome::{FailureReason, PipelineOutcome};

/// Request entry point shared by the HTTP api and the CLI.
pub struct Classifier {
    ctx: Arc<InferenceContext>,
    pipelines: BTreeMap<String, CascadePipeline>,
    default_mode: String,
}

impl Classifier {
    /// Build from an existing context and one cascade per mode.
    pub fn new(
        ctx: Arc<InferenceContext>,
        pipelines: BTreeMap<String, CascadePipeline>,
        default_mode: &str,
    ) -> Result<Self> {
        if !pipelines.contains_key(default_mode) {
            return Err(anyhow!("no cascade configured for default mode '{}'", default_mode));
        }
        Ok(Self {
            ctx,
            pipelines,
            default_mode: default_mode.to_string(),
        })
    }

    /// Register every configured model, load them per policy, bind cascades.
    pub fn from_config(cfg: &BananaConfig, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        let mut registry = ModelRegistry::new();
        for entry in &cfg.models.entries {
            let candidates: Vec<&str> = entry.candidates.iter().map(String::as_str).collect();
            registry.register_lazy(
                &entry.name,
                ModelSource::new(&cfg.models.dir, &candidates),
                loader.clone(),
            );
        }

        match cfg.models.loading {
            LoadingMode::Eager => registry.preload(cfg.models.on_missing)?,
            LoadingMode::Lazy => log::info!("models load on first use"),
        }

        log::info!(
            "unknown class policy: {:?}; {} class keys",
            cfg.unknown_class,
            cfg.classes.len()
        );
        let ctx = Arc::new(InferenceContext::new(registry, cfg.classes.clone()));

        let mut pipelines = BTreeMap::new();
        for (mode, spec) in &cfg.cascades {
            log::info!(
                "mode '{}': {} stage(s), fallback {}, trigger {:?}, acceptance {:.2}",
                mode,
                spec.stages.len(),
                spec.fallback
                    .as_ref()
                    .map(|f| f.model.as_str())
                    .unwrap_or("none"),
                spec.fallback_trigger,
                spec.acceptance_threshold
            );
            pipelines.insert(mode.clone(), CascadePipeline::new(ctx.clone(), spec.clone())?);
        }

        Self::new(ctx, pipelines, &cfg.default_mode)
    }

    pub fn context(&self) -> &InferenceContext {
        &self.ctx
    }

    pub fn modes(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    pub fn default_mode(&self) -> &str {
        &self.default_mode
    }

    /// Classify an upload. Always returns a well-formed outcome.
    ///
    /// Unknown or missing modes use the default cascade.
    pub fn classify(&self, bytes: &[u8], mode: Option<&str>) -> PipelineOutcome {
        let requested = mode.map(|m| m.trim().to_lowercase());
        let pipeline = match requested.as_deref().and_then(|m| self.pipelines.get(m)) {
            Some(pipeline) => pipeline,
            None => {
                if let Some(mode) = &requested {
                    log::debug!("unknown mode '{}', using '{}'", mode, self.default_mode);
                }
                match self.pipelines.get(&self.default_mode) {
                    Some(pipeline) => pipeline,
                    None => {
                        return PipelineOutcome::failure_with(
                            FailureReason::ServerError,
                            "default cascade missing",
                        )
                    }
                }
            }
        };

        match catch_unwind(AssertUnwindSafe(|| pipeline.classify(bytes))) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                log::error!("classification aborted: {}", detail);
                PipelineOutcome::failure_with(FailureReason::ServerError, detail)
            }
        }
    }
}
