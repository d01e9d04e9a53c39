//! Cascade pipeline: gating stages, one terminal stage, optional fallback.
//!
//! Each stage returns a tagged `Result<DetectionSet, SlotError>`; the
//! orchestrator decides the next step from that tag alone and commits to a
//! single `PipelineOutcome`. Faults never cross `run`/`classify`.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::classes::UnknownClassPolicy;
use crate::context::InferenceContext;
use crate::detect::{DetectionSet, InferenceError, InferenceParams, ModelSlot, SlotError};
use crate::frame::{decode_image, InferenceView, PixelBuffer};
use crate::outcome::{Engine, FailureReason, PipelineOutcome};

pub const DEFAULT_ACCEPTANCE_THRESHOLD: f32 = 0.40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    /// Vetoes on an empty result; never selects.
    Gating,
    /// Result is eligible to become the outcome.
    Terminal,
}

/// When the fallback terminal stage runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FallbackTrigger {
    /// Only when the terminal stage fails at runtime.
    #[default]
    OnError,
    /// Also when the terminal stage returns no detections.
    OnErrorOrEmpty,
}

impl FallbackTrigger {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on_error" => Ok(Self::OnError),
            "on_error_or_empty" => Ok(Self::OnErrorOrEmpty),
            other => Err(anyhow!(
                "fallback trigger must be 'on_error' or 'on_error_or_empty', got '{}'",
                other
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageSpec {
    pub name: String,
    /// Registry name of the model this stage runs.
    pub model: String,
    pub kind: StageKind,
    pub params: InferenceParams,
}

impl StageSpec {
    pub fn gating(model: &str, confidence: f32) -> Self {
        Self::new(model, StageKind::Gating, confidence)
    }

    pub fn terminal(model: &str, confidence: f32) -> Self {
        Self::new(model, StageKind::Terminal, confidence)
    }

    fn new(model: &str, kind: StageKind, confidence: f32) -> Self {
        Self {
            name: model.to_string(),
            model: model.to_string(),
            kind,
            params: InferenceParams::default().with_confidence(confidence),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_params(mut self, params: InferenceParams) -> Self {
        self.params = params;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CascadeSpec {
    /// Gating stages in order, terminal stage last.
    pub stages: Vec<StageSpec>,
    pub fallback: Option<StageSpec>,
    pub fallback_trigger: FallbackTrigger,
    pub acceptance_threshold: f32,
    pub unknown_class: UnknownClassPolicy,
}

impl Default for CascadeSpec {
    /// Filter model gate, then the main detector with a smaller fallback.
    fn default() -> Self {
        Self {
            stages: vec![
                StageSpec::gating("filter", 0.35),
                StageSpec::terminal("real", 0.25),
            ],
            fallback: Some(StageSpec::terminal("real_fallback", 0.25)),
            fallback_trigger: FallbackTrigger::default(),
            acceptance_threshold: DEFAULT_ACCEPTANCE_THRESHOLD,
            unknown_class: UnknownClassPolicy::default(),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum CascadeError {
    #[error("cascade has no stages")]
    NoStages,

    #[error("cascade must end with exactly one terminal stage")]
    TerminalPlacement,

    #[error("fallback stage '{0}' must be a terminal stage")]
    FallbackNotTerminal(String),

    #[error("stage '{stage}' references unregistered model '{model}'")]
    UnknownModel { stage: String, model: String },

    #[error("{what} must be within 0..=1, got {value}")]
    ThresholdOutOfRange { what: String, value: f32 },

    #[error("stage '{0}' has a zero input size")]
    ZeroInputSize(String),
}

struct BoundStage {
    spec: StageSpec,
    slot: Arc<ModelSlot>,
}

/// A validated cascade bound to the models of an `InferenceContext`.
pub struct CascadePipeline {
    ctx: Arc<InferenceContext>,
    spec: CascadeSpec,
    gating: Vec<BoundStage>,
    terminal: BoundStage,
    fallback: Option<BoundStage>,
}

impl CascadePipeline {
    pub fn new(ctx: Arc<InferenceContext>, spec: CascadeSpec) -> Result<Self, CascadeError> {
        check_unit("acceptance threshold", spec.acceptance_threshold)?;

        let (last, leading) = spec.stages.split_last().ok_or(CascadeError::NoStages)?;
        if last.kind != StageKind::Terminal
            || leading.iter().any(|s| s.kind != StageKind::Gating)
        {
            return Err(CascadeError::TerminalPlacement);
        }
        if let Some(fallback) = &spec.fallback {
            if fallback.kind != StageKind::Terminal {
                return Err(CascadeError::FallbackNotTerminal(fallback.name.clone()));
            }
        }

        let bind = |stage: &StageSpec| -> Result<BoundStage, CascadeError> {
            check_unit(&format!("stage '{}' confidence", stage.name), stage.params.confidence_threshold)?;
            check_unit(&format!("stage '{}' iou", stage.name), stage.params.iou_threshold)?;
            if stage.params.input_size == 0 {
                return Err(CascadeError::ZeroInputSize(stage.name.clone()));
            }
            let slot = ctx.registry().get(&stage.model).ok_or_else(|| CascadeError::UnknownModel {
                stage: stage.name.clone(),
                model: stage.model.clone(),
            })?;
            Ok(BoundStage {
                spec: stage.clone(),
                slot,
            })
        };

        let gating = leading.iter().map(&bind).collect::<Result<Vec<_>, _>>()?;
        let terminal = bind(last)?;
        let fallback = spec.fallback.as_ref().map(&bind).transpose()?;

        Ok(Self {
            ctx,
            spec,
            gating,
            terminal,
            fallback,
        })
    }

    pub fn spec(&self) -> &CascadeSpec {
        &self.spec
    }

    /// Decode and classify an uploaded payload. No model runs on decode failure.
    pub fn classify(&self, bytes: &[u8]) -> PipelineOutcome {
        match decode_image(bytes) {
            Ok(frame) => self.run(frame),
            Err(err) => {
                log::debug!("rejecting upload: {}", err);
                PipelineOutcome::failure(FailureReason::InvalidImageFormat)
            }
        }
    }

    /// Classify a decoded image. The buffer is released when this returns.
    pub fn run(&self, frame: PixelBuffer) -> PipelineOutcome {
        let view = frame.inference_view();
        self.cascade(&view)
    }

    fn cascade(&self, view: &InferenceView<'_>) -> PipelineOutcome {
        for stage in &self.gating {
            match run_stage(stage, view) {
                Ok(set) if set.is_empty() => {
                    log::debug!("gating stage '{}' vetoed the image", stage.spec.name);
                    return PipelineOutcome::failure(FailureReason::NoBananaDetected);
                }
                Ok(set) => {
                    log::debug!("gating stage '{}' passed ({} detections)", stage.spec.name, set.len());
                }
                Err(err) => return gating_failure(err),
            }
        }

        let primary = run_stage(&self.terminal, view);
        let primary = match primary {
            Ok(set) if !set.is_empty() => return self.select(set, Engine::Main),
            Ok(_) if self.spec.fallback_trigger == FallbackTrigger::OnError => {
                return PipelineOutcome::failure(FailureReason::BananaLikeObject);
            }
            other => other,
        };

        let Some(fallback) = &self.fallback else {
            return match primary {
                Ok(_) => PipelineOutcome::failure(FailureReason::BananaLikeObject),
                Err(err) => terminal_failure(err),
            };
        };

        match &primary {
            Ok(_) => log::warn!(
                "terminal stage '{}' found nothing; switching to fallback '{}'",
                self.terminal.spec.name,
                fallback.spec.name
            ),
            Err(err) => log::warn!(
                "terminal stage '{}' failed ({}); switching to fallback '{}'",
                self.terminal.spec.name,
                err,
                fallback.spec.name
            ),
        }

        match run_stage(fallback, view) {
            Ok(set) if !set.is_empty() => self.select(set, Engine::Fallback),
            Ok(_) => PipelineOutcome::failure_with(
                FailureReason::AllModelsFailed,
                format!(
                    "terminal stage '{}' and fallback '{}' produced no detections",
                    self.terminal.spec.name, fallback.spec.name
                ),
            ),
            Err(fallback_err) => match (&primary, &fallback_err) {
                (Err(SlotError::NotLoaded { .. }), SlotError::NotLoaded { .. }) => {
                    PipelineOutcome::failure_with(
                        FailureReason::ModelNotLoaded,
                        fallback_err.to_string(),
                    )
                }
                (Err(primary_err), _) => PipelineOutcome::failure_with(
                    FailureReason::AllModelsFailed,
                    format!("{}; {}", primary_err, fallback_err),
                ),
                (Ok(_), _) => PipelineOutcome::failure_with(
                    FailureReason::AllModelsFailed,
                    fallback_err.to_string(),
                ),
            },
        }
    }

    fn select(&self, set: DetectionSet, engine: Engine) -> PipelineOutcome {
        let Some(best) = set.best() else {
            return PipelineOutcome::failure(FailureReason::AllModelsFailed);
        };
        if best.confidence() < self.spec.acceptance_threshold {
            log::debug!(
                "best detection {:.3} below acceptance {:.2}",
                best.confidence(),
                self.spec.acceptance_threshold
            );
            return PipelineOutcome::failure(FailureReason::LowConfidence);
        }
        match self
            .ctx
            .classes()
            .resolve(best.class_id(), self.spec.unknown_class)
        {
            Ok(species_key) => PipelineOutcome::Success {
                species_key,
                confidence: best.confidence(),
                engine,
            },
            Err(reason) => {
                PipelineOutcome::failure_with(reason, format!("class id {}", best.class_id()))
            }
        }
    }
}

/// Run one stage, keep detections at or above its threshold.
///
/// A panicking model is reported as an inference error of that stage.
fn run_stage(stage: &BoundStage, view: &InferenceView<'_>) -> Result<DetectionSet, SlotError> {
    let params = &stage.spec.params;
    let result = catch_unwind(AssertUnwindSafe(|| stage.slot.infer(view, params)))
        .unwrap_or_else(|payload| {
            Err(SlotError::Inference {
                name: stage.slot.name().to_string(),
                source: InferenceError::Backend(format!(
                    "model panicked: {}",
                    panic_message(payload.as_ref())
                )),
            })
        });
    result.map(|set| set.retain_above(params.confidence_threshold))
}

fn gating_failure(err: SlotError) -> PipelineOutcome {
    match err {
        SlotError::NotLoaded { .. } => {
            PipelineOutcome::failure_with(FailureReason::ModelNotLoaded, err.to_string())
        }
        SlotError::Inference { .. } => {
            log::error!("gating stage failed: {}", err);
            PipelineOutcome::failure_with(FailureReason::ServerError, err.to_string())
        }
    }
}

fn terminal_failure(err: SlotError) -> PipelineOutcome {
    match err {
        SlotError::NotLoaded { .. } => {
            PipelineOutcome::failure_with(FailureReason::ModelNotLoaded, err.to_string())
        }
        SlotError::Inference { .. } => {
            PipelineOutcome::failure_with(FailureReason::AllModelsFailed, err.to_string())
        }
    }
}

fn check_unit(what: &str, value: f32) -> Result<(), CascadeError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(CascadeError::ThresholdOutOfRange {
            what: what.to_string(),
            value,
        })
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::ClassKeyTable;
    use crate::detect::{ModelRegistry, ScriptedModel};

    fn context(models: Vec<(&str, ScriptedModel)>) -> Arc<InferenceContext> {
        let mut registry = ModelRegistry::new();
        for (name, model) in models {
            registry.register_preloaded(name, Arc::new(model));
        }
        Arc::new(InferenceContext::new(registry, ClassKeyTable::default()))
    }

    #[test]
    fn rejects_malformed_cascades() {
        let ctx = context(vec![
            ("filter", ScriptedModel::new("filter")),
            ("real", ScriptedModel::new("real")),
        ]);
        let base = CascadeSpec {
            fallback: None,
            ..CascadeSpec::default()
        };

        let empty = CascadeSpec {
            stages: vec![],
            ..base.clone()
        };
        assert_eq!(CascadePipeline::new(ctx.clone(), empty).err(), Some(CascadeError::NoStages));

        let gating_last = CascadeSpec {
            stages: vec![StageSpec::terminal("real", 0.25), StageSpec::gating("filter", 0.35)],
            ..base.clone()
        };
        assert_eq!(
            CascadePipeline::new(ctx.clone(), gating_last).err(),
            Some(CascadeError::TerminalPlacement)
        );

        let unknown = CascadeSpec {
            stages: vec![StageSpec::terminal("ghost", 0.25)],
            ..base.clone()
        };
        assert!(matches!(
            CascadePipeline::new(ctx.clone(), unknown).err(),
            Some(CascadeError::UnknownModel { .. })
        ));

        let bad_threshold = CascadeSpec {
            acceptance_threshold: 1.5,
            ..base.clone()
        };
        assert!(matches!(
            CascadePipeline::new(ctx.clone(), bad_threshold).err(),
            Some(CascadeError::ThresholdOutOfRange { .. })
        ));

        let gating_fallback = CascadeSpec {
            fallback: Some(StageSpec::gating("filter", 0.3)),
            ..base.clone()
        };
        assert!(matches!(
            CascadePipeline::new(ctx.clone(), gating_fallback).err(),
            Some(CascadeError::FallbackNotTerminal(_))
        ));

        assert!(CascadePipeline::new(ctx, base).is_ok());
    }

    #[test]
    fn gating_model_error_is_server_error() {
        let ctx = context(vec![
            ("filter", ScriptedModel::failing("filter", "shape mismatch")),
            ("real", ScriptedModel::returning("real", &[(1, 0.9)])),
            ("real_fallback", ScriptedModel::new("real_fallback")),
        ]);
        let pipeline = CascadePipeline::new(ctx, CascadeSpec::default()).unwrap();
        let frame = PixelBuffer::from_rgb8(vec![0; 3], 1, 1).unwrap();
        let outcome = pipeline.run(frame);
        assert_eq!(outcome.reason(), Some(FailureReason::ServerError));
    }

    #[test]
    fn panicking_terminal_model_falls_back() {
        let ctx = context(vec![
            ("filter", ScriptedModel::returning("filter", &[(0, 0.9)])),
            ("real", ScriptedModel::new("real").then_panic("backend exploded")),
            ("real_fallback", ScriptedModel::returning("real_fallback", &[(3, 0.7)])),
        ]);
        let pipeline = CascadePipeline::new(ctx, CascadeSpec::default()).unwrap();
        let frame = PixelBuffer::from_rgb8(vec![0; 3], 1, 1).unwrap();
        match pipeline.run(frame) {
            PipelineOutcome::Success {
                species_key,
                engine,
                ..
            } => {
                assert_eq!(species_key, "homthong");
                assert_eq!(engine, Engine::Fallback);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn stage_threshold_is_applied_even_if_model_ignores_it() {
        struct Loose;
        impl crate::detect::DetectionModel for Loose {
            fn name(&self) -> &str {
                "loose"
            }
            fn infer(
                &self,
                _image: &InferenceView<'_>,
                _params: &InferenceParams,
            ) -> Result<DetectionSet, InferenceError> {
                Ok(DetectionSet::new(vec![crate::detect::Detection::new(0, 0.1)?]))
            }
        }

        let mut registry = ModelRegistry::new();
        registry.register_preloaded("filter", Arc::new(Loose));
        registry.register_preloaded("real", Arc::new(ScriptedModel::returning("real", &[(1, 0.9)])));
        let ctx = Arc::new(InferenceContext::new(registry, ClassKeyTable::default()));
        let spec = CascadeSpec {
            fallback: None,
            ..CascadeSpec::default()
        };
        let pipeline = CascadePipeline::new(ctx, spec).unwrap();
        let frame = PixelBuffer::from_rgb8(vec![0; 3], 1, 1).unwrap();
        assert_eq!(pipeline.run(frame).reason(), Some(FailureReason::NoBananaDetected));
    }

    #[test]
    fn fallback_trigger_parsing() {
        assert_eq!(FallbackTrigger::parse("on_error").unwrap(), FallbackTrigger::OnError);
        assert_eq!(
            FallbackTrigger::parse("ON_ERROR_OR_EMPTY").unwrap(),
            FallbackTrigger::OnErrorOrEmpty
        );
        assert!(FallbackTrigger::parse("always").is_err());
    }
}
