use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use banana_cascade::detect::{ModelSource, ScriptedModel, UnavailableLoader};
use banana_cascade::{
    CascadePipeline, CascadeSpec, ClassKeyTable, Engine, FailureReason, FallbackTrigger,
    InferenceContext, ModelRegistry, PipelineOutcome, PixelBuffer, UnknownClassPolicy,
};

struct Models {
    filter: Arc<ScriptedModel>,
    real: Arc<ScriptedModel>,
    fallback: Arc<ScriptedModel>,
}

impl Models {
    fn new(filter: ScriptedModel, real: ScriptedModel, fallback: ScriptedModel) -> Self {
        Self {
            filter: Arc::new(filter),
            real: Arc::new(real),
            fallback: Arc::new(fallback),
        }
    }

    fn context(&self) -> Arc<InferenceContext> {
        let mut registry = ModelRegistry::new();
        registry.register_preloaded("filter", self.filter.clone());
        registry.register_preloaded("real", self.real.clone());
        registry.register_preloaded("real_fallback", self.fallback.clone());
        Arc::new(InferenceContext::new(registry, ClassKeyTable::default()))
    }

    fn pipeline(&self, spec: CascadeSpec) -> CascadePipeline {
        CascadePipeline::new(self.context(), spec).unwrap()
    }
}

fn banana_gate() -> ScriptedModel {
    ScriptedModel::returning("filter", &[(0, 0.92)])
}

fn frame() -> PixelBuffer {
    PixelBuffer::from_rgb8(vec![128; 4 * 4 * 3], 4, 4).unwrap()
}

fn success(key: &str, confidence: f32, engine: Engine) -> PipelineOutcome {
    PipelineOutcome::Success {
        species_key: key.to_string(),
        confidence,
        engine,
    }
}

#[test]
fn main_engine_classifies_banana() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::returning("real", &[(6, 0.91), (2, 0.55)]),
        ScriptedModel::returning("real_fallback", &[(3, 0.99)]),
    );
    let outcome = models.pipeline(CascadeSpec::default()).run(frame());

    assert_eq!(outcome, success("kai", 0.91, Engine::Main));
    assert_eq!(models.fallback.calls(), 0);
    let json = outcome.to_response();
    assert_eq!(json["banana_key"], "kai");
    assert_eq!(json["engine"], "main");
}

#[test]
fn empty_gate_stops_before_terminal() {
    let models = Models::new(
        ScriptedModel::new("filter"),
        ScriptedModel::returning("real", &[(6, 0.91)]),
        ScriptedModel::returning("real_fallback", &[(6, 0.91)]),
    );
    let outcome = models.pipeline(CascadeSpec::default()).run(frame());

    assert_eq!(outcome.reason(), Some(FailureReason::NoBananaDetected));
    assert_eq!(models.real.calls(), 0);
    assert_eq!(models.fallback.calls(), 0);
}

#[test]
fn gate_below_stage_threshold_counts_as_empty() {
    let models = Models::new(
        ScriptedModel::returning("filter", &[(0, 0.20)]),
        ScriptedModel::returning("real", &[(6, 0.91)]),
        ScriptedModel::new("real_fallback"),
    );
    let outcome = models.pipeline(CascadeSpec::default()).run(frame());
    assert_eq!(outcome.reason(), Some(FailureReason::NoBananaDetected));
}

#[test]
fn terminal_error_switches_to_fallback() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::failing("real", "onnx runtime error"),
        ScriptedModel::returning("real_fallback", &[(3, 0.80)]),
    );
    let outcome = models.pipeline(CascadeSpec::default()).run(frame());

    assert_eq!(outcome, success("homthong", 0.80, Engine::Fallback));
    assert_eq!(outcome.to_response()["engine"], "fallback");
}

#[test]
fn both_terminal_models_failing() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::failing("real", "primary down"),
        ScriptedModel::failing("real_fallback", "fallback down"),
    );
    let outcome = models.pipeline(CascadeSpec::default()).run(frame());

    assert_eq!(outcome.reason(), Some(FailureReason::AllModelsFailed));
    let json = outcome.to_response();
    assert_eq!(json["success"], false);
    assert_eq!(json["reason"], "all_models_failed");
}

#[test]
fn weak_detection_is_low_confidence() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::returning("real", &[(1, 0.30)]),
        ScriptedModel::returning("real_fallback", &[(1, 0.95)]),
    );
    let outcome = models.pipeline(CascadeSpec::default()).run(frame());

    assert_eq!(outcome.reason(), Some(FailureReason::LowConfidence));
    assert_eq!(models.fallback.calls(), 0);
}

#[test]
fn acceptance_threshold_is_inclusive() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::returning("real", &[(1, 0.40)]),
        ScriptedModel::new("real_fallback"),
    );
    let outcome = models.pipeline(CascadeSpec::default()).run(frame());
    assert_eq!(outcome, success("namwa", 0.40, Engine::Main));
}

#[test]
fn empty_terminal_is_banana_like_under_on_error() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::new("real"),
        ScriptedModel::returning("real_fallback", &[(5, 0.88)]),
    );
    let outcome = models.pipeline(CascadeSpec::default()).run(frame());

    assert_eq!(outcome.reason(), Some(FailureReason::BananaLikeObject));
    assert_eq!(models.fallback.calls(), 0);
}

#[test]
fn empty_terminal_runs_fallback_under_on_error_or_empty() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::new("real"),
        ScriptedModel::returning("real_fallback", &[(5, 0.88)]),
    );
    let spec = CascadeSpec {
        fallback_trigger: FallbackTrigger::OnErrorOrEmpty,
        ..CascadeSpec::default()
    };
    let outcome = models.pipeline(spec).run(frame());

    assert_eq!(outcome, success("thepphanom", 0.88, Engine::Fallback));
}

#[test]
fn empty_terminal_and_empty_fallback() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::new("real"),
        ScriptedModel::new("real_fallback"),
    );
    let spec = CascadeSpec {
        fallback_trigger: FallbackTrigger::OnErrorOrEmpty,
        ..CascadeSpec::default()
    };
    let outcome = models.pipeline(spec).run(frame());
    assert_eq!(outcome.reason(), Some(FailureReason::AllModelsFailed));
}

#[test]
fn terminal_error_without_fallback() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::failing("real", "boom"),
        ScriptedModel::new("real_fallback"),
    );
    let spec = CascadeSpec {
        fallback: None,
        ..CascadeSpec::default()
    };
    let outcome = models.pipeline(spec).run(frame());
    assert_eq!(outcome.reason(), Some(FailureReason::AllModelsFailed));
}

#[test]
fn unknown_class_id_policies() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::returning("real", &[(42, 0.90)]),
        ScriptedModel::new("real_fallback"),
    );

    let strict = models.pipeline(CascadeSpec::default()).run(frame());
    assert_eq!(strict.reason(), Some(FailureReason::UnknownClassId));

    let lenient = models
        .pipeline(CascadeSpec {
            unknown_class: UnknownClassPolicy::Lenient,
            ..CascadeSpec::default()
        })
        .run(frame());
    assert_eq!(lenient, success("unknown", 0.90, Engine::Main));
}

#[test]
fn ties_resolve_to_first_detection() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::returning("real", &[(2, 0.80), (5, 0.80)]),
        ScriptedModel::new("real_fallback"),
    );
    let pipeline = models.pipeline(CascadeSpec::default());

    let first = pipeline.run(frame());
    assert_eq!(first, success("namwadam", 0.80, Engine::Main));
    assert_eq!(pipeline.run(frame()), first);
}

#[test]
fn missing_terminal_models_report_not_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let loader = Arc::new(UnavailableLoader);
    let mut registry = ModelRegistry::new();
    registry.register_preloaded("filter", Arc::new(banana_gate()));
    registry.register_lazy(
        "real",
        ModelSource::new(dir.path(), &["best_modelv8sbg.onnx"]),
        loader.clone(),
    );
    registry.register_lazy(
        "real_fallback",
        ModelSource::new(dir.path(), &["best_modelv8nbg.onnx"]),
        loader,
    );
    let ctx = Arc::new(InferenceContext::new(registry, ClassKeyTable::default()));
    let pipeline = CascadePipeline::new(ctx, CascadeSpec::default()).unwrap();

    let outcome = pipeline.run(frame());
    assert_eq!(outcome.reason(), Some(FailureReason::ModelNotLoaded));
}

#[test]
fn pixel_buffer_released_on_failure_path() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::failing("real", "boom"),
        ScriptedModel::failing("real_fallback", "boom"),
    );
    let pipeline = models.pipeline(CascadeSpec::default());
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let frame = frame().on_release(move || flag.store(true, Ordering::SeqCst));

    let outcome = pipeline.run(frame);
    assert_eq!(outcome.reason(), Some(FailureReason::AllModelsFailed));
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn concurrent_requests_share_one_pipeline() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::returning("real", &[(8, 0.77)]),
        ScriptedModel::new("real_fallback"),
    );
    let pipeline = Arc::new(models.pipeline(CascadeSpec::default()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pipeline = pipeline.clone();
            std::thread::spawn(move || {
                (0..5)
                    .map(|_| pipeline.run(frame()))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    for handle in handles {
        for outcome in handle.join().unwrap() {
            assert_eq!(outcome, success("ngachang", 0.77, Engine::Main));
        }
    }
    assert_eq!(models.real.calls(), 40);
    assert_eq!(models.filter.calls(), 40);
}

#[test]
fn stage_thresholds_reach_the_model() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::returning("real", &[(4, 0.6)]),
        ScriptedModel::new("real_fallback"),
    );
    models.pipeline(CascadeSpec::default()).run(frame());

    assert_eq!(models.filter.last_params().unwrap().confidence_threshold, 0.35);
    assert_eq!(models.real.last_params().unwrap().confidence_threshold, 0.25);
}

#[test]
fn panicking_gate_does_not_affect_next_request() {
    let models = Models::new(
        ScriptedModel::new("filter")
            .then_panic("transient gate fault")
            .then_return(&[(0, 0.92)]),
        ScriptedModel::returning("real", &[(1, 0.90)]),
        ScriptedModel::new("real_fallback"),
    );
    let pipeline = models.pipeline(CascadeSpec::default());

    assert_eq!(pipeline.run(frame()).reason(), Some(FailureReason::ServerError));
    assert_eq!(pipeline.run(frame()), success("namwa", 0.90, Engine::Main));
    assert_eq!(pipeline.run(frame()), success("namwa", 0.90, Engine::Main));
}

#[test]
fn panicking_terminal_recovers_on_next_request() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::new("real")
            .then_panic("transient terminal fault")
            .then_return(&[(1, 0.90)]),
        ScriptedModel::returning("real_fallback", &[(3, 0.80)]),
    );
    let pipeline = models.pipeline(CascadeSpec::default());

    assert_eq!(pipeline.run(frame()), success("homthong", 0.80, Engine::Fallback));
    assert_eq!(pipeline.run(frame()), success("namwa", 0.90, Engine::Main));
    assert_eq!(models.real.calls(), 2);
    assert_eq!(models.fallback.calls(), 1);
}

#[test]
fn undecodable_upload_runs_no_model() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::returning("real", &[(1, 0.90)]),
        ScriptedModel::returning("real_fallback", &[(1, 0.90)]),
    );
    let pipeline = models.pipeline(CascadeSpec::default());

    let outcome = pipeline.classify(b"garbage");
    assert_eq!(outcome.reason(), Some(FailureReason::InvalidImageFormat));
    assert_eq!(models.filter.calls(), 0);
    assert_eq!(models.real.calls(), 0);
    assert_eq!(models.fallback.calls(), 0);
}

#[test]
fn weak_fallback_detection_is_low_confidence() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::failing("real", "boom"),
        ScriptedModel::returning("real_fallback", &[(3, 0.30)]),
    );
    let outcome = models.pipeline(CascadeSpec::default()).run(frame());

    assert_eq!(outcome.reason(), Some(FailureReason::LowConfidence));
    assert_eq!(models.fallback.calls(), 1);
}

#[test]
fn unmapped_fallback_class_is_unknown_class_id() {
    let models = Models::new(
        banana_gate(),
        ScriptedModel::failing("real", "boom"),
        ScriptedModel::returning("real_fallback", &[(42, 0.90)]),
    );
    let outcome = models.pipeline(CascadeSpec::default()).run(frame());

    assert_eq!(outcome.reason(), Some(FailureReason::UnknownClassId));
    assert_eq!(models.fallback.calls(), 1);
}
