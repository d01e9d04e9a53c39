use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::detect::backend::{DetectionModel, InferenceError, InferenceParams};
use crate::detect::result::{Detection, DetectionSet};
use crate::frame::InferenceView;

#[derive(Clone, Debug)]
enum Step {
    Detections(Vec<(u32, f32)>),
    Fail(String),
    Panic(String),
}

/// Deterministic model for tests and dry runs.
///
/// Replays a script of responses, one per `infer` call; the last step repeats
/// once the script is exhausted. Scripted scores below the call's confidence
/// threshold are dropped, as a real detector would.
pub struct ScriptedModel {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    last_params: Mutex<Option<InferenceParams>>,
}

impl ScriptedModel {
    /// A model that never detects anything.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            last_params: Mutex::new(None),
        }
    }

    /// A model that always returns `(class_id, confidence)` pairs.
    pub fn returning(name: &str, detections: &[(u32, f32)]) -> Self {
        Self::new(name).then_return(detections)
    }

    /// A model whose every call fails with a backend error.
    pub fn failing(name: &str, message: &str) -> Self {
        Self::new(name).then_fail(message)
    }

    pub fn then_return(self, detections: &[(u32, f32)]) -> Self {
        self.push(Step::Detections(detections.to_vec()))
    }

    pub fn then_fail(self, message: &str) -> Self {
        self.push(Step::Fail(message.to_string()))
    }

    /// Panic inside `infer`, to exercise unwinding paths.
    pub fn then_panic(self, message: &str) -> Self {
        self.push(Step::Panic(message.to_string()))
    }

    fn push(self, step: Step) -> Self {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(step);
        }
        self
    }

    /// Number of `infer` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Parameters of the most recent call.
    pub fn last_params(&self) -> Option<InferenceParams> {
        self.last_params.lock().ok().and_then(|p| *p)
    }

    fn next_step(&self) -> Option<Step> {
        let mut steps = self.steps.lock().unwrap_or_else(PoisonError::into_inner);
        if steps.len() > 1 {
            steps.pop_front()
        } else {
            steps.front().cloned()
        }
    }
}

impl DetectionModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn infer(
        &self,
        _image: &InferenceView<'_>,
        params: &InferenceParams,
    ) -> Result<DetectionSet, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_params.lock() {
            *last = Some(*params);
        }

        match self.next_step() {
            None => Ok(DetectionSet::empty()),
            Some(Step::Fail(message)) => Err(InferenceError::Backend(message)),
            Some(Step::Panic(message)) => panic!("{}", message),
            Some(Step::Detections(pairs)) => {
                let detections = pairs
                    .into_iter()
                    .map(|(class_id, confidence)| Detection::new(class_id, confidence))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(DetectionSet::new(detections).retain_above(params.confidence_threshold))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelBuffer;

    fn run(model: &ScriptedModel, conf: f32) -> Result<DetectionSet, InferenceError> {
        let frame = PixelBuffer::from_rgb8(vec![0; 3], 1, 1).unwrap();
        let params = InferenceParams::default().with_confidence(conf);
        model.infer(&frame.inference_view(), &params)
    }

    #[test]
    fn replays_script_then_repeats_last_step() {
        let model = ScriptedModel::failing("m", "boom").then_return(&[(1, 0.9)]);

        assert!(run(&model, 0.25).is_err());
        assert_eq!(run(&model, 0.25).unwrap().len(), 1);
        assert_eq!(run(&model, 0.25).unwrap().len(), 1);
        assert_eq!(model.calls(), 3);
    }

    #[test]
    fn applies_confidence_threshold() {
        let model = ScriptedModel::returning("m", &[(1, 0.30), (2, 0.20)]);
        let set = run(&model, 0.25).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(model.last_params().unwrap().confidence_threshold, 0.25);
    }

    #[test]
    fn out_of_range_score_is_an_inference_error() {
        let model = ScriptedModel::returning("m", &[(1, 1.5)]);
        assert_eq!(run(&model, 0.0), Err(InferenceError::InvalidConfidence(1.5)));
    }

    #[test]
    fn empty_model_detects_nothing() {
        let model = ScriptedModel::new("m");
        assert!(run(&model, 0.0).unwrap().is_empty());
    }
}
