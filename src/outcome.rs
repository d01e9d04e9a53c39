//! Request outcome and its wire form.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Failure taxonomy reported to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Payload could not be decoded into pixels.
    InvalidImageFormat,
    /// A gating stage found nothing.
    NoBananaDetected,
    /// The terminal stage ran cleanly but found nothing.
    BananaLikeObject,
    /// No terminal stage produced a usable detection set.
    AllModelsFailed,
    /// Best detection below the acceptance threshold.
    LowConfidence,
    /// Class id missing from the class key table.
    UnknownClassId,
    /// A required model is not available.
    ModelNotLoaded,
    /// Any other fault.
    ServerError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidImageFormat => "invalid_image_format",
            Self::NoBananaDetected => "no_banana_detected",
            Self::BananaLikeObject => "banana_like_object",
            Self::AllModelsFailed => "all_models_failed",
            Self::LowConfidence => "low_confidence",
            Self::UnknownClassId => "unknown_class_id",
            Self::ModelNotLoaded => "model_not_loaded",
            Self::ServerError => "server_error",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which terminal stage produced a successful result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    Main,
    Fallback,
}

/// Exactly one of these is produced per request.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineOutcome {
    Success {
        species_key: String,
        confidence: f32,
        engine: Engine,
    },
    Failure {
        reason: FailureReason,
        detail: Option<String>,
    },
}

impl PipelineOutcome {
    pub fn failure(reason: FailureReason) -> Self {
        Self::Failure {
            reason,
            detail: None,
        }
    }

    pub fn failure_with(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self::Failure {
            reason,
            detail: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Failure reason, if this is a failure.
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            Self::Failure { reason, .. } => Some(*reason),
            Self::Success { .. } => None,
        }
    }

    /// JSON body returned to HTTP callers. Confidence is rounded to 3 places.
    pub fn to_response(&self) -> Value {
        match self {
            Self::Success {
                species_key,
                confidence,
                engine,
            } => json!({
                "success": true,
                "banana_key": species_key,
                "confidence": round3(*confidence),
                "engine": engine,
            }),
            Self::Failure {
                reason,
                detail: Some(detail),
            } => json!({
                "success": false,
                "reason": reason,
                "detail": detail,
            }),
            Self::Failure {
                reason,
                detail: None,
            } => json!({
                "success": false,
                "reason": reason,
            }),
        }
    }
}

fn round3(value: f32) -> f64 {
    (value as f64 * 1000.0).round() / 1000.0
}
