use serde::Serialize;

use super::backend::InferenceError;

/// Axis-aligned box, normalized to the source image (0..1), corner form.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter_w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let inter_h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.area() + other.area() - inter;
        if union > f32::EPSILON {
            inter / union
        } else {
            0.0
        }
    }
}

/// One candidate produced by a model call. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    class_id: u32,
    confidence: f32,
    bbox: Option<BoundingBox>,
}

impl Detection {
    /// Confidence must be finite and within `0.0..=1.0`.
    pub fn new(class_id: u32, confidence: f32) -> Result<Self, InferenceError> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(InferenceError::InvalidConfidence(confidence));
        }
        Ok(Self {
            class_id,
            confidence,
            bbox: None,
        })
    }

    pub fn with_box(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn bbox(&self) -> Option<&BoundingBox> {
        self.bbox.as_ref()
    }
}

/// Detections from a single model call, in model output order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionSet {
    detections: Vec<Detection>,
}

impl DetectionSet {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.detections.iter()
    }

    /// Highest confidence wins; on ties the earliest detection is kept.
    pub fn best(&self) -> Option<&Detection> {
        self.detections.iter().fold(None, |best, det| match best {
            Some(current) if current.confidence >= det.confidence => Some(current),
            _ => Some(det),
        })
    }

    /// Keep only detections at or above `threshold`, preserving order.
    pub fn retain_above(mut self, threshold: f32) -> Self {
        self.detections.retain(|d| d.confidence >= threshold);
        self
    }
}

impl From<Vec<Detection>> for DetectionSet {
    fn from(detections: Vec<Detection>) -> Self {
        Self::new(detections)
    }
}

impl IntoIterator for DetectionSet {
    type Item = Detection;
    type IntoIter = std::vec::IntoIter<Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.detections.into_iter()
    }
}
