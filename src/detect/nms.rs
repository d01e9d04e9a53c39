//! Class-aware non-maximum suppression.

use super::result::{Detection, DetectionSet};

/// Upper bound on candidates entering NMS, to bound CPU time.
pub const MAX_NMS_INPUTS: usize = 300;

/// Suppress same-class boxes overlapping a stronger one by more than
/// `iou_threshold`. Detections without a box are never suppressed.
///
/// Output is sorted by descending confidence (stable on ties).
pub fn non_max_suppression(candidates: Vec<Detection>, iou_threshold: f32) -> DetectionSet {
    let mut candidates = candidates;
    candidates.sort_by(|a, b| b.confidence().total_cmp(&a.confidence()));
    if candidates.len() > MAX_NMS_INPUTS {
        log::warn!(
            "nms input truncated from {} to {} candidates",
            candidates.len(),
            MAX_NMS_INPUTS
        );
        candidates.truncate(MAX_NMS_INPUTS);
    }

    let mut suppressed = vec![false; candidates.len()];
    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        let Some(box_a) = candidates[i].bbox().copied() else {
            continue;
        };
        for j in (i + 1)..candidates.len() {
            if suppressed[j] || candidates[j].class_id() != candidates[i].class_id() {
                continue;
            }
            if let Some(box_b) = candidates[j].bbox() {
                if box_a.iou(box_b) > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }
    }

    candidates
        .into_iter()
        .zip(suppressed)
        .filter_map(|(det, gone)| (!gone).then_some(det))
        .collect::<Vec<_>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;

    fn boxed(class_id: u32, confidence: f32, b: [f32; 4]) -> Detection {
        Detection::new(class_id, confidence).unwrap().with_box(BoundingBox {
            x1: b[0],
            y1: b[1],
            x2: b[2],
            y2: b[3],
        })
    }

    #[test]
    fn empty_input() {
        assert!(non_max_suppression(vec![], 0.5).is_empty());
    }

    #[test]
    fn overlapping_same_class_keeps_strongest() {
        let out = non_max_suppression(
            vec![
                boxed(0, 0.8, [0.12, 0.12, 0.52, 0.52]),
                boxed(0, 0.9, [0.1, 0.1, 0.5, 0.5]),
            ],
            0.5,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out.best().unwrap().confidence(), 0.9);
    }

    #[test]
    fn overlapping_different_classes_survive() {
        let out = non_max_suppression(
            vec![
                boxed(0, 0.9, [0.1, 0.1, 0.5, 0.5]),
                boxed(1, 0.8, [0.1, 0.1, 0.5, 0.5]),
            ],
            0.5,
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn disjoint_boxes_survive() {
        let out = non_max_suppression(
            vec![
                boxed(0, 0.9, [0.0, 0.0, 0.2, 0.2]),
                boxed(0, 0.8, [0.8, 0.8, 1.0, 1.0]),
            ],
            0.5,
        );
        assert_eq!(out.len(), 2);
    }
}
