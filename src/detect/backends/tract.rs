#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use image::imageops::FilterType;
use image::{ImageBuffer, Rgb};
use tract_onnx::prelude::*;

use crate::detect::backend::{
    DetectionModel, InferenceError, InferenceParams, ModelLoadError, ModelLoader,
};
use crate::detect::nms::non_max_suppression;
use crate::detect::result::{BoundingBox, Detection, DetectionSet};
use crate::frame::InferenceView;

/// Letterbox padding value (114/255), matching YOLO training.
const PAD_VALUE: f32 = 114.0 / 255.0;

/// Tract-based YOLOv8 detector for ONNX exports.
///
/// Loads a local model file once; inference performs no I/O.
pub struct TractModel {
    name: String,
    plan: Mutex<TypedRunnableModel<TypedModel>>,
    input_size: u32,
}

#[derive(Clone, Copy, Debug)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    new_w: f32,
    orig_w: f32,
    orig_h: f32,
    flipped: bool,
}

impl TractModel {
    /// Load an ONNX model with a fixed `1x3xSxS` input.
    pub fn load(path: &Path, input_size: u32) -> Result<Self, ModelLoadError> {
        if !path.is_file() {
            return Err(ModelLoadError::Missing(path.to_path_buf()));
        }
        let size = input_size as usize;
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| corrupt(path, e))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .map_err(|e| corrupt(path, e))?
            .into_optimized()
            .map_err(|e| corrupt(path, e))?
            .into_runnable()
            .map_err(|e| corrupt(path, e))?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "tract".to_string());

        Ok(Self {
            name,
            plan: Mutex::new(plan),
            input_size,
        })
    }

    fn build_input(
        &self,
        image: &InferenceView<'_>,
        flip: bool,
    ) -> Result<(Tensor, Letterbox), InferenceError> {
        let (orig_w, orig_h) = (image.width(), image.height());
        let src: ImageBuffer<Rgb<u8>, &[u8]> =
            ImageBuffer::from_raw(orig_w, orig_h, image.pixels()).ok_or_else(|| {
                InferenceError::Shape(format!("pixel buffer is not {}x{} RGB8", orig_w, orig_h))
            })?;

        let size = self.input_size;
        let scale = (size as f32 / orig_w as f32).min(size as f32 / orig_h as f32);
        let new_w = ((orig_w as f32 * scale).round() as u32).clamp(1, size);
        let new_h = ((orig_h as f32 * scale).round() as u32).clamp(1, size);

        let mut resized = image::imageops::resize(&src, new_w, new_h, FilterType::Triangle);
        if flip {
            image::imageops::flip_horizontal_in_place(&mut resized);
        }

        let pad_x = (size - new_w) / 2;
        let pad_y = (size - new_h) / 2;
        let s = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, s, s), |(_, channel, y, x)| {
            let (x, y) = (x as u32, y as u32);
            if x < pad_x || y < pad_y || x >= pad_x + new_w || y >= pad_y + new_h {
                PAD_VALUE
            } else {
                resized.get_pixel(x - pad_x, y - pad_y)[channel] as f32 / 255.0
            }
        });

        Ok((
            input.into_tensor(),
            Letterbox {
                scale,
                pad_x: pad_x as f32,
                pad_y: pad_y as f32,
                new_w: new_w as f32,
                orig_w: orig_w as f32,
                orig_h: orig_h as f32,
                flipped: flip,
            },
        ))
    }

    fn run_once(
        &self,
        image: &InferenceView<'_>,
        params: &InferenceParams,
        flip: bool,
    ) -> Result<Vec<Detection>, InferenceError> {
        let (input, letterbox) = self.build_input(image, flip)?;
        let outputs = {
            let plan = self.plan.lock().unwrap_or_else(PoisonError::into_inner);
            plan.run(tvec!(input.into()))
                .map_err(|e| InferenceError::Backend(format!("{:#}", e)))?
        };
        let output = outputs
            .first()
            .ok_or_else(|| InferenceError::Shape("model produced no outputs".into()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| InferenceError::Shape(format!("output tensor was not f32: {}", e)))?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .map_err(|e| InferenceError::Shape(format!("expected 3D output: {}", e)))?;

        // [1, 4+nc, anchors] or [1, anchors, 4+nc]
        let shape = view.shape();
        let transposed = shape[1] > shape[2];
        let (features, anchors) = if transposed {
            (shape[2], shape[1])
        } else {
            (shape[1], shape[2])
        };
        if shape[0] != 1 || features < 5 {
            return Err(InferenceError::Shape(format!(
                "unexpected output shape {:?}",
                shape
            )));
        }
        let at = |anchor: usize, feature: usize| {
            if transposed {
                view[[0, anchor, feature]]
            } else {
                view[[0, feature, anchor]]
            }
        };

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_idx, score) = (4..features)
                .map(|f| (f - 4, at(anchor, f)))
                .fold((0usize, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < params.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (at(anchor, 0), at(anchor, 1), at(anchor, 2), at(anchor, 3));
            if !(cx.is_finite() && cy.is_finite() && w > 0.0 && h > 0.0) {
                continue;
            }
            let Some(bbox) = letterbox.unmap(cx, cy, w, h) else {
                continue;
            };
            candidates.push(Detection::new(class_idx as u32, score.min(1.0))?.with_box(bbox));
        }
        Ok(candidates)
    }
}

impl Letterbox {
    /// Model-space center box back to normalized source-image corners.
    fn unmap(&self, cx: f32, cy: f32, w: f32, h: f32) -> Option<BoundingBox> {
        let mut x1 = cx - w / 2.0 - self.pad_x;
        let mut x2 = cx + w / 2.0 - self.pad_x;
        if self.flipped {
            (x1, x2) = (self.new_w - x2, self.new_w - x1);
        }
        let y1 = cy - h / 2.0 - self.pad_y;
        let y2 = cy + h / 2.0 - self.pad_y;
        let bbox = BoundingBox {
            x1: (x1 / self.scale / self.orig_w).clamp(0.0, 1.0),
            y1: (y1 / self.scale / self.orig_h).clamp(0.0, 1.0),
            x2: (x2 / self.scale / self.orig_w).clamp(0.0, 1.0),
            y2: (y2 / self.scale / self.orig_h).clamp(0.0, 1.0),
        };
        (bbox.area() > 1e-8).then_some(bbox)
    }
}

impl DetectionModel for TractModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn infer(
        &self,
        image: &InferenceView<'_>,
        params: &InferenceParams,
    ) -> Result<DetectionSet, InferenceError> {
        if params.input_size != self.input_size {
            return Err(InferenceError::Shape(format!(
                "requested input size {} but model was built for {}",
                params.input_size, self.input_size
            )));
        }
        let mut candidates = self.run_once(image, params, false)?;
        if params.augment {
            candidates.extend(self.run_once(image, params, true)?);
        }
        Ok(non_max_suppression(candidates, params.iou_threshold))
    }
}

/// Loads ONNX artifacts into `TractModel`s with a fixed input size.
#[derive(Clone, Copy, Debug)]
pub struct TractLoader {
    pub input_size: u32,
}

impl Default for TractLoader {
    fn default() -> Self {
        Self {
            input_size: InferenceParams::default().input_size,
        }
    }
}

impl ModelLoader for TractLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn DetectionModel>, ModelLoadError> {
        Ok(Arc::new(TractModel::load(path, self.input_size)?))
    }
}

fn corrupt(path: &Path, err: impl std::fmt::Display) -> ModelLoadError {
    ModelLoadError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("{:#}", err),
    }
}
