use std::path::Path;
use std::sync::Arc;

use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};

use crate::common::error::{FaceGateError, Result};

/// Detector input resolution; dictated by the model export.
const INPUT_SIZE: u32 = 640;

const IOU_THRESHOLD: f32 = 0.45;

#[derive(Debug, Clone)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    /// Clamp the box to image bounds.
    pub fn clamped(&self, width: u32, height: u32) -> FaceBox {
        FaceBox {
            x1: self.x1.max(0.0).min(width as f32),
            y1: self.y1.max(0.0).min(height as f32),
            x2: self.x2.max(0.0).min(width as f32),
            y2: self.y2.max(0.0).min(height as f32),
            confidence: self.confidence,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Context box centered on this one, side lengths scaled by `factor`.
    pub fn scaled(&self, factor: f32) -> FaceBox {
        let cx = (self.x1 + self.x2) / 2.0;
        let cy = (self.y1 + self.y2) / 2.0;
        let half_w = self.width() * factor / 2.0;
        let half_h = self.height() * factor / 2.0;
        FaceBox {
            x1: cx - half_w,
            y1: cy - half_h,
            x2: cx + half_w,
            y2: cy + half_h,
            confidence: self.confidence,
        }
    }
}

pub struct FaceDetector {
    session: Session,
    _environment: Arc<Environment>,
}

impl FaceDetector {
    pub fn new(model_path: &Path) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_detector")
                .build()
                .map_err(|e| FaceGateError::Model(format!("Failed to create environment: {}", e)))?,
        );

        if !model_path.exists() {
            return Err(FaceGateError::Model(format!(
                "Detector model not found at: {:?}",
                model_path
            )));
        }

        let session = SessionBuilder::new(&environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_model_from_file(model_path)?;

        Ok(Self {
            session,
            _environment: environment,
        })
    }

    /// Run the detector and return candidate boxes in original-image
    /// coordinates, sorted by descending confidence.
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;

        let resized = image.resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::Nearest);
        let img_array = image_to_array(&resized);

        let cow_array = CowArray::from(img_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;
        let outputs = self.session.run(vec![input_tensor])?;

        let mut faces = parse_detections(&outputs)?;

        // Scale coordinates back to original image dimensions
        let scale_x = orig_width / INPUT_SIZE as f32;
        let scale_y = orig_height / INPUT_SIZE as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        Ok(faces)
    }
}

fn image_to_array(img: &DynamicImage) -> Array4<f32> {
    let rgb = img.to_rgb8();
    let width = rgb.width() as usize;
    let height = rgb.height() as usize;
    let mut array = Array4::<f32>::zeros((1, 3, height, width));

    let norm_factor = 1.0 / 255.0;
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        array[[0, 0, y, x]] = pixel[0] as f32 * norm_factor;
        array[[0, 1, y, x]] = pixel[1] as f32 * norm_factor;
        array[[0, 2, y, x]] = pixel[2] as f32 * norm_factor;
    }

    array
}

fn parse_detections(outputs: &[Value]) -> Result<Vec<FaceBox>> {
    let mut faces = Vec::new();

    // YOLO-family output: [1, 8400, 4 + scores] or transposed [1, 4 + scores, 8400]
    if let Some(output) = outputs.first() {
        let output = output.try_extract::<f32>()?.view().to_owned();
        let shape = output.shape().to_vec();
        let Some(output_array) = output.as_slice() else {
            return Ok(faces);
        };

        let (num_predictions, prediction_length, is_transposed) = if shape.len() >= 3 {
            if shape[2] > shape[1] && shape[1] <= 10 {
                (shape[2], shape[1], true)
            } else {
                (shape[1], shape[2], false)
            }
        } else if shape.len() == 2 {
            (shape[0], shape[1], false)
        } else {
            tracing::warn!("Unexpected detector output shape: {:?}", shape);
            return Ok(faces);
        };

        for i in 0..num_predictions {
            let (x_center_raw, y_center_raw, width_raw, height_raw, confidence) = if is_transposed {
                let stride = num_predictions;
                (
                    output_array[i],
                    output_array[stride + i],
                    output_array[2 * stride + i],
                    output_array[3 * stride + i],
                    if prediction_length > 4 {
                        output_array[4 * stride + i]
                    } else {
                        0.0
                    },
                )
            } else {
                let base_idx = i * prediction_length;
                (
                    output_array[base_idx],
                    output_array[base_idx + 1],
                    output_array[base_idx + 2],
                    output_array[base_idx + 3],
                    if prediction_length > 4 {
                        output_array[base_idx + 4]
                    } else {
                        0.0
                    },
                )
            };

            // Normalized exports need scaling into pixel space
            let scale_factor = if x_center_raw > 1.0
                || y_center_raw > 1.0
                || width_raw > 1.0
                || height_raw > 1.0
            {
                1.0
            } else {
                INPUT_SIZE as f32
            };

            let x_center = x_center_raw * scale_factor;
            let y_center = y_center_raw * scale_factor;
            let width = width_raw * scale_factor;
            let height = height_raw * scale_factor;

            if confidence > 0.001 {
                let x1 = (x_center - width / 2.0).max(0.0);
                let y1 = (y_center - height / 2.0).max(0.0);
                let x2 = (x_center + width / 2.0).min(INPUT_SIZE as f32);
                let y2 = (y_center + height / 2.0).min(INPUT_SIZE as f32);

                if x2 > x1 && y2 > y1 && (x2 - x1) > 10.0 && (y2 - y1) > 10.0 {
                    faces.push(FaceBox {
                        x1,
                        y1,
                        x2,
                        y2,
                        confidence,
                    });
                }
            }
        }
    }

    faces = apply_nms(faces, IOU_THRESHOLD);
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    faces.truncate(5);

    Ok(faces)
}

fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    if boxes.is_empty() {
        return boxes;
    }

    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep = Vec::new();
    let mut indices: Vec<usize> = (0..boxes.len()).collect();

    while !indices.is_empty() {
        let i = indices[0];
        keep.push(boxes[i].clone());

        indices = indices[1..]
            .iter()
            .filter(|&&j| calculate_iou(&boxes[i], &boxes[j]) < iou_threshold)
            .copied()
            .collect();
    }

    keep
}

fn calculate_iou(box1: &FaceBox, box2: &FaceBox) -> f32 {
    let x1 = box1.x1.max(box2.x1);
    let y1 = box1.y1.max(box2.y1);
    let x2 = box1.x2.min(box2.x2);
    let y2 = box1.y2.min(box2.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = box1.area() + box2.area() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamped_box_stays_inside_image() {
        let face = FaceBox {
            x1: -10.0,
            y1: 5.0,
            x2: 700.0,
            y2: 300.0,
            confidence: 0.9,
        };
        let clamped = face.clamped(640, 480);
        assert_eq!(clamped.x1, 0.0);
        assert_eq!(clamped.x2, 640.0);
        assert_eq!(clamped.y2, 300.0);
        assert!(clamped.area() > 0.0);
    }

    #[test]
    fn scaled_box_keeps_center() {
        let face = FaceBox {
            x1: 100.0,
            y1: 100.0,
            x2: 200.0,
            y2: 200.0,
            confidence: 1.0,
        };
        let context = face.scaled(2.7);
        assert!((context.x1 - (150.0 - 135.0)).abs() < 1e-3);
        assert!((context.x2 - (150.0 + 135.0)).abs() < 1e-3);
        assert!((context.width() - 270.0).abs() < 1e-3);
    }

    #[test]
    fn nms_drops_overlapping_boxes() {
        let boxes = vec![
            FaceBox { x1: 0.0, y1: 0.0, x2: 100.0, y2: 100.0, confidence: 0.9 },
            FaceBox { x1: 5.0, y1: 5.0, x2: 105.0, y2: 105.0, confidence: 0.8 },
            FaceBox { x1: 300.0, y1: 300.0, x2: 400.0, y2: 400.0, confidence: 0.7 },
        ];
        let kept = apply_nms(boxes, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
    }
}
