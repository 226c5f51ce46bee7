use std::path::Path;
use std::sync::Arc;

use image::DynamicImage;
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};

use crate::common::error::{FaceGateError, Result};

/// Anti-spoof input resolution; dictated by the model export.
pub const INPUT_SIZE: u32 = 112;

/// Index of the "real face" class in the network output.
pub const REAL_CLASS_INDEX: usize = 1;

pub struct AntiSpoof {
    session: Session,
    _environment: Arc<Environment>,
}

impl AntiSpoof {
    pub fn new(model_path: &Path) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("anti_spoof")
                .build()
                .map_err(|e| FaceGateError::Model(format!("Failed to create environment: {}", e)))?,
        );

        if !model_path.exists() {
            return Err(FaceGateError::Model(format!(
                "Anti-spoof model not found at: {:?}",
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

    /// Raw class scores for a context crop already resized to
    /// `INPUT_SIZE`×`INPUT_SIZE`. Callers softmax the result.
    pub fn scores(&self, crop: &DynamicImage) -> Result<Vec<f32>> {
        let input_array = preprocess_crop(crop);
        let cow_array = CowArray::from(input_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;

        let outputs = self.session.run(vec![input_tensor])?;
        let scores = outputs[0].try_extract::<f32>()?.view().to_owned().into_raw_vec();
        Ok(scores)
    }
}

fn preprocess_crop(img: &DynamicImage) -> Array4<f32> {
    // [0,1] range with RGB→BGR channel swap, as the network was trained
    let rgb = img.to_rgb8();
    let size = INPUT_SIZE as usize;
    let mut array = Array4::<f32>::zeros((1, 3, size, size));

    let norm_factor = 1.0 / 255.0;
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x < size && y < size {
            for c in 0..3 {
                array[[0, 2 - c, y, x]] = pixel[c] as f32 * norm_factor;
            }
        }
    }

    array
}

pub fn softmax(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
