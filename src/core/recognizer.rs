use std::path::Path;
use std::sync::Arc;

use image::DynamicImage;
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};

use crate::common::error::{FaceGateError, Result};

pub type Embedding = Vec<f32>;

/// Recognizer input resolution; dictated by the model export.
pub const INPUT_SIZE: u32 = 112;

pub struct FaceRecognizer {
    session: Session,
    _environment: Arc<Environment>,
}

impl FaceRecognizer {
    pub fn new(model_path: &Path) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_recognizer")
                .build()
                .map_err(|e| FaceGateError::Model(format!("Failed to create environment: {}", e)))?,
        );

        if !model_path.exists() {
            return Err(FaceGateError::Model(format!(
                "Recognition model not found at: {:?}",
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

    /// Run the embedding network on a face crop already resized to
    /// `INPUT_SIZE`×`INPUT_SIZE`. The output is not normalized here.
    pub fn embed(&self, face: &DynamicImage) -> Result<Embedding> {
        let input_array = preprocess_face(face);
        let cow_array = CowArray::from(input_array.into_dyn());
        let input_tensor = Value::from_array(self.session.allocator(), &cow_array)?;

        let outputs = self.session.run(vec![input_tensor])?;
        let embedding = outputs[0].try_extract::<f32>()?.view().to_owned().into_raw_vec();
        Ok(embedding)
    }
}

fn preprocess_face(img: &DynamicImage) -> Array4<f32> {
    // ArcFace normalization: (x - 127.5) / 128
    let rgb = img.to_rgb8();
    let size = INPUT_SIZE as usize;
    let mut array = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x < size && y < size {
            for c in 0..3 {
                array[[0, c, y, x]] = (pixel[c] as f32 - 127.5) / 128.0;
            }
        }
    }

    array
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in v.iter_mut() {
            *value /= norm;
        }
    }
}
