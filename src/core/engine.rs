use std::sync::Mutex as StdMutex;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{imageops::FilterType, DynamicImage};
use tokio::sync::Mutex;

use crate::common::config::{ModelConfig, RecognitionConfig};
use crate::common::error::Result;
use crate::core::detector::{FaceBox, FaceDetector};
use crate::core::liveness::{self, softmax, AntiSpoof};
use crate::core::recognizer::{self, l2_normalize, Embedding, FaceRecognizer};
use crate::gallery::Gallery;

/// Context-box scale applied around the face before the anti-spoof network.
const LIVENESS_CONTEXT_SCALE: f32 = 2.7;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    pub enroll_id: i64,
    pub score: f32,
}

impl MatchResult {
    pub fn no_match() -> Self {
        Self {
            matched: false,
            enroll_id: 0,
            score: 0.0,
        }
    }
}

/// Latest anti-spoof evaluation, published for operator telemetry.
#[derive(Debug, Clone, Copy)]
pub struct LivenessReading {
    pub score: f32,
    pub probability: f32,
    pub elapsed_ms: u64,
}

/// Seam around the neural networks. The three forward passes keep internal
/// state between input binding and execution, so every implementation is
/// driven under the engine's single-flight gate.
pub trait Inference: Send {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>>;
    fn spoof_scores(&self, crop: &DynamicImage) -> Result<Vec<f32>>;
    fn embed(&self, face: &DynamicImage) -> Result<Embedding>;
}

/// Production backend bundling the three ONNX sessions.
pub struct OnnxInference {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    anti_spoof: AntiSpoof,
}

impl OnnxInference {
    pub fn load(models: &ModelConfig) -> Result<Self> {
        Ok(Self {
            detector: FaceDetector::new(&models.face_detection)?,
            recognizer: FaceRecognizer::new(&models.face_recognition)?,
            anti_spoof: AntiSpoof::new(&models.anti_spoof)?,
        })
    }
}

impl Inference for OnnxInference {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        self.detector.detect(image)
    }

    fn spoof_scores(&self, crop: &DynamicImage) -> Result<Vec<f32>> {
        self.anti_spoof.scores(crop)
    }

    fn embed(&self, face: &DynamicImage) -> Result<Embedding> {
        self.recognizer.embed(face)
    }
}

pub struct RecognitionEngine {
    // Single-flight gate: the networks are not re-entrant, so every
    // detect/liveness/embed run is serialized here. Input decoding happens
    // before the gate is taken.
    inference: Mutex<Box<dyn Inference>>,
    recognition: RecognitionConfig,
    last_liveness: StdMutex<Option<LivenessReading>>,
}

impl RecognitionEngine {
    pub fn new(inference: Box<dyn Inference>, recognition: RecognitionConfig) -> Self {
        Self {
            inference: Mutex::new(inference),
            recognition,
            last_liveness: StdMutex::new(None),
        }
    }

    pub fn recognize_with_liveness(&self) -> bool {
        self.recognition.recognize_with_liveness
    }

    /// Latest anti-spoof evaluation, if any scan has run one.
    pub fn latest_liveness(&self) -> Option<LivenessReading> {
        self.last_liveness.lock().ok().and_then(|slot| *slot)
    }

    /// Decode a transport-encoded image and produce its embedding. Every
    /// pipeline rejection reduces to `None`; callers treat that as a
    /// non-match.
    pub async fn embed_bytes(&self, image_b64: &str, check_liveness: bool) -> Option<Embedding> {
        let image = decode_image(image_b64)?;

        let inference = self.inference.lock().await;
        match self.run_pipeline(inference.as_ref(), &image, check_liveness) {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::debug!("inference pipeline failed: {}", e);
                None
            }
        }
    }

    /// Embed the probe and scan the gallery for the nearest neighbor.
    pub async fn match_bytes(&self, gallery: &Gallery, image_b64: &str) -> MatchResult {
        let check_liveness = self.recognition.recognize_with_liveness;
        let Some(probe) = self.embed_bytes(image_b64, check_liveness).await else {
            return MatchResult::no_match();
        };

        match gallery.best_match(&probe).await {
            Some((enroll_id, score)) => {
                tracing::debug!(enroll_id, score, "best match");
                MatchResult {
                    matched: score > self.recognition.match_threshold,
                    enroll_id,
                    score,
                }
            }
            None => MatchResult::no_match(),
        }
    }

    fn run_pipeline(
        &self,
        inference: &dyn Inference,
        image: &DynamicImage,
        check_liveness: bool,
    ) -> Result<Option<Embedding>> {
        let (width, height) = (image.width(), image.height());

        let candidates = inference.detect(image)?;
        let Some(best) = candidates
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        else {
            tracing::debug!("no face detected");
            return Ok(None);
        };

        if best.confidence < self.recognition.detection_confidence {
            tracing::debug!(confidence = best.confidence, "detection below confidence floor");
            return Ok(None);
        }

        let face = best.clamped(width, height);
        if face.area() <= 0.0 {
            tracing::debug!("face box clamped to zero area");
            return Ok(None);
        }

        if check_liveness {
            let context = face.scaled(LIVENESS_CONTEXT_SCALE).clamped(width, height);
            let crop = crop_resize(image, &context, liveness::INPUT_SIZE);

            let started = Instant::now();
            let scores = inference.spoof_scores(&crop)?;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let probs = softmax(&scores);
            let score = scores.get(liveness::REAL_CLASS_INDEX).copied().unwrap_or(0.0);
            let probability = probs.get(liveness::REAL_CLASS_INDEX).copied().unwrap_or(0.0);

            self.publish_liveness(LivenessReading {
                score,
                probability,
                elapsed_ms,
            });

            if probability < self.recognition.liveness_threshold {
                tracing::debug!(probability, "liveness check rejected probe");
                return Ok(None);
            }
        }

        let crop = crop_resize(image, &face, recognizer::INPUT_SIZE);
        let mut embedding = inference.embed(&crop)?;
        l2_normalize(&mut embedding);
        Ok(Some(embedding))
    }

    fn publish_liveness(&self, reading: LivenessReading) {
        if let Ok(mut slot) = self.last_liveness.lock() {
            *slot = Some(reading);
        }
    }
}

fn decode_image(image_b64: &str) -> Option<DynamicImage> {
    let bytes = match STANDARD.decode(image_b64.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("image base64 decode failed: {}", e);
            return None;
        }
    };

    let image = match image::load_from_memory(&bytes) {
        Ok(image) => image,
        Err(e) => {
            tracing::debug!("image decode failed: {}", e);
            return None;
        }
    };

    if image.width() == 0 || image.height() == 0 {
        return None;
    }
    Some(image)
}

fn crop_resize(image: &DynamicImage, region: &FaceBox, size: u32) -> DynamicImage {
    let x = region.x1.max(0.0) as u32;
    let y = region.y1.max(0.0) as u32;
    let width = region.width().max(1.0) as u32;
    let height = region.height().max(1.0) as u32;

    image
        .crop_imm(x, y, width, height)
        .resize_exact(size, size, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct StubInference {
        boxes: Vec<FaceBox>,
        spoof: Vec<f32>,
        embedding: Embedding,
    }

    impl Inference for StubInference {
        fn detect(&self, _image: &DynamicImage) -> Result<Vec<FaceBox>> {
            Ok(self.boxes.clone())
        }

        fn spoof_scores(&self, _crop: &DynamicImage) -> Result<Vec<f32>> {
            Ok(self.spoof.clone())
        }

        fn embed(&self, _face: &DynamicImage) -> Result<Embedding> {
            Ok(self.embedding.clone())
        }
    }

    fn test_image_b64() -> String {
        let image = DynamicImage::new_rgb8(64, 64);
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
            .unwrap();
        STANDARD.encode(&bytes)
    }

    fn face_box(confidence: f32) -> FaceBox {
        FaceBox {
            x1: 8.0,
            y1: 8.0,
            x2: 56.0,
            y2: 56.0,
            confidence,
        }
    }

    fn engine(stub: StubInference) -> RecognitionEngine {
        RecognitionEngine::new(Box::new(stub), RecognitionConfig::default())
    }

    #[tokio::test]
    async fn rejects_garbage_bytes() {
        let engine = engine(StubInference {
            boxes: vec![face_box(0.99)],
            spoof: vec![0.0, 5.0],
            embedding: vec![1.0, 0.0],
        });
        assert!(engine.embed_bytes("not-base64!!!", false).await.is_none());
    }

    #[tokio::test]
    async fn rejects_when_no_face_found() {
        let engine = engine(StubInference {
            boxes: vec![],
            spoof: vec![0.0, 5.0],
            embedding: vec![1.0, 0.0],
        });
        assert!(engine.embed_bytes(&test_image_b64(), false).await.is_none());
    }

    #[tokio::test]
    async fn rejects_low_confidence_detection() {
        let engine = engine(StubInference {
            boxes: vec![face_box(0.4)],
            spoof: vec![0.0, 5.0],
            embedding: vec![1.0, 0.0],
        });
        assert!(engine.embed_bytes(&test_image_b64(), false).await.is_none());
    }

    #[tokio::test]
    async fn liveness_rejection_still_publishes_reading() {
        let engine = engine(StubInference {
            boxes: vec![face_box(0.99)],
            // Spoof class wins: "real" probability well below 0.30
            spoof: vec![5.0, 0.0],
            embedding: vec![1.0, 0.0],
        });

        assert!(engine.embed_bytes(&test_image_b64(), true).await.is_none());

        let reading = engine.latest_liveness().unwrap();
        assert!(reading.probability < 0.30);
    }

    #[tokio::test]
    async fn returns_normalized_embedding() {
        let engine = engine(StubInference {
            boxes: vec![face_box(0.99)],
            spoof: vec![0.0, 5.0],
            embedding: vec![3.0, 4.0],
        });

        let embedding = engine.embed_bytes(&test_image_b64(), true).await.unwrap();
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        let reading = engine.latest_liveness().unwrap();
        assert!(reading.probability > 0.9);
    }
}
