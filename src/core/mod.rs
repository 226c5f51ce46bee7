pub mod detector;
pub mod engine;
pub mod liveness;
pub mod recognizer;

pub use detector::{FaceBox, FaceDetector};
pub use engine::{Inference, LivenessReading, MatchResult, OnnxInference, RecognitionEngine};
pub use recognizer::{cosine_similarity, Embedding, FaceRecognizer};
