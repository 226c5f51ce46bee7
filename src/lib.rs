pub mod common;
pub mod core;
pub mod gallery;
pub mod protocol;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use common::{Config, FaceGateError, Result};
pub use crate::core::{
    cosine_similarity, Inference, LivenessReading, MatchResult, OnnxInference, RecognitionEngine,
};
pub use gallery::{Gallery, UserInfo};
pub use service::{
    EnrollmentController, Reconciler, Router, Server, SessionHandle, SessionRegistry, SessionRole,
};
pub use store::{MemoryRepository, Repository, SqlRepository};
