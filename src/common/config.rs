use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::common::error::{FaceGateError, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub ai: ModelConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub enrollment: EnrollmentConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    pub connection_string: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    pub face_detection: PathBuf,
    pub face_recognition: PathBuf,
    pub anti_spoof: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognitionConfig {
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,
    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,
    #[serde(default = "default_liveness_threshold")]
    pub liveness_threshold: f32,
    #[serde(default = "default_true")]
    pub recognize_with_liveness: bool,
}

fn default_match_threshold() -> f32 { 0.30 }
fn default_detection_confidence() -> f32 { 0.6 }
fn default_liveness_threshold() -> f32 { 0.30 }
fn default_true() -> bool { true }

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
            detection_confidence: default_detection_confidence(),
            liveness_threshold: default_liveness_threshold(),
            recognize_with_liveness: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnrollmentConfig {
    #[serde(default = "default_shots_required")]
    pub shots_required: u32,
    #[serde(default = "default_enroll_timeout")]
    pub timeout_secs: u64,
}

fn default_shots_required() -> u32 { 2 }
fn default_enroll_timeout() -> u64 { 60 }

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            shots_required: default_shots_required(),
            timeout_secs: default_enroll_timeout(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

fn default_reconcile_interval() -> u64 { 30 }
fn default_query_timeout() -> u64 { 60 }

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl Config {
    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Err(FaceGateError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| FaceGateError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Resolve relative model paths against the directory holding the binary.
    pub fn resolve_model_paths(&mut self) -> Result<()> {
        let exe_dir = std::env::current_exe()?
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        for path in [
            &mut self.ai.face_detection,
            &mut self.ai.face_recognition,
            &mut self.ai.anti_spoof,
        ] {
            if path.is_relative() {
                *path = exe_dir.join(&path);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(FaceGateError::Config("Server port must be non-zero".into()));
        }
        if self.store.connection_string.is_empty() {
            return Err(FaceGateError::Config("Store connection string is empty".into()));
        }

        for (name, value) in [
            ("match_threshold", self.recognition.match_threshold),
            ("detection_confidence", self.recognition.detection_confidence),
            ("liveness_threshold", self.recognition.liveness_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FaceGateError::Config(format!(
                    "{} must be between 0.0 and 1.0, got {}",
                    name, value
                )));
            }
        }

        if self.enrollment.shots_required == 0 {
            return Err(FaceGateError::Config(
                "Enrollment must require at least one shot".into(),
            ));
        }

        Ok(())
    }
}
