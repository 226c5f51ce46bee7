pub mod config;
pub mod error;

pub use config::Config;
pub use error::{FaceGateError, Result};
