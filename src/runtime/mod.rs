//! Runtime module: run configuration for the driver binary.

pub mod settings;

pub use settings::{EvalSettings, ModelSettings, RecorderSettings, RunSettings};
