//! Run configuration, loadable from a JSON file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_FLUSH_EVERY;
use crate::core::StackedRnnConfig;
use crate::error::{EvalError, EvalResult};
use crate::signals::SignalFlags;

/// Evaluator configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalSettings {
    /// Rows the model is unrolled for.
    pub batch_size: usize,

    /// Time-steps per aggregate evaluation block.
    pub record_every: usize,

    pub log_state: bool,
    pub log_input: bool,
    pub log_output: bool,
    pub log_gradients: bool,

    /// Reset recurrent state before every block instead of carrying it.
    pub refresh_state: bool,

    pub verbose: bool,
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            batch_size: 1,
            record_every: 1,
            log_state: true,
            log_input: true,
            log_output: true,
            log_gradients: false,
            refresh_state: false,
            verbose: true,
        }
    }
}

impl EvalSettings {
    pub fn signal_flags(&self) -> SignalFlags {
        SignalFlags {
            log_state: self.log_state,
            log_input: self.log_input,
            log_output: self.log_output,
            log_gradients: self.log_gradients,
        }
    }
}

/// Recorder configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    pub dataset_name: String,
    pub model_name: String,
    /// Buffered rows that trigger a store append.
    pub flush_every: usize,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            dataset_name: "default".to_string(),
            model_name: "model".to_string(),
            flush_every: DEFAULT_FLUSH_EVERY,
        }
    }
}

pub type ModelSettings = StackedRnnConfig;

/// Everything one run needs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub eval: EvalSettings,
    pub recorder: RecorderSettings,
    pub model: ModelSettings,
}

impl RunSettings {
    pub fn from_json_str(text: &str) -> EvalResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: &Path) -> EvalResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> EvalResult<()> {
        if self.eval.batch_size == 0 {
            return Err(EvalError::precondition("eval.batch_size must be positive"));
        }
        if self.eval.record_every == 0 {
            return Err(EvalError::precondition("eval.record_every must be positive"));
        }
        if self.recorder.flush_every == 0 {
            return Err(EvalError::precondition("recorder.flush_every must be positive"));
        }
        self.model.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CellKind;

    #[test]
    fn test_defaults() {
        let s = RunSettings::default();
        assert_eq!(s.eval.batch_size, 1);
        assert_eq!(s.eval.record_every, 1);
        assert!(s.eval.log_state && s.eval.log_input && s.eval.log_output);
        assert!(!s.eval.log_gradients && !s.eval.refresh_state);
        assert_eq!(s.recorder.flush_every, 100);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let s = RunSettings::from_json_str(
            r#"{
                "eval": {"batch_size": 4, "log_gradients": true},
                "recorder": {"dataset_name": "ptb"},
                "model": {"vocab_size": 50, "embedding_dim": null,
                          "layers": [{"kind": "gru", "units": 8}]}
            }"#,
        )
        .unwrap();
        assert_eq!(s.eval.batch_size, 4);
        assert_eq!(s.eval.record_every, 1);
        assert!(s.eval.signal_flags().log_gradients);
        assert_eq!(s.recorder.dataset_name, "ptb");
        assert_eq!(s.recorder.flush_every, 100);
        assert_eq!(s.model.embedding_dim, None);
        assert_eq!(s.model.layers[0].kind, CellKind::Gru);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zeros() {
        let mut s = RunSettings::default();
        s.eval.record_every = 0;
        assert!(s.validate().is_err());

        let mut s = RunSettings::default();
        s.recorder.flush_every = 0;
        assert!(s.validate().is_err());

        let mut s = RunSettings::default();
        s.model.layers[0].units = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_json_error() {
        let err = RunSettings::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, EvalError::Json(_)));
    }
}
