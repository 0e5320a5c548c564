//! Running totals of one aggregate evaluation.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::SumOp;
use crate::error::{EvalError, EvalResult};

/// Final per-token averages of an `evaluate` call.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct EvalSummary {
    pub loss: f64,
    pub accuracy: f64,
    /// Loop iterations executed.
    pub steps: usize,
    /// Time-steps consumed (`steps * record_every`).
    pub tokens: usize,
}

#[derive(Clone, Debug)]
pub struct EvalSession {
    total_loss: f64,
    total_accuracy: f64,
    step: usize,
    record_every: usize,
}

impl EvalSession {
    pub fn new(record_every: usize) -> Self {
        Self {
            total_loss: 0.0,
            total_accuracy: 0.0,
            step: 0,
            record_every,
        }
    }

    /// Add one block's sums. A missing loss means the model ignored the request.
    pub fn accumulate(&mut self, sums: &BTreeMap<SumOp, f64>) -> EvalResult<()> {
        let loss = sums.get(&SumOp::Loss).ok_or_else(|| {
            EvalError::precondition("model returned no loss for an evaluation block")
        })?;
        self.total_loss += loss;
        self.total_accuracy += sums.get(&SumOp::Accuracy).copied().unwrap_or(0.0);
        self.step += 1;
        Ok(())
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    /// Loss per loop iteration so far, as shown in progress lines.
    pub fn running_loss(&self) -> f64 {
        if self.step == 0 {
            0.0
        } else {
            self.total_loss / self.step as f64
        }
    }

    /// Normalise by `input_size * record_every`, independent of block size.
    pub fn finish(&self, input_size: usize) -> EvalSummary {
        let denom = (input_size * self.record_every).max(1) as f64;
        EvalSummary {
            loss: self.total_loss / denom,
            accuracy: self.total_accuracy / denom,
            steps: self.step,
            tokens: self.step * self.record_every,
        }
    }
}
