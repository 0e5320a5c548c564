//! Per-layer recurrent state.
//!
//! Plain cells (Elman, GRU) carry a single hidden tensor; gated cells (LSTM)
//! carry a `{cell, hidden}` pair.  Every tensor is batch-major:
//! `[batch_size, units]`.  Which variant a layer holds is fixed by the
//! architecture when the model is built.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Shape of a layer's state, known before any step runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateKind {
    Plain,
    Gated,
}

/// Recurrent state for a single layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LayerState {
    /// Single hidden tensor `[batch, units]`.
    Plain(Array2<f32>),
    /// Memory cell and hidden output, both `[batch, units]`.
    Gated {
        cell: Array2<f32>,
        hidden: Array2<f32>,
    },
}

impl LayerState {
    /// Zero-initialised state of the given kind.
    pub fn zeros(kind: StateKind, batch_size: usize, units: usize) -> Self {
        match kind {
            StateKind::Plain => LayerState::Plain(Array2::zeros((batch_size, units))),
            StateKind::Gated => LayerState::Gated {
                cell: Array2::zeros((batch_size, units)),
                hidden: Array2::zeros((batch_size, units)),
            },
        }
    }

    pub fn kind(&self) -> StateKind {
        match self {
            LayerState::Plain(_) => StateKind::Plain,
            LayerState::Gated { .. } => StateKind::Gated,
        }
    }

    /// The tensor the next layer consumes.
    pub fn hidden(&self) -> &Array2<f32> {
        match self {
            LayerState::Plain(h) => h,
            LayerState::Gated { hidden, .. } => hidden,
        }
    }

    /// Reset to zeros in place.
    pub fn reset(&mut self) {
        match self {
            LayerState::Plain(h) => h.fill(0.0),
            LayerState::Gated { cell, hidden } => {
                cell.fill(0.0);
                hidden.fill(0.0);
            }
        }
    }

    /// Check if the state has diverged (NaN or Inf).
    pub fn is_healthy(&self) -> bool {
        match self {
            LayerState::Plain(h) => h.iter().all(|v| v.is_finite()),
            LayerState::Gated { cell, hidden } => cell
                .iter()
                .chain(hidden.iter())
                .all(|v| v.is_finite()),
        }
    }

    /// L2 norm of the hidden tensor (for monitoring divergence).
    pub fn norm(&self) -> f32 {
        self.hidden().mapv(|v| v * v).sum().sqrt()
    }
}

/// States for every layer of a stacked model, bottom layer first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateBank {
    pub layers: Vec<LayerState>,
}

impl StateBank {
    pub fn new(kinds: &[(StateKind, usize)], batch_size: usize) -> Self {
        Self {
            layers: kinds
                .iter()
                .map(|&(kind, units)| LayerState::zeros(kind, batch_size, units))
                .collect(),
        }
    }

    pub fn reset_all(&mut self) {
        for s in &mut self.layers {
            s.reset();
        }
    }

    pub fn all_healthy(&self) -> bool {
        self.layers.iter().all(|s| s.is_healthy())
    }

    pub fn kinds(&self) -> Vec<StateKind> {
        self.layers.iter().map(LayerState::kind).collect()
    }
}
