//! Reference recurrent cells operating on whole batches.
//!
//! ```text
//! Elman:  h' = tanh(x·W + h·U + b)
//! GRU:    z = σ(x·W_z + h·U_z + b_z)
//!         r = σ(x·W_r + h·U_r + b_r)
//!         n = tanh(x·W_n + r ⊙ (h·U_n) + b_n)
//!         h' = (1 - z) ⊙ n + z ⊙ h
//! LSTM:   [i, f, g, o] = x·W + h·U + b
//!         c' = σ(f) ⊙ c + σ(i) ⊙ tanh(g)
//!         h' = σ(o) ⊙ tanh(c')
//! ```
//!
//! Gate blocks are packed side by side along the last axis of `W`, `U` and `b`.

use ndarray::{s, Array1, Array2};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{EvalError, EvalResult};

use super::state::{LayerState, StateKind};

/// Supported cell architectures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Elman,
    Gru,
    Lstm,
}

impl CellKind {
    /// Number of packed gate blocks.
    pub fn gates(self) -> usize {
        match self {
            CellKind::Elman => 1,
            CellKind::Gru => 3,
            CellKind::Lstm => 4,
        }
    }

    pub fn state_kind(self) -> StateKind {
        match self {
            CellKind::Lstm => StateKind::Gated,
            CellKind::Elman | CellKind::Gru => StateKind::Plain,
        }
    }
}

/// Weights for one recurrent layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecurrentCell {
    pub kind: CellKind,

    /// Input projection: W ∈ R^{input_dim × gates·units}
    pub w_input: Array2<f32>,

    /// Recurrent projection: U ∈ R^{units × gates·units}
    pub w_hidden: Array2<f32>,

    /// Bias: b ∈ R^{gates·units}
    pub bias: Array1<f32>,

    pub units: usize,
}

impl RecurrentCell {
    pub fn zeros(kind: CellKind, input_dim: usize, units: usize) -> Self {
        let width = kind.gates() * units;
        Self {
            kind,
            w_input: Array2::zeros((input_dim, width)),
            w_hidden: Array2::zeros((units, width)),
            bias: Array1::zeros(width),
            units,
        }
    }

    /// Gaussian-initialised weights; LSTM forget gates start biased open.
    pub fn random(
        kind: CellKind,
        input_dim: usize,
        units: usize,
        dist: &Normal<f32>,
        rng: &mut StdRng,
    ) -> Self {
        let width = kind.gates() * units;
        let w_input = Array2::from_shape_fn((input_dim, width), |_| dist.sample(rng));
        let w_hidden = Array2::from_shape_fn((units, width), |_| dist.sample(rng));
        let mut bias = Array1::zeros(width);
        if kind == CellKind::Lstm {
            bias.slice_mut(s![units..2 * units]).fill(1.0);
        }
        Self {
            kind,
            w_input,
            w_hidden,
            bias,
            units,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.w_input.nrows()
    }

    /// Advance one time-step for the whole batch.
    ///
    /// `x` is `[batch, input_dim]`; the returned state replaces `state`.
    pub fn step(&self, x: &Array2<f32>, state: &LayerState) -> EvalResult<LayerState> {
        let u = self.units;
        match (self.kind, state) {
            (CellKind::Elman, LayerState::Plain(h)) => {
                let pre = x.dot(&self.w_input) + h.dot(&self.w_hidden) + &self.bias;
                Ok(LayerState::Plain(pre.mapv(f32::tanh)))
            }
            (CellKind::Gru, LayerState::Plain(h)) => {
                let gi = x.dot(&self.w_input) + &self.bias;
                let gh = h.dot(&self.w_hidden);
                let z = (&gi.slice(s![.., 0..u]) + &gh.slice(s![.., 0..u])).mapv(sigmoid);
                let r = (&gi.slice(s![.., u..2 * u]) + &gh.slice(s![.., u..2 * u])).mapv(sigmoid);
                let n = (&gi.slice(s![.., 2 * u..3 * u]) + &(&r * &gh.slice(s![.., 2 * u..3 * u])))
                    .mapv(f32::tanh);
                let next = &z.mapv(|v| 1.0 - v) * &n + &z * h;
                Ok(LayerState::Plain(next))
            }
            (CellKind::Lstm, LayerState::Gated { cell, hidden }) => {
                let g = x.dot(&self.w_input) + hidden.dot(&self.w_hidden) + &self.bias;
                let i = g.slice(s![.., 0..u]).mapv(sigmoid);
                let f = g.slice(s![.., u..2 * u]).mapv(sigmoid);
                let cand = g.slice(s![.., 2 * u..3 * u]).mapv(f32::tanh);
                let o = g.slice(s![.., 3 * u..4 * u]).mapv(sigmoid);
                let next_cell = &f * cell + &i * &cand;
                let next_hidden = &o * &next_cell.mapv(f32::tanh);
                Ok(LayerState::Gated {
                    cell: next_cell,
                    hidden: next_hidden,
                })
            }
            (kind, other) => Err(EvalError::precondition(format!(
                "{kind:?} cell cannot consume a {:?} state",
                other.kind()
            ))),
        }
    }

    pub fn param_count(&self) -> usize {
        self.w_input.len() + self.w_hidden.len() + self.bias.len()
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
