//! Stacked recurrent language model, a concrete [`UnrolledModel`].
//!
//! ```text
//! x_t  = E[id_t]              (or one-hot(id_t) without an embedding table)
//! h¹_t = cell₁(x_t,  h¹_{t-1})
//! hᴸ_t = cell_L(hᴸ⁻¹_t, hᴸ_{t-1})
//! p_t  = softmax(hᴸ_t · W_out + b_out)
//! ```
//!
//! Loss is cross-entropy against the target id, accuracy is top-1 agreement;
//! both are averaged over the batch and summed over the block's time-steps.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::config::FD_EPSILON;
use crate::error::{EvalError, EvalResult};
use crate::signals::SignalCollector;

use super::cell::{CellKind, RecurrentCell};
use super::gradient;
use super::model::{RunOutput, StepTrace, SumOp, UnrolledModel};
use super::state::{LayerState, StateBank, StateKind};

/// One recurrent layer of the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub kind: CellKind,
    pub units: usize,
}

/// Architecture and initialisation of a [`StackedRnn`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackedRnnConfig {
    pub vocab_size: usize,

    /// Embedding width; `None` feeds one-hot token vectors.
    pub embedding_dim: Option<usize>,

    pub layers: Vec<LayerSpec>,

    /// Seed for weight initialisation.
    pub seed: u64,

    /// Standard deviation of the Gaussian weight initialiser.
    pub init_std: f32,
}

impl Default for StackedRnnConfig {
    fn default() -> Self {
        Self {
            vocab_size: 1000,
            embedding_dim: Some(64),
            layers: vec![
                LayerSpec {
                    kind: CellKind::Lstm,
                    units: 128,
                },
                LayerSpec {
                    kind: CellKind::Lstm,
                    units: 128,
                },
            ],
            seed: 0,
            init_std: 0.1,
        }
    }
}

impl StackedRnnConfig {
    pub fn validate(&self) -> EvalResult<()> {
        if self.vocab_size == 0 {
            return Err(EvalError::precondition("vocab_size must be positive"));
        }
        if self.embedding_dim == Some(0) {
            return Err(EvalError::precondition("embedding_dim must be positive"));
        }
        if self.layers.is_empty() {
            return Err(EvalError::precondition("model needs at least one layer"));
        }
        if let Some(i) = self.layers.iter().position(|l| l.units == 0) {
            return Err(EvalError::precondition(format!("layer {i} has zero units")));
        }
        if !(self.init_std.is_finite() && self.init_std > 0.0) {
            return Err(EvalError::precondition("init_std must be positive"));
        }
        Ok(())
    }

    pub fn input_dim(&self) -> usize {
        self.embedding_dim.unwrap_or(self.vocab_size)
    }
}

/// Trained parameters; this is what a checkpoint holds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RnnWeights {
    /// Token embedding: [vocab_size, embedding_dim]
    pub embedding: Option<Array2<f32>>,

    /// Recurrent layers, bottom first.
    pub cells: Vec<RecurrentCell>,

    /// Output projection: W_out ∈ R^{top_units × vocab_size}
    pub w_out: Array2<f32>,

    /// Output bias: b_out ∈ R^{vocab_size}
    pub b_out: Array1<f32>,
}

impl RnnWeights {
    /// Gaussian-initialised weights from a seeded generator.
    pub fn random(config: &StackedRnnConfig) -> EvalResult<Self> {
        config.validate()?;
        let dist = Normal::new(0.0f32, config.init_std)
            .map_err(|e| EvalError::precondition(format!("invalid init_std: {e}")))?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let embedding = config.embedding_dim.map(|dim| {
            Array2::from_shape_fn((config.vocab_size, dim), |_| {
                rand_distr::Distribution::sample(&dist, &mut rng)
            })
        });

        let mut input_dim = config.input_dim();
        let mut cells = Vec::with_capacity(config.layers.len());
        for layer in &config.layers {
            cells.push(RecurrentCell::random(
                layer.kind, input_dim, layer.units, &dist, &mut rng,
            ));
            input_dim = layer.units;
        }

        let w_out = Array2::from_shape_fn((input_dim, config.vocab_size), |_| {
            rand_distr::Distribution::sample(&dist, &mut rng)
        });
        Ok(Self {
            embedding,
            cells,
            w_out,
            b_out: Array1::zeros(config.vocab_size),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.b_out.len()
    }

    /// Check that layer widths chain together.
    pub fn validate(&self) -> EvalResult<()> {
        let Some(first) = self.cells.first() else {
            return Err(EvalError::precondition("weights contain no layers"));
        };
        let expected_input = match &self.embedding {
            Some(e) => {
                if e.nrows() != self.vocab_size() {
                    return Err(EvalError::precondition("embedding rows differ from vocab size"));
                }
                e.ncols()
            }
            None => self.vocab_size(),
        };
        if first.input_dim() != expected_input {
            return Err(EvalError::precondition(format!(
                "first layer expects {} inputs, embedding provides {expected_input}",
                first.input_dim()
            )));
        }
        for (i, pair) in self.cells.windows(2).enumerate() {
            if pair[1].input_dim() != pair[0].units {
                return Err(EvalError::precondition(format!(
                    "layer {} expects {} inputs, layer {i} emits {}",
                    i + 1,
                    pair[1].input_dim(),
                    pair[0].units
                )));
            }
        }
        let top = self.cells[self.cells.len() - 1].units;
        if self.w_out.dim() != (top, self.vocab_size()) {
            return Err(EvalError::precondition("output projection shape mismatch"));
        }
        Ok(())
    }

    pub fn param_count(&self) -> usize {
        self.embedding.as_ref().map_or(0, |e| e.len())
            + self.cells.iter().map(RecurrentCell::param_count).sum::<usize>()
            + self.w_out.len()
            + self.b_out.len()
    }
}

/// A stacked RNN unrolled for a fixed batch size, carrying state across calls.
pub struct StackedRnn {
    weights: RnnWeights,
    batch_size: usize,
    state: StateBank,
    steps_seen: u64,
}

impl StackedRnn {
    /// Random-initialised model.
    pub fn new(config: &StackedRnnConfig, batch_size: usize) -> EvalResult<Self> {
        Self::from_weights(RnnWeights::random(config)?, batch_size)
    }

    pub fn from_weights(weights: RnnWeights, batch_size: usize) -> EvalResult<Self> {
        if batch_size == 0 {
            return Err(EvalError::precondition("batch_size must be positive"));
        }
        weights.validate()?;
        let layout: Vec<(StateKind, usize)> = weights
            .cells
            .iter()
            .map(|c| (c.kind.state_kind(), c.units))
            .collect();
        Ok(Self {
            state: StateBank::new(&layout, batch_size),
            weights,
            batch_size,
            steps_seen: 0,
        })
    }

    /// Load weights from a bincode checkpoint.
    pub fn load(path: &Path, batch_size: usize) -> EvalResult<Self> {
        let bytes = std::fs::read(path)?;
        let weights: RnnWeights = bincode::deserialize(&bytes)?;
        Self::from_weights(weights, batch_size)
    }

    /// Write the weights as a bincode checkpoint.
    pub fn save(&self, path: &Path) -> EvalResult<()> {
        let bytes = bincode::serialize(&self.weights)?;
        crate::io::files::write_to_file(&bytes, path, crate::io::files::WriteMode::Overwrite)?;
        Ok(())
    }

    pub fn weights(&self) -> &RnnWeights {
        &self.weights
    }

    pub fn state(&self) -> &StateBank {
        &self.state
    }

    /// Map one column of token ids to input vectors `[batch, input_dim]`.
    fn input_vectors(&self, ids: ArrayView1<u32>) -> EvalResult<Array2<f32>> {
        let vocab = self.weights.vocab_size();
        if let Some(&bad) = ids.iter().find(|&&id| id as usize >= vocab) {
            return Err(EvalError::precondition(format!(
                "token id {bad} outside vocabulary of {vocab}"
            )));
        }
        Ok(match &self.weights.embedding {
            Some(table) => {
                let rows: Vec<usize> = ids.iter().map(|&id| id as usize).collect();
                table.select(Axis(0), &rows)
            }
            None => {
                let mut onehot = Array2::zeros((ids.len(), vocab));
                for (row, &id) in ids.iter().enumerate() {
                    onehot[[row, id as usize]] = 1.0;
                }
                onehot
            }
        })
    }

    /// One time-step from explicit states; returns the next states and logits.
    fn forward_from(
        &self,
        x: &Array2<f32>,
        states: &[LayerState],
    ) -> EvalResult<(Vec<LayerState>, Array2<f32>)> {
        let mut next = Vec::with_capacity(states.len());
        let mut h = x.clone();
        for (cell, state) in self.weights.cells.iter().zip(states) {
            let out = cell.step(&h, state)?;
            h = out.hidden().clone();
            next.push(out);
        }
        let logits = h.dot(&self.weights.w_out) + &self.weights.b_out;
        Ok((next, logits))
    }
}

/// Per-sample cross-entropy of `logits` `[batch, vocab]` against `targets`.
pub fn cross_entropy(logits: &Array2<f32>, targets: ArrayView1<u32>) -> EvalResult<Array1<f32>> {
    let vocab = logits.ncols();
    logits
        .outer_iter()
        .zip(targets.iter())
        .map(|(row, &target)| {
            let t = target as usize;
            if t >= vocab {
                return Err(EvalError::precondition(format!(
                    "target id {target} outside vocabulary of {vocab}"
                )));
            }
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            let lse = row.mapv(|v| (v - max).exp()).sum().ln() + max;
            Ok(lse - row[t])
        })
        .collect::<EvalResult<Vec<f32>>>()
        .map(Array1::from_vec)
}

/// Per-sample top-1 hit (1.0 or 0.0).
pub fn top1_hits(logits: &Array2<f32>, targets: ArrayView1<u32>) -> Array1<f32> {
    logits
        .outer_iter()
        .zip(targets.iter())
        .map(|(row, &target)| {
            let best = row
                .iter()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |acc, (i, &v)| {
                    if v > acc.1 {
                        (i, v)
                    } else {
                        acc
                    }
                })
                .0;
            if best == target as usize {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

impl UnrolledModel for StackedRnn {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn state_kinds(&self) -> Vec<StateKind> {
        self.weights
            .cells
            .iter()
            .map(|c| c.kind.state_kind())
            .collect()
    }

    fn maps_to_embedding(&self) -> bool {
        self.weights.embedding.is_some()
    }

    fn reset_state(&mut self) {
        self.state.reset_all();
        self.steps_seen = 0;
    }

    fn steps_seen(&self) -> u64 {
        self.steps_seen
    }

    fn run(
        &mut self,
        inputs: ArrayView2<u32>,
        targets: Option<ArrayView2<u32>>,
        stride: usize,
        eval_ops: &SignalCollector,
        sum_ops: &[SumOp],
        refresh_state: bool,
    ) -> anyhow::Result<RunOutput> {
        let (batch, len) = inputs.dim();
        if batch != self.batch_size {
            bail!("inputs carry {batch} rows, model is unrolled for {}", self.batch_size);
        }
        if len != stride {
            bail!("inputs carry {len} steps, stride is {stride}");
        }
        if let Some(t) = &targets {
            if t.dim() != inputs.dim() {
                bail!("targets shape {:?} differs from inputs {:?}", t.dim(), inputs.dim());
            }
        }
        if refresh_state {
            self.reset_state();
        }

        let input_dim = self.weights.cells[0].input_dim();
        let top_units = self.weights.cells[self.weights.cells.len() - 1].units;
        let with_gradients = eval_ops.wants_input_gradients() && targets.is_some();

        let mut embeddings = self
            .maps_to_embedding()
            .then(|| Array3::zeros((batch, len, input_dim)));
        let mut gradients = with_gradients.then(|| Array3::zeros((batch, len, input_dim)));
        let mut outputs = Array3::zeros((batch, len, top_units));
        let mut loss_sum = 0.0f64;
        let mut hit_sum = 0.0f64;

        for t in 0..len {
            let x = self
                .input_vectors(inputs.column(t))
                .with_context(|| format!("embedding step {t}"))?;
            let (next, logits) = self.forward_from(&x, &self.state.layers)?;

            if let Some(tg) = &targets {
                let target_col = tg.column(t);
                let losses = cross_entropy(&logits, target_col)?;
                loss_sum += f64::from(losses.sum()) / batch as f64;
                hit_sum += f64::from(top1_hits(&logits, target_col).sum()) / batch as f64;

                if let Some(grads) = gradients.as_mut() {
                    let carried = &self.state.layers;
                    let g = gradient::input_gradient(&x, FD_EPSILON, |xp| {
                        let (_, lg) = self.forward_from(xp, carried)?;
                        cross_entropy(&lg, target_col)
                    })?;
                    grads.slice_mut(s![.., t, ..]).assign(&g);
                }
            }

            if let Some(emb) = embeddings.as_mut() {
                emb.slice_mut(s![.., t, ..]).assign(&x);
            }
            if let Some(top) = next.last() {
                outputs.slice_mut(s![.., t, ..]).assign(top.hidden());
            }
            self.state.layers = next;
            self.steps_seen += 1;
        }

        if !self.state.all_healthy() {
            tracing::warn!("recurrent state diverged after {} steps", self.steps_seen);
        }

        let mut sums = BTreeMap::new();
        if targets.is_some() {
            for op in sum_ops {
                let value = match op {
                    SumOp::Loss => loss_sum,
                    SumOp::Accuracy => hit_sum,
                };
                sums.insert(*op, value);
            }
        }

        let trace = StepTrace {
            states: self.state.layers.clone(),
            inputs: inputs.mapv(|id| id as f32),
            embeddings,
            outputs,
            input_gradients: gradients,
        };
        let signals = eval_ops.collect(&trace)?;
        Ok(RunOutput { signals, sums })
    }
}
