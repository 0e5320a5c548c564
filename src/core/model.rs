//! The unrolled-model contract consumed by the evaluator.
//!
//! A model handle owns recurrent state that survives across `run` calls.  Each
//! call advances it by `stride` time-steps, hands the collector a
//! [`StepTrace`] of everything it observed, and reports the requested metric
//! sums for the block.

use std::collections::BTreeMap;

use ndarray::{Array2, Array3, ArrayView2};

use crate::signals::{SignalBundle, SignalCollector};

use super::state::{LayerState, StateKind};

/// Scalar metrics a caller can ask `run` to sum over a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SumOp {
    Loss,
    Accuracy,
}

impl SumOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SumOp::Loss => "loss",
            SumOp::Accuracy => "acc-1",
        }
    }
}

/// Raw observations from one block, before the collector names and stacks them.
#[derive(Clone, Debug)]
pub struct StepTrace {
    /// Per-layer state at the end of the block, bottom layer first.
    pub states: Vec<LayerState>,

    /// Token ids fed in: `[batch, stride]`.
    pub inputs: Array2<f32>,

    /// Embedded inputs `[batch, stride, dim]` (absent when the model feeds ids directly).
    pub embeddings: Option<Array3<f32>>,

    /// Top-layer outputs: `[batch, stride, units]`.
    pub outputs: Array3<f32>,

    /// d(loss)/d(input vector) `[batch, stride, dim]`, only when requested and targets were given.
    pub input_gradients: Option<Array3<f32>>,
}

/// What one `run` call hands back.
#[derive(Clone, Debug, Default)]
pub struct RunOutput {
    pub signals: SignalBundle,
    pub sums: BTreeMap<SumOp, f64>,
}

/// Stateful, step-wise executable sequence model.
pub trait UnrolledModel {
    /// Rows processed per call.
    fn batch_size(&self) -> usize;

    /// State shape of each layer, bottom first.  Fixed at construction.
    fn state_kinds(&self) -> Vec<StateKind>;

    /// Whether raw token ids are mapped through an embedding table.
    fn maps_to_embedding(&self) -> bool;

    /// Zero the recurrent state.
    fn reset_state(&mut self);

    /// Time-steps consumed since the last reset.
    fn steps_seen(&self) -> u64;

    /// Execute `stride` time-steps.
    ///
    /// `inputs` (and `targets` when present) are `[batch_size, stride]`.
    /// With `refresh_state` the state is reset before the block instead of
    /// carried over.  Sums are only reported for metrics in `sum_ops` and only
    /// when targets are supplied.
    fn run(
        &mut self,
        inputs: ArrayView2<u32>,
        targets: Option<ArrayView2<u32>>,
        stride: usize,
        eval_ops: &SignalCollector,
        sum_ops: &[SumOp],
        refresh_state: bool,
    ) -> anyhow::Result<RunOutput>;
}
