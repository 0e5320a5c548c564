//! Core module: recurrent state, cells, the unrolled-model contract and the
//! reference stacked RNN.

pub mod cell;
pub mod gradient;
pub mod model;
pub mod stacked;
pub mod state;

pub use cell::{CellKind, RecurrentCell};
pub use model::{RunOutput, StepTrace, SumOp, UnrolledModel};
pub use stacked::{LayerSpec, RnnWeights, StackedRnn, StackedRnnConfig};
pub use state::{LayerState, StateBank, StateKind};
