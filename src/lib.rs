//! # RNNVIS
//!
//! Streaming evaluation engine for recurrent language models.
//!
//! A trained model is stepped over token sequences while per-step internal
//! signals (layer states, inputs, embeddings, outputs, input gradients) are
//! captured and persisted for later visual inspection.
//!
//! ## Components
//!
//! 1. **Signal Collector**: which signals to capture per step, in which shape
//! 2. **Evaluator**: aggregate loss/accuracy over feeders, or a detailed trace
//!    of a token matrix one position at a time
//! 3. **Recorder**: per-sample rows buffered and appended to an evaluation store
//!
//! ## Data flow
//!
//! ```text
//! tokens ──► Evaluator ──► UnrolledModel::run ──► SignalBundle
//!                                                     │
//!                 EvalStore ◄── flush ◄── Recorder ◄──┘
//! ```

pub mod core;
pub mod error;
pub mod eval;
pub mod io;
pub mod record;
pub mod runtime;
pub mod signals;

pub use crate::core::{StackedRnn, StackedRnnConfig, UnrolledModel};
pub use crate::error::{EvalError, EvalResult};
pub use crate::eval::{EvalSummary, Evaluator, Feeder, SequenceFeeder, TokenSource};
pub use crate::record::{EvalStore, JsonDirStore, MemoryStore, Recorder, StepRecorder};
pub use crate::signals::{SignalBundle, SignalCollector, SignalFlags};

/// Engine-wide constants.
pub mod config {
    /// Buffered rows that trigger a store append.
    pub const DEFAULT_FLUSH_EVERY: usize = 100;

    /// Input length above which detailed recording warns.
    pub const LONG_INPUT_WARN: usize = 10_000;

    /// Aggregate progress period, in loop iterations.
    pub const PROGRESS_EVERY: usize = 500;

    /// Detailed progress lines per sequence.
    pub const PROGRESS_DIVISIONS: usize = 10;

    /// Central-difference step for input gradients.
    pub const FD_EPSILON: f32 = 1e-3;
}
