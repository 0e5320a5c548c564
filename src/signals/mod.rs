//! Signal module: what gets captured from each step, and in which shape.

pub mod bundle;
pub mod collector;

pub use bundle::{SampleSignals, SignalBundle};
pub use collector::{RawSignal, SignalCollector, SignalFlags, SignalKind, StatePart};
