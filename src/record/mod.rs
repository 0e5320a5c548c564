//! Recording module: buffered per-step trace persistence.

pub mod json_store;
pub mod recorder;
pub mod store;

pub use json_store::JsonDirStore;
pub use recorder::{Recorder, RecorderStats, StepRecorder};
pub use store::{DocumentId, EvalRecord, EvalStore, EvaluationDoc, MemoryStore};
