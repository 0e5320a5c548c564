//! Evaluation module: input conversion, feeders, and the evaluator loop.

pub mod convert;
pub mod evaluator;
pub mod feeder;
pub mod session;

pub use convert::{token_matrix, TokenSource};
pub use evaluator::Evaluator;
pub use feeder::{Feeder, SequenceFeeder};
pub use session::{EvalSession, EvalSummary};
