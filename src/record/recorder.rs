//! Buffered recorder: per-step bundles → per-sample rows → batched store
//! appends.
//!
//! Two owned buffers grow in parallel, one id per row.  Once the id buffer
//! reaches `flush_every` both are swapped out and handed to the store in a
//! single append.

use ndarray::Array2;
use tracing::debug;

use crate::error::{EvalError, EvalResult};
use crate::signals::SignalBundle;

use super::store::{DocumentId, EvalRecord, EvalStore};

/// Consumer of the detailed evaluation trace.
pub trait StepRecorder {
    /// Called once with the full `[batch, length]` inputs before stepping.
    fn start(&mut self, inputs: &Array2<u32>, targets: Option<&Array2<u32>>) -> EvalResult<()>;

    /// Called once per step with `[batch, ...]` signals.
    fn record(&mut self, bundle: SignalBundle) -> EvalResult<()>;

    /// Called after the last step.
    fn finish(&mut self) -> EvalResult<()> {
        Ok(())
    }
}

impl<R: StepRecorder + ?Sized> StepRecorder for &mut R {
    fn start(&mut self, inputs: &Array2<u32>, targets: Option<&Array2<u32>>) -> EvalResult<()> {
        (**self).start(inputs, targets)
    }

    fn record(&mut self, bundle: SignalBundle) -> EvalResult<()> {
        (**self).record(bundle)
    }

    fn finish(&mut self) -> EvalResult<()> {
        (**self).finish()
    }
}

/// Recorder counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub documents: usize,
    pub rows_pushed: usize,
    pub flushes: usize,
}

pub struct Recorder<S: EvalStore> {
    store: S,
    dataset_name: String,
    model_name: String,
    flush_every: usize,

    eval_doc_ids: Vec<DocumentId>,
    inputs: Option<Array2<u32>>,
    step: usize,

    eval_ids: Vec<DocumentId>,
    records: Vec<EvalRecord>,

    stats: RecorderStats,
}

impl<S: EvalStore> Recorder<S> {
    /// A `flush_every` of zero is treated as one.
    pub fn new(
        store: S,
        dataset_name: impl Into<String>,
        model_name: impl Into<String>,
        flush_every: usize,
    ) -> Self {
        Self {
            store,
            dataset_name: dataset_name.into(),
            model_name: model_name.into(),
            flush_every: flush_every.max(1),
            eval_doc_ids: Vec::new(),
            inputs: None,
            step: 0,
            eval_ids: Vec::new(),
            records: Vec::new(),
            stats: RecorderStats::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Steps recorded since `start`.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn batch_size(&self) -> usize {
        self.eval_doc_ids.len()
    }

    pub fn document_ids(&self) -> &[DocumentId] {
        &self.eval_doc_ids
    }

    /// Rows waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.records.len()
    }

    pub fn stats(&self) -> RecorderStats {
        self.stats
    }

    /// Hand both buffers to the store. Nothing happens when they are empty.
    pub fn flush(&mut self) -> EvalResult<()> {
        if self.eval_ids.is_empty() && self.records.is_empty() {
            return Ok(());
        }
        let ids = std::mem::take(&mut self.eval_ids);
        let records = std::mem::take(&mut self.records);
        let rows = records.len();
        self.store
            .push_evaluation_records(ids, records)
            .map_err(EvalError::Store)?;
        self.stats.rows_pushed += rows;
        self.stats.flushes += 1;
        debug!("flushed {} rows", rows);
        Ok(())
    }
}

impl<S: EvalStore> StepRecorder for Recorder<S> {
    /// Session state is replaced only once every document has been created.
    fn start(&mut self, inputs: &Array2<u32>, _targets: Option<&Array2<u32>>) -> EvalResult<()> {
        let mut doc_ids = Vec::with_capacity(inputs.nrows());
        for row in inputs.outer_iter() {
            let tokens = row.to_vec();
            let id = self
                .store
                .insert_evaluation(&self.dataset_name, &self.model_name, &tokens)
                .map_err(EvalError::Store)?;
            debug!("created evaluation document {}", id);
            doc_ids.push(id);
        }

        self.stats.documents += doc_ids.len();
        self.eval_doc_ids = doc_ids;
        self.inputs = Some(inputs.clone());
        self.step = 0;
        self.eval_ids.clear();
        self.records.clear();
        Ok(())
    }

    fn record(&mut self, bundle: SignalBundle) -> EvalResult<()> {
        let inputs = self
            .inputs
            .as_ref()
            .ok_or_else(|| EvalError::precondition("record called before start"))?;
        if self.step >= inputs.ncols() {
            return Err(EvalError::precondition(format!(
                "step {} beyond input length {}",
                self.step,
                inputs.ncols()
            )));
        }

        let samples = bundle.split_samples(inputs.nrows())?;
        let step = self.step;
        self.records
            .extend(samples.into_iter().enumerate().map(|(i, signals)| EvalRecord {
                word_id: inputs[[i, step]],
                signals,
            }));
        self.eval_ids.extend(self.eval_doc_ids.iter().cloned());
        self.step += 1;

        if self.eval_ids.len() >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> EvalResult<()> {
        self.flush()
    }
}
