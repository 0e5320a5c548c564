//! Evaluator: drives an [`UnrolledModel`] over feeders (aggregate mode) or over
//! a fixed token matrix one position at a time (detailed trace mode).

use ndarray::s;
use tracing::{info, warn};

use crate::config::{LONG_INPUT_WARN, PROGRESS_DIVISIONS, PROGRESS_EVERY};
use crate::core::{SumOp, UnrolledModel};
use crate::error::{EvalError, EvalResult};
use crate::record::StepRecorder;
use crate::runtime::settings::EvalSettings;
use crate::signals::{SignalCollector, SignalFlags};

use super::convert::{token_matrix, TokenSource};
use super::feeder::Feeder;
use super::session::{EvalSession, EvalSummary};

const AGGREGATE_OPS: [SumOp; 2] = [SumOp::Loss, SumOp::Accuracy];

/// Evaluates a trained model, optionally recording every step.
pub struct Evaluator<M: UnrolledModel> {
    model: M,
    collector: SignalCollector,
    record_every: usize,
}

impl<M: UnrolledModel> Evaluator<M> {
    /// Build the signal registry for `model` once; it is reused by every call.
    pub fn new(model: M, record_every: usize, flags: SignalFlags) -> EvalResult<Self> {
        if record_every == 0 {
            return Err(EvalError::precondition("record_every must be positive"));
        }
        let collector = SignalCollector::for_model(&model, flags);
        Ok(Self {
            model,
            collector,
            record_every,
        })
    }

    pub fn from_settings(model: M, settings: &EvalSettings) -> EvalResult<Self> {
        Self::new(model, settings.record_every, settings.signal_flags())
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Aggregate loss and accuracy over `input_size` blocks of `record_every`
    /// time-steps, normalised per time-step.
    pub fn evaluate<I, T>(
        &mut self,
        inputs: &mut I,
        targets: &mut T,
        input_size: usize,
        verbose: bool,
        refresh_state: bool,
    ) -> EvalResult<EvalSummary>
    where
        I: Feeder + ?Sized,
        T: Feeder + ?Sized,
    {
        if input_size == 0 {
            return Err(EvalError::precondition("input_size must be positive"));
        }
        let batch = self.model.batch_size();
        let block = (batch, self.record_every);

        self.model.reset_state();
        let mut session = EvalSession::new(self.record_every);
        info!("Start evaluating...");

        for i in 0..input_size {
            let x = inputs
                .next_block(self.record_every)
                .map_err(EvalError::Feeder)?;
            let y = targets
                .next_block(self.record_every)
                .map_err(EvalError::Feeder)?;
            if x.dim() != block || y.dim() != block {
                return Err(EvalError::precondition(format!(
                    "feeder blocks {:?} / {:?}, expected {block:?}",
                    x.dim(),
                    y.dim()
                )));
            }

            let out = self
                .model
                .run(
                    x.view(),
                    Some(y.view()),
                    self.record_every,
                    &self.collector,
                    &AGGREGATE_OPS,
                    refresh_state,
                )
                .map_err(EvalError::Model)?;
            session.accumulate(&out.sums)?;

            if verbose && i % PROGRESS_EVERY == 0 {
                info!("[{}/{}]: avg loss:{:.3}", i, input_size, session.running_loss());
            }
        }

        let summary = session.finish(input_size);
        info!(
            "Evaluate Summary: avg loss:{:.3}, acc-1: {:.3}",
            summary.loss, summary.accuracy
        );
        Ok(summary)
    }

    /// Run `inputs` (`[batch, length]`) one position at a time and hand every
    /// step's signal bundle to `recorder`.
    ///
    /// Without targets no loss-derived signals are produced.
    pub fn evaluate_and_record<R>(
        &mut self,
        inputs: &dyn TokenSource,
        targets: Option<&dyn TokenSource>,
        recorder: &mut R,
        verbose: bool,
        refresh_state: bool,
    ) -> EvalResult<()>
    where
        R: StepRecorder + ?Sized,
    {
        let inputs = token_matrix("inputs", inputs)?;
        let targets = targets.map(|t| token_matrix("targets", t)).transpose()?;

        let (batch, length) = inputs.dim();
        if batch != self.model.batch_size() {
            return Err(EvalError::precondition(format!(
                "inputs carry {batch} rows, model is unrolled for {}",
                self.model.batch_size()
            )));
        }
        if let Some(t) = &targets {
            if t.dim() != inputs.dim() {
                return Err(EvalError::precondition(format!(
                    "targets shape {:?} differs from inputs {:?}",
                    t.dim(),
                    inputs.dim()
                )));
            }
        }

        recorder.start(&inputs, targets.as_ref())?;
        if length > LONG_INPUT_WARN {
            warn!("inputs too long, might take some time.");
        }

        self.model.reset_state();
        let progress_every = length / PROGRESS_DIVISIONS;
        for i in 0..length {
            let x = inputs.slice(s![.., i..i + 1]);
            let y = targets.as_ref().map(|t| t.slice(s![.., i..i + 1]));
            let out = self
                .model
                .run(x, y, 1, &self.collector, &[], refresh_state)
                .map_err(EvalError::Model)?;
            recorder.record(out.signals)?;

            if verbose && progress_every > 0 && i != 0 && i % progress_every == 0 {
                info!("[{}/{}] completed", i, length);
            }
        }
        recorder.finish()?;
        info!("Evaluation done!");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LayerState, RunOutput, StateKind, StepTrace};
    use crate::eval::feeder::SequenceFeeder;
    use crate::record::{MemoryStore, Recorder};
    use anyhow::bail;
    use ndarray::{array, Array2, Array3, ArrayView2};
    use std::collections::BTreeMap;

    const UNITS: usize = 3;

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        stride: usize,
        steps_before: u64,
        has_targets: bool,
        refresh: bool,
        sum_ops: Vec<SumOp>,
    }

    /// Deterministic stand-in: every time-step costs `loss_per_token` and
    /// scores `acc_per_token`.
    struct ScriptedModel {
        batch: usize,
        kinds: Vec<StateKind>,
        loss_per_token: f64,
        acc_per_token: f64,
        steps: u64,
        resets: usize,
        calls: Vec<Call>,
        fail_at: Option<usize>,
    }

    impl ScriptedModel {
        fn new(batch: usize) -> Self {
            Self {
                batch,
                kinds: vec![StateKind::Plain, StateKind::Gated],
                loss_per_token: 2.0,
                acc_per_token: 0.25,
                steps: 0,
                resets: 0,
                calls: Vec::new(),
                fail_at: None,
            }
        }
    }

    impl UnrolledModel for ScriptedModel {
        fn batch_size(&self) -> usize {
            self.batch
        }

        fn state_kinds(&self) -> Vec<StateKind> {
            self.kinds.clone()
        }

        fn maps_to_embedding(&self) -> bool {
            false
        }

        fn reset_state(&mut self) {
            self.steps = 0;
            self.resets += 1;
        }

        fn steps_seen(&self) -> u64 {
            self.steps
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
            if self.fail_at == Some(self.calls.len()) {
                bail!("device lost");
            }
            if refresh_state {
                self.reset_state();
            }
            self.calls.push(Call {
                stride,
                steps_before: self.steps,
                has_targets: targets.is_some(),
                refresh: refresh_state,
                sum_ops: sum_ops.to_vec(),
            });
            self.steps += stride as u64;

            let trace = StepTrace {
                states: self
                    .kinds
                    .iter()
                    .map(|&k| LayerState::zeros(k, self.batch, UNITS))
                    .collect(),
                inputs: inputs.mapv(|v| v as f32),
                embeddings: None,
                outputs: Array3::zeros((self.batch, stride, UNITS)),
                input_gradients: None,
            };
            let signals = eval_ops.collect(&trace)?;

            let mut sums = BTreeMap::new();
            if targets.is_some() {
                for op in sum_ops {
                    let per_token = match op {
                        SumOp::Loss => self.loss_per_token,
                        SumOp::Accuracy => self.acc_per_token,
                    };
                    sums.insert(*op, per_token * stride as f64);
                }
            }
            Ok(RunOutput { signals, sums })
        }
    }

    fn feeders(batch: usize, columns: usize) -> (SequenceFeeder, SequenceFeeder) {
        let tokens: Vec<u32> = (0..(batch * columns + 1) as u32).collect();
        SequenceFeeder::pair(&tokens, batch).unwrap()
    }

    fn evaluate_with_stride(stride: usize) -> (EvalSummary, Vec<Call>) {
        let input_size = 3;
        let mut ev = Evaluator::new(ScriptedModel::new(2), stride, SignalFlags::default()).unwrap();
        let (mut x, mut y) = feeders(2, input_size * stride);
        let summary = ev.evaluate(&mut x, &mut y, input_size, true, false).unwrap();
        (summary, ev.into_model().calls)
    }

    #[test]
    fn test_evaluate_normalises_per_token() {
        for stride in [1, 4] {
            let (summary, calls) = evaluate_with_stride(stride);
            assert!((summary.loss - 2.0).abs() < 1e-12, "stride {stride}");
            assert!((summary.accuracy - 0.25).abs() < 1e-12, "stride {stride}");
            assert_eq!(summary.steps, 3);
            assert_eq!(summary.tokens, 3 * stride);
            assert_eq!(calls.len(), 3);
        }
    }

    #[test]
    fn test_evaluate_step_invariant() {
        let (_, calls) = evaluate_with_stride(4);
        for (i, call) in calls.iter().enumerate() {
            assert_eq!(call.stride, 4);
            assert_eq!(call.steps_before, (i * 4) as u64);
            assert!(call.has_targets);
            assert_eq!(call.sum_ops, vec![SumOp::Loss, SumOp::Accuracy]);
        }
    }

    #[test]
    fn test_evaluate_resets_first_and_honours_refresh() {
        let mut ev = Evaluator::new(ScriptedModel::new(1), 2, SignalFlags::default()).unwrap();
        let (mut x, mut y) = feeders(1, 6);
        ev.evaluate(&mut x, &mut y, 3, false, true).unwrap();
        let model = ev.into_model();
        assert_eq!(model.resets, 1 + 3);
        assert!(model.calls.iter().all(|c| c.refresh && c.steps_before == 0));
    }

    #[test]
    fn test_evaluate_rejects_zero_input_size() {
        let mut ev = Evaluator::new(ScriptedModel::new(1), 1, SignalFlags::default()).unwrap();
        let (mut x, mut y) = feeders(1, 2);
        let err = ev.evaluate(&mut x, &mut y, 0, false, false).unwrap_err();
        assert!(matches!(err, EvalError::Precondition(_)));
    }

    #[test]
    fn test_evaluate_surfaces_feeder_exhaustion() {
        let mut ev = Evaluator::new(ScriptedModel::new(1), 2, SignalFlags::default()).unwrap();
        let (mut x, mut y) = feeders(1, 3);
        let err = ev.evaluate(&mut x, &mut y, 2, false, false).unwrap_err();
        assert!(matches!(err, EvalError::Feeder(_)));
    }

    #[test]
    fn test_zero_stride_rejected() {
        assert!(Evaluator::new(ScriptedModel::new(1), 0, SignalFlags::default()).is_err());
    }

    #[test]
    fn test_record_steps_one_token_at_a_time() {
        let mut ev = Evaluator::new(ScriptedModel::new(2), 4, SignalFlags::default()).unwrap();
        let inputs = array![[1u32, 2, 3], [4, 5, 6]];
        let mut recorder = Recorder::new(MemoryStore::default(), "ptb", "lstm", 100);

        ev.evaluate_and_record(&inputs, None, &mut recorder, true, false)
            .unwrap();

        let model = ev.into_model();
        assert_eq!(model.calls.len(), 3);
        assert!(model.calls.iter().all(|c| c.stride == 1 && !c.has_targets));
        assert!(model.calls.iter().all(|c| c.sum_ops.is_empty()));

        let store = recorder.store();
        assert_eq!(store.documents.len(), 2);
        assert_eq!(store.documents[1].tokens, vec![4, 5, 6]);
        assert_eq!(store.rows.len(), 6);
        assert_eq!(store.push_calls, 1);
        let word_ids: Vec<u32> = store.rows.iter().map(|(_, r)| r.word_id).collect();
        assert_eq!(word_ids, vec![1, 4, 2, 5, 3, 6]);
        let first = &store.rows[0].1.signals;
        assert_eq!(first["state"].shape(), &[1, UNITS]);
        assert_eq!(first["state_h"].shape(), &[1, UNITS]);
        assert_eq!(first["input"].shape(), &[1]);
    }

    #[test]
    fn test_record_passes_targets_through() {
        let mut ev = Evaluator::new(ScriptedModel::new(1), 1, SignalFlags::none()).unwrap();
        let inputs = vec![vec![1u32, 2]];
        let targets = vec![vec![2u32, 3]];
        let mut recorder = Recorder::new(MemoryStore::default(), "d", "m", 10);
        ev.evaluate_and_record(&inputs, Some(&targets), &mut recorder, false, false)
            .unwrap();
        assert!(ev.model().calls.iter().all(|c| c.has_targets));
        assert!(recorder.store().rows.iter().all(|(_, r)| r.signals.is_empty()));
    }

    #[test]
    fn test_record_rejects_unconvertible_inputs_before_start() {
        let mut ev = Evaluator::new(ScriptedModel::new(2), 1, SignalFlags::default()).unwrap();
        let ragged = vec![vec![1u32, 2], vec![3]];
        let mut recorder = Recorder::new(MemoryStore::default(), "d", "m", 10);

        let err = ev
            .evaluate_and_record(&ragged, None, &mut recorder, false, false)
            .unwrap_err();
        assert!(matches!(err, EvalError::Conversion { what: "inputs", .. }));
        assert!(recorder.store().documents.is_empty());
        assert!(ev.model().calls.is_empty());

        let inputs = array![[1u32], [2]];
        let bad_targets = serde_json::json!({"not": "tokens"});
        let err = ev
            .evaluate_and_record(&inputs, Some(&bad_targets), &mut recorder, false, false)
            .unwrap_err();
        assert!(matches!(err, EvalError::Conversion { what: "targets", .. }));
    }

    #[test]
    fn test_record_rejects_shape_mismatches() {
        let mut ev = Evaluator::new(ScriptedModel::new(2), 1, SignalFlags::default()).unwrap();
        let mut recorder = Recorder::new(MemoryStore::default(), "d", "m", 10);

        let wrong_batch = Array2::<u32>::zeros((3, 4));
        assert!(matches!(
            ev.evaluate_and_record(&wrong_batch, None, &mut recorder, false, false),
            Err(EvalError::Precondition(_))
        ));

        let inputs = Array2::<u32>::zeros((2, 4));
        let targets = Array2::<u32>::zeros((2, 3));
        assert!(matches!(
            ev.evaluate_and_record(&inputs, Some(&targets), &mut recorder, false, false),
            Err(EvalError::Precondition(_))
        ));
    }

    #[test]
    fn test_stacked_rnn_into_json_store() {
        use crate::core::{CellKind, LayerSpec, StackedRnn, StackedRnnConfig};
        use crate::record::JsonDirStore;

        let config = StackedRnnConfig {
            vocab_size: 10,
            embedding_dim: Some(3),
            layers: vec![
                LayerSpec {
                    kind: CellKind::Lstm,
                    units: 4,
                },
                LayerSpec {
                    kind: CellKind::Elman,
                    units: 4,
                },
            ],
            seed: 7,
            init_std: 0.2,
        };
        let model = StackedRnn::new(&config, 2).unwrap();
        let flags = SignalFlags {
            log_gradients: true,
            ..SignalFlags::default()
        };
        let mut ev = Evaluator::new(model, 1, flags).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(tmp.path()).unwrap();
        let mut recorder = Recorder::new(store, "toy", "lstm-elman", 3);
        let inputs = array![[1u32, 2, 3, 4], [5, 6, 7, 8]];
        let targets = array![[2u32, 3, 4, 5], [6, 7, 8, 9]];
        ev.evaluate_and_record(&inputs, Some(&targets), &mut recorder, false, false)
            .unwrap();

        let store = recorder.into_store();
        let docs = store.load_evaluations().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].tokens, vec![1, 2, 3, 4]);

        let rows = store.load_records().unwrap();
        assert_eq!(rows.len(), 8);
        assert_eq!(rows[7].0, docs[1].id);
        assert_eq!(rows[7].1.word_id, 8);
        let signals = &rows[0].1.signals;
        assert_eq!(signals["state_c"].shape(), &[1, 4]);
        assert_eq!(signals["state"].shape(), &[1, 4]);
        assert_eq!(signals["input_embedding"].shape(), &[1, 3]);
        assert_eq!(signals["inputs_gradients"].shape(), &[1, 3]);
    }

    #[test]
    fn test_long_input_only_warns() {
        let length = LONG_INPUT_WARN + 1;
        let mut ev = Evaluator::new(ScriptedModel::new(1), 1, SignalFlags::none()).unwrap();
        let inputs = Array2::<u32>::zeros((1, length));
        let mut recorder = Recorder::new(MemoryStore::default(), "d", "m", 1000);

        ev.evaluate_and_record(&inputs, None, &mut recorder, false, false)
            .unwrap();

        assert_eq!(ev.model().calls.len(), length);
        assert_eq!(recorder.store().rows.len(), length);
        assert_eq!(recorder.step(), length);
    }

    #[test]
    fn test_model_failure_propagates() {
        let mut model = ScriptedModel::new(1);
        model.fail_at = Some(1);
        let mut ev = Evaluator::new(model, 1, SignalFlags::default()).unwrap();
        let mut recorder = Recorder::new(MemoryStore::default(), "d", "m", 1);
        let err = ev
            .evaluate_and_record(&array![[1u32, 2, 3]], None, &mut recorder, false, false)
            .unwrap_err();
        assert!(matches!(err, EvalError::Model(_)));
        // The first step was flushed before the failure.
        assert_eq!(recorder.store().rows.len(), 1);
    }
}
