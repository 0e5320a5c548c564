//! Which internal signals to capture per step, and how to shape them.
//!
//! The collector is built once from the model's architecture and a set of
//! flags.  It holds an ordered registry of `(name, SignalKind)` and, alongside
//! it, one extraction closure per entry.  Per step the model produces a
//! [`StepTrace`]; `collect` runs the closures over it and returns a
//! [`SignalBundle`].
//!
//! State tensors are grouped by layer state shape: plain layers go to
//! `state`, gated layers contribute their cell to `state_c` and hidden output
//! to `state_h`.  Each group is stacked on a new layer axis, giving
//! `[batch, layers_in_group, units]`.

use std::fmt;

use ndarray::{stack, ArrayD, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::core::model::{StepTrace, UnrolledModel};
use crate::core::state::{LayerState, StateKind};
use crate::error::{EvalError, EvalResult};

use super::bundle::SignalBundle;

pub const STATE: &str = "state";
pub const STATE_CELL: &str = "state_c";
pub const STATE_HIDDEN: &str = "state_h";
pub const INPUT: &str = "input";
pub const INPUT_EMBEDDING: &str = "input_embedding";
pub const OUTPUT: &str = "output";
pub const INPUT_GRADIENTS: &str = "inputs_gradients";

/// Which part of a layer's state a stacked group reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatePart {
    Plain,
    Cell,
    Hidden,
}

/// Tensors passed through as the model produced them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawSignal {
    Input,
    InputEmbedding,
    Output,
}

/// How a named signal is produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalKind {
    /// Selected layers' state, stacked along axis 1.
    LayerStack { part: StatePart, layers: Vec<usize> },
    Raw(RawSignal),
    /// d(loss)/d(input), derived by the model when targets are present.
    InputGradient,
}

/// What to log.  Mirrors the evaluator settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalFlags {
    pub log_state: bool,
    pub log_input: bool,
    pub log_output: bool,
    pub log_gradients: bool,
}

impl Default for SignalFlags {
    fn default() -> Self {
        Self {
            log_state: true,
            log_input: true,
            log_output: true,
            log_gradients: false,
        }
    }
}

impl SignalFlags {
    /// Nothing captured.
    pub fn none() -> Self {
        Self {
            log_state: false,
            log_input: false,
            log_output: false,
            log_gradients: false,
        }
    }
}

type Extractor = Box<dyn Fn(&StepTrace) -> EvalResult<Option<ArrayD<f32>>> + Send + Sync>;

/// Immutable registry of signals, resolved to extractors at construction.
pub struct SignalCollector {
    specs: Vec<(String, SignalKind)>,
    extractors: Vec<Extractor>,
}

impl fmt::Debug for SignalCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalCollector")
            .field("specs", &self.specs)
            .finish()
    }
}

impl SignalCollector {
    /// Build the registry for a model with the given per-layer state kinds.
    pub fn new(state_kinds: &[StateKind], maps_to_embedding: bool, flags: SignalFlags) -> Self {
        let mut specs: Vec<(String, SignalKind)> = Vec::new();

        if flags.log_state {
            let mut groups: Vec<(&'static str, StatePart, Vec<usize>)> = Vec::new();
            let mut push = |name: &'static str, part: StatePart, layer: usize| {
                match groups.iter_mut().find(|(n, _, _)| *n == name) {
                    Some((_, _, layers)) => layers.push(layer),
                    None => groups.push((name, part, vec![layer])),
                }
            };
            for (layer, kind) in state_kinds.iter().enumerate() {
                match kind {
                    StateKind::Gated => {
                        push(STATE_CELL, StatePart::Cell, layer);
                        push(STATE_HIDDEN, StatePart::Hidden, layer);
                    }
                    StateKind::Plain => push(STATE, StatePart::Plain, layer),
                }
            }
            for (name, part, layers) in groups {
                specs.push((name.to_string(), SignalKind::LayerStack { part, layers }));
            }
        }
        if flags.log_input {
            specs.push((INPUT.to_string(), SignalKind::Raw(RawSignal::Input)));
            if maps_to_embedding {
                specs.push((
                    INPUT_EMBEDDING.to_string(),
                    SignalKind::Raw(RawSignal::InputEmbedding),
                ));
            }
        }
        if flags.log_output {
            specs.push((OUTPUT.to_string(), SignalKind::Raw(RawSignal::Output)));
        }
        if flags.log_gradients {
            specs.push((INPUT_GRADIENTS.to_string(), SignalKind::InputGradient));
        }

        let extractors = specs.iter().map(|(_, kind)| resolve(kind.clone())).collect();
        Self { specs, extractors }
    }

    /// Build the registry from a model handle's declared architecture.
    pub fn for_model<M: UnrolledModel + ?Sized>(model: &M, flags: SignalFlags) -> Self {
        Self::new(&model.state_kinds(), model.maps_to_embedding(), flags)
    }

    /// A collector that captures nothing.
    pub fn empty() -> Self {
        Self::new(&[], false, SignalFlags::none())
    }

    pub fn specs(&self) -> &[(String, SignalKind)] {
        &self.specs
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Whether the model must derive input gradients for this collector.
    pub fn wants_input_gradients(&self) -> bool {
        self.specs
            .iter()
            .any(|(_, kind)| *kind == SignalKind::InputGradient)
    }

    /// Realise every registered signal from one step's trace.
    ///
    /// Signals whose source is absent this step (e.g. gradients without
    /// targets) are left out of the bundle.
    pub fn collect(&self, trace: &StepTrace) -> EvalResult<SignalBundle> {
        let mut bundle = SignalBundle::new();
        for ((name, _), extract) in self.specs.iter().zip(&self.extractors) {
            if let Some(value) = extract(trace)? {
                bundle.insert(name.clone(), value);
            }
        }
        Ok(bundle)
    }
}

fn resolve(kind: SignalKind) -> Extractor {
    match kind {
        SignalKind::LayerStack { part, layers } => Box::new(move |trace: &StepTrace| {
            stack_layers(&trace.states, part, &layers).map(Some)
        }),
        SignalKind::Raw(RawSignal::Input) => {
            Box::new(|trace: &StepTrace| Ok(Some(trace.inputs.clone().into_dyn())))
        }
        SignalKind::Raw(RawSignal::InputEmbedding) => Box::new(|trace: &StepTrace| {
            Ok(trace.embeddings.as_ref().map(|e| e.clone().into_dyn()))
        }),
        SignalKind::Raw(RawSignal::Output) => {
            Box::new(|trace: &StepTrace| Ok(Some(trace.outputs.clone().into_dyn())))
        }
        SignalKind::InputGradient => Box::new(|trace: &StepTrace| {
            Ok(trace.input_gradients.as_ref().map(|g| g.clone().into_dyn()))
        }),
    }
}

fn stack_layers(states: &[LayerState], part: StatePart, layers: &[usize]) -> EvalResult<ArrayD<f32>> {
    let views = layers
        .iter()
        .map(|&layer| {
            let state = states.get(layer).ok_or_else(|| {
                EvalError::precondition(format!(
                    "layer {layer} requested but the model reported {} layers",
                    states.len()
                ))
            })?;
            let view: ArrayView2<f32> = match (part, state) {
                (StatePart::Plain, LayerState::Plain(h)) => h.view(),
                (StatePart::Cell, LayerState::Gated { cell, .. }) => cell.view(),
                (StatePart::Hidden, LayerState::Gated { hidden, .. }) => hidden.view(),
                (part, state) => {
                    return Err(EvalError::precondition(format!(
                        "layer {layer} holds a {:?} state, cannot read {part:?}",
                        state.kind()
                    )))
                }
            };
            Ok(view)
        })
        .collect::<EvalResult<Vec<_>>>()?;

    let stacked = stack(Axis(1), &views).map_err(|e| {
        EvalError::precondition(format!("cannot stack layers {layers:?}: {e}"))
    })?;
    Ok(stacked.into_dyn())
}
