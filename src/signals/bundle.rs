//! Named, batch-major signal tensors produced by one step.

use std::collections::BTreeMap;

use ndarray::{ArrayD, Axis};

use crate::error::{EvalError, EvalResult};

/// Mapping from signal name to a tensor whose leading axis is the batch.
#[derive(Clone, Debug, Default)]
pub struct SignalBundle {
    signals: BTreeMap<String, ArrayD<f32>>,
}

/// One sample's slice of a bundle.
pub type SampleSignals = BTreeMap<String, ArrayD<f32>>;

impl SignalBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ArrayD<f32>) {
        self.signals.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.signals.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.signals.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.signals.keys().map(String::as_str)
    }

    /// Shared leading dimension, or `None` for an empty bundle.
    pub fn batch_size(&self) -> EvalResult<Option<usize>> {
        let mut batch = None;
        for (name, value) in &self.signals {
            let lead = value.shape().first().copied().ok_or_else(|| {
                EvalError::precondition(format!("signal '{name}' is a scalar, expected [batch, ...]"))
            })?;
            match batch {
                None => batch = Some(lead),
                Some(b) if b != lead => {
                    return Err(EvalError::precondition(format!(
                        "signal '{name}' has batch {lead}, others have {b}"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(batch)
    }

    /// Select sample `index` from every signal.
    pub fn sample(&self, index: usize) -> EvalResult<SampleSignals> {
        self.signals
            .iter()
            .map(|(name, value)| {
                if value.ndim() == 0 || index >= value.len_of(Axis(0)) {
                    return Err(EvalError::precondition(format!(
                        "sample {index} out of range for signal '{name}' with shape {:?}",
                        value.shape()
                    )));
                }
                Ok((name.clone(), value.index_axis(Axis(0), index).to_owned()))
            })
            .collect()
    }

    /// Split into `batch_size` per-sample maps, in row order.
    pub fn split_samples(&self, batch_size: usize) -> EvalResult<Vec<SampleSignals>> {
        if let Some(b) = self.batch_size()? {
            if b != batch_size {
                return Err(EvalError::precondition(format!(
                    "bundle carries batch {b}, expected {batch_size}"
                )));
            }
        }
        (0..batch_size).map(|i| self.sample(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn bundle() -> SignalBundle {
        let mut b = SignalBundle::new();
        b.insert(
            "state",
            Array3::from_shape_fn((2, 3, 4), |(i, l, u)| (i * 100 + l * 10 + u) as f32).into_dyn(),
        );
        b.insert(
            "input",
            Array2::from_shape_vec((2, 1), vec![5.0, 9.0]).unwrap().into_dyn(),
        );
        b
    }

    #[test]
    fn test_batch_size() {
        assert_eq!(bundle().batch_size().unwrap(), Some(2));
        assert_eq!(SignalBundle::new().batch_size().unwrap(), None);
    }

    #[test]
    fn test_mismatched_batch_rejected() {
        let mut b = bundle();
        b.insert("output", Array2::<f32>::zeros((3, 1)).into_dyn());
        assert!(b.batch_size().is_err());
    }

    #[test]
    fn test_sample_selects_row() {
        let s = bundle().sample(1).unwrap();
        assert_eq!(s["state"].shape(), &[3, 4]);
        assert_eq!(s["state"][[2, 3]], 123.0);
        assert_eq!(s["input"].shape(), &[1]);
        assert_eq!(s["input"][[0]], 9.0);
    }

    #[test]
    fn test_split_samples_in_order() {
        let samples = bundle().split_samples(2).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0]["input"][[0]], 5.0);
        assert_eq!(samples[1]["input"][[0]], 9.0);
        assert!(bundle().split_samples(3).is_err());
    }

    #[test]
    fn test_empty_bundle_splits_into_empty_maps() {
        let samples = SignalBundle::new().split_samples(3).unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.is_empty()));
    }
}
