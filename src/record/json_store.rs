//! File-backed evaluation store: two JSON-lines files under one directory.
//!
//! - `evaluations.jsonl`: one [`EvaluationDoc`] per line
//! - `records.jsonl`: one row per line, `{"eval_id": .., "word_id": .., "signals": ..}`
//!
//! Each signal is written as `{"shape": [..], "data": [..]}`. JSON has no
//! NaN or infinity, so those values are written as the strings `"NaN"`,
//! `"inf"` and `"-inf"`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::io::files::{write_to_file, WriteMode};

use super::store::{DocumentId, EvalRecord, EvalStore, EvaluationDoc};

pub const EVALUATIONS_FILE: &str = "evaluations.jsonl";
pub const RECORDS_FILE: &str = "records.jsonl";

#[derive(Serialize, Deserialize)]
struct RecordLine {
    eval_id: DocumentId,
    word_id: u32,
    signals: BTreeMap<String, SignalLine>,
}

#[derive(Serialize, Deserialize)]
struct SignalLine {
    shape: Vec<usize>,
    data: Vec<Scalar>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Finite(f32),
    Special(String),
}

impl Scalar {
    fn encode(v: f32) -> Self {
        if v.is_finite() {
            Scalar::Finite(v)
        } else if v.is_nan() {
            Scalar::Special("NaN".to_string())
        } else if v > 0.0 {
            Scalar::Special("inf".to_string())
        } else {
            Scalar::Special("-inf".to_string())
        }
    }

    fn decode(&self) -> anyhow::Result<f32> {
        Ok(match self {
            Scalar::Finite(v) => *v,
            Scalar::Special(s) => match s.as_str() {
                "NaN" => f32::NAN,
                "inf" => f32::INFINITY,
                "-inf" => f32::NEG_INFINITY,
                other => bail!("unknown scalar {other:?}"),
            },
        })
    }
}

impl RecordLine {
    fn encode(eval_id: DocumentId, record: EvalRecord) -> Self {
        let signals = record
            .signals
            .into_iter()
            .map(|(name, value)| {
                let line = SignalLine {
                    shape: value.shape().to_vec(),
                    data: value.iter().map(|&v| Scalar::encode(v)).collect(),
                };
                (name, line)
            })
            .collect();
        Self {
            eval_id,
            word_id: record.word_id,
            signals,
        }
    }

    fn decode(self) -> anyhow::Result<(DocumentId, EvalRecord)> {
        let mut signals = BTreeMap::new();
        for (name, line) in self.signals {
            let data = line
                .data
                .iter()
                .map(Scalar::decode)
                .collect::<anyhow::Result<Vec<f32>>>()?;
            let value = ArrayD::from_shape_vec(IxDyn(&line.shape), data)
                .with_context(|| format!("signal '{name}' data does not match its shape"))?;
            signals.insert(name, value);
        }
        Ok((
            self.eval_id,
            EvalRecord {
                word_id: self.word_id,
                signals,
            },
        ))
    }
}

#[derive(Debug)]
pub struct JsonDirStore {
    root: PathBuf,
    next_id: usize,
}

impl JsonDirStore {
    /// Open (or create) a store rooted at `root`. Id numbering resumes after
    /// the documents already present.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating store directory {}", root.display()))?;
        let next_id = count_lines(&root.join(EVALUATIONS_FILE))?;
        Ok(Self { root, next_id })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn evaluations_path(&self) -> PathBuf {
        self.root.join(EVALUATIONS_FILE)
    }

    pub fn records_path(&self) -> PathBuf {
        self.root.join(RECORDS_FILE)
    }

    pub fn load_evaluations(&self) -> anyhow::Result<Vec<EvaluationDoc>> {
        read_lines(&self.evaluations_path())
    }

    pub fn load_records(&self) -> anyhow::Result<Vec<(DocumentId, EvalRecord)>> {
        let lines: Vec<RecordLine> = read_lines(&self.records_path())?;
        lines.into_iter().map(RecordLine::decode).collect()
    }
}

impl EvalStore for JsonDirStore {
    fn insert_evaluation(
        &mut self,
        dataset_name: &str,
        model_name: &str,
        tokens: &[u32],
    ) -> anyhow::Result<DocumentId> {
        let doc = EvaluationDoc {
            id: DocumentId::new(format!("eval-{:06}", self.next_id)),
            dataset_name: dataset_name.to_string(),
            model_name: model_name.to_string(),
            tokens: tokens.to_vec(),
        };
        let mut line = serde_json::to_string(&doc)?;
        line.push('\n');
        write_to_file(&line, &self.evaluations_path(), WriteMode::Append)?;
        self.next_id += 1;
        Ok(doc.id)
    }

    fn push_evaluation_records(
        &mut self,
        eval_ids: Vec<DocumentId>,
        records: Vec<EvalRecord>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            eval_ids.len() == records.len(),
            "{} ids for {} records",
            eval_ids.len(),
            records.len()
        );
        let mut out = String::new();
        for (eval_id, record) in eval_ids.into_iter().zip(records) {
            out.push_str(&serde_json::to_string(&RecordLine::encode(eval_id, record))?);
            out.push('\n');
        }
        write_to_file(&out, &self.records_path(), WriteMode::Append)?;
        Ok(())
    }
}

fn count_lines(path: &Path) -> anyhow::Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let file = fs::File::open(path)?;
    let mut n = 0;
    for line in BufReader::new(file).lines() {
        if !line?.trim().is_empty() {
            n += 1;
        }
    }
    Ok(n)
}

fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)?;
    let mut out = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(
            serde_json::from_str(&line)
                .with_context(|| format!("{}:{}", path.display(), n + 1))?,
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(word_id: u32) -> EvalRecord {
        let mut signals = BTreeMap::new();
        signals.insert(
            "state".to_string(),
            ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![0.5, -1.0, 2.0, 0.0]).unwrap(),
        );
        EvalRecord { word_id, signals }
    }

    #[test]
    fn test_documents_and_rows_persist() {
        let tmp = tempdir().unwrap();
        let mut store = JsonDirStore::new(tmp.path().join("store")).unwrap();
        let a = store.insert_evaluation("ptb", "gru", &[1, 2, 3]).unwrap();
        let b = store.insert_evaluation("ptb", "gru", &[4, 5, 6]).unwrap();
        assert_eq!(a.as_str(), "eval-000000");
        assert_eq!(b.as_str(), "eval-000001");

        store
            .push_evaluation_records(vec![a.clone(), b.clone()], vec![record(1), record(4)])
            .unwrap();
        store
            .push_evaluation_records(vec![a.clone()], vec![record(2)])
            .unwrap();

        let docs = store.load_evaluations().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].tokens, vec![4, 5, 6]);

        let rows = store.load_records().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].0, a);
        assert_eq!(rows[2].1, record(2));
    }

    #[test]
    fn test_non_finite_signals_read_back() {
        let tmp = tempdir().unwrap();
        let mut store = JsonDirStore::new(tmp.path()).unwrap();
        let id = store.insert_evaluation("d", "m", &[1]).unwrap();
        let mut signals = BTreeMap::new();
        signals.insert(
            "state".to_string(),
            ArrayD::from_shape_vec(
                IxDyn(&[4]),
                vec![f32::NAN, 1.0, f32::INFINITY, f32::NEG_INFINITY],
            )
            .unwrap(),
        );
        store
            .push_evaluation_records(vec![id.clone()], vec![EvalRecord { word_id: 1, signals }])
            .unwrap();

        let rows = store.load_records().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, id);
        let state = &rows[0].1.signals["state"];
        assert_eq!(state.shape(), &[4]);
        assert!(state[[0]].is_nan());
        assert_eq!(state[[1]], 1.0);
        assert_eq!(state[[2]], f32::INFINITY);
        assert_eq!(state[[3]], f32::NEG_INFINITY);
    }

    #[test]
    fn test_corrupt_scalar_rejected() {
        let tmp = tempdir().unwrap();
        let store = JsonDirStore::new(tmp.path()).unwrap();
        write_to_file(
            "{\"eval_id\":\"x\",\"word_id\":0,\"signals\":{\"s\":{\"shape\":[1],\"data\":[\"huge\"]}}}\n",
            &store.records_path(),
            WriteMode::Append,
        )
        .unwrap();
        assert!(store.load_records().is_err());
    }

    #[test]
    fn test_reopen_resumes_ids() {
        let tmp = tempdir().unwrap();
        {
            let mut store = JsonDirStore::new(tmp.path()).unwrap();
            store.insert_evaluation("d", "m", &[1]).unwrap();
        }
        let mut store = JsonDirStore::new(tmp.path()).unwrap();
        let id = store.insert_evaluation("d", "m", &[2]).unwrap();
        assert_eq!(id.as_str(), "eval-000001");
    }

    #[test]
    fn test_empty_store_loads_nothing() {
        let tmp = tempdir().unwrap();
        let store = JsonDirStore::new(tmp.path()).unwrap();
        assert!(store.load_evaluations().unwrap().is_empty());
        assert!(store.load_records().unwrap().is_empty());
    }
}
