//! Persistence collaborator contract and an in-memory store.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::ensure;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Identifier of one persisted evaluation document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One sample's signals at one step, stamped with the token consumed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalRecord {
    pub word_id: u32,
    pub signals: BTreeMap<String, ArrayD<f32>>,
}

/// "This sample in this evaluation run."
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationDoc {
    pub id: DocumentId,
    pub dataset_name: String,
    pub model_name: String,
    pub tokens: Vec<u32>,
}

/// Evaluation store.
pub trait EvalStore {
    /// Create a document for one sample's full token sequence.
    fn insert_evaluation(
        &mut self,
        dataset_name: &str,
        model_name: &str,
        tokens: &[u32],
    ) -> anyhow::Result<DocumentId>;

    /// Append rows; `eval_ids[k]` owns `records[k]`. Ids may repeat.
    fn push_evaluation_records(
        &mut self,
        eval_ids: Vec<DocumentId>,
        records: Vec<EvalRecord>,
    ) -> anyhow::Result<()>;
}

impl<S: EvalStore + ?Sized> EvalStore for &mut S {
    fn insert_evaluation(
        &mut self,
        dataset_name: &str,
        model_name: &str,
        tokens: &[u32],
    ) -> anyhow::Result<DocumentId> {
        (**self).insert_evaluation(dataset_name, model_name, tokens)
    }

    fn push_evaluation_records(
        &mut self,
        eval_ids: Vec<DocumentId>,
        records: Vec<EvalRecord>,
    ) -> anyhow::Result<()> {
        (**self).push_evaluation_records(eval_ids, records)
    }
}

/// Keeps everything in process.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    pub documents: Vec<EvaluationDoc>,
    pub rows: Vec<(DocumentId, EvalRecord)>,
    /// Number of `push_evaluation_records` calls received.
    pub push_calls: usize,
}

impl MemoryStore {
    pub fn document(&self, id: &DocumentId) -> Option<&EvaluationDoc> {
        self.documents.iter().find(|d| &d.id == id)
    }

    /// Rows attached to `id`, in push order.
    pub fn rows_for<'a>(&'a self, id: &'a DocumentId) -> impl Iterator<Item = &'a EvalRecord> + 'a {
        self.rows
            .iter()
            .filter(move |(doc, _)| doc == id)
            .map(|(_, r)| r)
    }
}

impl EvalStore for MemoryStore {
    fn insert_evaluation(
        &mut self,
        dataset_name: &str,
        model_name: &str,
        tokens: &[u32],
    ) -> anyhow::Result<DocumentId> {
        let id = DocumentId::new(format!("mem-{}", self.documents.len()));
        self.documents.push(EvaluationDoc {
            id: id.clone(),
            dataset_name: dataset_name.to_string(),
            model_name: model_name.to_string(),
            tokens: tokens.to_vec(),
        });
        Ok(id)
    }

    fn push_evaluation_records(
        &mut self,
        eval_ids: Vec<DocumentId>,
        records: Vec<EvalRecord>,
    ) -> anyhow::Result<()> {
        ensure!(
            eval_ids.len() == records.len(),
            "{} ids for {} records",
            eval_ids.len(),
            records.len()
        );
        self.push_calls += 1;
        self.rows.extend(eval_ids.into_iter().zip(records));
        Ok(())
    }
}
