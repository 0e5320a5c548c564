//! Boundary conversion of token containers into `[batch, length]` matrices.
//!
//! Conversion runs before any stateful work: a failure carries the runtime
//! type name of the offending value.

use std::any::type_name;

use ndarray::{Array2, ArrayD, Ix2};
use serde_json::Value;

use crate::error::{EvalError, EvalResult};

/// Anything that may be shaped into a rectangular matrix of token ids.
pub trait TokenSource {
    /// The matrix, or the type name to report on failure.
    fn to_token_matrix(&self) -> Result<Array2<u32>, String>;
}

impl TokenSource for Array2<u32> {
    fn to_token_matrix(&self) -> Result<Array2<u32>, String> {
        Ok(self.clone())
    }
}

impl TokenSource for ArrayD<u32> {
    fn to_token_matrix(&self) -> Result<Array2<u32>, String> {
        self.clone()
            .into_dimensionality::<Ix2>()
            .map_err(|_| format!("{}<{}d>", type_name::<Self>(), self.ndim()))
    }
}

impl TokenSource for [Vec<u32>] {
    fn to_token_matrix(&self) -> Result<Array2<u32>, String> {
        rows_to_matrix(self).ok_or_else(|| type_name::<Self>().to_string())
    }
}

impl TokenSource for Vec<Vec<u32>> {
    fn to_token_matrix(&self) -> Result<Array2<u32>, String> {
        rows_to_matrix(self).ok_or_else(|| type_name::<Self>().to_string())
    }
}

impl TokenSource for Value {
    fn to_token_matrix(&self) -> Result<Array2<u32>, String> {
        let rows = self.as_array().ok_or_else(|| json_kind(self))?;
        let mut parsed = Vec::with_capacity(rows.len());
        for row in rows {
            let cells = row
                .as_array()
                .ok_or_else(|| format!("array of {}", json_kind(row)))?;
            let ids = cells
                .iter()
                .map(|c| {
                    c.as_u64()
                        .and_then(|v| u32::try_from(v).ok())
                        .ok_or_else(|| format!("array of array of {}", json_kind(c)))
                })
                .collect::<Result<Vec<u32>, String>>()?;
            parsed.push(ids);
        }
        rows_to_matrix(&parsed).ok_or_else(|| "ragged array".to_string())
    }
}

impl<T: TokenSource + ?Sized> TokenSource for &T {
    fn to_token_matrix(&self) -> Result<Array2<u32>, String> {
        (**self).to_token_matrix()
    }
}

/// Convert `src`, naming it `what` ("inputs" or "targets") on failure.
pub fn token_matrix<S: TokenSource + ?Sized>(what: &'static str, src: &S) -> EvalResult<Array2<u32>> {
    src.to_token_matrix()
        .map_err(|type_name| EvalError::conversion(what, type_name))
}

fn rows_to_matrix(rows: &[Vec<u32>]) -> Option<Array2<u32>> {
    let width = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != width) {
        return None;
    }
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), width), flat).ok()
}

fn json_kind(v: &Value) -> String {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(n) if n.is_i64() && n.as_i64().is_some_and(|i| i < 0) => "negative int",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}
