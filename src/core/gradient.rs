//! Input gradients by forward perturbation.
//!
//! The loss is differentiated w.r.t. each input coordinate with a central
//! difference along the standard basis tangent `e_j`:
//!
//! ```text
//! ∂L/∂x_j ≈ (L(x + ε·e_j) − L(x − ε·e_j)) / 2ε
//! ```
//!
//! Rows of the batch are independent, so one perturbation of column `j`
//! yields that coordinate's derivative for every sample at once.  Columns are
//! evaluated in parallel.

use ndarray::{Array1, Array2};
use rayon::prelude::*;

use crate::error::{EvalError, EvalResult};

/// Basis tangent `ε·e_index` over `dim` coordinates.
pub fn basis_tangent(dim: usize, index: usize, epsilon: f32) -> Array1<f32> {
    let mut values = Array1::zeros(dim);
    if index < dim {
        values[index] = epsilon;
    }
    values
}

/// Gradient of a per-sample loss w.r.t. the batch input `x` (`[batch, dim]`).
///
/// `loss_fn` maps a `[batch, dim]` input to a `[batch]` vector of losses.
pub fn input_gradient<F>(x: &Array2<f32>, epsilon: f32, loss_fn: F) -> EvalResult<Array2<f32>>
where
    F: Fn(&Array2<f32>) -> EvalResult<Array1<f32>> + Sync,
{
    if !(epsilon.is_finite() && epsilon > 0.0) {
        return Err(EvalError::precondition(format!(
            "finite-difference epsilon must be positive, got {epsilon}"
        )));
    }
    let (batch, dim) = x.dim();

    let columns = (0..dim)
        .into_par_iter()
        .map(|j| {
            let tangent = basis_tangent(dim, j, epsilon);
            let plus = loss_fn(&(x + &tangent))?;
            let minus = loss_fn(&(x - &tangent))?;
            if plus.len() != batch || minus.len() != batch {
                return Err(EvalError::precondition(format!(
                    "loss function returned {} values for a batch of {batch}",
                    plus.len()
                )));
            }
            Ok((plus - minus) / (2.0 * epsilon))
        })
        .collect::<EvalResult<Vec<Array1<f32>>>>()?;

    let mut grad = Array2::zeros((batch, dim));
    for (j, col) in columns.iter().enumerate() {
        grad.column_mut(j).assign(col);
    }
    Ok(grad)
}
