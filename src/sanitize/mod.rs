use serde::{Deserialize, Serialize};

use crate::model::layers::Parameterized;
use crate::model::ForecastModel;

/// Largest healthy weight magnitude; anything above counts as divergence.
pub const MAX_WEIGHT_ABS: f64 = 1e6;

/// True if any value is NaN or infinite.
pub fn has_invalid_values(arr: &[f64]) -> bool {
    arr.iter().any(|&x| x.is_nan() || x.is_infinite())
}

/// Health summary of a model's parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticResult {
    pub is_healthy: bool,
    pub has_nan: bool,
    pub has_inf: bool,
    pub nan_count: usize,
    pub inf_count: usize,
    /// Largest absolute value among the finite weights
    pub max_abs_weight: f64,
    pub parameter_count: usize,
    pub message: String,
}

/// Scans every parameter for non-finite or exploding weights.
pub fn diagnose_model(model: &ForecastModel) -> DiagnosticResult {
    let mut nan_count = 0;
    let mut inf_count = 0;
    let mut max_abs_weight: f64 = 0.0;
    let mut parameter_count = 0;

    for param in model.parameters() {
        parameter_count += param.len();
        for &val in param.as_slice() {
            if val.is_nan() {
                nan_count += 1;
            } else if val.is_infinite() {
                inf_count += 1;
            } else {
                max_abs_weight = max_abs_weight.max(val.abs());
            }
        }
    }

    let has_nan = nan_count > 0;
    let has_inf = inf_count > 0;
    let is_healthy = !has_nan && !has_inf && max_abs_weight < MAX_WEIGHT_ABS;

    let message = if is_healthy {
        "Model is healthy".to_string()
    } else if has_nan {
        format!("Model contains {nan_count} NaN values")
    } else if has_inf {
        format!("Model contains {inf_count} infinite values")
    } else {
        format!("Model has exploding weights: max |w| = {max_abs_weight:.2e}")
    };

    DiagnosticResult {
        is_healthy,
        has_nan,
        has_inf,
        nan_count,
        inf_count,
        max_abs_weight,
        parameter_count,
        message,
    }
}
