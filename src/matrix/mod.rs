//! Row-major dense matrix and the numeric kernels built on it.
//!
//! Every layer works on [`Matrix`]: a sample's time series is `T × C`,
//! weights are `in × out` and biases are `1 × out` row vectors.

use std::ops::{Index, IndexMut};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::sanitize::has_invalid_values;

/// Floor for divisions and logarithms.
pub const EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MatrixRepr", into = "MatrixRepr")]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct MatrixRepr {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl TryFrom<MatrixRepr> for Matrix {
    type Error = String;

    fn try_from(repr: MatrixRepr) -> std::result::Result<Self, Self::Error> {
        if repr.rows * repr.cols != repr.data.len() {
            return Err(format!(
                "matrix {}x{} has {} values",
                repr.rows,
                repr.cols,
                repr.data.len()
            ));
        }
        Ok(Self {
            rows: repr.rows,
            cols: repr.cols,
            data: repr.data,
        })
    }
}

impl From<Matrix> for MatrixRepr {
    fn from(m: Matrix) -> Self {
        Self {
            rows: m.rows,
            cols: m.cols,
            data: m.data,
        }
    }
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if rows * cols != data.len() {
            return Err(ForecastError::invalid(format!(
                "cannot shape {} values as {rows}x{cols}",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// One row per frame.
    pub fn from_rows(frames: &[Vec<f64>]) -> Result<Self> {
        let cols = frames.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(frames.len() * cols);
        for (i, frame) in frames.iter().enumerate() {
            if frame.len() != cols {
                return Err(ForecastError::invalid(format!(
                    "row {i} has {} values, expected {cols}",
                    frame.len()
                )));
            }
            data.extend_from_slice(frame);
        }
        Ok(Self {
            rows: frames.len(),
            cols,
            data,
        })
    }

    pub fn row_vector(values: Vec<f64>) -> Self {
        Self {
            rows: 1,
            cols: values.len(),
            data: values,
        }
    }

    /// Glorot uniform init, limit = sqrt(6 / (fan_in + fan_out)).
    pub fn glorot_uniform<R: Rng>(fan_in: usize, fan_out: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
        let data = (0..fan_in * fan_out)
            .map(|_| rng.gen_range(-limit..=limit))
            .collect();
        Self {
            rows: fan_in,
            cols: fan_out,
            data,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    pub fn row(&self, r: usize) -> &[f64] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [f64] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_iter(&self) -> impl Iterator<Item = &[f64]> {
        // chunks panics on cols == 0
        self.data.chunks(self.cols.max(1)).take(self.rows)
    }

    /// First `n` rows.
    pub fn head_rows(&self, n: usize) -> Matrix {
        let n = n.min(self.rows);
        Matrix {
            rows: n,
            cols: self.cols,
            data: self.data[..n * self.cols].to_vec(),
        }
    }

    /// Columns `[start, start + width)`.
    pub fn columns(&self, start: usize, width: usize) -> Matrix {
        assert!(start + width <= self.cols, "column slice out of range");
        let mut out = Matrix::zeros(self.rows, width);
        for r in 0..self.rows {
            out.row_mut(r)
                .copy_from_slice(&self.row(r)[start..start + width]);
        }
        out
    }

    /// Writes `block` into the columns starting at `start`.
    pub fn set_columns(&mut self, start: usize, block: &Matrix) {
        assert_eq!(self.rows, block.rows, "row count mismatch");
        assert!(start + block.cols <= self.cols, "column slice out of range");
        for r in 0..self.rows {
            let width = block.cols;
            self.row_mut(r)[start..start + width].copy_from_slice(block.row(r));
        }
    }

    /// Column-wise concatenation.
    pub fn hconcat(parts: &[&Matrix]) -> Matrix {
        let rows = parts.first().map_or(0, |m| m.rows);
        let cols = parts.iter().map(|m| m.cols).sum();
        let mut out = Matrix::zeros(rows, cols);
        let mut offset = 0;
        for part in parts {
            out.set_columns(offset, part);
            offset += part.cols;
        }
        out
    }

    /// Splits into blocks of the given widths; inverse of [`Matrix::hconcat`].
    pub fn split_columns(&self, widths: &[usize]) -> Vec<Matrix> {
        let mut offset = 0;
        widths
            .iter()
            .map(|&w| {
                let block = self.columns(offset, w);
                offset += w;
                block
            })
            .collect()
    }

    pub fn transpose(&self) -> Matrix {
        let mut out = Matrix::zeros(self.cols, self.rows);
        for r in 0..self.rows {
            for c in 0..self.cols {
                out.data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        out
    }

    /// self · rhs
    pub fn matmul(&self, rhs: &Matrix) -> Matrix {
        assert_eq!(self.cols, rhs.rows, "matmul inner dimension mismatch");
        let mut out = Matrix::zeros(self.rows, rhs.cols);
        for i in 0..self.rows {
            let a_row = &self.data[i * self.cols..(i + 1) * self.cols];
            let out_row = &mut out.data[i * rhs.cols..(i + 1) * rhs.cols];
            for (k, &a) in a_row.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                vec_add_scaled(out_row, rhs.row(k), a);
            }
        }
        out
    }

    /// self · rhsᵀ
    pub fn matmul_transposed(&self, rhs: &Matrix) -> Matrix {
        assert_eq!(self.cols, rhs.cols, "matmul_transposed dimension mismatch");
        let mut out = Matrix::zeros(self.rows, rhs.rows);
        for i in 0..self.rows {
            let a_row = self.row(i);
            for j in 0..rhs.rows {
                out.data[i * rhs.rows + j] = dot_product(a_row, rhs.row(j));
            }
        }
        out
    }

    /// selfᵀ · rhs
    pub fn transposed_matmul(&self, rhs: &Matrix) -> Matrix {
        assert_eq!(self.rows, rhs.rows, "transposed_matmul dimension mismatch");
        let mut out = Matrix::zeros(self.cols, rhs.cols);
        for r in 0..self.rows {
            let a_row = self.row(r);
            let b_row = rhs.row(r);
            for (i, &a) in a_row.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                vec_add_scaled(&mut out.data[i * rhs.cols..(i + 1) * rhs.cols], b_row, a);
            }
        }
        out
    }

    /// Adds a `1 × cols` bias to every row.
    pub fn add_row_vector(&mut self, bias: &Matrix) {
        assert_eq!(bias.rows, 1, "bias must be a row vector");
        assert_eq!(bias.cols, self.cols, "bias width mismatch");
        for r in 0..self.rows {
            vec_add_scaled(self.row_mut(r), &bias.data, 1.0);
        }
    }

    /// Column sums as a `1 × cols` row.
    pub fn column_sums(&self) -> Matrix {
        let mut out = Matrix::zeros(1, self.cols);
        for r in 0..self.rows {
            vec_add_scaled(&mut out.data, self.row(r), 1.0);
        }
        out
    }

    pub fn add_assign(&mut self, other: &Matrix) {
        assert_eq!(self.shape(), other.shape(), "add_assign shape mismatch");
        vec_add_scaled(&mut self.data, &other.data, 1.0);
    }

    pub fn scale(&mut self, factor: f64) {
        for v in self.data.iter_mut() {
            *v *= factor;
        }
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Matrix {
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    pub fn zip_map(&self, other: &Matrix, f: impl Fn(f64, f64) -> f64) -> Matrix {
        assert_eq!(self.shape(), other.shape(), "zip_map shape mismatch");
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
        }
    }

    pub fn sum_squares(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum()
    }

    pub fn is_finite(&self) -> bool {
        !has_invalid_values(&self.data)
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f64;

    fn index(&self, (r, c): (usize, usize)) -> &f64 {
        &self.data[r * self.cols + c]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut f64 {
        &mut self.data[r * self.cols + c]
    }
}

/// Dot product.
pub fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum()
}

/// `a += scale * b`
pub fn vec_add_scaled(a: &mut [f64], b: &[f64], scale: f64) {
    for (ai, &bi) in a.iter_mut().zip(b.iter()) {
        *ai += scale * bi;
    }
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Softmax shifted by the maximum.
pub fn softmax_in_place(values: &mut [f64]) {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in values.iter_mut() {
            *v /= sum;
        }
    }
}

/// Index of the maximum; the first one on ties.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}
