use ndarray::{Array2, ArrayView1, ArrayView2};

use super::LossFn;
use crate::{MlErr, Result};

/// Softmax cross-entropy loss over raw class scores.
#[derive(Default, Clone, Copy, Debug)]
pub struct CrossEntropy;

impl CrossEntropy {
    /// Returns a new `CrossEntropy`.
    pub fn new() -> Self {
        Self
    }
}

impl LossFn for CrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, labels: &[usize]) -> Result<f32> {
        check_labels(y_pred, labels)?;

        if labels.is_empty() {
            return Ok(0.);
        }

        let total: f32 = y_pred
            .rows()
            .into_iter()
            .zip(labels)
            .map(|(row, &label)| log_sum_exp(row) - row[label])
            .sum();

        Ok(total / labels.len() as f32)
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, labels: &[usize]) -> Result<Array2<f32>> {
        check_labels(y_pred, labels)?;

        let mut p = softmax(y_pred);

        for (mut row, &label) in p.rows_mut().into_iter().zip(labels) {
            row[label] -= 1.;
        }

        if !labels.is_empty() {
            p /= labels.len() as f32;
        }

        Ok(p)
    }
}

/// Counts the rows whose highest score is at the expected label.
pub fn top1_correct(y_pred: ArrayView2<f32>, labels: &[usize]) -> usize {
    let mut correct = 0;

    for (row, &label) in y_pred.rows().into_iter().zip(labels) {
        if argmax(row) == Some(label) {
            correct += 1;
        }
    }

    correct
}

fn argmax(row: ArrayView1<f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;

    for (i, &v) in row.iter().enumerate() {
        match best {
            Some((_, bv)) if bv >= v => {}
            _ => best = Some((i, v)),
        }
    }

    best.map(|(i, _)| i)
}

fn log_sum_exp(row: ArrayView1<f32>) -> f32 {
    let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    max + row.mapv(|v| (v - max).exp()).sum().ln()
}

fn softmax(y_pred: ArrayView2<f32>) -> Array2<f32> {
    let mut p = y_pred.to_owned();

    for mut row in p.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }

    p
}

fn check_labels(y_pred: ArrayView2<f32>, labels: &[usize]) -> Result<()> {
    if y_pred.nrows() != labels.len() {
        return Err(MlErr::SizeMismatch {
            what: "labels",
            got: labels.len(),
            expected: y_pred.nrows(),
        });
    }

    let classes = y_pred.ncols();

    match labels.iter().find(|&&label| label >= classes) {
        Some(&label) => Err(MlErr::LabelOutOfRange { label, classes }),
        None => Ok(()),
    }
}
