//! Math utilities: gate activations, softmax, and small statistics helpers.

use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Logistic sigmoid.
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Derivative of the sigmoid expressed through its output `s = sigmoid(x)`.
#[inline]
pub fn d_sigmoid_from_output(s: f32) -> f32 {
    s * (1.0 - s)
}

/// Derivative of tanh expressed through its output `t = tanh(x)`.
#[inline]
pub fn d_tanh_from_output(t: f32) -> f32 {
    1.0 - t * t
}

/// Numerically stable softmax over a logit vector.
///
/// The maximum logit is subtracted before exponentiation so large logits
/// (e.g. after dividing by a small temperature) never overflow.
#[must_use]
pub fn softmax(logits: ArrayView1<f32>) -> Array1<f32> {
    let max_val = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps = logits.mapv(|x| (x - max_val).exp());
    let sum = exps.sum();
    exps / sum
}

/// Row-wise log-softmax of a `(rows, classes)` matrix.
#[must_use]
pub fn log_softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum = row.iter().map(|&x| (x - max_val).exp()).sum::<f32>().ln() + max_val;
        row.mapv_inplace(|x| x - log_sum);
    }
    out
}

/// Index of the largest element (first one on ties), `None` for an empty view.
#[must_use]
pub fn argmax(values: ArrayView1<f32>) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            a.partial_cmp(b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ib.cmp(ia))
        })
        .map(|(i, _)| i)
}

/// Shannon entropy (nats) of the empirical distribution given by `counts`.
#[must_use]
pub fn entropy(counts: &[usize]) -> f32 {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f32 / total as f32;
            -p * p.ln()
        })
        .sum()
}
