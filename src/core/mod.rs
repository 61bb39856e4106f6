//! Core sequence model: embedding -> GRU -> dense projection.
//!
//! This module provides the model structures and both call modes:
//! - `forward_train`: full windows, zero initial state, logits for every timestep
//! - `forward_infer`: arbitrary-length input plus an optional carried hidden state,
//!   returning logits and the final state for the next call
//!
//! ## Recurrence
//!
//! ```text
//! z  = σ(x·Wz + h·Uz + bz)            update gate
//! r  = σ(x·Wr + h·Ur + br)            reset gate
//! n  = tanh(x·Wn + bn + r ⊙ (h·Un))   candidate
//! h' = z ⊙ h + (1 - z) ⊙ n
//! ```
//!
//! Logits at each step are `h'·Wout + bout`.

mod bptt;
pub mod params;

pub use params::Parameters;

use ndarray::{s, Array2, Array3, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::utils::sigmoid;

/// Error type for every fallible operation in the crate.
#[derive(Debug, Error)]
pub enum RnnError {
    /// Tensor or index shape does not match the model configuration.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Invalid hyperparameters or component configuration.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// The corpus is too short to produce a single training example.
    #[error("Empty dataset: {0}")]
    EmptyDataset(String),

    /// Temperature must be finite and strictly positive.
    #[error("Invalid temperature {0}: must be a finite value > 0")]
    InvalidTemperature(f32),

    /// No corpus file exists (or it is unreadable) for the identifier.
    #[error("No corpus for `{identifier}` at {}: {source}", .path.display())]
    MissingCorpus {
        identifier: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No trained model exists for the identifier.
    #[error("No trained model for `{identifier}` at {}; train before sampling", .path.display())]
    MissingCheckpoint { identifier: String, path: PathBuf },

    /// Persisted configuration record differs from the requested one.
    #[error("Config mismatch: {0}")]
    ConfigMismatch(String),

    /// Filesystem failure.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unknown loss or optimizer name.
    #[error("Unknown {kind}: {name}")]
    UnknownSpec { kind: &'static str, name: String },
}

pub type RnnResult<T> = Result<T, RnnError>;

/// Architecture hyperparameters that determine every tensor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub rnn_hidden_units: usize,
}

impl ModelConfig {
    /// # Errors
    /// `InvalidConfig` if any dimension is zero.
    pub fn validate(&self) -> RnnResult<()> {
        if self.vocab_size == 0 || self.embedding_dim == 0 || self.rnn_hidden_units == 0 {
            return Err(RnnError::InvalidConfig(format!(
                "all model dimensions must be non-zero, got {self:?}"
            )));
        }
        Ok(())
    }
}

/// Recurrent hidden state for a batch, shape `(batch, rnn_hidden_units)`.
///
/// Owned by whoever drives generation; passed by value into each inference
/// step and replaced by the state that step returns.
#[derive(Debug, Clone, PartialEq)]
pub struct HiddenState(Array2<f32>);

impl HiddenState {
    /// The default initial state: all zeros.
    #[must_use]
    pub fn zeros(batch_size: usize, units: usize) -> Self {
        Self(Array2::zeros((batch_size, units)))
    }

    #[must_use]
    pub fn from_array(h: Array2<f32>) -> Self {
        Self(h)
    }

    #[must_use]
    pub fn as_array(&self) -> &Array2<f32> {
        &self.0
    }

    #[must_use]
    pub fn into_array(self) -> Array2<f32> {
        self.0
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.0.nrows()
    }

    #[must_use]
    pub fn units(&self) -> usize {
        self.0.ncols()
    }
}

/// Single-step stateful inference, the seam the text sampler drives.
///
/// Implementations must not mutate shared state: everything carried between
/// calls travels through the returned [`HiddenState`].
pub trait Recurrent: Send + Sync {
    /// Number of logits produced per timestep.
    fn vocab_size(&self) -> usize;

    /// Run `inputs` (shape `(batch, time)`) starting from `state`, or from the
    /// default initial state when `None`. Returns logits of shape
    /// `(batch, time, vocab_size)` and the final hidden state.
    ///
    /// # Errors
    /// Implementations report malformed inputs or states.
    fn forward_infer(
        &self,
        inputs: &Array2<usize>,
        state: Option<HiddenState>,
    ) -> RnnResult<(Array3<f32>, HiddenState)>;
}

/// Per-timestep activations kept for backpropagation through time.
#[derive(Debug, Clone)]
pub(crate) struct StepCache {
    /// Embedded input, `(batch, embedding_dim)`
    pub x: Array2<f32>,
    /// State entering the step
    pub h_prev: Array2<f32>,
    pub z: Array2<f32>,
    pub r: Array2<f32>,
    pub n: Array2<f32>,
    /// `h_prev · Un` before the reset gate is applied
    pub hu: Array2<f32>,
    /// State leaving the step
    pub h: Array2<f32>,
}

/// Output of a full forward pass.
pub(crate) struct ForwardPass {
    pub logits: Array3<f32>,
    pub h: Array2<f32>,
    pub steps: Vec<StepCache>,
}

/// Character-level GRU language model.
///
/// # Architecture
///
/// - **Embedding:** `(vocab_size, embedding_dim)` lookup table
/// - **GRU:** input kernels `(embedding_dim, units)`, recurrent kernels `(units, units)`
/// - **Projection:** `(units, vocab_size)` plus bias
///
/// Parameters are only changed by the training procedure; inference takes
/// `&self`, so one loaded model can serve any number of concurrent sessions.
#[derive(Debug, Clone)]
pub struct SequenceModel {
    config: ModelConfig,
    params: Parameters,
}

impl SequenceModel {
    /// Create a freshly initialized model.
    ///
    /// # Errors
    /// `InvalidConfig` if any dimension is zero.
    pub fn new<R: Rng + ?Sized>(config: ModelConfig, rng: &mut R) -> RnnResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            params: Parameters::init(&config, rng),
        })
    }

    /// Wrap existing parameters, checking every tensor against `config`.
    ///
    /// # Errors
    /// `InvalidConfig` for zero dimensions, `ShapeMismatch` for any tensor
    /// whose shape disagrees with `config`.
    pub fn from_parameters(config: ModelConfig, params: Parameters) -> RnnResult<Self> {
        config.validate()?;
        params.check_shapes(&config)?;
        Ok(Self { config, params })
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    #[must_use]
    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    /// Training-mode forward pass: zero initial state, state discarded.
    ///
    /// # Errors
    /// `ShapeMismatch` if any index is outside the vocabulary.
    pub fn forward_train(&self, inputs: &Array2<usize>) -> RnnResult<Array3<f32>> {
        let h0 = Array2::zeros((inputs.nrows(), self.config.rnn_hidden_units));
        Ok(self.run(inputs, h0, false)?.logits)
    }

    /// Inference-mode forward pass with an explicitly carried state.
    ///
    /// # Errors
    /// `ShapeMismatch` if any index is outside the vocabulary or the state
    /// does not have shape `(batch, rnn_hidden_units)`.
    pub fn forward_infer(
        &self,
        inputs: &Array2<usize>,
        state: Option<HiddenState>,
    ) -> RnnResult<(Array3<f32>, HiddenState)> {
        let h0 = match state {
            Some(state) => {
                let expected = (inputs.nrows(), self.config.rnn_hidden_units);
                if state.as_array().dim() != expected {
                    return Err(RnnError::ShapeMismatch(format!(
                        "hidden state has shape {:?}, expected {:?}",
                        state.as_array().dim(),
                        expected
                    )));
                }
                state.into_array()
            }
            None => Array2::zeros((inputs.nrows(), self.config.rnn_hidden_units)),
        };
        let pass = self.run(inputs, h0, false)?;
        Ok((pass.logits, HiddenState(pass.h)))
    }

    fn check_indices(&self, inputs: &Array2<usize>) -> RnnResult<()> {
        if let Some(&bad) = inputs.iter().find(|&&i| i >= self.config.vocab_size) {
            return Err(RnnError::ShapeMismatch(format!(
                "input index {bad} outside vocabulary of size {}",
                self.config.vocab_size
            )));
        }
        Ok(())
    }

    /// Look up the embeddings for column `t` of `inputs`.
    fn embed(&self, inputs: &Array2<usize>, t: usize) -> Array2<f32> {
        let mut x = Array2::zeros((inputs.nrows(), self.config.embedding_dim));
        for (mut row, &idx) in x.axis_iter_mut(Axis(0)).zip(inputs.column(t)) {
            row.assign(&self.params.embedding.row(idx));
        }
        x
    }

    fn gru_step(&self, x: Array2<f32>, h_prev: Array2<f32>) -> StepCache {
        let p = &self.params;
        let z = (x.dot(&p.w_z) + h_prev.dot(&p.u_z) + &p.b_z).mapv(sigmoid);
        let r = (x.dot(&p.w_r) + h_prev.dot(&p.u_r) + &p.b_r).mapv(sigmoid);
        let hu = h_prev.dot(&p.u_n);
        let n = (x.dot(&p.w_n) + &p.b_n + &r * &hu).mapv(f32::tanh);
        let h = &z * &h_prev + &z.mapv(|v| 1.0 - v) * &n;
        StepCache {
            x,
            h_prev,
            z,
            r,
            n,
            hu,
            h,
        }
    }

    /// Unroll the recurrence over every timestep of `inputs`.
    pub(crate) fn run(
        &self,
        inputs: &Array2<usize>,
        h0: Array2<f32>,
        keep_cache: bool,
    ) -> RnnResult<ForwardPass> {
        self.check_indices(inputs)?;
        let (batch, time) = inputs.dim();
        let mut logits = Array3::zeros((batch, time, self.config.vocab_size));
        let mut steps = Vec::with_capacity(if keep_cache { time } else { 0 });
        let mut h = h0;

        for t in 0..time {
            let x = self.embed(inputs, t);
            let step = self.gru_step(x, h);
            let out = step.h.dot(&self.params.w_out) + &self.params.b_out;
            logits.slice_mut(s![.., t, ..]).assign(&out);
            h = step.h.clone();
            if keep_cache {
                steps.push(step);
            }
        }

        Ok(ForwardPass { logits, h, steps })
    }
}

impl Recurrent for SequenceModel {
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward_infer(
        &self,
        inputs: &Array2<usize>,
        state: Option<HiddenState>,
    ) -> RnnResult<(Array3<f32>, HiddenState)> {
        SequenceModel::forward_infer(self, inputs, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_model() -> SequenceModel {
        let config = ModelConfig {
            vocab_size: 5,
            embedding_dim: 4,
            rnn_hidden_units: 6,
        };
        SequenceModel::new(config, &mut StdRng::seed_from_u64(7)).unwrap()
    }

    #[test]
    fn test_invalid_dims() {
        let config = ModelConfig {
            vocab_size: 0,
            embedding_dim: 4,
            rnn_hidden_units: 6,
        };
        let result = SequenceModel::new(config, &mut StdRng::seed_from_u64(0));
        assert!(matches!(result, Err(RnnError::InvalidConfig(_))));
    }

    #[test]
    fn test_forward_train_shape() {
        let model = tiny_model();
        let inputs = array![[0, 1, 2], [3, 4, 0]];
        let logits = model.forward_train(&inputs).unwrap();
        assert_eq!(logits.dim(), (2, 3, 5));
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_infer_returns_state() {
        let model = tiny_model();
        let (logits, state) = model.forward_infer(&array![[1, 2]], None).unwrap();
        assert_eq!(logits.dim(), (1, 2, 5));
        assert_eq!(state.batch_size(), 1);
        assert_eq!(state.units(), 6);
    }

    #[test]
    fn test_train_and_infer_agree_from_zero_state() {
        let model = tiny_model();
        let inputs = array![[4, 3, 2, 1]];
        let train_logits = model.forward_train(&inputs).unwrap();
        let (infer_logits, _) = model.forward_infer(&inputs, None).unwrap();
        for (a, b) in train_logits.iter().zip(infer_logits.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_carried_state_equals_full_replay() {
        // Feeding one index at a time while carrying state must reproduce the
        // last-step logits of a single pass over the whole sequence.
        let model = tiny_model();
        let seq = [0usize, 3, 1, 4, 2];
        let full = Array2::from_shape_vec((1, seq.len()), seq.to_vec()).unwrap();
        let (full_logits, full_state) = model.forward_infer(&full, None).unwrap();

        let mut state = None;
        let mut last = None;
        for &idx in &seq {
            let (logits, next) = model.forward_infer(&array![[idx]], state).unwrap();
            last = Some(logits);
            state = Some(next);
        }
        let last = last.unwrap();
        for v in 0..5 {
            assert_abs_diff_eq!(last[[0, 0, v]], full_logits[[0, 4, v]], epsilon = 1e-5);
        }
        let state = state.unwrap();
        for (a, b) in state.as_array().iter().zip(full_state.as_array().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_out_of_vocab_index_rejected() {
        let model = tiny_model();
        let result = model.forward_train(&array![[0, 5]]);
        assert!(matches!(result, Err(RnnError::ShapeMismatch(_))));
    }

    #[test]
    fn test_wrong_state_shape_rejected() {
        let model = tiny_model();
        let state = HiddenState::zeros(1, 3);
        let result = model.forward_infer(&array![[0]], Some(state));
        assert!(matches!(result, Err(RnnError::ShapeMismatch(_))));
    }

    #[test]
    fn test_from_parameters_checks_shapes() {
        let model = tiny_model();
        let wrong = ModelConfig {
            vocab_size: 5,
            embedding_dim: 8,
            rnn_hidden_units: 6,
        };
        let result = SequenceModel::from_parameters(wrong, model.params().clone());
        assert!(matches!(result, Err(RnnError::ShapeMismatch(_))));
    }
}
