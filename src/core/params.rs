//! Model parameter storage shared by the model, its gradients, and optimizers.

use ndarray::{Array1, Array2, ArrayViewD, ArrayViewMutD};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;

use super::{ModelConfig, RnnError, RnnResult};

/// Every trainable tensor of a [`super::SequenceModel`].
///
/// The same struct doubles as the gradient container: gradients have exactly
/// the shapes of the parameters they belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    /// Embedding table, `(vocab_size, embedding_dim)`
    pub embedding: Array2<f32>,
    /// Update-gate input kernel, `(embedding_dim, units)`
    pub w_z: Array2<f32>,
    /// Reset-gate input kernel
    pub w_r: Array2<f32>,
    /// Candidate input kernel
    pub w_n: Array2<f32>,
    /// Update-gate recurrent kernel, `(units, units)`
    pub u_z: Array2<f32>,
    pub u_r: Array2<f32>,
    pub u_n: Array2<f32>,
    pub b_z: Array1<f32>,
    pub b_r: Array1<f32>,
    pub b_n: Array1<f32>,
    /// Projection to logits, `(units, vocab_size)`
    pub w_out: Array2<f32>,
    pub b_out: Array1<f32>,
}

/// Xavier/Glorot uniform: `U(-limit, limit)` with `limit = sqrt(6 / (fan_in + fan_out))`.
fn glorot<R: Rng + ?Sized>(fan_in: usize, fan_out: usize, rng: &mut R) -> Array2<f32> {
    let limit = (6.0f32 / (fan_in + fan_out) as f32).sqrt();
    Array2::random_using((fan_in, fan_out), Uniform::new(-limit, limit), rng)
}

impl Parameters {
    /// All-zero tensors shaped for `config`.
    #[must_use]
    pub fn zeros(config: &ModelConfig) -> Self {
        let (v, e, h) = (config.vocab_size, config.embedding_dim, config.rnn_hidden_units);
        Self {
            embedding: Array2::zeros((v, e)),
            w_z: Array2::zeros((e, h)),
            w_r: Array2::zeros((e, h)),
            w_n: Array2::zeros((e, h)),
            u_z: Array2::zeros((h, h)),
            u_r: Array2::zeros((h, h)),
            u_n: Array2::zeros((h, h)),
            b_z: Array1::zeros(h),
            b_r: Array1::zeros(h),
            b_n: Array1::zeros(h),
            w_out: Array2::zeros((h, v)),
            b_out: Array1::zeros(v),
        }
    }

    /// Random initialization.
    ///
    /// Input kernels and the projection use Glorot uniform. Recurrent kernels
    /// use a narrower `U(-1/sqrt(units), 1/sqrt(units))` so the initial
    /// recurrence is contractive. Embeddings draw from `U(-0.05, 0.05)`;
    /// biases start at zero.
    pub fn init<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> Self {
        let (v, e, h) = (config.vocab_size, config.embedding_dim, config.rnn_hidden_units);
        let rec_limit = 1.0 / (h as f32).sqrt();
        let rec = Uniform::new(-rec_limit, rec_limit);
        Self {
            embedding: Array2::random_using((v, e), Uniform::new(-0.05, 0.05), rng),
            w_z: glorot(e, h, rng),
            w_r: glorot(e, h, rng),
            w_n: glorot(e, h, rng),
            u_z: Array2::random_using((h, h), rec, rng),
            u_r: Array2::random_using((h, h), rec, rng),
            u_n: Array2::random_using((h, h), rec, rng),
            b_z: Array1::zeros(h),
            b_r: Array1::zeros(h),
            b_n: Array1::zeros(h),
            w_out: glorot(h, v, rng),
            b_out: Array1::zeros(v),
        }
    }

    /// Named read-only views of every tensor, in a fixed order.
    #[must_use]
    pub fn tensors(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)> {
        vec![
            ("embedding", self.embedding.view().into_dyn()),
            ("w_z", self.w_z.view().into_dyn()),
            ("w_r", self.w_r.view().into_dyn()),
            ("w_n", self.w_n.view().into_dyn()),
            ("u_z", self.u_z.view().into_dyn()),
            ("u_r", self.u_r.view().into_dyn()),
            ("u_n", self.u_n.view().into_dyn()),
            ("b_z", self.b_z.view().into_dyn()),
            ("b_r", self.b_r.view().into_dyn()),
            ("b_n", self.b_n.view().into_dyn()),
            ("w_out", self.w_out.view().into_dyn()),
            ("b_out", self.b_out.view().into_dyn()),
        ]
    }

    /// Mutable views in the same order as [`Parameters::tensors`].
    pub fn tensors_mut(&mut self) -> Vec<ArrayViewMutD<'_, f32>> {
        vec![
            self.embedding.view_mut().into_dyn(),
            self.w_z.view_mut().into_dyn(),
            self.w_r.view_mut().into_dyn(),
            self.w_n.view_mut().into_dyn(),
            self.u_z.view_mut().into_dyn(),
            self.u_r.view_mut().into_dyn(),
            self.u_n.view_mut().into_dyn(),
            self.b_z.view_mut().into_dyn(),
            self.b_r.view_mut().into_dyn(),
            self.b_n.view_mut().into_dyn(),
            self.w_out.view_mut().into_dyn(),
            self.b_out.view_mut().into_dyn(),
        ]
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.tensors().iter().map(|(_, t)| t.len()).sum()
    }

    /// Name of the first tensor holding a NaN or infinity.
    #[must_use]
    pub fn first_non_finite(&self) -> Option<&'static str> {
        self.tensors()
            .into_iter()
            .find(|(_, t)| t.iter().any(|v| !v.is_finite()))
            .map(|(name, _)| name)
    }

    /// Elementwise `self += other`.
    pub fn add_assign(&mut self, other: &Parameters) {
        for (mut dst, (_, src)) in self.tensors_mut().into_iter().zip(other.tensors()) {
            dst += &src;
        }
    }

    /// Multiply every tensor by `factor`.
    pub fn scale(&mut self, factor: f32) {
        for mut t in self.tensors_mut() {
            t.mapv_inplace(|v| v * factor);
        }
    }

    /// L2 norm over all tensors taken together.
    #[must_use]
    pub fn global_norm(&self) -> f32 {
        self.tensors()
            .iter()
            .map(|(_, t)| t.iter().map(|v| v * v).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    /// Rescale so the global norm is at most `max_norm`. Returns the norm
    /// before clipping.
    pub fn clip_global_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.global_norm();
        if norm > max_norm && norm > 0.0 {
            self.scale(max_norm / norm);
        }
        norm
    }

    /// Verify every tensor has the shape `config` implies.
    ///
    /// # Errors
    /// `ShapeMismatch` naming the first offending tensor.
    pub fn check_shapes(&self, config: &ModelConfig) -> RnnResult<()> {
        let expected = Self::zeros(config);
        for ((name, actual), (_, want)) in self.tensors().into_iter().zip(expected.tensors()) {
            if actual.shape() != want.shape() {
                return Err(RnnError::ShapeMismatch(format!(
                    "tensor `{name}` has shape {:?}, config requires {:?}",
                    actual.shape(),
                    want.shape()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> ModelConfig {
        ModelConfig {
            vocab_size: 7,
            embedding_dim: 3,
            rnn_hidden_units: 4,
        }
    }

    #[test]
    fn test_num_parameters() {
        let p = Parameters::zeros(&config());
        // 7*3 + 3*(3*4) + 3*(4*4) + 3*4 + 4*7 + 7
        assert_eq!(p.num_parameters(), 21 + 36 + 48 + 12 + 28 + 7);
    }

    #[test]
    fn test_init_is_seeded() {
        let a = Parameters::init(&config(), &mut StdRng::seed_from_u64(3));
        let b = Parameters::init(&config(), &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
        assert!(a.b_z.iter().all(|&v| v == 0.0));
        assert!(a.w_z.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_add_assign_and_scale() {
        let mut a = Parameters::init(&config(), &mut StdRng::seed_from_u64(1));
        let b = a.clone();
        a.add_assign(&b);
        a.scale(0.5);
        for ((_, x), (_, y)) in a.tensors().iter().zip(b.tensors().iter()) {
            for (u, v) in x.iter().zip(y.iter()) {
                assert_abs_diff_eq!(u, v, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_clip_global_norm() {
        let mut p = Parameters::zeros(&config());
        p.b_out.fill(3.0);
        let before = p.clip_global_norm(1.0);
        assert_abs_diff_eq!(before, (7.0f32 * 9.0).sqrt(), epsilon = 1e-5);
        assert_abs_diff_eq!(p.global_norm(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_first_non_finite() {
        let mut p = Parameters::init(&config(), &mut StdRng::seed_from_u64(2));
        assert_eq!(p.first_non_finite(), None);
        p.u_r[[1, 2]] = f32::INFINITY;
        p.b_out[0] = f32::NAN;
        assert_eq!(p.first_non_finite(), Some("u_r"));
    }

    #[test]
    fn test_check_shapes() {
        let p = Parameters::zeros(&config());
        assert!(p.check_shapes(&config()).is_ok());
        let mut other = config();
        other.rnn_hidden_units = 5;
        assert!(p.check_shapes(&other).is_err());
    }
}
