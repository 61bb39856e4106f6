//! Gradient-descent optimizers.
//!
//! ## Adam
//!
//! ```text
//! m = β₁ * m + (1 - β₁) * g
//! v = β₂ * v + (1 - β₂) * g²
//! m_hat = m / (1 - β₁^t)
//! v_hat = v / (1 - β₂^t)
//! θ = θ - α * m_hat / (√v_hat + ε)
//! ```
//!
//! Moment tensors mirror [`Parameters`] exactly, so every parameter has its
//! own state.

use ndarray::{ArrayViewD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::core::{ModelConfig, Parameters, RnnError};

/// Tensors above this size are updated with rayon.
const PARALLEL_THRESHOLD: usize = 4096;

/// Which optimizer to train with, and its hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum OptimizerSpec {
    Adam {
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
    Sgd {
        learning_rate: f32,
    },
}

impl OptimizerSpec {
    /// Adam with the usual defaults (1e-3, 0.9, 0.999, 1e-7).
    #[must_use]
    pub fn adam() -> Self {
        Self::Adam {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
        }
    }

    /// Plain SGD at 0.01.
    #[must_use]
    pub fn sgd() -> Self {
        Self::Sgd {
            learning_rate: 0.01,
        }
    }

    /// Same optimizer with a different learning rate.
    #[must_use]
    pub fn with_learning_rate(self, lr: f32) -> Self {
        match self {
            Self::Adam {
                beta1,
                beta2,
                epsilon,
                ..
            } => Self::Adam {
                learning_rate: lr,
                beta1,
                beta2,
                epsilon,
            },
            Self::Sgd { .. } => Self::Sgd { learning_rate: lr },
        }
    }

    #[must_use]
    pub fn learning_rate(&self) -> f32 {
        match *self {
            Self::Adam { learning_rate, .. } | Self::Sgd { learning_rate } => learning_rate,
        }
    }

    /// Fresh optimizer state for a model of shape `config`.
    #[must_use]
    pub fn build(&self, config: &ModelConfig) -> Optimizer {
        match *self {
            Self::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => Optimizer::Adam(Adam {
                m: Parameters::zeros(config),
                v: Parameters::zeros(config),
                learning_rate,
                beta1,
                beta2,
                epsilon,
                step: 0,
            }),
            Self::Sgd { learning_rate } => Optimizer::Sgd { learning_rate },
        }
    }
}

impl Default for OptimizerSpec {
    fn default() -> Self {
        Self::adam()
    }
}

impl FromStr for OptimizerSpec {
    type Err = RnnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::adam()),
            "sgd" => Ok(Self::sgd()),
            other => Err(RnnError::UnknownSpec {
                kind: "optimizer",
                name: other.to_string(),
            }),
        }
    }
}

/// Adam moment estimates and hyperparameters.
#[derive(Debug, Clone)]
pub struct Adam {
    m: Parameters,
    v: Parameters,
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
}

impl Adam {
    /// Number of updates applied so far.
    #[must_use]
    pub fn steps(&self) -> i32 {
        self.step
    }
}

/// Live optimizer state.
#[derive(Debug, Clone)]
pub enum Optimizer {
    Adam(Adam),
    Sgd { learning_rate: f32 },
}

impl Optimizer {
    /// Apply one update of `grads` to `params`.
    pub fn step(&mut self, params: &mut Parameters, grads: &Parameters) {
        match self {
            Optimizer::Sgd { learning_rate } => {
                let lr = *learning_rate;
                for (p, (_, g)) in params.tensors_mut().into_iter().zip(grads.tensors()) {
                    sgd_update(p, g, lr);
                }
            }
            Optimizer::Adam(adam) => {
                adam.step += 1;
                let bias1 = 1.0 - adam.beta1.powi(adam.step);
                let bias2 = 1.0 - adam.beta2.powi(adam.step);
                let hp = AdamHyper {
                    lr: adam.learning_rate,
                    beta1: adam.beta1,
                    beta2: adam.beta2,
                    epsilon: adam.epsilon,
                    bias1,
                    bias2,
                };
                let tensors = params
                    .tensors_mut()
                    .into_iter()
                    .zip(adam.m.tensors_mut())
                    .zip(adam.v.tensors_mut())
                    .zip(grads.tensors());
                for (((p, m), v), (_, g)) in tensors {
                    adam_update(p, m, v, g, &hp);
                }
            }
        }
    }
}

struct AdamHyper {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    bias1: f32,
    bias2: f32,
}

fn sgd_update(p: ArrayViewMutD<'_, f32>, g: ArrayViewD<'_, f32>, lr: f32) {
    let zip = Zip::from(p).and(g);
    let update = |p: &mut f32, &g: &f32| *p -= lr * g;
    zip.for_each(update);
}

fn adam_update(
    p: ArrayViewMutD<'_, f32>,
    m: ArrayViewMutD<'_, f32>,
    v: ArrayViewMutD<'_, f32>,
    g: ArrayViewD<'_, f32>,
    hp: &AdamHyper,
) {
    let parallel = p.len() > PARALLEL_THRESHOLD;
    let update = |p: &mut f32, m: &mut f32, v: &mut f32, &g: &f32| {
        *m = hp.beta1 * *m + (1.0 - hp.beta1) * g;
        *v = hp.beta2 * *v + (1.0 - hp.beta2) * g * g;
        let m_hat = *m / hp.bias1;
        let v_hat = *v / hp.bias2;
        *p -= hp.lr * m_hat / (v_hat.sqrt() + hp.epsilon);
    };
    let zip = Zip::from(p).and(m).and(v).and(g);
    if parallel {
        zip.par_for_each(update);
    } else {
        zip.for_each(update);
    }
}
