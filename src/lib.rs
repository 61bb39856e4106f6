//! # charnn
//!
//! Character-level recurrent text generation, trained on one user's replies.
//!
//! ## Overview
//!
//! A corpus is mapped to a character [`Vocabulary`], sliced into windowed
//! (input, target) pairs, and used to train a GRU [`SequenceModel`]. The
//! trained model, its vocabulary and the hyperparameters it was trained
//! with are persisted together; a [`TextSampler`] later generates text one
//! character at a time, carrying the recurrent state between steps.
//!
//! ## Structure
//!
//! - [`core`]: Model parameters, forward passes, backpropagation through time
//! - [`data`]: Corpus files, vocabulary, windowed dataset construction
//! - [`training`]: Training loop, optimizers, early stopping
//! - [`sampler`]: Stateful temperature sampling
//! - [`checkpoint`]: Persisted model bundle and config sidecar
//! - [`events`]: Event sinks used for logging
//! - [`utils`]: Activations, softmax, small statistics helpers

pub mod checkpoint;
pub mod core;
pub mod data;
pub mod events;
pub mod sampler;
pub mod training;
pub mod utils;

pub use crate::core::{HiddenState, ModelConfig, Recurrent, RnnError, RnnResult, SequenceModel};
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointStats, LoadedModel};
pub use data::{make_dataset, Dataset, DatasetConfig, Vocabulary};
pub use events::{EventSink, MemorySink, NullSink, TracingSink};
pub use sampler::{sample_categorical, SamplingSession, TextSampler};
pub use training::{
    train, EpochMetrics, LossSpec, OptimizerSpec, TrainConfig, TrainingReport,
};

use serde::{Deserialize, Serialize};

/// Hyperparameters of one training invocation.
///
/// Persisted beside every checkpoint. A checkpoint is reused only when the
/// requested record is [compatible](ConfigRecord::is_compatible) with the
/// stored one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigRecord {
    pub seq_length: usize,
    pub batch_size: usize,
    pub embedding_dim: usize,
    pub rnn_hidden_units: usize,
    /// Loss name, e.g. `sparse_categorical_crossentropy`.
    pub loss: String,
    /// Optimizer name, `adam` or `sgd`.
    pub optimizer: String,
    pub epochs: usize,
    pub val_frac: f64,
    pub es_patience: usize,
}

impl Default for ConfigRecord {
    fn default() -> Self {
        Self {
            seq_length: 100,
            batch_size: 4,
            embedding_dim: 256,
            rnn_hidden_units: 128,
            loss: "sparse_categorical_crossentropy".to_string(),
            optimizer: "adam".to_string(),
            epochs: 20,
            val_frac: 0.1,
            es_patience: 5,
        }
    }
}

impl ConfigRecord {
    /// Exact equality of every hyperparameter.
    #[must_use]
    pub fn is_compatible(&self, other: &ConfigRecord) -> bool {
        self == other
    }

    /// Human-readable list of fields that differ, `stored -> requested`.
    #[must_use]
    pub fn differences(&self, other: &ConfigRecord) -> Vec<String> {
        let mut diffs = Vec::new();
        macro_rules! cmp {
            ($($field:ident),*) => {
                $(
                    if self.$field != other.$field {
                        diffs.push(format!(
                            "{}: {:?} -> {:?}",
                            stringify!($field),
                            self.$field,
                            other.$field
                        ));
                    }
                )*
            };
        }
        cmp!(
            seq_length,
            batch_size,
            embedding_dim,
            rnn_hidden_units,
            loss,
            optimizer,
            epochs,
            val_frac,
            es_patience
        );
        diffs
    }

    #[must_use]
    pub fn model_config(&self, vocab_size: usize) -> ModelConfig {
        ModelConfig {
            vocab_size,
            embedding_dim: self.embedding_dim,
            rnn_hidden_units: self.rnn_hidden_units,
        }
    }

    #[must_use]
    pub fn dataset_config(&self) -> DatasetConfig {
        DatasetConfig {
            seq_length: self.seq_length,
            batch_size: self.batch_size,
            val_frac: self.val_frac,
            ..DatasetConfig::default()
        }
    }

    /// # Errors
    /// `UnknownSpec` if the loss or optimizer name is not recognised.
    pub fn train_config(&self) -> RnnResult<TrainConfig> {
        Ok(TrainConfig {
            epochs: self.epochs,
            es_patience: self.es_patience,
            loss: self.loss.parse()?,
            optimizer: self.optimizer.parse()?,
            ..TrainConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_record() {
        let record = ConfigRecord::default();
        assert_eq!(record.seq_length, 100);
        assert_eq!(record.batch_size, 4);
        assert_eq!(record.embedding_dim, 256);
        assert_eq!(record.rnn_hidden_units, 128);
        let train = record.train_config().unwrap();
        assert_eq!(train.epochs, 20);
        assert_eq!(train.es_patience, 5);
        assert_eq!(train.optimizer, OptimizerSpec::adam());
        assert_eq!(train.loss, LossSpec::SparseCategoricalCrossentropy { from_logits: true });
    }

    #[test]
    fn test_embedding_dim_mismatch_is_incompatible() {
        let stored = ConfigRecord {
            embedding_dim: 256,
            rnn_hidden_units: 128,
            ..ConfigRecord::default()
        };
        let requested = ConfigRecord {
            embedding_dim: 64,
            rnn_hidden_units: 128,
            ..ConfigRecord::default()
        };
        assert!(!stored.is_compatible(&requested));
        assert_eq!(stored.differences(&requested), vec!["embedding_dim: 256 -> 64"]);
        assert!(stored.is_compatible(&stored.clone()));
    }

    #[test]
    fn test_partial_record_fills_defaults() {
        let record: ConfigRecord =
            serde_json::from_str(r#"{"embedding_dim": 32, "rnn_hidden_units": 16}"#).unwrap();
        assert_eq!(record.embedding_dim, 32);
        assert_eq!(record.seq_length, 100);
        assert_eq!(record.model_config(10).rnn_hidden_units, 16);
    }

    #[test]
    fn test_unknown_optimizer() {
        let record = ConfigRecord {
            optimizer: "adagrad".to_string(),
            ..ConfigRecord::default()
        };
        assert!(matches!(
            record.train_config(),
            Err(RnnError::UnknownSpec { kind: "optimizer", .. })
        ));
    }
}
