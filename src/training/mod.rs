//! Training loop, early stopping, and metrics.
//!
//! Each epoch visits every training batch once (in a fresh random order),
//! computing gradients for the rows of a batch in parallel with rayon and
//! applying one optimizer step per batch. When validation batches are
//! given, validation loss drives early stopping.

pub mod optimizer;

pub use optimizer::{Optimizer, OptimizerSpec};

use ndarray::s;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Instant;

use crate::core::{Parameters, RnnError, RnnResult, SequenceModel};
use crate::data::Batch;
use crate::events::EventSink;

/// Classification loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossSpec {
    /// Cross-entropy against integer targets. `from_logits` says the model
    /// output is unnormalized scores rather than probabilities.
    SparseCategoricalCrossentropy { from_logits: bool },
}

impl Default for LossSpec {
    fn default() -> Self {
        Self::SparseCategoricalCrossentropy { from_logits: true }
    }
}

impl LossSpec {
    /// # Errors
    /// `InvalidConfig` when `from_logits` is false: the model only emits logits.
    pub fn validate(&self) -> RnnResult<()> {
        match self {
            Self::SparseCategoricalCrossentropy { from_logits: true } => Ok(()),
            Self::SparseCategoricalCrossentropy { from_logits: false } => {
                Err(RnnError::InvalidConfig(
                    "sparse categorical crossentropy must be computed from logits".to_string(),
                ))
            }
        }
    }
}

impl FromStr for LossSpec {
    type Err = RnnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sparse_categorical_crossentropy" => Ok(Self::default()),
            other => Err(RnnError::UnknownSpec {
                kind: "loss",
                name: other.to_string(),
            }),
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    /// Upper bound on full passes over the training batches.
    pub epochs: usize,
    /// Epochs without validation improvement before stopping.
    pub es_patience: usize,
    pub loss: LossSpec,
    pub optimizer: OptimizerSpec,
    /// Clip each batch gradient to this global L2 norm.
    pub clip_norm: Option<f32>,
    /// Put back the parameters from the best validation epoch when stopping.
    pub restore_best_weights: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            es_patience: 5,
            loss: LossSpec::default(),
            optimizer: OptimizerSpec::default(),
            clip_norm: Some(5.0),
            restore_best_weights: false,
        }
    }
}

/// Metrics for one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch number.
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: Option<f32>,
    pub elapsed_secs: f32,
}

/// Outcome of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub history: Vec<EpochMetrics>,
    pub stopped_early: bool,
    pub best_val_loss: Option<f32>,
    pub best_epoch: Option<usize>,
}

impl TrainingReport {
    #[must_use]
    pub fn epochs_run(&self) -> usize {
        self.history.len()
    }

    #[must_use]
    pub fn final_train_loss(&self) -> Option<f32> {
        self.history.last().map(|m| m.train_loss)
    }
}

/// Early-stopping monitor on validation loss (lower is better).
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: Option<f32>,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    #[must_use]
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: None,
            best_epoch: None,
            wait: 0,
        }
    }

    /// Record an epoch's validation loss. Returns `true` if it improved on
    /// the best seen so far.
    pub fn observe(&mut self, epoch: usize, val_loss: f32) -> bool {
        let improved = self.best.map_or(true, |best| val_loss < best);
        if improved {
            self.best = Some(val_loss);
            self.best_epoch = Some(epoch);
            self.wait = 0;
        } else {
            self.wait += 1;
        }
        improved
    }

    /// True once `patience` consecutive epochs passed without improvement.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.wait > 0 && self.wait >= self.patience
    }

    #[must_use]
    pub fn best(&self) -> Option<f32> {
        self.best
    }

    #[must_use]
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

/// Mean loss and gradient over a batch, one rayon task per row.
///
/// Per-row gradients are summed in row order, so results do not depend on
/// thread scheduling.
///
/// # Errors
/// Propagates shape errors from the model.
pub fn batch_gradients(model: &SequenceModel, batch: &Batch) -> RnnResult<(f32, Parameters)> {
    let rows = batch.size();
    if rows == 0 {
        return Err(RnnError::ShapeMismatch("empty batch".to_string()));
    }
    let per_row = (0..rows)
        .into_par_iter()
        .map(|i| {
            let inputs = batch.inputs.slice(s![i..=i, ..]).to_owned();
            let targets = batch.targets.slice(s![i..=i, ..]).to_owned();
            model.loss_and_gradients(&inputs, &targets)
        })
        .collect::<RnnResult<Vec<_>>>()?;
    let mut loss_sum = 0.0f32;
    let mut grads = Parameters::zeros(model.config());
    for (loss, g) in &per_row {
        loss_sum += *loss;
        grads.add_assign(g);
    }
    let scale = 1.0 / rows as f32;
    grads.scale(scale);
    Ok((loss_sum * scale, grads))
}

/// Mean loss over `batches`.
///
/// # Errors
/// `EmptyDataset` for no batches; model shape errors.
pub fn evaluate(model: &SequenceModel, batches: &[Batch]) -> RnnResult<f32> {
    if batches.is_empty() {
        return Err(RnnError::EmptyDataset("no batches to evaluate".to_string()));
    }
    let losses = batches
        .par_iter()
        .map(|b| model.evaluate_loss(&b.inputs, &b.targets))
        .collect::<RnnResult<Vec<f32>>>()?;
    Ok(losses.iter().sum::<f32>() / batches.len() as f32)
}

/// One pass over `batches` in the given order. Returns the mean batch loss.
///
/// # Errors
/// `EmptyDataset` for no batches; model shape errors.
pub fn train_epoch(
    model: &mut SequenceModel,
    optimizer: &mut Optimizer,
    batches: &[&Batch],
    clip_norm: Option<f32>,
) -> RnnResult<f32> {
    if batches.is_empty() {
        return Err(RnnError::EmptyDataset("no training batches".to_string()));
    }
    let mut total = 0.0;
    for batch in batches {
        let (loss, mut grads) = batch_gradients(model, batch)?;
        if let Some(max_norm) = clip_norm {
            grads.clip_global_norm(max_norm);
        }
        optimizer.step(model.params_mut(), &grads);
        total += loss;
    }
    Ok(total / batches.len() as f32)
}

/// Train `model` on `train_batches`, stopping at `config.epochs` or earlier
/// when validation loss stops improving.
///
/// # Errors
/// `InvalidConfig` for an unusable loss spec, `EmptyDataset` for no
/// training batches, and model shape errors.
pub fn train<R: Rng + ?Sized>(
    model: &mut SequenceModel,
    train_batches: &[Batch],
    validation: Option<&[Batch]>,
    config: &TrainConfig,
    rng: &mut R,
    sink: &dyn EventSink,
) -> RnnResult<TrainingReport> {
    train_with_callback(model, train_batches, validation, config, rng, sink, |_| Ok(()))
}

/// [`train`], invoking `on_epoch` after every epoch (e.g. to append metrics
/// to a file). An error from the callback aborts training.
///
/// # Errors
/// As [`train`], plus anything `on_epoch` returns.
pub fn train_with_callback<R, F>(
    model: &mut SequenceModel,
    train_batches: &[Batch],
    validation: Option<&[Batch]>,
    config: &TrainConfig,
    rng: &mut R,
    sink: &dyn EventSink,
    mut on_epoch: F,
) -> RnnResult<TrainingReport>
where
    R: Rng + ?Sized,
    F: FnMut(&EpochMetrics) -> RnnResult<()>,
{
    config.loss.validate()?;
    if train_batches.is_empty() {
        return Err(RnnError::EmptyDataset("no training batches".to_string()));
    }
    let validation = validation.filter(|v| !v.is_empty());
    if validation.is_none() {
        sink.warn("no validation data: early stopping disabled, the model may overfit");
    }

    let mut optimizer = config.optimizer.build(model.config());
    let mut monitor = EarlyStopping::new(config.es_patience);
    let mut best_params: Option<Parameters> = None;
    let mut history = Vec::with_capacity(config.epochs);
    let mut stopped_early = false;
    let mut order: Vec<&Batch> = train_batches.iter().collect();

    sink.info(&format!(
        "training {} parameters on {} batches for up to {} epochs",
        model.params().num_parameters(),
        train_batches.len(),
        config.epochs
    ));

    for epoch in 1..=config.epochs {
        let start = Instant::now();
        order.shuffle(rng);
        let train_loss = train_epoch(model, &mut optimizer, &order, config.clip_norm)?;
        let val_loss = validation.map(|v| evaluate(model, v)).transpose()?;

        let metrics = EpochMetrics {
            epoch,
            train_loss,
            val_loss,
            elapsed_secs: start.elapsed().as_secs_f32(),
        };
        sink.info(&match val_loss {
            Some(v) => format!(
                "epoch {epoch}/{}: loss={train_loss:.4} val_loss={v:.4} ({:.1}s)",
                config.epochs, metrics.elapsed_secs
            ),
            None => format!(
                "epoch {epoch}/{}: loss={train_loss:.4} ({:.1}s)",
                config.epochs, metrics.elapsed_secs
            ),
        });
        if !train_loss.is_finite() {
            sink.warn(&format!("epoch {epoch}: training loss is not finite"));
        }
        on_epoch(&metrics)?;
        history.push(metrics);

        if let Some(v) = val_loss {
            if monitor.observe(epoch, v) && config.restore_best_weights {
                best_params = Some(model.params().clone());
            }
            if monitor.should_stop() {
                sink.info(&format!(
                    "early stopping after epoch {epoch}: no improvement for {} epochs",
                    config.es_patience
                ));
                stopped_early = true;
                break;
            }
        }
    }

    if let Some(params) = best_params {
        *model.params_mut() = params;
        if let Some(epoch) = monitor.best_epoch() {
            sink.info(&format!("restored weights from epoch {epoch}"));
        }
    }

    Ok(TrainingReport {
        history,
        stopped_early,
        best_val_loss: monitor.best(),
        best_epoch: monitor.best_epoch(),
    })
}
