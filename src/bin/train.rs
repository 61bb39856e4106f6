//! Character model training binary.
//!
//! Trains a GRU on `<replies-dir>/<identifier>.txt` and writes the model
//! bundle plus its config sidecar to `<model-dir>`. An existing model whose
//! sidecar matches the requested hyperparameters is reused unless `--force`.
//! Optionally writes per-epoch JSONL metrics.

use anyhow::{Context, Result};
use charnn::checkpoint::{
    checkpoint_exists, read_config_record, save_checkpoint, CheckpointStats,
};
use charnn::data::{load_corpus, make_dataset, Vocabulary};
use charnn::training::train_with_callback;
use charnn::{ConfigRecord, EventSink, RnnError, SequenceModel, TracingSink};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "charnn-train",
    about = "Train a character-level text generator on a user's replies"
)]
struct Args {
    /// User identifier; the corpus is `<replies-dir>/<identifier>.txt`
    identifier: String,

    /// Directory holding corpus files
    #[arg(long, default_value = "replies")]
    replies_dir: PathBuf,

    /// Directory for model bundles and config sidecars
    #[arg(long, default_value = "saved_models")]
    model_dir: PathBuf,

    /// Characters the model looks back over per training window
    #[arg(long, default_value_t = 100)]
    seq_length: usize,

    /// Windows per batch
    #[arg(long, default_value_t = 4)]
    batch_size: usize,

    /// Embedding dimension per character
    #[arg(long, default_value_t = 256)]
    embedding_dim: usize,

    /// GRU hidden units
    #[arg(long, default_value_t = 128)]
    rnn_hidden_units: usize,

    /// Loss function
    #[arg(long, default_value = "sparse_categorical_crossentropy")]
    loss: String,

    /// Optimizer (adam or sgd)
    #[arg(long, default_value = "adam")]
    optimizer: String,

    /// Maximum number of epochs
    #[arg(long, default_value_t = 20)]
    epochs: usize,

    /// Fraction of windows held out for validation (steps of 10%)
    #[arg(long, default_value_t = 0.1)]
    val_frac: f64,

    /// Epochs without validation improvement before stopping
    #[arg(long, default_value_t = 5)]
    es_patience: usize,

    /// Shuffle buffer capacity
    #[arg(long, default_value_t = 10_000)]
    shuffle_buffer: usize,

    /// Clip batch gradients to this global norm (0 = no clipping)
    #[arg(long, default_value_t = 5.0)]
    clip_norm: f32,

    /// Restore the best validation epoch's weights after early stopping
    #[arg(long)]
    restore_best_weights: bool,

    /// Append per-epoch metrics as JSONL to this file
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// Seed for initialization and shuffling
    #[arg(long)]
    rng_seed: Option<u64>,

    /// Retrain even if a compatible model already exists
    #[arg(long)]
    force: bool,
}

impl Args {
    fn record(&self) -> ConfigRecord {
        ConfigRecord {
            seq_length: self.seq_length,
            batch_size: self.batch_size,
            embedding_dim: self.embedding_dim,
            rnn_hidden_units: self.rnn_hidden_units,
            loss: self.loss.clone(),
            optimizer: self.optimizer.clone(),
            epochs: self.epochs,
            val_frac: self.val_frac,
            es_patience: self.es_patience,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("charnn=info")),
        )
        .init();

    let args = Args::parse();
    let sink = TracingSink;
    let record = args.record();

    if !args.force && checkpoint_exists(&args.model_dir, &args.identifier) {
        match read_config_record(&args.model_dir, &args.identifier) {
            Ok(stored) if stored.is_compatible(&record) => {
                sink.info(&format!(
                    "compatible model for `{}` already exists in {}; use --force to retrain",
                    args.identifier,
                    args.model_dir.display()
                ));
                return Ok(());
            }
            Ok(stored) => sink.info(&format!(
                "existing model was trained with different settings ({}); retraining",
                stored.differences(&record).join(", ")
            )),
            Err(e) => sink.warn(&format!("cannot read existing config ({e}); retraining")),
        }
    }

    let text = load_corpus(&args.replies_dir, &args.identifier)
        .context("corpus must be harvested before training")?;
    let vocab = Vocabulary::from_text(&text);
    sink.info(&format!(
        "corpus: {} characters, {} distinct",
        text.chars().count(),
        vocab.size()
    ));

    let mut rng = match args.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut ds_config = record.dataset_config();
    ds_config.shuffle_buffer = args.shuffle_buffer;
    let dataset = make_dataset(&text, &vocab, &ds_config, &mut rng)?;
    sink.info(&format!(
        "{} windows -> {} training batches, {} validation batches",
        dataset.num_pairs,
        dataset.train.len(),
        dataset.validation.len()
    ));

    let mut model = SequenceModel::new(record.model_config(vocab.size()), &mut rng)?;
    let mut train_config = record.train_config()?;
    train_config.clip_norm = (args.clip_norm > 0.0).then_some(args.clip_norm);
    train_config.restore_best_weights = args.restore_best_weights;

    let mut metrics_file = match &args.metrics_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening metrics file {}", path.display()))?;
            Some((path.clone(), file))
        }
        None => None,
    };

    let report = train_with_callback(
        &mut model,
        &dataset.train,
        dataset.validation(),
        &train_config,
        &mut rng,
        &sink,
        |metrics| {
            let Some((path, file)) = metrics_file.as_mut() else {
                return Ok(());
            };
            let event = serde_json::json!({
                "type": "epoch",
                "identifier": args.identifier,
                "epoch": metrics.epoch,
                "train_loss": metrics.train_loss,
                "val_loss": metrics.val_loss,
                "elapsed_secs": metrics.elapsed_secs,
            });
            writeln!(file, "{event}").map_err(|source| RnnError::Io {
                path: path.clone(),
                source,
            })
        },
    )?;

    if report.stopped_early {
        sink.info(&format!(
            "stopped early after {} epochs (best val_loss {:.4} at epoch {})",
            report.epochs_run(),
            report.best_val_loss.unwrap_or(f32::NAN),
            report.best_epoch.unwrap_or(0)
        ));
    }

    let path = save_checkpoint(
        &args.model_dir,
        &args.identifier,
        &record,
        &vocab,
        &model,
        CheckpointStats::from_report(&report),
    )?;
    sink.info(&format!("saved model to {}", path.display()));
    Ok(())
}
