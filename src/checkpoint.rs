//! Checkpoint save/load for trained models.
//!
//! A checkpoint is one JSON bundle holding everything needed to sample:
//! the [`ConfigRecord`] the model was trained with, the ordered vocabulary
//! snapshot, and every weight tensor as nested vectors. The record is also
//! written to a small sidecar file so callers can check compatibility
//! without reading the weights.
//!
//! ```text
//! <model_dir>/<identifier>_model.json    bundle
//! <model_dir>/<identifier>_config.json   ConfigRecord
//! ```

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::core::{Parameters, RnnError, RnnResult, SequenceModel};
use crate::data::Vocabulary;
use crate::training::TrainingReport;
use crate::ConfigRecord;

/// Weight tensors in serializable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedParameters {
    pub embedding: Vec<Vec<f32>>,
    pub w_z: Vec<Vec<f32>>,
    pub w_r: Vec<Vec<f32>>,
    pub w_n: Vec<Vec<f32>>,
    pub u_z: Vec<Vec<f32>>,
    pub u_r: Vec<Vec<f32>>,
    pub u_n: Vec<Vec<f32>>,
    pub b_z: Vec<f32>,
    pub b_r: Vec<f32>,
    pub b_n: Vec<f32>,
    pub w_out: Vec<Vec<f32>>,
    pub b_out: Vec<f32>,
}

/// Serializable checkpoint data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    /// Hyperparameters the model was trained with.
    pub config: ConfigRecord,
    pub vocab_size: usize,
    /// Vocabulary snapshot; position is the index.
    pub vocab: Vec<char>,
    pub weights: SerializedParameters,
    /// Epochs completed.
    pub epoch: usize,
    pub train_loss: Option<f32>,
    pub val_loss: Option<f32>,
}

/// Training outcome stored with the weights.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CheckpointStats {
    pub epoch: usize,
    pub train_loss: Option<f32>,
    pub val_loss: Option<f32>,
}

impl CheckpointStats {
    #[must_use]
    pub fn from_report(report: &TrainingReport) -> Self {
        let last = report.history.last();
        Self {
            epoch: report.history.len(),
            train_loss: last.map(|m| m.train_loss),
            val_loss: last.and_then(|m| m.val_loss),
        }
    }
}

/// A checkpoint reconstructed into usable parts.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub config: ConfigRecord,
    pub vocab: Vocabulary,
    pub model: SequenceModel,
    pub stats: CheckpointStats,
}

#[must_use]
pub fn checkpoint_path(model_dir: &Path, identifier: &str) -> PathBuf {
    model_dir.join(format!("{identifier}_model.json"))
}

#[must_use]
pub fn config_path(model_dir: &Path, identifier: &str) -> PathBuf {
    model_dir.join(format!("{identifier}_config.json"))
}

#[must_use]
pub fn checkpoint_exists(model_dir: &Path, identifier: &str) -> bool {
    checkpoint_path(model_dir, identifier).is_file()
}

fn array2_to_vecs(arr: &Array2<f32>) -> Vec<Vec<f32>> {
    arr.rows().into_iter().map(|row| row.to_vec()).collect()
}

fn vecs_to_array2(name: &str, vecs: &[Vec<f32>]) -> RnnResult<Array2<f32>> {
    let nrows = vecs.len();
    let ncols = vecs.first().map_or(0, Vec::len);
    if vecs.iter().any(|row| row.len() != ncols) {
        return Err(RnnError::ShapeMismatch(format!("tensor `{name}` has ragged rows")));
    }
    let flat: Vec<f32> = vecs.iter().flat_map(|r| r.iter().copied()).collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| RnnError::ShapeMismatch(format!("tensor `{name}`: {e}")))
}

impl SerializedParameters {
    #[must_use]
    pub fn from_parameters(p: &Parameters) -> Self {
        Self {
            embedding: array2_to_vecs(&p.embedding),
            w_z: array2_to_vecs(&p.w_z),
            w_r: array2_to_vecs(&p.w_r),
            w_n: array2_to_vecs(&p.w_n),
            u_z: array2_to_vecs(&p.u_z),
            u_r: array2_to_vecs(&p.u_r),
            u_n: array2_to_vecs(&p.u_n),
            b_z: p.b_z.to_vec(),
            b_r: p.b_r.to_vec(),
            b_n: p.b_n.to_vec(),
            w_out: array2_to_vecs(&p.w_out),
            b_out: p.b_out.to_vec(),
        }
    }

    /// # Errors
    /// `ShapeMismatch` for ragged matrices.
    pub fn to_parameters(&self) -> RnnResult<Parameters> {
        Ok(Parameters {
            embedding: vecs_to_array2("embedding", &self.embedding)?,
            w_z: vecs_to_array2("w_z", &self.w_z)?,
            w_r: vecs_to_array2("w_r", &self.w_r)?,
            w_n: vecs_to_array2("w_n", &self.w_n)?,
            u_z: vecs_to_array2("u_z", &self.u_z)?,
            u_r: vecs_to_array2("u_r", &self.u_r)?,
            u_n: vecs_to_array2("u_n", &self.u_n)?,
            b_z: Array1::from(self.b_z.clone()),
            b_r: Array1::from(self.b_r.clone()),
            b_n: Array1::from(self.b_n.clone()),
            w_out: vecs_to_array2("w_out", &self.w_out)?,
            b_out: Array1::from(self.b_out.clone()),
        })
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RnnError + '_ {
    move |source| RnnError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T, pretty: bool) -> RnnResult<()> {
    let file = fs::File::create(path).map_err(io_err(path))?;
    let mut writer = BufWriter::new(file);
    if pretty {
        serde_json::to_writer_pretty(&mut writer, value)?;
    } else {
        serde_json::to_writer(&mut writer, value)?;
    }
    writer.flush().map_err(io_err(path))
}

/// Persist the bundle and the sidecar record for `identifier`.
///
/// Returns the bundle path.
///
/// # Errors
/// `ShapeMismatch` if the vocabulary does not fit the model,
/// `InvalidConfig` if any weight is NaN or infinite, `Io` or
/// `Serialization` on write failures.
pub fn save_checkpoint(
    model_dir: &Path,
    identifier: &str,
    config: &ConfigRecord,
    vocab: &Vocabulary,
    model: &SequenceModel,
    stats: CheckpointStats,
) -> RnnResult<PathBuf> {
    crate::data::corpus::validate_identifier(identifier)?;
    if vocab.size() != model.config().vocab_size {
        return Err(RnnError::ShapeMismatch(format!(
            "vocabulary has {} characters, model expects {}",
            vocab.size(),
            model.config().vocab_size
        )));
    }
    if let Some(name) = model.params().first_non_finite() {
        return Err(RnnError::InvalidConfig(format!(
            "model weights are not finite (tensor `{name}`); training diverged"
        )));
    }
    fs::create_dir_all(model_dir).map_err(io_err(model_dir))?;

    let data = CheckpointData {
        config: config.clone(),
        vocab_size: vocab.size(),
        vocab: vocab.chars().to_vec(),
        weights: SerializedParameters::from_parameters(model.params()),
        epoch: stats.epoch,
        train_loss: stats.train_loss,
        val_loss: stats.val_loss,
    };

    let path = checkpoint_path(model_dir, identifier);
    write_json(&path, &data, false)?;
    write_json(&config_path(model_dir, identifier), config, true)?;
    Ok(path)
}

/// Read the sidecar record for `identifier`.
///
/// # Errors
/// `MissingCheckpoint` if it does not exist, `Io`/`Serialization` if it
/// cannot be read.
pub fn read_config_record(model_dir: &Path, identifier: &str) -> RnnResult<ConfigRecord> {
    let path = config_path(model_dir, identifier);
    if !path.is_file() {
        return Err(RnnError::MissingCheckpoint {
            identifier: identifier.to_string(),
            path,
        });
    }
    let file = fs::File::open(&path).map_err(io_err(&path))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Load the bundle at `path`.
///
/// When `expected` is given, the stored record must be compatible with it
/// before any weights are touched.
///
/// # Errors
/// `MissingCheckpoint` if the file does not exist, `ConfigMismatch` for an
/// incompatible record, `ShapeMismatch` when the vocabulary or any tensor
/// disagrees with the stored record.
pub fn load_checkpoint(path: &Path, expected: Option<&ConfigRecord>) -> RnnResult<LoadedModel> {
    if !path.is_file() {
        let identifier = path
            .file_stem()
            .map(|s| s.to_string_lossy())
            .map(|s| s.trim_end_matches("_model").to_string())
            .unwrap_or_default();
        return Err(RnnError::MissingCheckpoint {
            identifier,
            path: path.to_path_buf(),
        });
    }
    let file = fs::File::open(path).map_err(io_err(path))?;
    let data: CheckpointData = serde_json::from_reader(BufReader::new(file))?;

    if let Some(expected) = expected {
        if !data.config.is_compatible(expected) {
            return Err(RnnError::ConfigMismatch(format!(
                "{} was trained with a different configuration ({})",
                path.display(),
                data.config.differences(expected).join(", ")
            )));
        }
    }

    let vocab = Vocabulary::from_chars(data.vocab)?;
    if vocab.size() != data.vocab_size {
        return Err(RnnError::ShapeMismatch(format!(
            "vocabulary snapshot has {} characters, checkpoint records {}",
            vocab.size(),
            data.vocab_size
        )));
    }

    let params = data.weights.to_parameters()?;
    let model = SequenceModel::from_parameters(data.config.model_config(vocab.size()), params)?;

    Ok(LoadedModel {
        config: data.config,
        vocab,
        model,
        stats: CheckpointStats {
            epoch: data.epoch,
            train_loss: data.train_loss,
            val_loss: data.val_loss,
        },
    })
}

/// [`load_checkpoint`] by model directory and identifier.
///
/// # Errors
/// As [`load_checkpoint`].
pub fn load_model(
    model_dir: &Path,
    identifier: &str,
    expected: Option<&ConfigRecord>,
) -> RnnResult<LoadedModel> {
    crate::data::corpus::validate_identifier(identifier)?;
    load_checkpoint(&checkpoint_path(model_dir, identifier), expected)
}
