//! Windowed dataset construction for next-character prediction.
//!
//! The encoded corpus is cut into non-overlapping spans of `seq_length + 1`
//! indices. Each span yields one pair: the span minus its last element is
//! the input, the span minus its first element is the target.
//!
//! ```text
//! text:    t e n s o r f l o w
//! span:   [t e n s o r f l o w]      seq_length = 9
//! input:  [t e n s o r f l o]
//! target:   [e n s o r f l o w]
//! ```
//!
//! Pairs are shuffled through a bounded buffer, split into training and
//! validation by position, and grouped into fixed-size batches.

use ndarray::Array2;
use rand::Rng;

use super::vocab::Vocabulary;
use crate::core::{RnnError, RnnResult};

/// Configuration for dataset construction.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetConfig {
    /// Timesteps per training window.
    pub seq_length: usize,
    /// Pairs per batch; incomplete trailing batches are dropped.
    pub batch_size: usize,
    /// Fraction of pairs held out for validation, effective in steps of 10%.
    pub val_frac: f64,
    /// Capacity of the shuffle buffer. Larger than the pair count means a
    /// full uniform shuffle; 1 keeps corpus order.
    pub shuffle_buffer: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            seq_length: 100,
            batch_size: 4,
            val_frac: 0.1,
            shuffle_buffer: 10_000,
        }
    }
}

impl DatasetConfig {
    /// # Errors
    /// `InvalidConfig` for a zero `seq_length`/`batch_size`/`shuffle_buffer`
    /// or a `val_frac` outside `[0, 1]`.
    pub fn validate(&self) -> RnnResult<()> {
        if self.seq_length == 0 || self.batch_size == 0 || self.shuffle_buffer == 0 {
            return Err(RnnError::InvalidConfig(
                "seq_length, batch_size and shuffle_buffer must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.val_frac) {
            return Err(RnnError::InvalidConfig(format!(
                "val_frac must be within [0, 1], got {}",
                self.val_frac
            )));
        }
        Ok(())
    }
}

/// One training example: `target[i]` is the character after `input[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePair {
    pub input: Vec<usize>,
    pub target: Vec<usize>,
}

/// A group of pairs stacked into `(batch_size, seq_length)` matrices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub inputs: Array2<usize>,
    pub targets: Array2<usize>,
}

impl Batch {
    /// Stack equal-length pairs row by row.
    ///
    /// # Errors
    /// `ShapeMismatch` if the pairs are empty or of differing lengths.
    pub fn from_pairs(pairs: &[SequencePair]) -> RnnResult<Self> {
        let seq_length = pairs
            .first()
            .map(|p| p.input.len())
            .ok_or_else(|| RnnError::ShapeMismatch("cannot batch zero pairs".to_string()))?;
        let mut inputs = Vec::with_capacity(pairs.len() * seq_length);
        let mut targets = Vec::with_capacity(pairs.len() * seq_length);
        for pair in pairs {
            if pair.input.len() != seq_length || pair.target.len() != seq_length {
                return Err(RnnError::ShapeMismatch(format!(
                    "pair lengths {}/{} differ from {seq_length}",
                    pair.input.len(),
                    pair.target.len()
                )));
            }
            inputs.extend_from_slice(&pair.input);
            targets.extend_from_slice(&pair.target);
        }
        let shape = (pairs.len(), seq_length);
        let to_matrix = |v: Vec<usize>| {
            Array2::from_shape_vec(shape, v).map_err(|e| RnnError::ShapeMismatch(e.to_string()))
        };
        Ok(Self {
            inputs: to_matrix(inputs)?,
            targets: to_matrix(targets)?,
        })
    }

    /// Number of rows.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inputs.nrows()
    }

    #[must_use]
    pub fn seq_length(&self) -> usize {
        self.inputs.ncols()
    }
}

/// Training and validation batches.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub train: Vec<Batch>,
    /// Empty when `val_frac` rounds to zero or too few pairs remain for a batch.
    pub validation: Vec<Batch>,
    /// Pairs produced before batching.
    pub num_pairs: usize,
}

impl Dataset {
    /// The validation batches, or `None` if there are none.
    #[must_use]
    pub fn validation(&self) -> Option<&[Batch]> {
        if self.validation.is_empty() {
            None
        } else {
            Some(&self.validation)
        }
    }
}

/// Number of pairs a text of `num_chars` characters yields.
#[must_use]
pub fn count_pairs(num_chars: usize, seq_length: usize) -> usize {
    num_chars / (seq_length + 1)
}

/// Cut the encoded text into non-overlapping `seq_length + 1` spans and turn
/// each into a pair. A trailing partial span is dropped.
#[must_use]
pub fn make_pairs(encoded: &[usize], seq_length: usize) -> Vec<SequencePair> {
    encoded
        .chunks_exact(seq_length + 1)
        .map(|span| SequencePair {
            input: span[..seq_length].to_vec(),
            target: span[1..].to_vec(),
        })
        .collect()
}

/// Shuffle through a bounded buffer.
///
/// The buffer is filled from the front of `items`; each output is a uniformly
/// chosen buffered element whose slot is refilled from the stream. Once the
/// stream is exhausted the remainder drains in random order.
pub fn buffered_shuffle<T, R: Rng + ?Sized>(items: Vec<T>, buffer_size: usize, rng: &mut R) -> Vec<T> {
    let cap = buffer_size.max(1);
    let mut out = Vec::with_capacity(items.len());
    let mut stream = items.into_iter();
    let mut buffer: Vec<T> = stream.by_ref().take(cap).collect();

    while !buffer.is_empty() {
        let i = rng.gen_range(0..buffer.len());
        match stream.next() {
            Some(next) => out.push(std::mem::replace(&mut buffer[i], next)),
            None => out.push(buffer.swap_remove(i)),
        }
    }
    out
}

/// Number of positions out of every ten that go to validation.
///
/// Halves round to even, so `val_frac = 0.25` gives 2 and `0.35` gives 4.
#[must_use]
pub fn validation_slots(val_frac: f64) -> usize {
    (10.0 * val_frac).round_ties_even().clamp(0.0, 10.0) as usize
}

/// The positional split rule: position `i` is validation iff
/// `i mod 10 < round(10 * val_frac)`.
#[must_use]
pub fn is_validation(position: usize, val_frac: f64) -> bool {
    position % 10 < validation_slots(val_frac)
}

/// Partition `items` by their enumeration position.
///
/// Returns `(train, validation)`, each keeping the input's relative order.
pub fn train_val_split<T>(items: Vec<T>, val_frac: f64) -> (Vec<T>, Vec<T>) {
    let slots = validation_slots(val_frac);
    let mut train = Vec::new();
    let mut validation = Vec::new();
    for (i, item) in items.into_iter().enumerate() {
        if i % 10 < slots {
            validation.push(item);
        } else {
            train.push(item);
        }
    }
    (train, validation)
}

/// Group pairs into batches, dropping an incomplete trailing batch.
///
/// # Errors
/// `InvalidConfig` for a zero batch size, `ShapeMismatch` if pairs have
/// inconsistent lengths.
pub fn batch_pairs(pairs: &[SequencePair], batch_size: usize) -> RnnResult<Vec<Batch>> {
    if batch_size == 0 {
        return Err(RnnError::InvalidConfig("batch_size must be positive".to_string()));
    }
    pairs.chunks_exact(batch_size).map(Batch::from_pairs).collect()
}

/// Build the full dataset from raw text.
///
/// Steps: encode, cut into spans, derive pairs, shuffle, split by position,
/// batch each partition.
///
/// # Errors
///
/// - `InvalidConfig` for a bad config or a character missing from `vocab`
/// - `EmptyDataset` if the text is shorter than one span, or no complete
///   training batch remains after the split
pub fn make_dataset<R: Rng + ?Sized>(
    text: &str,
    vocab: &Vocabulary,
    config: &DatasetConfig,
    rng: &mut R,
) -> RnnResult<Dataset> {
    config.validate()?;
    let encoded = vocab.encode(text)?;
    let pairs = make_pairs(&encoded, config.seq_length);
    if pairs.is_empty() {
        return Err(RnnError::EmptyDataset(format!(
            "corpus has {} characters, need at least {} for one window",
            encoded.len(),
            config.seq_length + 1
        )));
    }
    let num_pairs = pairs.len();

    let shuffled = buffered_shuffle(pairs, config.shuffle_buffer, rng);
    let (train_pairs, val_pairs) = train_val_split(shuffled, config.val_frac);

    let train = batch_pairs(&train_pairs, config.batch_size)?;
    if train.is_empty() {
        return Err(RnnError::EmptyDataset(format!(
            "{} training pairs cannot fill one batch of {}",
            train_pairs.len(),
            config.batch_size
        )));
    }
    let validation = batch_pairs(&val_pairs, config.batch_size)?;

    Ok(Dataset {
        train,
        validation,
        num_pairs,
    })
}
