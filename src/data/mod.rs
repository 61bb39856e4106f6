//! Corpus loading, vocabulary management, and dataset construction.
//!
//! ## Submodules
//!
//! - [`corpus`]: Per-user reply files
//! - [`vocab`]: Character vocabulary derived from a corpus
//! - [`samples`]: Windowed (input, target) pairs, shuffling, splitting, batching

pub mod corpus;
pub mod samples;
pub mod vocab;

pub use corpus::{corpus_path, load_corpus, save_replies, split_replies};
pub use samples::{
    batch_pairs, buffered_shuffle, make_dataset, make_pairs, train_val_split, Batch, Dataset,
    DatasetConfig, SequencePair,
};
pub use vocab::Vocabulary;
