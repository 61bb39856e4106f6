//! Character vocabulary for next-character prediction.
//!
//! Maps between characters and contiguous indices `[0, size)`. The
//! vocabulary is derived from a corpus in first-occurrence order, so the
//! same corpus always yields the same encoding. Every character counts,
//! including whitespace and newlines.

use std::collections::HashMap;

use crate::core::{RnnError, RnnResult};

/// Character-to-index vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    /// Ordered list of characters in the vocabulary (`num2char`).
    chars: Vec<char>,
    /// Reverse mapping from character to index (`char2num`).
    char_to_idx: HashMap<char, usize>,
}

impl Vocabulary {
    /// Build the vocabulary of `text`: each distinct character, numbered in
    /// order of first appearance.
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        let mut chars = Vec::new();
        let mut char_to_idx = HashMap::new();
        for c in text.chars() {
            char_to_idx.entry(c).or_insert_with(|| {
                chars.push(c);
                chars.len() - 1
            });
        }
        Self { chars, char_to_idx }
    }

    /// Rebuild a vocabulary from an ordered snapshot (e.g. a checkpoint).
    ///
    /// # Errors
    /// `InvalidConfig` if the snapshot repeats a character.
    pub fn from_chars(chars: Vec<char>) -> RnnResult<Self> {
        let mut char_to_idx = HashMap::with_capacity(chars.len());
        for (i, &c) in chars.iter().enumerate() {
            if char_to_idx.insert(c, i).is_some() {
                return Err(RnnError::InvalidConfig(format!(
                    "vocabulary snapshot repeats character {c:?}"
                )));
            }
        }
        Ok(Self { chars, char_to_idx })
    }

    /// Number of characters in the vocabulary.
    #[must_use]
    pub fn size(&self) -> usize {
        self.chars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Ordered characters; position is the index.
    #[must_use]
    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    /// Get the index for a character, or `None` if not in vocabulary.
    #[must_use]
    pub fn char_to_index(&self, c: char) -> Option<usize> {
        self.char_to_idx.get(&c).copied()
    }

    /// Get the character for an index, or `None` if out of bounds.
    #[must_use]
    pub fn index_to_char(&self, idx: usize) -> Option<char> {
        self.chars.get(idx).copied()
    }

    /// True when every character of `text` is in the vocabulary.
    #[must_use]
    pub fn contains_all(&self, text: &str) -> bool {
        text.chars().all(|c| self.char_to_idx.contains_key(&c))
    }

    /// Encode `text` into indices.
    ///
    /// # Errors
    /// `InvalidConfig` naming the first character outside the vocabulary.
    pub fn encode(&self, text: &str) -> RnnResult<Vec<usize>> {
        text.chars()
            .map(|c| {
                self.char_to_index(c).ok_or_else(|| {
                    RnnError::InvalidConfig(format!("character {c:?} is not in the vocabulary"))
                })
            })
            .collect()
    }

    /// Decode indices back to text.
    ///
    /// # Errors
    /// `ShapeMismatch` for an index outside `[0, size)`.
    pub fn decode(&self, indices: &[usize]) -> RnnResult<String> {
        indices
            .iter()
            .map(|&i| {
                self.index_to_char(i).ok_or_else(|| {
                    RnnError::ShapeMismatch(format!(
                        "index {i} outside vocabulary of size {}",
                        self.size()
                    ))
                })
            })
            .collect()
    }
}
