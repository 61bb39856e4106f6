//! Per-user corpus files.
//!
//! A corpus is a UTF-8 text file `<dir>/<identifier>.txt` holding a user's
//! replies, each followed by a blank line. Harvesting the replies happens
//! elsewhere; this module only reads and writes the file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::core::{RnnError, RnnResult};

/// Reject identifiers that would escape the corpus directory.
///
/// # Errors
/// `InvalidConfig` for empty identifiers or ones containing path separators.
pub fn validate_identifier(identifier: &str) -> RnnResult<()> {
    if identifier.is_empty()
        || identifier.contains(['/', '\\'])
        || identifier == "."
        || identifier == ".."
    {
        return Err(RnnError::InvalidConfig(format!(
            "invalid identifier {identifier:?}"
        )));
    }
    Ok(())
}

/// Location of the corpus for `identifier`.
#[must_use]
pub fn corpus_path(dir: &Path, identifier: &str) -> PathBuf {
    dir.join(format!("{identifier}.txt"))
}

#[must_use]
pub fn corpus_exists(dir: &Path, identifier: &str) -> bool {
    corpus_path(dir, identifier).is_file()
}

/// Read the corpus for `identifier`.
///
/// # Errors
/// `InvalidConfig` for a bad identifier, `MissingCorpus` if the file is
/// absent, `Io` if it cannot be read or is not valid UTF-8.
pub fn load_corpus(dir: &Path, identifier: &str) -> RnnResult<String> {
    validate_identifier(identifier)?;
    let path = corpus_path(dir, identifier);
    fs::read_to_string(&path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => RnnError::MissingCorpus {
            identifier: identifier.to_string(),
            path,
            source,
        },
        _ => RnnError::Io { path, source },
    })
}

/// Write replies in corpus format, replacing any existing file.
///
/// # Errors
/// `InvalidConfig` for a bad identifier, `Io` if the directory or file
/// cannot be written.
pub fn save_replies<I, S>(dir: &Path, identifier: &str, replies: I) -> RnnResult<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    validate_identifier(identifier)?;
    fs::create_dir_all(dir).map_err(|source| RnnError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut content = String::new();
    for reply in replies {
        content.push_str(reply.as_ref());
        content.push_str("\n\n");
    }

    let path = corpus_path(dir, identifier);
    fs::write(&path, content).map_err(|source| RnnError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Split a corpus back into its non-empty reply blocks.
///
/// Blocks are separated by blank lines, so a reply that itself contains a
/// blank line comes back as several blocks.
#[must_use]
pub fn split_replies(text: &str) -> Vec<&str> {
    text.split("\n\n")
        .map(|block| block.trim_matches('\n'))
        .filter(|block| !block.trim().is_empty())
        .collect()
}
