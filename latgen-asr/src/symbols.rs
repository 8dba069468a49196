//! Word symbol table: bijective mapping between word ids and word strings.

use crate::error::{LatticeError, ModelError};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Opaque word identifier.
///
/// Word ids have meaning only relative to the symbol table of the model
/// bundle they came from; they are never interchangeable across bundles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WordId(pub u32);

impl fmt::Display for WordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable word symbol table loaded from the model bundle.
///
/// The on-disk format is one `word id` pair per line with dense ids
/// starting at 0 (id 0 is conventionally the epsilon symbol).
#[derive(Clone, Debug)]
pub struct SymbolTable {
    words: Vec<String>,
    ids: HashMap<String, WordId>,
}

impl SymbolTable {
    /// Build a table from words in id order (index = id).
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let words: Vec<String> = words.into_iter().map(Into::into).collect();
        let ids = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), WordId(i as u32)))
            .collect();
        Self { words, ids }
    }

    /// Load a symbol table from a `words.txt` file.
    pub fn from_text_file(path: &Path) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut entries: Vec<(String, u32)> = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (word, id) = match (fields.next(), fields.next(), fields.next()) {
                (Some(word), Some(id), None) => (word, id),
                _ => {
                    return Err(ModelError::Parse {
                        path: path.to_path_buf(),
                        line: lineno + 1,
                        message: format!("expected `word id`, got {line:?}"),
                    });
                }
            };

            let id: u32 = id.parse().map_err(|_| ModelError::Parse {
                path: path.to_path_buf(),
                line: lineno + 1,
                message: format!("invalid word id {id:?}"),
            })?;

            entries.push((word.to_string(), id));
        }

        entries.sort_by_key(|&(_, id)| id);

        let mut words = Vec::with_capacity(entries.len());
        for (word, id) in entries {
            if id as usize != words.len() {
                return Err(ModelError::Parse {
                    path: path.to_path_buf(),
                    line: 0,
                    message: format!("word ids are not dense at id {id}"),
                });
            }
            words.push(word);
        }

        Ok(Self::from_words(words))
    }

    /// Look up the word string for an id.
    pub fn word(&self, id: WordId) -> Result<&str, LatticeError> {
        self.words
            .get(id.0 as usize)
            .map(String::as_str)
            .ok_or(LatticeError::UnknownWordId {
                id: id.0,
                vocab_size: self.words.len(),
            })
    }

    /// Look up the id for a word string.
    pub fn id(&self, word: &str) -> Option<WordId> {
        self.ids.get(word).copied()
    }

    /// Vocabulary size.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SymbolTable {
        SymbolTable::from_words(["<eps>", "eleven", "seven"])
    }

    #[test]
    fn looks_up_both_directions() {
        let table = table();

        assert_eq!(table.word(WordId(1)).unwrap(), "eleven");
        assert_eq!(table.id("seven"), Some(WordId(2)));
        assert_eq!(table.id("missing"), None);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn rejects_out_of_range_id() {
        let table = table();

        let err = table.word(WordId(3)).unwrap_err();

        assert!(matches!(
            err,
            LatticeError::UnknownWordId { id: 3, vocab_size: 3 }
        ));
    }

    #[test]
    fn parses_words_file() {
        let path = std::env::temp_dir().join("latgen_words_test.txt");
        std::fs::write(&path, "<eps> 0\neleven 1\nseven 2\n").unwrap();

        let table = SymbolTable::from_text_file(&path).unwrap();

        assert_eq!(table.word(WordId(2)).unwrap(), "seven");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_sparse_ids() {
        let path = std::env::temp_dir().join("latgen_words_sparse.txt");
        std::fs::write(&path, "<eps> 0\neleven 5\n").unwrap();

        let result = SymbolTable::from_text_file(&path);

        assert!(matches!(result, Err(ModelError::Parse { .. })));
        std::fs::remove_file(path).ok();
    }
}
