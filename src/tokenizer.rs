//! Character-level tokenizer over the fixed chain alphabet
//!
//! Training strings only ever contain the separator `#`, newlines, `=`, the
//! binary values `0`/`1` and the characters of the chain's variable names, so
//! every character is its own token. The vocabulary is persisted next to the
//! model weights as `vocab.json`:
//!
//! ```text
//! { "tokens": ["#", "\n", "=", "0", "1", "A", "B", "C", "D", "E"] }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Separator placed before and between samples in batch-with-separator mode
pub const SEPARATOR: char = '#';

/// Symbols present in every vocabulary, in id order
pub const BASE_ALPHABET: [char; 5] = [SEPARATOR, '\n', '=', '0', '1'];

#[derive(Debug, Serialize, Deserialize)]
struct VocabFile {
    tokens: Vec<String>,
}

/// Character tokenizer with a small closed vocabulary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTokenizer {
    /// Token ID → character
    idx2token: Vec<char>,
    /// Character → token ID
    vocab_map: HashMap<char, u32>,
}

impl ChainTokenizer {
    /// Build the vocabulary for a chain with the given variable names
    pub fn for_variables<S: AsRef<str>>(variables: &[S]) -> Self {
        let mut extra: Vec<char> = variables
            .iter()
            .flat_map(|v| v.as_ref().chars())
            .filter(|c| !BASE_ALPHABET.contains(c))
            .collect();
        extra.sort_unstable();
        extra.dedup();

        Self::from_tokens(BASE_ALPHABET.iter().copied().chain(extra).collect())
    }

    fn from_tokens(idx2token: Vec<char>) -> Self {
        let vocab_map = idx2token
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u32))
            .collect();
        Self {
            idx2token,
            vocab_map,
        }
    }

    /// Load a vocabulary written by [`ChainTokenizer::save`]
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocab file: {}", path.display()))?;
        let file: VocabFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse vocab file: {}", path.display()))?;

        let mut idx2token = Vec::with_capacity(file.tokens.len());
        for token in &file.tokens {
            let mut chars = token.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => idx2token.push(c),
                _ => anyhow::bail!("Vocab entry {token:?} is not a single character"),
            }
        }
        for symbol in BASE_ALPHABET {
            anyhow::ensure!(
                idx2token.contains(&symbol),
                "Vocab is missing base symbol {symbol:?}"
            );
        }

        let tokenizer = Self::from_tokens(idx2token);
        anyhow::ensure!(
            tokenizer.vocab_map.len() == tokenizer.idx2token.len(),
            "Vocab file contains duplicate tokens"
        );
        tracing::debug!("Loaded vocabulary: {} tokens", tokenizer.vocab_size());
        Ok(tokenizer)
    }

    /// Write the vocabulary as JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = VocabFile {
            tokens: self.idx2token.iter().map(ToString::to_string).collect(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)
            .with_context(|| format!("Failed to write vocab file: {}", path.display()))
    }

    pub fn vocab_size(&self) -> usize {
        self.idx2token.len()
    }

    /// Encode text, failing on characters outside the vocabulary
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.chars()
            .map(|c| {
                self.vocab_map
                    .get(&c)
                    .copied()
                    .with_context(|| format!("Character {c:?} is not in the vocabulary"))
            })
            .collect()
    }

    /// Decode token IDs; unknown IDs render as `<id>`
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .map(|&id| match self.idx2token.get(id as usize) {
                Some(c) => c.to_string(),
                None => format!("<{id}>"),
            })
            .collect()
    }

    /// ID of a single-character symbol
    pub fn token_id(&self, symbol: &str) -> Option<u32> {
        let mut chars = symbol.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => self.vocab_map.get(&c).copied(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_vocab_layout() {
        let tok = ChainTokenizer::for_variables(&["B", "A", "C"]);
        assert_eq!(tok.vocab_size(), 8);
        assert_eq!(tok.token_id("#"), Some(0));
        assert_eq!(tok.token_id("0"), Some(3));
        assert_eq!(tok.token_id("1"), Some(4));
        assert_eq!(tok.token_id("A"), Some(5));
        assert_eq!(tok.token_id("C"), Some(7));
        assert_eq!(tok.token_id("AB"), None);
    }

    #[test]
    fn test_encode_decode() {
        let tok = ChainTokenizer::for_variables(&["A", "B"]);
        let ids = tok.encode("#\nA=0\nB=1").unwrap();
        assert_eq!(ids.len(), 9);
        assert_eq!(tok.decode(&ids), "#\nA=0\nB=1");
        assert_eq!(tok.decode(&[99]), "<99>");
    }

    #[test]
    fn test_unknown_character() {
        let tok = ChainTokenizer::for_variables(&["A"]);
        assert!(tok.encode("Z=1").is_err());
    }

    #[test]
    fn test_digits_in_names_are_shared() {
        let tok = ChainTokenizer::for_variables(&["X0", "X1"]);
        assert_eq!(tok.vocab_size(), 6);
        assert!(tok.encode("X1=0").is_ok());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vocab.json");
        let tok = ChainTokenizer::for_variables(&["A", "B", "C", "D", "E"]);
        tok.save(&path).unwrap();
        assert_eq!(ChainTokenizer::from_file(&path).unwrap(), tok);
    }

    #[test]
    fn test_reject_incomplete_vocab() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vocab.json");
        std::fs::write(&path, r#"{"tokens": ["A", "="]}"#).unwrap();
        assert!(ChainTokenizer::from_file(&path).is_err());
    }
}
