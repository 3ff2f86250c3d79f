//! Character-level tokeniser for SpeechT5.
//!
//! SpeechT5 ships a SentencePiece *char* model: every vocabulary entry is a
//! single character, plus the word-boundary marker `▁` and the special tokens
//! `<s> <pad> </s> <unk>`.  The vocabulary is read from the repository's
//! `tokenizer.json`.
//!
//! Encoding mirrors the SentencePiece pipeline: whitespace runs collapse to a
//! single `▁`, a leading `▁` is prepended, each character maps to its id
//! (lower-cased as a second try, `<unk>` as the last resort) and `</s>` is
//! appended.

use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

const WORD_BOUNDARY: char = '\u{2581}';

#[derive(Deserialize)]
struct TokenizerFile {
    #[serde(default)]
    added_tokens: Vec<AddedToken>,
    model: TokenizerModel,
}

#[derive(Deserialize)]
struct AddedToken {
    id: i64,
    content: String,
}

#[derive(Deserialize)]
struct TokenizerModel {
    /// Unigram models list `[token, score]` pairs (id = position); WordPiece /
    /// BPE models map `token → id`.
    vocab: serde_json::Value,
    #[serde(default)]
    unk_id: Option<i64>,
}

/// Character → id table with the special ids the encoder needs.
#[derive(Debug, Clone)]
pub struct CharVocab {
    chars: HashMap<char, i64>,
    unk_id: i64,
    eos_id: i64,
}

impl CharVocab {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("cannot read tokenizer: {}", path.display()))?;
        Self::from_json(&bytes).with_context(|| format!("bad tokenizer: {}", path.display()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let file: TokenizerFile = serde_json::from_slice(bytes).context("invalid tokenizer.json")?;

        let mut tokens: HashMap<String, i64> = match &file.model.vocab {
            serde_json::Value::Array(entries) => entries
                .iter()
                .enumerate()
                .filter_map(|(id, entry)| Some((entry.get(0)?.as_str()?.to_string(), id as i64)))
                .collect(),
            serde_json::Value::Object(map) => map
                .iter()
                .filter_map(|(tok, id)| Some((tok.clone(), id.as_i64()?)))
                .collect(),
            _ => anyhow::bail!("tokenizer model has no usable vocab"),
        };
        for added in file.added_tokens {
            tokens.insert(added.content, added.id);
        }

        let unk_id = file
            .model
            .unk_id
            .or_else(|| tokens.get("<unk>").copied())
            .context("tokenizer has no <unk> token")?;
        let eos_id = tokens.get("</s>").copied().context("tokenizer has no </s> token")?;

        let chars = tokens
            .iter()
            .filter_map(|(tok, &id)| {
                let mut it = tok.chars();
                match (it.next(), it.next()) {
                    (Some(c), None) => Some((c, id)),
                    _ => None,
                }
            })
            .collect();

        Ok(Self {
            chars,
            unk_id,
            eos_id,
        })
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn eos_id(&self) -> i64 {
        self.eos_id
    }

    fn char_id(&self, c: char) -> i64 {
        self.chars
            .get(&c)
            .or_else(|| c.to_lowercase().next().and_then(|l| self.chars.get(&l)))
            .copied()
            .unwrap_or(self.unk_id)
    }

    /// Text → ids, terminated by `</s>`.
    pub fn encode(&self, text: &str) -> Vec<i64> {
        let mut ids = Vec::with_capacity(text.len() + 2);
        for word in text.split_whitespace() {
            ids.push(self.char_id(WORD_BOUNDARY));
            ids.extend(word.chars().map(|c| self.char_id(c)));
        }
        ids.push(self.eos_id);
        ids
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A tiny Unigram tokenizer.json in the SpeechT5 layout.
    pub(crate) const TOKENIZER_JSON: &str = r#"{
        "added_tokens": [
            {"id": 0, "content": "<s>", "special": true},
            {"id": 1, "content": "<pad>", "special": true},
            {"id": 2, "content": "</s>", "special": true},
            {"id": 3, "content": "<unk>", "special": true}
        ],
        "model": {
            "type": "Unigram",
            "unk_id": 3,
            "vocab": [["<s>", 0.0], ["<pad>", 0.0], ["</s>", 0.0], ["<unk>", 0.0],
                      ["▁", -1.0], ["e", -2.0], ["h", -3.0], ["l", -4.0],
                      ["o", -5.0], ["T", -6.0], [",", -7.0]]
        }
    }"#;

    fn vocab() -> CharVocab {
        CharVocab::from_json(TOKENIZER_JSON.as_bytes()).unwrap()
    }

    #[test]
    fn test_encode_hello() {
        assert_eq!(vocab().encode("hello"), vec![4, 6, 5, 7, 7, 8, 2]);
    }

    #[test]
    fn test_whitespace_collapses_to_boundaries() {
        let v = vocab();
        assert_eq!(v.encode("  he \t  lo "), vec![4, 6, 5, 4, 7, 8, 2]);
    }

    #[test]
    fn test_case_fallback_and_unknown() {
        let v = vocab();
        // 'T' exists as-is, 'H' falls back to 'h', 'z' is unknown.
        assert_eq!(v.encode("THz,"), vec![4, 9, 6, 3, 10, 2]);
    }

    #[test]
    fn test_empty_text_is_just_eos() {
        assert_eq!(vocab().encode("   "), vec![2]);
    }

    #[test]
    fn test_object_vocab() {
        let json = r#"{"model": {"vocab": {"<unk>": 0, "</s>": 1, "a": 2, "▁": 3}}}"#;
        let v = CharVocab::from_json(json.as_bytes()).unwrap();
        assert_eq!(v.encode("a b"), vec![3, 2, 3, 0, 1]);
    }

    #[test]
    fn test_missing_eos_is_error() {
        let json = r#"{"model": {"vocab": {"<unk>": 0, "a": 1}}}"#;
        assert!(CharVocab::from_json(json.as_bytes()).is_err());
    }
}
