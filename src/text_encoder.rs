//! Prompt tokenization and embedding (spec §4.2). Wraps a
//! [`ManagedModel`] the way the teacher's `build_clip_transformer` builds
//! an eagerly-loaded CLIP text transformer, but loads lazily and is
//! fronted by a from-scratch byte-pair-encoding tokenizer over the
//! resource directory's `vocab.json`/`merges.txt`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use tch::{Device, IValue, Tensor};

use crate::error::{Error, Result};
use crate::managed_model::ManagedModel;

/// A from-scratch byte-pair-encoding tokenizer driven by the pair
/// `vocab.json` (token -> id) / `merges.txt` (ordered merge rules) found in
/// a resource directory (spec §6).
pub struct BpeTokenizer {
    encoder: HashMap<String, i64>,
    bpe_ranks: HashMap<(String, String), usize>,
    pattern: Regex,
    sequence_length: usize,
    bos_token: i64,
    eos_token: i64,
}

impl BpeTokenizer {
    pub fn from_files(vocab_path: impl AsRef<Path>, merges_path: impl AsRef<Path>, sequence_length: usize) -> Result<Self> {
        let vocab_path = vocab_path.as_ref();
        let vocab_text = fs::read_to_string(vocab_path)
            .map_err(|_| Error::ResourceMissing { path: vocab_path.display().to_string() })?;
        let encoder: HashMap<String, i64> = serde_json::from_str(&vocab_text).map_err(|source| {
            Error::InvalidMetadata { path: vocab_path.display().to_string(), source }
        })?;

        let merges_path = merges_path.as_ref();
        let merges_text = fs::read_to_string(merges_path)
            .map_err(|_| Error::ResourceMissing { path: merges_path.display().to_string() })?;
        let bpe_ranks: HashMap<(String, String), usize> = merges_text
            .lines()
            .skip(1) // header comment line, CLIP's merges.txt convention
            .filter(|line| !line.is_empty())
            .enumerate()
            .filter_map(|(rank, line)| {
                let mut parts = line.split_whitespace();
                let a = parts.next()?;
                let b = parts.next()?;
                Some(((a.to_string(), b.to_string()), rank))
            })
            .collect();

        if encoder.is_empty() {
            return Err(Error::TokenizationFailed { reason: "vocabulary is empty".to_string() });
        }

        let bos_token = *encoder.get("<|startoftext|>").ok_or_else(|| Error::TokenizationFailed {
            reason: "vocabulary missing <|startoftext|>".to_string(),
        })?;
        let eos_token = *encoder.get("<|endoftext|>").ok_or_else(|| Error::TokenizationFailed {
            reason: "vocabulary missing <|endoftext|>".to_string(),
        })?;

        // CLIP's tokenizer regex: contractions, runs of letters, runs of
        // digits, or a single non-space-non-letter-non-digit symbol.
        let pattern = Regex::new(
            r"(?i)<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[[:alpha:]]+|[[:digit:]]|[^\s[:alpha:][:digit:]]+",
        )
        .expect("tokenizer regex is a compile-time constant");

        Ok(BpeTokenizer { encoder, bpe_ranks, pattern, sequence_length, bos_token, eos_token })
    }

    fn bpe(&self, token: &str) -> Vec<String> {
        let mut word: Vec<String> = token.chars().map(|c| c.to_string()).collect();
        if word.is_empty() {
            return word;
        }
        let last = word.len() - 1;
        word[last] = format!("{}</w>", word[last]);

        loop {
            let mut best: Option<(usize, (String, String))> = None;
            for window in word.windows(2) {
                let pair = (window[0].clone(), window[1].clone());
                if let Some(&rank) = self.bpe_ranks.get(&pair) {
                    if best.as_ref().map(|(r, _)| rank < *r).unwrap_or(true) {
                        best = Some((rank, pair));
                    }
                }
            }
            let Some((_, (first, second))) = best else { break };
            let mut merged = Vec::with_capacity(word.len());
            let mut i = 0;
            while i < word.len() {
                if i + 1 < word.len() && word[i] == first && word[i + 1] == second {
                    merged.push(format!("{first}{second}"));
                    i += 2;
                } else {
                    merged.push(word[i].clone());
                    i += 1;
                }
            }
            word = merged;
            if word.len() == 1 {
                break;
            }
        }
        word
    }

    /// Encode `text` to ids, padded/truncated to the model-declared
    /// sequence length. Truncation beyond the limit is logged, but the
    /// truncated prefix is still what embeds (spec §4.2).
    pub fn encode(&self, text: &str) -> Result<Vec<i64>> {
        let lower = text.to_lowercase();
        let mut ids = vec![self.bos_token];
        for m in self.pattern.find_iter(&lower) {
            for piece in self.bpe(m.as_str()) {
                match self.encoder.get(&piece) {
                    Some(&id) => ids.push(id),
                    None => {
                        return Err(Error::TokenizationFailed {
                            reason: format!("subword {piece:?} absent from vocabulary"),
                        })
                    }
                }
            }
        }
        ids.push(self.eos_token);
        let token_count = ids.len();
        ids.truncate(self.sequence_length);
        if token_count > self.sequence_length {
            log::debug!(
                "prompt truncated from {token_count} to {} tokens",
                self.sequence_length
            );
        }
        while ids.len() < self.sequence_length {
            ids.push(self.eos_token);
        }
        Ok(ids)
    }
}

/// The text encoder: tokenize then embed through the `TextEncoder.*`
/// artifact (spec §4.2). Exposes `encode(text) -> [B,L,E]`.
pub struct TextEncoder {
    model: ManagedModel,
    tokenizer: BpeTokenizer,
    device: Device,
}

impl TextEncoder {
    pub fn new(model: ManagedModel, tokenizer: BpeTokenizer, device: Device) -> Self {
        TextEncoder { model, tokenizer, device }
    }

    pub fn model(&self) -> &ManagedModel {
        &self.model
    }

    /// Run the full tokenize -> embed pipeline, reading "last_hidden_state"
    /// from the output if the artifact returns a named tuple, otherwise
    /// taking the first output (spec §4.2).
    pub fn encode(&self, text: &str) -> Result<Tensor> {
        let ids = self.tokenizer.encode(text)?;
        let input = Tensor::from_slice(&ids).view([1, ids.len() as i64]).to_device(self.device);
        self.model.perform(|module| {
            let output = module.forward_is(&[IValue::Tensor(input.shallow_clone())]).map_err(|source| {
                Error::InferenceFailed { name: self.model.name().to_string(), source }
            })?;
            extract_hidden_state(output).ok_or_else(|| Error::ShapeMismatch {
                context: format!("{} output", self.model.name()),
                expected: vec![1, -1, -1],
                actual: vec![],
            })
        })
    }
}

fn extract_hidden_state(output: IValue) -> Option<Tensor> {
    match output {
        IValue::Tensor(t) => Some(t),
        IValue::Tuple(values) | IValue::GenericList(values) => {
            values.into_iter().find_map(extract_hidden_state)
        }
        IValue::GenericDict(entries) => entries.into_iter().find_map(|(key, value)| match key {
            IValue::String(name) if name == "last_hidden_state" => extract_hidden_state(value),
            _ => None,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let vocab_path = dir.join("vocab.json");
        let merges_path = dir.join("merges.txt");
        let mut vocab = fs::File::create(&vocab_path).unwrap();
        write!(
            vocab,
            r#"{{"<|startoftext|>": 0, "<|endoftext|>": 1, "a</w>": 2, "photo</w>": 3, "p": 4, "h": 5, "o": 6, "t": 7}}"#
        )
        .unwrap();
        let mut merges = fs::File::create(&merges_path).unwrap();
        writeln!(merges, "#version: fixture").unwrap();
        fs::write(&merges_path, "#version: fixture\n").unwrap();
        (vocab_path, merges_path)
    }

    #[test]
    fn empty_vocabulary_is_fatal() {
        let dir = std::env::temp_dir().join(format!("bpe-test-empty-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let vocab_path = dir.join("vocab.json");
        let merges_path = dir.join("merges.txt");
        fs::write(&vocab_path, "{}").unwrap();
        fs::write(&merges_path, "#header\n").unwrap();
        let err = BpeTokenizer::from_files(&vocab_path, &merges_path, 77).unwrap_err();
        assert!(matches!(err, Error::TokenizationFailed { .. }));
    }

    #[test]
    fn encode_pads_to_sequence_length() {
        let dir = std::env::temp_dir().join(format!("bpe-test-pad-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let (vocab_path, merges_path) = write_fixture(&dir);
        let tokenizer = BpeTokenizer::from_files(&vocab_path, &merges_path, 8).unwrap();
        let ids = tokenizer.encode("a").unwrap();
        assert_eq!(ids.len(), 8);
        assert_eq!(ids[0], 0); // bos
    }

    #[test]
    fn encode_truncates_to_sequence_length() {
        let dir = std::env::temp_dir().join(format!("bpe-test-trunc-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let (vocab_path, merges_path) = write_fixture(&dir);
        let tokenizer = BpeTokenizer::from_files(&vocab_path, &merges_path, 3).unwrap();
        let ids = tokenizer.encode("a photo").unwrap();
        assert_eq!(ids.len(), 3);
    }
}
