//! BPE tokenizer for llama2.c `tokenizer.bin` vocabularies
//!
//! File format: one little-endian i32 max token length, then for each of
//! `vocab_size` entries an f32 merge score, an i32 byte length, and that many
//! raw bytes. BOS id is 1, EOS id is 2.

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::info;

pub const BOS_ID: u32 = 1;
pub const EOS_ID: u32 = 2;

pub struct Tokenizer {
    /// token id → raw bytes of the piece
    vocab: Vec<Vec<u8>>,
    /// token id → merge score
    vocab_scores: Vec<f32>,
    /// piece bytes → token id
    token_to_id: HashMap<Vec<u8>, u32>,
    max_token_length: usize,
}

impl Tokenizer {
    pub fn from_file(path: &Path, vocab_size: usize) -> Result<Self> {
        info!("Loading tokenizer: {}", path.display());
        let file = File::open(path)
            .with_context(|| format!("failed to open tokenizer: {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let max_token_length = reader
            .read_i32::<LittleEndian>()
            .context("truncated tokenizer header")? as usize;

        let mut vocab = Vec::with_capacity(vocab_size);
        let mut vocab_scores = Vec::with_capacity(vocab_size);
        for i in 0..vocab_size {
            let score = reader
                .read_f32::<LittleEndian>()
                .with_context(|| format!("truncated tokenizer entry {i}"))?;
            let len = reader
                .read_i32::<LittleEndian>()
                .with_context(|| format!("truncated tokenizer entry {i}"))? as usize;
            let mut piece = vec![0u8; len];
            reader
                .read_exact(&mut piece)
                .with_context(|| format!("truncated tokenizer entry {i}"))?;
            vocab_scores.push(score);
            vocab.push(piece);
        }

        Ok(Self::from_vocab(vocab, vocab_scores, max_token_length))
    }

    /// Build a tokenizer from in-memory vocab tables.
    pub fn from_vocab(vocab: Vec<Vec<u8>>, vocab_scores: Vec<f32>, max_token_length: usize) -> Self {
        let mut token_to_id = HashMap::with_capacity(vocab.len());
        for (i, piece) in vocab.iter().enumerate() {
            // First occurrence wins for duplicate pieces
            token_to_id.entry(piece.clone()).or_insert(i as u32);
        }
        Self {
            vocab,
            vocab_scores,
            token_to_id,
            max_token_length,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn max_token_length(&self) -> usize {
        self.max_token_length
    }

    fn lookup(&self, piece: &[u8]) -> Option<u32> {
        self.token_to_id.get(piece).copied()
    }

    /// Encode text into token ids: optional BOS, SentencePiece-style space
    /// prefix, per-byte lookup with `<0xXX>` fallback, then iterative
    /// highest-score pair merging.
    pub fn encode(&self, text: &str, bos: bool, eos: bool) -> Vec<u32> {
        let mut tokens: Vec<u32> = Vec::new();
        if bos {
            tokens.push(BOS_ID);
        }

        // SentencePiece prepends a space before the first word
        if !text.is_empty() {
            if let Some(id) = self.lookup(b" ") {
                tokens.push(id);
            }
        }

        for &b in text.as_bytes() {
            if let Some(id) = self.lookup(&[b]) {
                tokens.push(id);
            } else {
                let byte_token = format!("<0x{:02X}>", b);
                if let Some(id) = self.lookup(byte_token.as_bytes()) {
                    tokens.push(id);
                } else {
                    tracing::warn!("no vocab entry for byte 0x{:02X}, skipping", b);
                }
            }
        }

        // Greedily merge the adjacent pair with the highest merge score until
        // no merge applies.
        loop {
            let mut best_score = f32::NEG_INFINITY;
            let mut best: Option<(usize, u32)> = None;

            for i in 0..tokens.len().saturating_sub(1) {
                let mut merged = self.vocab[tokens[i] as usize].clone();
                merged.extend_from_slice(&self.vocab[tokens[i + 1] as usize]);
                if let Some(id) = self.lookup(&merged) {
                    if self.vocab_scores[id as usize] > best_score {
                        best_score = self.vocab_scores[id as usize];
                        best = Some((i, id));
                    }
                }
            }

            match best {
                Some((idx, id)) => {
                    tokens[idx] = id;
                    tokens.remove(idx + 1);
                }
                None => break,
            }
        }

        if eos {
            tokens.push(EOS_ID);
        }
        tokens
    }

    /// Decode a single token id to its text piece.
    pub fn decode(&self, token: u32) -> String {
        let Some(piece) = self.vocab.get(token as usize) else {
            return String::new();
        };
        // Raw byte tokens are spelled "<0xXX>" in the vocab
        if piece.len() == 6 && piece.starts_with(b"<0x") && piece.ends_with(b">") {
            if let Ok(hex) = std::str::from_utf8(&piece[3..5]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    return String::from_utf8_lossy(&[byte]).into_owned();
                }
            }
        }
        String::from_utf8_lossy(piece).into_owned()
    }

    /// Decode a token sequence to text.
    pub fn decode_all(&self, tokens: &[u32]) -> String {
        tokens.iter().map(|&t| self.decode(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Write;

    // Small vocab: ids 0..3 reserved like llama2.c (<unk>, BOS, EOS), then
    // single characters and a few merge targets.
    fn test_tokenizer() -> Tokenizer {
        let pieces: Vec<&[u8]> = vec![
            b"<unk>", b"<s>", b"</s>", b" ", b"a", b"b", b"c", b"ab", b"abc",
        ];
        let scores = vec![0.0, 0.0, 0.0, -1.0, -1.0, -1.0, -1.0, 1.0, 2.0];
        Tokenizer::from_vocab(
            pieces.into_iter().map(|p| p.to_vec()).collect(),
            scores,
            8,
        )
    }

    #[test]
    fn test_encode_merges_by_score() {
        let tok = test_tokenizer();
        // "abc" → [BOS, " ", a, b, c] → merges to [BOS, " ", abc]
        let ids = tok.encode("abc", true, false);
        assert_eq!(ids, vec![BOS_ID, 3, 8]);
    }

    #[test]
    fn test_encode_empty_prompt() {
        let tok = test_tokenizer();
        assert_eq!(tok.encode("", true, false), vec![BOS_ID]);
        assert_eq!(tok.encode("", true, true), vec![BOS_ID, EOS_ID]);
    }

    #[test]
    fn test_encode_partial_merge() {
        let tok = test_tokenizer();
        // "ab" merges once, "c" alone stays
        let ids = tok.encode("ab", false, false);
        assert_eq!(ids, vec![3, 7]);
    }

    #[test]
    fn test_decode_roundtrip_pieces() {
        let tok = test_tokenizer();
        assert_eq!(tok.decode(8), "abc");
        assert_eq!(tok.decode_all(&[3, 4, 5]), " ab");
    }

    #[test]
    fn test_decode_byte_token() {
        let tok = Tokenizer::from_vocab(
            vec![b"<0x41>".to_vec()],
            vec![0.0],
            8,
        );
        assert_eq!(tok.decode(0), "A");
    }

    #[test]
    fn test_decode_out_of_range() {
        let tok = test_tokenizer();
        assert_eq!(tok.decode(10_000), "");
    }

    #[test]
    fn test_from_file_roundtrip() {
        let pieces: Vec<&[u8]> = vec![b"<unk>", b"<s>", b"</s>", b"x"];
        let scores = [0.0f32, 0.0, 0.0, -1.5];

        let mut buf: Vec<u8> = Vec::new();
        buf.write_i32::<LittleEndian>(8).unwrap();
        for (piece, score) in pieces.iter().zip(scores.iter()) {
            buf.write_f32::<LittleEndian>(*score).unwrap();
            buf.write_i32::<LittleEndian>(piece.len() as i32).unwrap();
            buf.write_all(piece).unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.bin");
        std::fs::write(&path, &buf).unwrap();

        let tok = Tokenizer::from_file(&path, pieces.len()).unwrap();
        assert_eq!(tok.vocab_size(), 4);
        assert_eq!(tok.max_token_length(), 8);
        assert_eq!(tok.decode(3), "x");
        assert_eq!(tok.encode("x", true, false), vec![BOS_ID, 3]);
    }

    #[test]
    fn test_from_file_missing() {
        let err = Tokenizer::from_file(Path::new("/nonexistent/tokenizer.bin"), 4);
        assert!(err.is_err());
    }
}
