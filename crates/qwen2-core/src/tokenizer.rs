//! Byte-level BPE tokenizer, GPT-2/Qwen2 style.
//!
//! Every byte has a home in the vocabulary (via the reversible
//! byte→unicode remap table below), so encoding never falls back to an
//! unknown-token placeholder the way word-level vocabularies do.
//! Merges are applied by looking up each adjacent pair's rank in the
//! GGUF-provided merge list and repeatedly collapsing the
//! lowest-rank pair, left to right, same as the reference GPT-2
//! implementation.

use std::collections::HashMap;
use std::sync::OnceLock;

use fancy_regex::Regex;

use crate::error::{Error, Result};
use crate::gguf::GgufValue;

/// Qwen2's pretokenization pattern (shared with GPT-4/cl100k): splits
/// contractions, letter runs, digit runs (capped at 3), punctuation runs,
/// and whitespace, with a negative lookahead so trailing whitespace before
/// a non-space character stays attached to the next word instead of the
/// preceding one.
const PRETOKENIZE_PATTERN: &str =
    r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

fn pretokenize_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PRETOKENIZE_PATTERN).expect("pretokenize pattern is valid"))
}

/// The reversible byte↔unicode table GPT-2 uses so every one of the 256
/// possible bytes maps to a single printable `char`, none of which
/// collide with BPE merge-rule syntax (whitespace, control codes).
fn byte_to_unicode() -> &'static [char; 256] {
    static TABLE: OnceLock<[char; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut printable: Vec<u32> = (b'!' as u32..=b'~' as u32)
            .chain(0xA1..=0xAC)
            .chain(0xAE..=0xFF)
            .collect();
        let mut table = [0u32; 256];
        for &b in &printable {
            table[b as usize] = b;
        }
        let mut next = 256u32;
        for b in 0..256u32 {
            if !printable.contains(&b) {
                table[b as usize] = next;
                printable.push(b);
                next += 1;
            }
        }
        let mut out = ['\0'; 256];
        for (i, &cp) in table.iter().enumerate() {
            out[i] = char::from_u32(cp).expect("byte remap produces a valid scalar value");
        }
        out
    })
}

fn unicode_to_byte() -> &'static HashMap<char, u8> {
    static MAP: OnceLock<HashMap<char, u8>> = OnceLock::new();
    MAP.get_or_init(|| byte_to_unicode().iter().enumerate().map(|(b, &c)| (c, b as u8)).collect())
}

const SPECIAL_TOKENS: &[&str] = &["<|im_start|>", "<|im_end|>", "<|endoftext|>"];

/// `tokenizer.ggml.token_type` codes, per the GGUF tokenizer-model spec.
/// Only `Normal` and `Byte` are ever streamed to the terminal; the rest
/// (control tokens, unknown, unused) are suppressed during streaming
/// even if they'd otherwise decode to visible text.
const TOKEN_TYPE_NORMAL: i32 = 1;
const TOKEN_TYPE_BYTE: i32 = 6;

pub struct BpeTokenizer {
    vocab: Vec<String>,
    token_to_id: HashMap<String, u32>,
    merge_ranks: HashMap<(String, String), usize>,
    token_type: Vec<i32>,
    pub im_start_id: u32,
    pub im_end_id: u32,
    pub endoftext_id: u32,
}

impl BpeTokenizer {
    pub fn from_gguf(metadata: &HashMap<String, GgufValue>) -> Result<Self> {
        let tokens = metadata
            .get("tokenizer.ggml.tokens")
            .and_then(GgufValue::as_array)
            .ok_or_else(|| Error::tokenizer("missing tokenizer.ggml.tokens"))?;

        let vocab: Vec<String> = tokens.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        if vocab.is_empty() {
            return Err(Error::tokenizer("empty vocabulary"));
        }

        let token_to_id: HashMap<String, u32> =
            vocab.iter().enumerate().map(|(i, t)| (t.clone(), i as u32)).collect();

        let merge_ranks: HashMap<(String, String), usize> = metadata
            .get("tokenizer.ggml.merges")
            .and_then(GgufValue::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(GgufValue::as_str)
                    .enumerate()
                    .filter_map(|(rank, merge)| {
                        let mut parts = merge.split(' ');
                        let a = parts.next()?;
                        let b = parts.next()?;
                        Some(((a.to_string(), b.to_string()), rank))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let token_type: Vec<i32> = metadata
            .get("tokenizer.ggml.token_type")
            .and_then(GgufValue::as_array)
            .map(|arr| arr.iter().map(|v| v.as_u32().map(|u| u as i32).unwrap_or(TOKEN_TYPE_NORMAL)).collect())
            .unwrap_or_else(|| vec![TOKEN_TYPE_NORMAL; vocab.len()]);

        let find_special = |name: &str, fallback: usize| -> u32 {
            token_to_id.get(name).copied().unwrap_or(fallback.min(vocab.len() - 1) as u32)
        };

        let im_start_id = find_special("<|im_start|>", vocab.len().saturating_sub(3));
        let im_end_id = find_special("<|im_end|>", vocab.len().saturating_sub(2));
        let endoftext_id = find_special("<|endoftext|>", vocab.len().saturating_sub(1));

        tracing::info!(vocab_size = vocab.len(), merges = merge_ranks.len(), "tokenizer loaded");

        Ok(Self { vocab, token_to_id, merge_ranks, token_type, im_start_id, im_end_id, endoftext_id })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Whether streaming output should print this token as it's produced.
    /// Only `Normal` and `Byte` tokens are ever echoed; specials and
    /// other control codes are suppressed (§6 streaming output).
    pub fn is_printable(&self, id: u32) -> bool {
        matches!(self.token_type.get(id as usize), Some(&TOKEN_TYPE_NORMAL) | Some(&TOKEN_TYPE_BYTE))
    }

    pub fn is_special(&self, id: u32) -> bool {
        id == self.im_start_id || id == self.im_end_id || id == self.endoftext_id
    }

    /// Encode raw text into token IDs. Literal occurrences of the three
    /// ChatML control strings are recognized and encoded as single
    /// tokens even when they appear inside otherwise plain text.
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        for segment in split_on_specials(text) {
            match segment {
                Segment::Special(tok) => {
                    if let Some(&id) = self.token_to_id.get(tok) {
                        ids.push(id);
                    }
                }
                Segment::Text(chunk) => {
                    for piece in pretokenize_regex().find_iter(chunk) {
                        let Ok(piece) = piece else { continue };
                        self.encode_piece(piece.as_str(), &mut ids);
                    }
                }
            }
        }
        ids
    }

    fn encode_piece(&self, piece: &str, out: &mut Vec<u32>) {
        let byte_table = byte_to_unicode();
        let mut symbols: Vec<String> =
            piece.bytes().map(|b| byte_table[b as usize].to_string()).collect();

        loop {
            let mut best_rank = usize::MAX;
            let mut best_pos = usize::MAX;
            for i in 0..symbols.len().saturating_sub(1) {
                if let Some(&rank) = self.merge_ranks.get(&(symbols[i].clone(), symbols[i + 1].clone())) {
                    if rank < best_rank {
                        best_rank = rank;
                        best_pos = i;
                    }
                }
            }
            if best_pos == usize::MAX {
                break;
            }
            let merged = format!("{}{}", symbols[best_pos], symbols[best_pos + 1]);
            symbols.splice(best_pos..best_pos + 2, [merged]);
        }

        for symbol in symbols {
            match self.token_to_id.get(&symbol) {
                Some(&id) => out.push(id),
                None => {
                    // No single vocabulary entry for this (shouldn't
                    // happen once merges run to completion against a
                    // complete merge table) — fall back to per-byte ids.
                    for ch in symbol.chars() {
                        if let Some(&id) = self.token_to_id.get(&ch.to_string()) {
                            out.push(id);
                        }
                    }
                }
            }
        }
    }

    /// Decode token IDs back to text. A decoded codepoint that isn't in
    /// the byte remap table is a format error, not silently dropped —
    /// it means the vocabulary and the decoder disagree about what a
    /// token represents.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let decoder = unicode_to_byte();
        let mut bytes = Vec::new();
        for &id in ids {
            let token = self
                .vocab
                .get(id as usize)
                .ok_or_else(|| Error::tokenizer(format!("token id {id} out of range")))?;
            for ch in token.chars() {
                let b = decoder
                    .get(&ch)
                    .ok_or_else(|| Error::format(format!("codepoint {ch:?} is not a valid byte-remap character")))?;
                bytes.push(*b);
            }
        }
        String::from_utf8(bytes).map_err(|e| Error::format(format!("decoded bytes are not valid UTF-8: {e}")))
    }

    pub fn decode_token(&self, id: u32) -> Result<String> {
        self.decode(&[id])
    }
}

enum Segment<'a> {
    Special(&'a str),
    Text(&'a str),
}

fn split_on_specials(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = text;
    'outer: while !rest.is_empty() {
        for &special in SPECIAL_TOKENS {
            if let Some(idx) = rest.find(special) {
                if idx == 0 {
                    segments.push(Segment::Special(special));
                    rest = &rest[special.len()..];
                    continue 'outer;
                }
            }
        }
        // Find the earliest special token occurrence, split the plain
        // text up to it off as its own segment.
        let mut earliest = None;
        for &special in SPECIAL_TOKENS {
            if let Some(idx) = rest.find(special) {
                earliest = Some(match earliest {
                    Some(e) if e <= idx => e,
                    _ => idx,
                });
            }
        }
        match earliest {
            Some(idx) => {
                segments.push(Segment::Text(&rest[..idx]));
                rest = &rest[idx..];
            }
            None => {
                segments.push(Segment::Text(rest));
                break;
            }
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tokenizer() -> BpeTokenizer {
        let mut metadata = HashMap::new();
        let vocab = vec![
            "h", "e", "l", "o", " ", "he", "ll", "hell", "hello", "<|im_start|>", "<|im_end|>", "<|endoftext|>",
        ];
        metadata.insert(
            "tokenizer.ggml.tokens".to_string(),
            GgufValue::Array(vocab.iter().map(|s| GgufValue::String(s.to_string())).collect()),
        );
        metadata.insert(
            "tokenizer.ggml.merges".to_string(),
            GgufValue::Array(
                ["h e", "he l", "hel l", "hell o"]
                    .iter()
                    .map(|s| GgufValue::String(s.to_string()))
                    .collect(),
            ),
        );
        BpeTokenizer::from_gguf(&metadata).unwrap()
    }

    #[test]
    fn byte_table_is_a_bijection() {
        let table = byte_to_unicode();
        let mut seen = std::collections::HashSet::new();
        for &c in table {
            assert!(seen.insert(c), "duplicate codepoint in byte remap table");
        }
        let back = unicode_to_byte();
        for b in 0..=255u8 {
            assert_eq!(back[&table[b as usize]], b);
        }
    }

    #[test]
    fn merges_apply_in_rank_order() {
        let tok = test_tokenizer();
        let mut ids = Vec::new();
        tok.encode_piece("hello", &mut ids);
        let decoded = tok.decode(&ids).unwrap();
        assert_eq!(decoded, "hello");
    }

    #[test]
    fn decode_rejects_unmapped_codepoint() {
        let tok = test_tokenizer();
        let err = tok.decode_token(99).unwrap_err();
        assert!(matches!(err, Error::Tokenizer(_)));
    }

    #[test]
    fn special_tokens_round_trip_as_single_ids() {
        let tok = test_tokenizer();
        let ids = tok.encode("<|im_start|>hello<|im_end|>");
        assert_eq!(ids[0], tok.im_start_id);
        assert_eq!(*ids.last().unwrap(), tok.im_end_id);
    }

    #[test]
    fn token_type_defaults_to_normal_when_metadata_absent() {
        let tok = test_tokenizer();
        assert!(tok.is_printable(0));
        assert!(tok.is_printable(tok.im_end_id));
    }

    #[test]
    fn token_type_suppresses_control_tokens_when_present() {
        let mut metadata = HashMap::new();
        let vocab = vec!["a", "<|im_start|>"];
        metadata.insert(
            "tokenizer.ggml.tokens".to_string(),
            GgufValue::Array(vocab.iter().map(|s| GgufValue::String(s.to_string())).collect()),
        );
        metadata.insert(
            "tokenizer.ggml.token_type".to_string(),
            GgufValue::Array(vec![GgufValue::I32(1), GgufValue::I32(3)]),
        );
        let tok = BpeTokenizer::from_gguf(&metadata).unwrap();
        assert!(tok.is_printable(0));
        assert!(!tok.is_printable(1));
    }
}
