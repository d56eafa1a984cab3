// Honyaku Engine — Subword tokenization for the local MT models
//
// One enum, two realizations: `tokenizer.json` files load through the pure
// Rust `tokenizers` crate; raw SentencePiece `.model` files go through the
// native bindings when the `native-spm` feature is compiled in. Call sites
// dispatch by match — no trait objects.
//
// Special-token quirks live here so the decode loop doesn't have to know
// model families: Helsinki OPUS-MT exports report no usable EOS (it is the
// same piece as BOS, id 0) and reserve pad id 60715 without naming it.

use crate::atoms::constants::HELSINKI_PAD_SENTINEL;
use crate::atoms::error::{CoreError, CoreResult};
use log::debug;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialToken {
    Bos,
    Eos,
    Pad,
    Unk,
}

enum TokenizerImpl {
    /// HuggingFace `tokenizer.json` (Unigram/SentencePiece serialization).
    Json(tokenizers::Tokenizer),
    /// Native SentencePiece `.model` file.
    #[cfg(feature = "native-spm")]
    Native(sentencepiece::SentencePieceProcessor),
}

pub struct SubwordTokenizer {
    inner: TokenizerImpl,
    vocab_size: usize,
    bos_id: i64,
    eos_id: i64,
    pad_id: i64,
    unk_id: i64,
}

impl SubwordTokenizer {
    /// Load a tokenizer from disk. `.model` selects the native SentencePiece
    /// path; anything else is parsed as `tokenizer.json`. Missing or
    /// unparseable files are fatal.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            return Err(CoreError::config(format!(
                "tokenizer file not found: {}",
                path.display()
            )));
        }

        match path.extension().and_then(|e| e.to_str()) {
            Some("model") => Self::from_native(path),
            _ => {
                let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
                    CoreError::config(format!("cannot parse {}: {}", path.display(), e))
                })?;
                Ok(Self::from_tokenizer(inner))
            }
        }
    }

    /// Wrap an already-built `tokenizers` tokenizer, resolving special ids.
    pub(crate) fn from_tokenizer(inner: tokenizers::Tokenizer) -> Self {
        let vocab_size = inner.get_vocab_size(true);
        let lookup = |piece: &str| inner.token_to_id(piece).map(|id| id as i64);

        // Helsinki convention: no "<s>" piece, "</s>" at id 0 doing double
        // duty. An invalid/absent EOS aliases to BOS.
        let bos_id = lookup("<s>").unwrap_or(0);
        let eos_id = lookup("</s>").filter(|&id| id >= 0).unwrap_or(bos_id);
        let pad_id = lookup("<pad>").unwrap_or(HELSINKI_PAD_SENTINEL);
        let unk_id = lookup("<unk>").unwrap_or(0);

        debug!(
            "[tokenizer] vocab={} bos={} eos={} pad={} unk={}",
            vocab_size, bos_id, eos_id, pad_id, unk_id
        );

        SubwordTokenizer { inner: TokenizerImpl::Json(inner), vocab_size, bos_id, eos_id, pad_id, unk_id }
    }

    #[cfg(feature = "native-spm")]
    fn from_native(path: &Path) -> CoreResult<Self> {
        let spm = sentencepiece::SentencePieceProcessor::open(path)
            .map_err(|e| CoreError::config(format!("cannot open {}: {}", path.display(), e)))?;
        let vocab_size = spm.len();
        let bos_id = spm.bos_id().map(|id| id as i64).unwrap_or(0);
        let eos_id = spm.eos_id().map(|id| id as i64).filter(|&id| id >= 0).unwrap_or(bos_id);
        let pad_id = spm.pad_id().map(|id| id as i64).unwrap_or(HELSINKI_PAD_SENTINEL);
        let unk_id = spm.unk_id() as i64;
        Ok(SubwordTokenizer {
            inner: TokenizerImpl::Native(spm),
            vocab_size,
            bos_id,
            eos_id,
            pad_id,
            unk_id,
        })
    }

    #[cfg(not(feature = "native-spm"))]
    fn from_native(path: &Path) -> CoreResult<Self> {
        Err(CoreError::config(format!(
            "{} is a raw SentencePiece model; rebuild with the `native-spm` feature or convert to tokenizer.json",
            path.display()
        )))
    }

    // ── Capability set ─────────────────────────────────────────────────────

    /// Deterministic text → ids, applying the model's own normalizer. No
    /// special tokens are added; the decode loop manages BOS/EOS itself.
    pub fn encode(&self, text: &str) -> CoreResult<Vec<i64>> {
        match &self.inner {
            TokenizerImpl::Json(t) => {
                let encoding = t
                    .encode(text, false)
                    .map_err(|e| CoreError::processing(format!("encode failed: {}", e)))?;
                Ok(encoding.get_ids().iter().map(|&id| id as i64).collect())
            }
            #[cfg(feature = "native-spm")]
            TokenizerImpl::Native(spm) => {
                let pieces = spm
                    .encode(text)
                    .map_err(|e| CoreError::processing(format!("encode failed: {}", e)))?;
                Ok(pieces.into_iter().map(|p| p.id as i64).collect())
            }
        }
    }

    /// Ids → text. Out-of-range ids render as nothing: they are dropped
    /// (mapped to the unknown token) before the underlying decoder runs.
    pub fn decode(&self, ids: &[i64]) -> CoreResult<String> {
        let in_range: Vec<u32> = ids
            .iter()
            .filter(|&&id| id >= 0 && (id as usize) < self.vocab_size)
            .map(|&id| id as u32)
            .collect();

        match &self.inner {
            TokenizerImpl::Json(t) => t
                .decode(&in_range, true)
                .map_err(|e| CoreError::processing(format!("decode failed: {}", e))),
            #[cfg(feature = "native-spm")]
            TokenizerImpl::Native(spm) => spm
                .decode_piece_ids(&in_range)
                .map_err(|e| CoreError::processing(format!("decode failed: {}", e))),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn special_token_id(&self, kind: SpecialToken) -> i64 {
        match kind {
            SpecialToken::Bos => self.bos_id,
            SpecialToken::Eos => self.eos_id,
            SpecialToken::Pad => self.pad_id,
            SpecialToken::Unk => self.unk_id,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::AddedToken;

    /// Word-level stand-in with the Helsinki vocabulary shape: "</s>" at 0,
    /// no "<s>", no "<pad>".
    fn helsinki_like() -> SubwordTokenizer {
        let mut vocab: HashMap<String, u32> = HashMap::new();
        vocab.insert("</s>".into(), 0);
        vocab.insert("<unk>".into(), 1);
        vocab.insert("hello".into(), 2);
        vocab.insert("world".into(), 3);
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".into())
            .build()
            .unwrap();
        let mut tokenizer = tokenizers::Tokenizer::new(model);
        tokenizer.add_special_tokens(&[
            AddedToken::from("</s>", true),
            AddedToken::from("<unk>", true),
        ]);
        SubwordTokenizer::from_tokenizer(tokenizer)
    }

    #[test]
    fn test_helsinki_special_tokens() {
        let tok = helsinki_like();
        assert_eq!(tok.special_token_id(SpecialToken::Bos), 0);
        assert_eq!(tok.special_token_id(SpecialToken::Eos), 0);
        assert_eq!(tok.special_token_id(SpecialToken::Pad), HELSINKI_PAD_SENTINEL);
        assert_eq!(tok.special_token_id(SpecialToken::Unk), 1);
        assert_eq!(tok.vocab_size(), 4);
    }

    #[test]
    fn test_encode_known_word() {
        let tok = helsinki_like();
        let ids = tok.encode("hello").unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_decode_drops_out_of_range_ids() {
        let tok = helsinki_like();
        // 9999 is outside the vocabulary, -1 is invalid.
        let text = tok.decode(&[2, 9999, -1]).unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn test_decode_skips_special_tokens() {
        let tok = helsinki_like();
        let text = tok.decode(&[2, 0]).unwrap();
        assert_eq!(text.trim(), "hello");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = SubwordTokenizer::from_file(Path::new("/nonexistent/tokenizer.json")).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }
}
