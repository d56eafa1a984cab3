// Honyaku Engine — Backend-A: on-device OPUS-MT translation
//
// Autoregressive greedy decoding over an encoder–decoder ONNX export with a
// source and a target SentencePiece tokenizer. The decode loop applies a
// repetition penalty, keeps ids inside the target vocabulary, and carries
// the Helsinki `BOS == EOS` guard so the model cannot terminate on step 0.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{DeviceKind, TokenUsage, TranslationRequest, TranslationResponse};
use crate::engine::config::OpusmtConfig;
use crate::engine::local::session::OnnxSession;
use crate::engine::local::tokenizer::{SpecialToken, SubwordTokenizer};
use log::{debug, info};
use ndarray::{s, Array2, Axis};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

pub const LOCAL_PROVIDER_ID: &str = "local_opusmt";

// ── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocalEngineOptions {
    pub model_path: PathBuf,
    pub source_tokenizer_path: PathBuf,
    pub target_tokenizer_path: PathBuf,
    pub device: DeviceKind,
    pub max_sequence_length: usize,
    pub max_output_length: usize,
    /// Logit divisor for already-emitted ids; 1.0 disables.
    pub repetition_penalty: f32,
    /// EOS is not honored (and, for `BOS == EOS` models, not selectable)
    /// before this many decode steps.
    pub min_steps_before_eos: usize,
}

impl LocalEngineOptions {
    /// Build from the config section; all three paths are required.
    pub fn from_config(config: &OpusmtConfig) -> CoreResult<Self> {
        let require = |field: &str, value: &Option<PathBuf>| {
            value
                .clone()
                .ok_or_else(|| CoreError::config(format!("Translation.OpusMT.{} is not set", field)))
        };
        Ok(LocalEngineOptions {
            model_path: require("ModelPath", &config.model_path)?,
            source_tokenizer_path: require("SourceTokenizerPath", &config.source_tokenizer_path)?,
            target_tokenizer_path: require("TargetTokenizerPath", &config.target_tokenizer_path)?,
            device: config.device,
            max_sequence_length: config.max_sequence_length,
            max_output_length: config.max_output_length,
            repetition_penalty: config.repetition_penalty,
            min_steps_before_eos: config.min_steps_before_eos,
        })
    }
}

// ── Engine ─────────────────────────────────────────────────────────────────

pub struct LocalMtEngine {
    options: LocalEngineOptions,
    /// The ONNX session is single-writer; serializing `run` here is part of
    /// the engine's public contract.
    session: Mutex<OnnxSession>,
    source_tokenizer: SubwordTokenizer,
    target_tokenizer: SubwordTokenizer,
}

impl LocalMtEngine {
    /// Load model and tokenizers. Missing files are fatal.
    pub fn load(options: LocalEngineOptions) -> CoreResult<Self> {
        let source_tokenizer = SubwordTokenizer::from_file(&options.source_tokenizer_path)?;
        let target_tokenizer = SubwordTokenizer::from_file(&options.target_tokenizer_path)?;
        let session = OnnxSession::load(&options.model_path, options.device)?;
        info!(
            "[opusmt] engine loaded: source vocab {}, target vocab {}",
            source_tokenizer.vocab_size(),
            target_tokenizer.vocab_size()
        );
        Ok(LocalMtEngine {
            options,
            session: Mutex::new(session),
            source_tokenizer,
            target_tokenizer,
        })
    }

    /// Translate one request. Inference faults come back as a structured
    /// processing error on the response, never a panic.
    pub fn translate(&self, request: &TranslationRequest) -> TranslationResponse {
        let started = Instant::now();
        match self.decode_greedy(&request.text) {
            Ok((text, usage)) => {
                let mut response = TranslationResponse::ok(&request.request_id, LOCAL_PROVIDER_ID, text)
                    .with_usage(usage)
                    .with_elapsed(started.elapsed());
                response.detected_language = Some(request.source_language.clone());
                response
            }
            Err(e) => TranslationResponse::fail(&request.request_id, LOCAL_PROVIDER_ID, e)
                .with_elapsed(started.elapsed()),
        }
    }

    fn decode_greedy(&self, text: &str) -> CoreResult<(String, TokenUsage)> {
        // 1. Encode with the source tokenizer, truncating to the window.
        let mut source_ids = self.source_tokenizer.encode(text)?;
        if source_ids.len() > self.options.max_sequence_length {
            debug!(
                "[opusmt] truncating input {} → {} tokens",
                source_ids.len(),
                self.options.max_sequence_length
            );
            source_ids.truncate(self.options.max_sequence_length);
        }
        if source_ids.is_empty() {
            return Ok((String::new(), TokenUsage::default()));
        }
        let input_len = source_ids.len();

        // 2. Encoder tensors: ids [1, L] and an all-ones mask [1, L].
        let encoder_ids = Array2::from_shape_vec((1, input_len), source_ids)
            .map_err(|e| CoreError::processing(format!("encoder tensor: {}", e)))?;
        let encoder_mask = Array2::<i64>::ones((1, input_len));

        // 3. Special ids come from the *target* side of the pair.
        let bos = self.target_tokenizer.special_token_id(SpecialToken::Bos);
        let eos = self.target_tokenizer.special_token_id(SpecialToken::Eos);
        let pad = self.target_tokenizer.special_token_id(SpecialToken::Pad);
        let target_vocab = self.target_tokenizer.vocab_size();

        let mut decoder_ids: Vec<i64> = vec![bos];
        let mut output_ids: Vec<i64> = Vec::new();
        let mut emitted: HashSet<i64> = HashSet::new();

        // 4. Greedy loop: one forward pass per generated token.
        let session = self.session.lock();
        for step in 0..self.options.max_output_length {
            let decoder_tensor = Array2::from_shape_vec((1, decoder_ids.len()), decoder_ids.clone())
                .map_err(|e| CoreError::processing(format!("decoder tensor: {}", e)))?;

            let logits =
                session.run(encoder_ids.clone(), encoder_mask.clone(), decoder_tensor)?;
            let logits = logits
                .into_dimensionality::<ndarray::Ix3>()
                .map_err(|e| CoreError::processing(format!("logits shape: {}", e)))?;

            // Last decoder position along the sequence axis.
            let last_index = logits.len_of(Axis(1)).saturating_sub(1);
            let row = logits.slice(s![0, last_index, ..]);
            let row: Vec<f32> = row.iter().copied().collect();

            let filter = StepFilter {
                bos,
                eos,
                pad,
                vocab_size: target_vocab,
                repetition_penalty: self.options.repetition_penalty,
                min_steps_before_eos: self.options.min_steps_before_eos,
                step,
            };
            let Some(next_id) = argmax_filtered(&row, &filter, &emitted) else {
                break;
            };

            if next_id == eos && step >= self.options.min_steps_before_eos {
                break;
            }
            decoder_ids.push(next_id);
            output_ids.push(next_id);
            emitted.insert(next_id);
        }
        drop(session);

        // 5. Keep only ids the target vocabulary can render, then decode.
        output_ids.retain(|&id| id >= 0 && (id as usize) < target_vocab);
        let usage = TokenUsage::new(input_len as u64, output_ids.len() as u64);
        let translated = self.target_tokenizer.decode(&output_ids)?;
        Ok((translated, usage))
    }
}

// ── Next-id selection ──────────────────────────────────────────────────────

pub(crate) struct StepFilter {
    pub bos: i64,
    pub eos: i64,
    pub pad: i64,
    pub vocab_size: usize,
    pub repetition_penalty: f32,
    pub min_steps_before_eos: usize,
    pub step: usize,
}

/// Argmax over one logits row with the decode-loop filters applied:
/// out-of-vocabulary ids, BOS, and PAD are never selectable; EOS is blocked
/// early for `BOS == EOS` models; emitted ids are penalized. Returns `None`
/// when no id survives the filters.
pub(crate) fn argmax_filtered(
    row: &[f32],
    filter: &StepFilter,
    emitted: &HashSet<i64>,
) -> Option<i64> {
    let mut best_id: Option<i64> = None;
    let mut best_score = f32::NEG_INFINITY;

    for (index, &raw) in row.iter().enumerate() {
        if index >= filter.vocab_size {
            break;
        }
        let id = index as i64;
        if id == filter.pad {
            continue;
        }
        if id == filter.bos {
            if filter.bos != filter.eos {
                // A plain BOS is never a legal continuation.
                continue;
            }
            // Shared BOS/EOS id (Helsinki): selectable as EOS, but not
            // before the early-termination guard has passed.
            if filter.step < filter.min_steps_before_eos {
                continue;
            }
        }

        let mut score = raw;
        if filter.repetition_penalty != 1.0 && emitted.contains(&id) {
            // Dividing a negative logit would *raise* its rank; multiply
            // instead so the penalty always lowers preference.
            if score > 0.0 {
                score /= filter.repetition_penalty;
            } else {
                score *= filter.repetition_penalty;
            }
        }

        if score > best_score {
            best_score = score;
            best_id = Some(id);
        }
    }

    best_id
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(step: usize) -> StepFilter {
        StepFilter {
            bos: 0,
            eos: 0,
            pad: 4,
            vocab_size: 5,
            repetition_penalty: 1.2,
            min_steps_before_eos: 3,
            step,
        }
    }

    #[test]
    fn test_bos_and_pad_never_selected() {
        // Distinct BOS (1) and PAD (4) carry the highest logits but must be
        // skipped at every step.
        let f = StepFilter {
            bos: 1,
            eos: 0,
            pad: 4,
            vocab_size: 5,
            repetition_penalty: 1.2,
            min_steps_before_eos: 3,
            step: 5,
        };
        let row = [0.5, 9.0, 2.0, 1.0, 8.0];
        assert_eq!(argmax_filtered(&row, &f, &HashSet::new()).unwrap(), 2);
    }

    #[test]
    fn test_shared_bos_eos_blocked_before_min_steps() {
        let mut f = filter(0);
        f.pad = 4;
        // EOS (= BOS = 0) dominates; steps 0–2 must pick something else.
        let row = [9.0, 1.0, 2.0, 0.5, 0.0];
        for step in 0..3 {
            f.step = step;
            assert_eq!(argmax_filtered(&row, &f, &HashSet::new()).unwrap(), 2);
        }
    }

    #[test]
    fn test_shared_bos_eos_selectable_after_min_steps() {
        // From step 3 on, the shared id may win so the loop can terminate.
        let row = [9.0, 1.0, 2.0, 0.5, 0.0];
        assert_eq!(argmax_filtered(&row, &filter(3), &HashSet::new()).unwrap(), 0);
    }

    #[test]
    fn test_distinct_eos_selectable_early() {
        // When EOS has its own id it is selectable at any step.
        let f = StepFilter {
            bos: 1,
            eos: 0,
            pad: 4,
            vocab_size: 5,
            repetition_penalty: 1.0,
            min_steps_before_eos: 3,
            step: 0,
        };
        let row = [9.0, 1.0, 2.0, 0.5, 0.0];
        assert_eq!(argmax_filtered(&row, &f, &HashSet::new()).unwrap(), 0);
    }

    #[test]
    fn test_out_of_vocab_ids_skipped() {
        let mut f = filter(5);
        f.vocab_size = 3;
        // Ids 3 and 4 are outside the target vocabulary.
        let row = [0.0, 1.0, 0.5, 9.0, 9.5];
        assert_eq!(argmax_filtered(&row, &f, &HashSet::new()).unwrap(), 1);
    }

    #[test]
    fn test_repetition_penalty_demotes_emitted_id() {
        let f = filter(5);
        let mut emitted = HashSet::new();
        emitted.insert(2);
        // 2 leads 3 by less than the penalty factor, so 3 wins once 2 is
        // penalized: 2.4 / 1.2 = 2.0 < 2.2.
        let row = [0.0, 1.0, 2.4, 2.2, 0.0];
        assert_eq!(argmax_filtered(&row, &f, &emitted).unwrap(), 3);
    }

    #[test]
    fn test_negative_logits_penalized_not_boosted() {
        let f = filter(5);
        let mut emitted = HashSet::new();
        emitted.insert(2);
        // All negative: penalizing 2 must push it below 3, not above.
        let row = [-9.0, -5.0, -1.0, -1.1, -9.0];
        assert_eq!(argmax_filtered(&row, &f, &emitted).unwrap(), 3);
    }

    #[test]
    fn test_penalty_of_one_disables() {
        let mut f = filter(5);
        f.repetition_penalty = 1.0;
        let mut emitted = HashSet::new();
        emitted.insert(2);
        let row = [0.0, 1.0, 2.4, 2.2, 0.0];
        assert_eq!(argmax_filtered(&row, &f, &emitted).unwrap(), 2);
    }

    #[test]
    fn test_empty_surviving_set_returns_none() {
        let f = StepFilter {
            bos: 0,
            eos: 0,
            pad: 1,
            vocab_size: 2,
            repetition_penalty: 1.2,
            min_steps_before_eos: 3,
            step: 0,
        };
        // Only BOS/EOS (blocked at step 0) and PAD exist.
        let row = [1.0, 1.0];
        assert!(argmax_filtered(&row, &f, &HashSet::new()).is_none());
    }
}
