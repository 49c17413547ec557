//! Top-level generation loop: prompt ingestion, autoregressive sampling,
//! and the [`Engine`] that owns everything a chat session needs between
//! calls so a multi-turn conversation keeps its KV cache.

use std::path::Path;

use crate::chatml::is_stop_token;
use crate::error::Result;
use crate::forward::{forward, RunState};
use crate::mmap::MmapModel;
use crate::model::{Config, Weights};
use crate::sampler::Sampler;
use crate::tokenizer::BpeTokenizer;

/// A loaded model plus the mutable state (KV cache, RoPE table, scratch
/// buffers) a generation run advances through. Reused across turns in a
/// chat session — each call to [`Engine::generate`] continues from
/// wherever the KV cache left off.
pub struct Engine {
    model: MmapModel,
    weights: Weights,
    config: Config,
    tokenizer: BpeTokenizer,
    state: RunState,
}

impl Engine {
    pub fn load(path: &Path) -> Result<Self> {
        let model = MmapModel::load(path)?;
        let config = Config::from_gguf(&model.gguf)?;
        let weights = Weights::from_gguf(&model, &config)?;
        let tokenizer = BpeTokenizer::from_gguf(&model.gguf.metadata)?;
        let state = RunState::new(&config);
        Ok(Self { model, weights, config, tokenizer, state })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tokenizer(&self) -> &BpeTokenizer {
        &self.tokenizer
    }

    /// Current position in the KV cache — how many tokens this engine
    /// has already processed.
    pub fn position(&self) -> usize {
        self.state.kv_cache.pos()
    }

    pub fn reset(&mut self) {
        self.state.kv_cache.reset();
    }

    /// Decode a single generated token for streaming display, or `None`
    /// if it's a special/control token that streaming output suppresses
    /// (§6: only token-type `Normal`/`Byte` are ever echoed).
    pub fn decode_stream_token(&self, id: u32) -> Option<String> {
        if self.tokenizer.is_special(id) || !self.tokenizer.is_printable(id) {
            return None;
        }
        self.tokenizer.decode_token(id).ok()
    }

    /// Feed `prompt_ids` through the model (populating the KV cache but
    /// not sampling), then sample up to `max_new_tokens` more, calling
    /// `on_token` with each newly generated id and its streaming-decoded
    /// text (`None` when the token is a special/control code streaming
    /// suppresses, per §6). Returns the full list of generated ids,
    /// including the stop token if one was emitted before the cap was
    /// reached — callers that only want the visible text strip it back
    /// off themselves.
    pub fn generate(
        &mut self,
        prompt_ids: &[u32],
        max_new_tokens: usize,
        sampler: &Sampler,
        mut on_token: impl FnMut(u32, Option<&str>),
    ) -> Result<Vec<u32>> {
        let mut history: Vec<u32> = prompt_ids.to_vec();
        let mut logits = vec![0.0f32; self.config.vocab_size];

        for &token in prompt_ids {
            if self.state.kv_cache.pos() >= self.config.seq_len {
                break;
            }
            let pos = self.state.kv_cache.pos();
            forward(&self.model, &self.weights, &self.config, &mut self.state, token, pos, &mut logits)?;
            self.state.kv_cache.advance();
        }

        let mut generated = Vec::new();

        for _ in 0..max_new_tokens {
            let sampled = sampler.sample(&mut logits, &history);
            generated.push(sampled);
            history.push(sampled);
            on_token(sampled, self.decode_stream_token(sampled).as_deref());

            if is_stop_token(&self.tokenizer, sampled) {
                break;
            }
            if self.state.kv_cache.pos() >= self.config.seq_len {
                tracing::warn!(pos = self.state.kv_cache.pos(), "context length exhausted before a stop token");
                break;
            }
            let pos = self.state.kv_cache.pos();
            forward(&self.model, &self.weights, &self.config, &mut self.state, sampled, pos, &mut logits)?;
            self.state.kv_cache.advance();
        }

        Ok(generated)
    }
}
