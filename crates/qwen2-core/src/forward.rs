//! Qwen2 transformer forward pass.
//!
//! One call computes one token: embedding lookup, N transformer blocks
//! (RMSNorm → GQA attention with RoPE → residual → RMSNorm → SwiGLU FFN
//! → residual), final RMSNorm, LM head projection to logits. Weight
//! matrices are read straight out of the mmap'd GGUF bytes through
//! [`TensorView`], so no full-precision copy of the weights is ever
//! materialized.

use crate::error::{Error, Result};
use crate::kv_cache::KvCache;
use crate::mmap::MmapModel;
use crate::model::{tensor_cols, tensor_kind, Config, Weights};
use crate::quant;
use crate::rope::RopeCache;
use crate::tensor::{self, TensorView};

/// Scratch buffers reused across every token of a generation run, sized
/// once from [`Config`].
pub struct RunState {
    x: Vec<f32>,
    xb: Vec<f32>,
    xb2: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    att_out: Vec<f32>,
    hb: Vec<f32>,
    hb2: Vec<f32>,
    norm_scratch: Vec<f32>,
    pub kv_cache: KvCache,
    pub rope: RopeCache,
}

impl RunState {
    pub fn new(config: &Config) -> Self {
        let dim = config.dim;
        let kv_dim = config.kv_dim();
        Self {
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            xb2: vec![0.0; dim],
            q: vec![0.0; dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att_out: vec![0.0; dim],
            hb: vec![0.0; config.hidden_dim],
            hb2: vec![0.0; config.hidden_dim],
            norm_scratch: vec![0.0; dim.max(config.hidden_dim)],
            kv_cache: KvCache::new(config.n_layers, config.seq_len, config.n_kv_heads, config.head_size),
            rope: RopeCache::precompute(config.seq_len, config.head_size, config.rope_theta),
        }
    }
}

fn weight_view<'a>(model: &'a MmapModel, tensor_idx: usize, cols: usize) -> Result<TensorView<'a>> {
    let kind = tensor_kind(model, tensor_idx);
    let data = model.tensor_data(tensor_idx)?;
    Ok(TensorView::new(data, kind, cols))
}

fn matmul_weight(model: &MmapModel, tensor_idx: usize, input: &[f32], output: &mut [f32]) -> Result<()> {
    let cols = input.len();
    debug_assert_eq!(tensor_cols(model, tensor_idx), cols);
    let view = weight_view(model, tensor_idx, cols)?;
    view.matmul(input, output);
    Ok(())
}

/// Add a bias tensor into `output` in place, if the checkpoint carries
/// one for this projection. Qwen2 trains QKV biases; architectures that
/// don't (e.g. LLaMA) simply have no `attn_{q,k,v}.bias` tensor, so this
/// is a no-op rather than an error when `bias_idx` is `None`.
fn add_bias_if_present(model: &MmapModel, bias_idx: Option<usize>, output: &mut [f32]) -> Result<()> {
    let Some(bias_idx) = bias_idx else { return Ok(()) };
    let n = output.len();
    let data = model.tensor_data(bias_idx)?;
    let mut bias = vec![0.0f32; n];
    quant::dequantize_row(data, &mut bias, n, tensor_kind(model, bias_idx))?;
    tensor::elementwise_add(output, &bias);
    Ok(())
}

fn rmsnorm_with_weight(
    model: &MmapModel,
    tensor_idx: usize,
    scratch: &mut [f32],
    output: &mut [f32],
    input: &[f32],
    eps: f32,
) -> Result<()> {
    let n = input.len();
    let data = model.tensor_data(tensor_idx)?;
    quant::dequantize_row(data, &mut scratch[..n], n, tensor_kind(model, tensor_idx))?;
    tensor::rmsnorm(output, input, &scratch[..n], eps);
    Ok(())
}

/// Run one token through the transformer, writing logits of length
/// `config.vocab_size` into `logits`. `pos` is this token's position in
/// the sequence (its KV-cache slot must not yet be written).
pub fn forward(
    model: &MmapModel,
    weights: &Weights,
    config: &Config,
    state: &mut RunState,
    token: u32,
    pos: usize,
    logits: &mut [f32],
) -> Result<()> {
    let dim = config.dim;
    let kv_dim = config.kv_dim();
    let n_heads = config.n_heads;
    let n_kv_heads = config.n_kv_heads;
    let head_size = config.head_size;

    // ---- Token embedding lookup ----
    {
        let embd_data = model.tensor_data(weights.token_embd)?;
        let embd_kind = tensor_kind(model, weights.token_embd);
        let row_bytes = quant::row_size_bytes(dim, embd_kind);
        let start = token as usize * row_bytes;
        let end = start + row_bytes;
        if end > embd_data.len() {
            return Err(Error::model(format!("token id {token} out of range for embedding table")));
        }
        quant::dequantize_row(&embd_data[start..end], &mut state.x, dim, embd_kind)?;
    }

    for l in 0..config.n_layers {
        let layer = &weights.layers[l];

        // Attention block
        rmsnorm_with_weight(model, layer.attn_norm, &mut state.norm_scratch, &mut state.xb, &state.x, config.rms_norm_eps)?;

        matmul_weight(model, layer.attn_q, &state.xb, &mut state.q)?;
        matmul_weight(model, layer.attn_k, &state.xb, &mut state.k)?;
        matmul_weight(model, layer.attn_v, &state.xb, &mut state.v)?;
        add_bias_if_present(model, layer.attn_q_bias, &mut state.q)?;
        add_bias_if_present(model, layer.attn_k_bias, &mut state.k)?;
        add_bias_if_present(model, layer.attn_v_bias, &mut state.v)?;

        state.rope.apply_multi_head(&mut state.q, pos, n_heads);
        state.rope.apply_multi_head(&mut state.k, pos, n_kv_heads);

        state.kv_cache.key_at_mut(l, pos).copy_from_slice(&state.k);
        state.kv_cache.value_at_mut(l, pos).copy_from_slice(&state.v);

        let seq_len = pos + 1;
        let kv_keys = state.kv_cache.keys(l, seq_len);
        let kv_values = state.kv_cache.values(l, seq_len);
        let q = &state.q;

        parallel_attention(
            &mut state.att_out,
            q,
            kv_keys,
            kv_values,
            seq_len,
            head_size,
            n_heads,
            n_kv_heads,
            kv_dim,
        );

        matmul_weight(model, layer.attn_output, &state.att_out, &mut state.xb2)?;
        tensor::elementwise_add(&mut state.x, &state.xb2);

        // FFN block
        rmsnorm_with_weight(model, layer.ffn_norm, &mut state.norm_scratch, &mut state.xb, &state.x, config.rms_norm_eps)?;

        matmul_weight(model, layer.ffn_gate, &state.xb, &mut state.hb)?;
        matmul_weight(model, layer.ffn_up, &state.xb, &mut state.hb2)?;
        tensor::silu(&mut state.hb);
        tensor::elementwise_mul(&mut state.hb, &state.hb2);
        matmul_weight(model, layer.ffn_down, &state.hb, &mut state.xb2)?;

        tensor::elementwise_add(&mut state.x, &state.xb2);
    }

    rmsnorm_with_weight(model, weights.output_norm, &mut state.norm_scratch, &mut state.xb, &state.x, config.rms_norm_eps)?;
    matmul_weight(model, weights.output, &state.xb, logits)?;

    Ok(())
}

/// Multi-head GQA attention: head `h` reads KV head `h * n_kv_heads / n_heads`.
/// Each head's scores/softmax/weighted-sum runs in its own rayon task.
#[allow(clippy::too_many_arguments)]
fn parallel_attention(
    att_out: &mut [f32],
    q: &[f32],
    kv_keys: &[f32],
    kv_values: &[f32],
    seq_len: usize,
    head_size: usize,
    n_heads: usize,
    n_kv_heads: usize,
    kv_dim: usize,
) {
    crate::thread_pool::par_for_each_chunks(att_out, head_size, n_heads, |h, out_slice| {
        let kv_h = h * n_kv_heads / n_heads;
        let q_slice = &q[h * head_size..(h + 1) * head_size];

        let mut head_keys = vec![0.0f32; seq_len * head_size];
        let mut head_values = vec![0.0f32; seq_len * head_size];
        for t in 0..seq_len {
            let src = t * kv_dim + kv_h * head_size;
            head_keys[t * head_size..(t + 1) * head_size].copy_from_slice(&kv_keys[src..src + head_size]);
            head_values[t * head_size..(t + 1) * head_size].copy_from_slice(&kv_values[src..src + head_size]);
        }

        crate::attention::attention(out_slice, q_slice, &head_keys, &head_values, seq_len, head_size);
    });
}
