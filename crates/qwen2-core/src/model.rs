//! Model hyperparameters and weight tensor index.
//!
//! [`Config`] holds the handful of scalars that size every buffer in the
//! forward pass; [`Weights`] resolves the GGUF tensor name for every
//! learned parameter once at load time so the hot loop never does
//! string lookups.

use crate::error::{Error, Result};
use crate::gguf::GgmlType;
use crate::mmap::MmapModel;

/// Transformer hyperparameters, read from `qwen2.*` GGUF metadata keys.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub vocab_size: usize,
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_size: usize,
    pub seq_len: usize,
    pub rope_theta: f32,
    pub rms_norm_eps: f32,
}

impl Config {
    /// Key-value dimension: `n_kv_heads * head_size`.
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_size
    }

    /// How many query heads share each key/value head under GQA.
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    pub fn from_gguf(gguf: &crate::gguf::GgufFile) -> Result<Self> {
        let arch = gguf.architecture().unwrap_or("qwen2");
        let prefix = format!("{arch}.");

        let dim = gguf
            .get_u32(&format!("{prefix}embedding_length"))
            .ok_or_else(|| Error::format(format!("missing {prefix}embedding_length")))? as usize;
        let n_heads = gguf
            .get_u32(&format!("{prefix}attention.head_count"))
            .ok_or_else(|| Error::format(format!("missing {prefix}attention.head_count")))?
            as usize;
        let n_kv_heads = gguf
            .get_u32(&format!("{prefix}attention.head_count_kv"))
            .unwrap_or(n_heads as u32) as usize;
        if n_heads == 0 || n_kv_heads == 0 || n_heads % n_kv_heads != 0 {
            return Err(Error::format(format!(
                "head_count {n_heads} is not an integer multiple of head_count_kv {n_kv_heads}"
            )));
        }
        if dim == 0 || dim % n_heads != 0 {
            return Err(Error::format(format!(
                "embedding_length {dim} is not an integer multiple of head_count {n_heads}"
            )));
        }
        if (dim / n_heads) % 2 != 0 {
            return Err(Error::format(format!(
                "head_size {} must be even for RoPE pairing",
                dim / n_heads
            )));
        }

        let vocab_size = gguf
            .get_u32(&format!("{prefix}vocab_size"))
            .or_else(|| gguf.get_array("tokenizer.ggml.tokens").map(|a| a.len() as u32))
            .ok_or_else(|| Error::format("missing vocab_size and tokenizer.ggml.tokens"))?
            as usize;

        Ok(Self {
            vocab_size,
            dim,
            hidden_dim: gguf
                .get_u32(&format!("{prefix}feed_forward_length"))
                .ok_or_else(|| Error::format(format!("missing {prefix}feed_forward_length")))?
                as usize,
            n_layers: gguf
                .get_u32(&format!("{prefix}block_count"))
                .ok_or_else(|| Error::format(format!("missing {prefix}block_count")))?
                as usize,
            n_heads,
            n_kv_heads,
            head_size: dim / n_heads,
            seq_len: gguf
                .get_u32(&format!("{prefix}context_length"))
                .unwrap_or(2048) as usize,
            rope_theta: gguf.get_f32(&format!("{prefix}rope.freq_base")).unwrap_or(10000.0),
            rms_norm_eps: gguf
                .get_f32(&format!("{prefix}attention.layer_norm_rms_epsilon"))
                .unwrap_or(1e-6),
        })
    }
}

/// Per-layer weight tensor indices. The QKV biases are `Some` for
/// Qwen2 checkpoints (which train them) and `None` for architectures
/// that don't carry attention biases at all; the forward pass skips
/// the add when absent rather than treating a missing tensor as zero.
pub struct LayerWeights {
    pub attn_norm: usize,
    pub attn_q: usize,
    pub attn_q_bias: Option<usize>,
    pub attn_k: usize,
    pub attn_k_bias: Option<usize>,
    pub attn_v: usize,
    pub attn_v_bias: Option<usize>,
    pub attn_output: usize,
    pub ffn_norm: usize,
    pub ffn_gate: usize,
    pub ffn_up: usize,
    pub ffn_down: usize,
}

/// Resolved GGUF tensor indices for every weight the forward pass reads.
/// `output` is aliased to `token_embd` when the checkpoint ties input and
/// output embeddings and carries no separate `output.weight` tensor.
pub struct Weights {
    pub token_embd: usize,
    pub output_norm: usize,
    pub output: usize,
    pub layers: Vec<LayerWeights>,
}

impl Weights {
    pub fn from_gguf(model: &MmapModel, config: &Config) -> Result<Self> {
        let find = |name: String| -> Result<usize> {
            model
                .gguf
                .tensor_index(&name)
                .ok_or_else(|| Error::model(format!("missing weight tensor: {name}")))
        };
        let find_opt = |name: String| -> Option<usize> { model.gguf.tensor_index(&name) };

        let mut layers = Vec::with_capacity(config.n_layers);
        for l in 0..config.n_layers {
            layers.push(LayerWeights {
                attn_norm: find(format!("blk.{l}.attn_norm.weight"))?,
                attn_q: find(format!("blk.{l}.attn_q.weight"))?,
                attn_q_bias: find_opt(format!("blk.{l}.attn_q.bias")),
                attn_k: find(format!("blk.{l}.attn_k.weight"))?,
                attn_k_bias: find_opt(format!("blk.{l}.attn_k.bias")),
                attn_v: find(format!("blk.{l}.attn_v.weight"))?,
                attn_v_bias: find_opt(format!("blk.{l}.attn_v.bias")),
                attn_output: find(format!("blk.{l}.attn_output.weight"))?,
                ffn_norm: find(format!("blk.{l}.ffn_norm.weight"))?,
                ffn_gate: find(format!("blk.{l}.ffn_gate.weight"))?,
                ffn_up: find(format!("blk.{l}.ffn_up.weight"))?,
                ffn_down: find(format!("blk.{l}.ffn_down.weight"))?,
            });
        }

        let token_embd = find("token_embd.weight".to_string())?;
        let output = model
            .gguf
            .tensor_index("output.weight")
            .unwrap_or(token_embd);

        Ok(Self {
            token_embd,
            output_norm: find("output_norm.weight".to_string())?,
            output,
            layers,
        })
    }
}

/// Number of elements stored in one row of a 2-D weight tensor, i.e.
/// the tensor's innermost dimension.
pub fn tensor_cols(model: &MmapModel, tensor_idx: usize) -> usize {
    let dims = &model.gguf.tensors[tensor_idx].dims;
    dims[0] as usize
}

pub fn tensor_kind(model: &MmapModel, tensor_idx: usize) -> GgmlType {
    model.gguf.tensors[tensor_idx].ggml_type
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::GgufFile;
    use std::io::Cursor;

    fn write_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    fn meta_u32(buf: &mut Vec<u8>, key: &str, value: u32) {
        write_string(buf, key);
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Builds a header-only GGUF stream (no tensors) with the `qwen2.*`
    /// keys `Config::from_gguf` reads, letting each test override the
    /// head-count pair to exercise the GQA/RoPE invariant checks.
    fn header_with_heads(n_heads: u32, n_kv_heads: u32, dim: u32) -> GgufFile {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x4655_4747u32.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes()); // tensor_count
        buf.extend_from_slice(&6u64.to_le_bytes()); // metadata_count

        meta_u32(&mut buf, "qwen2.embedding_length", dim);
        meta_u32(&mut buf, "qwen2.attention.head_count", n_heads);
        meta_u32(&mut buf, "qwen2.attention.head_count_kv", n_kv_heads);
        meta_u32(&mut buf, "qwen2.feed_forward_length", dim * 4);
        meta_u32(&mut buf, "qwen2.block_count", 2);
        meta_u32(&mut buf, "qwen2.vocab_size", 100);

        let mut cursor = Cursor::new(buf);
        GgufFile::parse(&mut cursor).unwrap()
    }

    #[test]
    fn derives_kv_dim_and_kv_mul_from_head_counts() {
        let gguf = header_with_heads(8, 2, 32);
        let config = Config::from_gguf(&gguf).unwrap();
        assert_eq!(config.head_size, 4);
        assert_eq!(config.kv_dim(), 8);
        assert_eq!(config.kv_mul(), 4);
    }

    #[test]
    fn rejects_head_count_not_a_multiple_of_kv_heads() {
        let gguf = header_with_heads(8, 3, 32);
        assert!(Config::from_gguf(&gguf).is_err());
    }

    #[test]
    fn rejects_odd_head_size() {
        // dim=24, n_heads=8 -> head_size=3, which breaks RoPE pairing.
        let gguf = header_with_heads(8, 8, 24);
        assert!(Config::from_gguf(&gguf).is_err());
    }
}
