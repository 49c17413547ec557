//! End-to-end exercise of the full load → forward → sample → decode path
//! against a synthetic GGUF file, rather than mocking any layer. Real
//! checkpoints are hundreds of megabytes, so these tests build the
//! smallest possible Qwen2-shaped model byte-for-byte in the same wire
//! format `GgufFile::parse` reads, the way the reflex-cache mmap tests
//! build real on-disk fixtures instead of stubbing the file layer.

use std::io::Write;

use tempfile::NamedTempFile;

use qwen2_core::sampler::{Sampler, SamplingStrategy};
use qwen2_core::Engine;

const ALIGNMENT: u64 = 32;
const DIM: usize = 8;
const N_HEADS: usize = 2;
const N_KV_HEADS: usize = 1;
const HEAD_SIZE: usize = DIM / N_HEADS;
const KV_DIM: usize = N_KV_HEADS * HEAD_SIZE;
const HIDDEN_DIM: usize = 8;
const N_LAYERS: usize = 1;
const SEQ_LEN: usize = 16;

/// Builds the metadata table and tensor/data blocks of a minimal GGUF
/// file in memory, then serializes it to the real on-disk wire format.
struct GgufBuilder {
    metadata: Vec<(String, Vec<u8>)>,
    metadata_count: u64,
    tensors: Vec<(String, Vec<u64>, u32, u64)>,
    data: Vec<u8>,
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

impl GgufBuilder {
    fn new() -> Self {
        Self { metadata: Vec::new(), metadata_count: 0, tensors: Vec::new(), data: Vec::new() }
    }

    fn meta_string(&mut self, key: &str, value: &str) -> &mut Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(&8u32.to_le_bytes()); // STRING
        write_string(&mut buf, value);
        self.metadata.push((key.to_string(), buf));
        self.metadata_count += 1;
        self
    }

    fn meta_u32(&mut self, key: &str, value: u32) -> &mut Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(&4u32.to_le_bytes()); // U32
        buf.extend_from_slice(&value.to_le_bytes());
        self.metadata.push((key.to_string(), buf));
        self.metadata_count += 1;
        self
    }

    fn meta_string_array(&mut self, key: &str, values: &[&str]) -> &mut Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(&9u32.to_le_bytes()); // ARRAY
        buf.extend_from_slice(&8u32.to_le_bytes()); // inner type STRING
        buf.extend_from_slice(&(values.len() as u64).to_le_bytes());
        for v in values {
            write_string(&mut buf, v);
        }
        self.metadata.push((key.to_string(), buf));
        self.metadata_count += 1;
        self
    }

    fn meta_i32_array(&mut self, key: &str, values: &[i32]) -> &mut Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(&9u32.to_le_bytes()); // ARRAY
        buf.extend_from_slice(&5u32.to_le_bytes()); // inner type I32
        buf.extend_from_slice(&(values.len() as u64).to_le_bytes());
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        self.metadata.push((key.to_string(), buf));
        self.metadata_count += 1;
        self
    }

    /// Appends one F32 tensor's data (row-major, `dims[0]` fastest) and
    /// pads the data region so the next tensor's offset stays aligned.
    fn tensor_f32(&mut self, name: &str, dims: &[u64], values: &[f32]) -> &mut Self {
        let offset = self.data.len() as u64;
        assert_eq!(offset % ALIGNMENT, 0, "offset must already be aligned");
        for v in values {
            self.data.extend_from_slice(&v.to_le_bytes());
        }
        while self.data.len() as u64 % ALIGNMENT != 0 {
            self.data.push(0);
        }
        self.tensors.push((name.to_string(), dims.to_vec(), 0 /* F32 */, offset));
        self
    }

    fn build(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x4655_4747u32.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes()); // version
        buf.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        buf.extend_from_slice(&self.metadata_count.to_le_bytes());

        for (key, value) in &self.metadata {
            write_string(&mut buf, key);
            buf.extend_from_slice(value);
        }

        for (name, dims, type_id, offset) in &self.tensors {
            write_string(&mut buf, name);
            buf.extend_from_slice(&(dims.len() as u32).to_le_bytes());
            for d in dims {
                buf.extend_from_slice(&d.to_le_bytes());
            }
            buf.extend_from_slice(&type_id.to_le_bytes());
            buf.extend_from_slice(&offset.to_le_bytes());
        }

        while buf.len() as u64 % ALIGNMENT != 0 {
            buf.push(0);
        }
        buf.extend_from_slice(&self.data);
        buf
    }
}

/// A patterned, small-magnitude weight vector. Not random (determinism
/// of the model file itself isn't under test here, only the engine's
/// behavior against a fixed one), just varied enough that attention and
/// the FFN don't collapse onto degenerate all-equal activations.
fn pattern(n: usize, seed: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32 + seed) * 0.37).sin() * 0.05).collect()
}

fn write_tiny_model() -> NamedTempFile {
    let vocab = ["a", "b", "c", "<|im_start|>", "<|im_end|>", "<|endoftext|>"];
    let vocab_size = vocab.len();

    let mut b = GgufBuilder::new();
    b.meta_string("general.architecture", "qwen2")
        .meta_u32("qwen2.embedding_length", DIM as u32)
        .meta_u32("qwen2.attention.head_count", N_HEADS as u32)
        .meta_u32("qwen2.attention.head_count_kv", N_KV_HEADS as u32)
        .meta_u32("qwen2.vocab_size", vocab_size as u32)
        .meta_u32("qwen2.feed_forward_length", HIDDEN_DIM as u32)
        .meta_u32("qwen2.block_count", N_LAYERS as u32)
        .meta_u32("qwen2.context_length", SEQ_LEN as u32)
        .meta_string_array("tokenizer.ggml.tokens", &vocab)
        .meta_i32_array("tokenizer.ggml.token_type", &[1, 1, 1, 3, 3, 3]);

    b.tensor_f32("token_embd.weight", &[DIM as u64, vocab_size as u64], &pattern(DIM * vocab_size, 1.0));

    for l in 0..N_LAYERS {
        let p = l as f32;
        b.tensor_f32(&format!("blk.{l}.attn_norm.weight"), &[DIM as u64], &vec![1.0; DIM])
            .tensor_f32(&format!("blk.{l}.attn_q.weight"), &[DIM as u64, DIM as u64], &pattern(DIM * DIM, 2.0 + p))
            .tensor_f32(&format!("blk.{l}.attn_q.bias"), &[DIM as u64], &pattern(DIM, 3.0 + p))
            .tensor_f32(&format!("blk.{l}.attn_k.weight"), &[DIM as u64, KV_DIM as u64], &pattern(DIM * KV_DIM, 4.0 + p))
            .tensor_f32(&format!("blk.{l}.attn_k.bias"), &[KV_DIM as u64], &pattern(KV_DIM, 5.0 + p))
            .tensor_f32(&format!("blk.{l}.attn_v.weight"), &[DIM as u64, KV_DIM as u64], &pattern(DIM * KV_DIM, 6.0 + p))
            .tensor_f32(&format!("blk.{l}.attn_v.bias"), &[KV_DIM as u64], &pattern(KV_DIM, 7.0 + p))
            .tensor_f32(&format!("blk.{l}.attn_output.weight"), &[DIM as u64, DIM as u64], &pattern(DIM * DIM, 8.0 + p))
            .tensor_f32(&format!("blk.{l}.ffn_norm.weight"), &[DIM as u64], &vec![1.0; DIM])
            .tensor_f32(&format!("blk.{l}.ffn_gate.weight"), &[DIM as u64, HIDDEN_DIM as u64], &pattern(DIM * HIDDEN_DIM, 9.0 + p))
            .tensor_f32(&format!("blk.{l}.ffn_up.weight"), &[DIM as u64, HIDDEN_DIM as u64], &pattern(DIM * HIDDEN_DIM, 10.0 + p))
            .tensor_f32(&format!("blk.{l}.ffn_down.weight"), &[HIDDEN_DIM as u64, DIM as u64], &pattern(HIDDEN_DIM * DIM, 11.0 + p));
    }

    b.tensor_f32("output_norm.weight", &[DIM as u64], &vec![1.0; DIM]);
    b.tensor_f32("output.weight", &[DIM as u64, vocab_size as u64], &pattern(DIM * vocab_size, 12.0));

    let bytes = b.build();
    let mut file = NamedTempFile::new().expect("failed to create temp file");
    file.write_all(&bytes).expect("failed to write model bytes");
    file.flush().expect("failed to flush temp file");
    file
}

#[test]
fn engine_loads_and_runs_a_forward_pass() {
    let file = write_tiny_model();
    let mut engine = Engine::load(file.path()).expect("engine should load the synthetic model");

    assert_eq!(engine.config().dim, DIM);
    assert_eq!(engine.config().n_heads, N_HEADS);
    assert_eq!(engine.config().n_kv_heads, N_KV_HEADS);
    assert_eq!(engine.position(), 0);

    let sampler = Sampler::new(SamplingStrategy::Greedy);
    let prompt_ids = vec![0u32, 1u32];
    let generated = engine.generate(&prompt_ids, 4, &sampler, |_, _| {}).expect("generation should succeed");

    assert!(!generated.is_empty());
    // The KV cache advances once per prompt token, then once more per
    // generated token except possibly the last (the loop breaks before
    // re-running the forward pass once a stop token is sampled).
    let prompt_and_generated = prompt_ids.len() + generated.len();
    assert!(engine.position() == prompt_and_generated || engine.position() == prompt_and_generated - 1);
}

#[test]
fn same_seed_reproduces_the_same_generated_sequence() {
    let run = || {
        let file = write_tiny_model();
        let mut engine = Engine::load(file.path()).unwrap();
        let sampler = Sampler::new(SamplingStrategy::Categorical { temperature: 0.8 }).with_seed(7);
        engine.generate(&[0, 1], 6, &sampler, |_, _| {}).unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn streaming_decode_suppresses_special_tokens_but_not_normal_ones() {
    let file = write_tiny_model();
    let engine = Engine::load(file.path()).unwrap();

    // ids 0..3 are "a"/"b"/"c" (token_type Normal); 3..6 are the ChatML
    // specials, which streaming must never echo regardless of their
    // token_type code.
    assert!(engine.decode_stream_token(0).is_some());
    assert!(engine.decode_stream_token(1).is_some());
    assert!(engine.decode_stream_token(3).is_none());
    assert!(engine.decode_stream_token(4).is_none());
    assert!(engine.decode_stream_token(5).is_none());
}

#[test]
fn kv_cache_is_reset_between_turns() {
    let file = write_tiny_model();
    let mut engine = Engine::load(file.path()).unwrap();
    let sampler = Sampler::new(SamplingStrategy::Greedy);

    engine.generate(&[0, 1, 2], 3, &sampler, |_, _| {}).unwrap();
    assert!(engine.position() > 0);

    engine.reset();
    assert_eq!(engine.position(), 0);
}
