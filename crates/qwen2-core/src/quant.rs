//! Quantization kernels — dequantize Q4_0 / Q8_0 blocks to f32.
//!
//! Only the two quantization schemes Qwen2 GGUF checkpoints actually
//! ship with alongside plain F32 are supported; anything else is a
//! format error rather than a silent all-zeros fallback.

use crate::error::{Error, Result};
use crate::gguf::GgmlType;

pub const Q4_0_BLOCK_ELEMS: usize = 32;
pub const Q4_0_BLOCK_BYTES: usize = 18;
pub const Q8_0_BLOCK_ELEMS: usize = 32;
pub const Q8_0_BLOCK_BYTES: usize = 34;

/// Dequantize one Q4_0 block (18 bytes → 32 f32 values).
/// Layout: scale (f16, 2 bytes) + 16 bytes of packed 4-bit signed nibbles.
/// Byte `i`'s low nibble is element `i`, high nibble is element `i + 16`.
pub fn dequantize_q4_0(block: &[u8], output: &mut [f32]) {
    debug_assert!(block.len() >= Q4_0_BLOCK_BYTES);
    debug_assert!(output.len() >= Q4_0_BLOCK_ELEMS);

    let scale = half::f16::from_le_bytes([block[0], block[1]]).to_f32();

    for (i, &byte) in block[2..18].iter().enumerate() {
        let lo = (byte & 0x0F) as f32 - 8.0;
        let hi = ((byte >> 4) & 0x0F) as f32 - 8.0;
        output[i] = lo * scale;
        output[i + 16] = hi * scale;
    }
}

/// Dequantize one Q8_0 block (34 bytes → 32 f32 values).
/// Layout: scale (f16, 2 bytes) + 32 signed-byte quants.
pub fn dequantize_q8_0(block: &[u8], output: &mut [f32]) {
    debug_assert!(block.len() >= Q8_0_BLOCK_BYTES);
    debug_assert!(output.len() >= Q8_0_BLOCK_ELEMS);

    let scale = half::f16::from_le_bytes([block[0], block[1]]).to_f32();

    for (out, &byte) in output.iter_mut().zip(&block[2..34]) {
        *out = byte as i8 as f32 * scale;
    }
}

/// Dequantize `n_elements` worth of raw tensor bytes into `output`.
pub fn dequantize_row(data: &[u8], output: &mut [f32], n_elements: usize, ggml_type: GgmlType) -> Result<()> {
    match ggml_type {
        GgmlType::F32 => {
            for (out, chunk) in output.iter_mut().zip(data.chunks_exact(4)).take(n_elements) {
                *out = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
        GgmlType::Q4_0 => {
            if n_elements % Q4_0_BLOCK_ELEMS != 0 {
                return Err(Error::format(format!(
                    "Q4_0 row of {n_elements} elements is not a multiple of the block size {Q4_0_BLOCK_ELEMS}"
                )));
            }
            let n_blocks = n_elements / Q4_0_BLOCK_ELEMS;
            for b in 0..n_blocks {
                let block_data = &data[b * Q4_0_BLOCK_BYTES..];
                dequantize_q4_0(block_data, &mut output[b * Q4_0_BLOCK_ELEMS..]);
            }
        }
        GgmlType::Q8_0 => {
            if n_elements % Q8_0_BLOCK_ELEMS != 0 {
                return Err(Error::format(format!(
                    "Q8_0 row of {n_elements} elements is not a multiple of the block size {Q8_0_BLOCK_ELEMS}"
                )));
            }
            let n_blocks = n_elements / Q8_0_BLOCK_ELEMS;
            for b in 0..n_blocks {
                let block_data = &data[b * Q8_0_BLOCK_BYTES..];
                dequantize_q8_0(block_data, &mut output[b * Q8_0_BLOCK_ELEMS..]);
            }
        }
        other => {
            return Err(Error::format(format!(
                "unsupported tensor quantization kind: {other:?}"
            )))
        }
    }
    Ok(())
}

/// Bytes a row of `n_elements` occupies on disk for `ggml_type`.
pub fn row_size_bytes(n_elements: usize, ggml_type: GgmlType) -> usize {
    match ggml_type {
        GgmlType::F32 => n_elements * 4,
        GgmlType::Q4_0 => (n_elements / Q4_0_BLOCK_ELEMS) * Q4_0_BLOCK_BYTES,
        GgmlType::Q8_0 => (n_elements / Q8_0_BLOCK_ELEMS) * Q8_0_BLOCK_BYTES,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dequantize_q8_0() {
        let scale_bytes = half::f16::from_f32(1.0).to_le_bytes();
        let mut block = vec![0u8; 34];
        block[0] = scale_bytes[0];
        block[1] = scale_bytes[1];
        for i in 0..32 {
            block[2 + i] = (i + 1) as u8;
        }
        let mut output = vec![0.0f32; 32];
        dequantize_q8_0(&block, &mut output);
        assert!((output[0] - 1.0).abs() < 0.01);
        assert!((output[1] - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_dequantize_q4_0_nibble_order() {
        let scale_bytes = half::f16::from_f32(2.0).to_le_bytes();
        let mut block = vec![0u8; 18];
        block[0] = scale_bytes[0];
        block[1] = scale_bytes[1];
        // byte 0: low nibble 9 (-> 1 after -8 bias), high nibble 8 (-> 0)
        block[2] = 0x89;
        let mut output = vec![0.0f32; 32];
        dequantize_q4_0(&block, &mut output);
        assert!((output[0] - 2.0).abs() < 1e-6); // element 0: low nibble
        assert!((output[16] - 0.0).abs() < 1e-6); // element 16: high nibble
    }

    #[test]
    fn test_dequantize_row_rejects_unsupported_type() {
        let data = vec![0u8; 64];
        let mut output = vec![0.0f32; 32];
        let err = dequantize_row(&data, &mut output, 32, GgmlType::F16).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }
}
