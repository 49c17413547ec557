//! SIMD dispatch seam.
//!
//! Every call site goes through this one function so a future
//! `#[cfg(target_arch)]` NEON/AVX2 kernel only needs to be plugged in
//! here, not threaded through `tensor.rs`/`TensorView`. Scalar for now.

/// Accelerated dot product — dispatches to SIMD when available.
pub fn dot_product_simd(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    crate::tensor::dot_product(a, b)
}
