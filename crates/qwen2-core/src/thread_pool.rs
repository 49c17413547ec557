//! Data-parallel helpers built on rayon.
//!
//! The forward pass only parallelizes two things: matmul rows and
//! per-head attention. Both are pure row/head-local computations with
//! no dependency between iterations, so a plain `par_iter`/`par_for_each`
//! over a scratch buffer is enough — no custom pool or work queue.

use rayon::prelude::*;

/// Fill `out[i]` with `f(i)` for every row, across threads.
pub fn matmul_rows(out: &mut [f32], f: impl Fn(usize) -> f32 + Sync) {
    out.par_iter_mut().enumerate().for_each(|(i, o)| *o = f(i));
}

/// Parallel matrix-vector multiply over two plain f32 slices:
/// `output = mat * vec`, `mat` laid out `[rows x cols]` row-major.
pub fn matmul_parallel(output: &mut [f32], mat: &[f32], vec_in: &[f32], rows: usize, cols: usize) {
    debug_assert_eq!(mat.len(), rows * cols);
    debug_assert_eq!(vec_in.len(), cols);
    debug_assert_eq!(output.len(), rows);

    output.par_iter_mut().enumerate().for_each(|(i, out)| {
        let row = &mat[i * cols..(i + 1) * cols];
        *out = crate::tensor::dot_product(row, vec_in);
    });
}

/// Split `buf` into `n_chunks` equal, disjoint slices and run `f(index,
/// slice)` on each across threads. Used for per-head attention, where
/// each head only ever touches its own slice of the output buffer.
pub fn par_for_each_chunks(buf: &mut [f32], chunk_size: usize, n_chunks: usize, f: impl Fn(usize, &mut [f32]) + Sync) {
    debug_assert_eq!(buf.len(), chunk_size * n_chunks);
    buf.par_chunks_mut(chunk_size).enumerate().for_each(|(i, chunk)| f(i, chunk));
}

/// Number of worker threads rayon will use.
pub fn num_threads() -> usize {
    rayon::current_num_threads()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_parallel() {
        let mat = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let vec_in = vec![1.0, 1.0, 1.0];
        let mut output = vec![0.0; 2];
        matmul_parallel(&mut output, &mat, &vec_in, 2, 3);
        assert!((output[0] - 6.0).abs() < 1e-6);
        assert!((output[1] - 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_matmul_rows_matches_serial() {
        let mat = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let vec_in = vec![1.0, 1.0, 1.0];
        let mut parallel_out = vec![0.0; 2];
        matmul_rows(&mut parallel_out, |row| {
            crate::tensor::dot_product(&mat[row * 3..row * 3 + 3], &vec_in)
        });
        let mut serial_out = vec![0.0; 2];
        crate::tensor::matmul(&mut serial_out, &mat, &vec_in, 2, 3);
        assert_eq!(parallel_out, serial_out);
    }
}
