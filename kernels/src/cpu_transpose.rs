use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Swaps the last two dimensions of row-major `data` with the given `shape`.
///
/// Work is split over the rows of the output (`[Batch..., N, M]` viewed as
/// `Batch * N` rows of length `M`), so each task writes a contiguous chunk and reads a
/// strided column of the input.
pub fn cpu_transpose<T, const RANK: usize>(data: &[T], shape: &[usize; RANK]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if RANK < 2 {
        return Err(KernelError::RankTooLow { rank: RANK, min: 2 });
    }
    let m = shape[RANK - 2];
    let n = shape[RANK - 1];
    let size: usize = shape.iter().product();
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![data.len()],
        });
    }
    let mut out_data = vec![T::zero(); size];
    if m == 0 || n == 0 {
        return Ok(out_data);
    }

    out_data
        .par_chunks_mut(m)
        .enumerate()
        .for_each(|(i, out_row)| {
            let batch_idx = i / n;
            let col_idx = i % n;
            let input_batch_offset = batch_idx * m * n;

            for (r, out_elem) in out_row.iter_mut().enumerate() {
                *out_elem = data[input_batch_offset + r * n + col_idx];
            }
        });

    Ok(out_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_simple() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

        let result = cpu_transpose(&data, &[2, 3]).unwrap();
        assert_eq!(result, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_transpose_row_vector() {
        let data = vec![1.0, 2.0, 3.0];

        let result = cpu_transpose(&data, &[1, 3]).unwrap();
        assert_eq!(result, data);
    }

    #[test]
    fn test_transpose_batch() {
        let data = vec![
            1.0, 2.0, 3.0, 4.0, //
            5.0, 6.0, 7.0, 8.0,
        ];

        let result = cpu_transpose(&data, &[2, 2, 2]).unwrap();
        assert_eq!(result, vec![1.0, 3.0, 2.0, 4.0, 5.0, 7.0, 6.0, 8.0]);
    }

    #[test]
    fn test_transpose_empty() {
        let data: Vec<f32> = vec![];
        let result = cpu_transpose(&data, &[0, 4]).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_transpose_rejects_short_buffer() {
        let data = vec![1.0, 2.0];
        assert!(matches!(
            cpu_transpose(&data, &[2, 2]),
            Err(KernelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_transpose_rejects_rank_one() {
        assert!(matches!(
            cpu_transpose(&[1.0f32, 2.0], &[2]),
            Err(KernelError::RankTooLow { rank: 1, min: 2 })
        ));
    }
}
