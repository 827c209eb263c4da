use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Copies rows `ids` of a row-major `[rows, cols]` table into a new `[ids.len(), cols]`
/// buffer, in the order given.
pub fn cpu_gather_rows<T>(table: &[T], cols: usize, ids: &[usize]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let rows = if cols == 0 { 0 } else { table.len() / cols };
    if let Some(&index) = ids.iter().find(|&&id| id >= rows) {
        return Err(KernelError::IndexOutOfBounds { index, rows });
    }

    let mut out = vec![T::zero(); ids.len() * cols];
    if cols == 0 {
        return Ok(out);
    }

    out.par_chunks_mut(cols)
        .zip(ids.par_iter())
        .for_each(|(out_row, &id)| {
            out_row.copy_from_slice(&table[id * cols..(id + 1) * cols]);
        });

    Ok(out)
}

/// Adds each row of `values` (`[indices.len(), cols]`) into row `indices[i]` of `dest`.
///
/// Repeated indices accumulate. The loop is sequential because two rows may target the
/// same destination.
pub fn cpu_scatter_add_rows<T>(
    dest: &mut [T],
    cols: usize,
    indices: &[usize],
    values: &[T],
) -> Result<()>
where
    T: KernelElem,
{
    if values.len() != indices.len() * cols {
        return Err(KernelError::ShapeMismatch {
            expected: vec![indices.len(), cols],
            got: vec![values.len()],
        });
    }
    let rows = if cols == 0 { 0 } else { dest.len() / cols };

    for (i, &row) in indices.iter().enumerate() {
        if row >= rows {
            return Err(KernelError::IndexOutOfBounds { index: row, rows });
        }
        let src = &values[i * cols..(i + 1) * cols];
        let dst = &mut dest[row * cols..(row + 1) * cols];
        for (d, &s) in dst.iter_mut().zip(src) {
            *d += s;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_rows_in_order() {
        let table = vec![0.0, 1.0, 10.0, 11.0, 20.0, 21.0];

        let out = cpu_gather_rows(&table, 2, &[2, 0, 2]).unwrap();
        assert_eq!(out, vec![20.0, 21.0, 0.0, 1.0, 20.0, 21.0]);
    }

    #[test]
    fn test_gather_rows_out_of_bounds() {
        let table = vec![0.0; 6];
        let err = cpu_gather_rows(&table, 2, &[3]);
        assert!(matches!(
            err,
            Err(KernelError::IndexOutOfBounds { index: 3, rows: 3 })
        ));
    }

    #[test]
    fn test_scatter_add_accumulates_duplicates() {
        let mut dest = vec![0.0; 6];
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

        cpu_scatter_add_rows(&mut dest, 2, &[1, 0, 1], &values).unwrap();
        assert_eq!(dest, vec![3.0, 4.0, 6.0, 8.0, 0.0, 0.0]);
    }

    #[test]
    fn test_scatter_add_shape_mismatch() {
        let mut dest = vec![0.0; 4];
        let err = cpu_scatter_add_rows(&mut dest, 2, &[0, 1], &[1.0, 2.0]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }
}
