use crate::KernelElem;
use rayon::prelude::*;

/// Sum of squared elements, the building block of L2 norms.
pub fn cpu_sum_squares<T>(data: &[T]) -> T
where
    T: KernelElem,
{
    data.par_iter()
        .map(|&x| x * x)
        .reduce(|| T::zero(), |a, b| a + b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_squares() {
        assert_eq!(cpu_sum_squares(&[3.0f32, 4.0]), 25.0);
        assert_eq!(cpu_sum_squares::<f32>(&[]), 0.0);
    }
}
