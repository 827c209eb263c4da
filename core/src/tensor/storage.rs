//! Storage abstraction for Tensors.
//!
//! A `Tensor` holds shape and strides; its `Storage` holds the contiguous elements.
//! Kernels only ever see the storage as a slice.

use crate::tensor::TensorElem;
use std::fmt::Debug;
use std::sync::Arc;

/// A trait for the underlying data storage.
pub trait Storage<T>: Clone + Debug + PartialEq + Send + Sync {
    /// Returns the data as an immutable slice.
    fn as_slice(&self) -> &[T];

    /// Returns the data as a mutable slice.
    fn as_mut_slice(&mut self) -> &mut [T];

    /// Returns the number of elements in the storage.
    fn len(&self) -> usize;

    /// Returns `true` if the storage contains no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: TensorElem> Storage<T> for Vec<T> {
    fn as_slice(&self) -> &[T] {
        self
    }
    fn as_mut_slice(&mut self) -> &mut [T] {
        self
    }
    fn len(&self) -> usize {
        self.len()
    }
}

/// Shared host buffer. Writing through a clone copies the buffer first.
impl<T: TensorElem> Storage<T> for Arc<Vec<T>> {
    fn as_slice(&self) -> &[T] {
        self
    }
    fn as_mut_slice(&mut self) -> &mut [T] {
        Arc::<Vec<T>>::make_mut(self)
    }
    fn len(&self) -> usize {
        self.as_ref().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_storage() {
        let mut storage = vec![1.0, 2.0, 3.0];
        assert_eq!(Storage::len(&storage), 3);
        assert!(!Storage::is_empty(&storage));

        storage.as_mut_slice()[0] = 10.0;
        assert_eq!(storage.as_slice(), &[10.0, 2.0, 3.0]);
    }

    #[test]
    fn test_empty_storage() {
        let storage: Vec<usize> = vec![];
        assert!(Storage::is_empty(&storage));
    }

    #[test]
    fn test_shared_storage_copies_on_write() {
        let original = Arc::new(vec![1.0f32, 2.0]);
        let mut copy = original.clone();
        assert!(Arc::ptr_eq(&original, &copy));

        copy.as_mut_slice()[0] = 5.0;
        assert!(!Arc::ptr_eq(&original, &copy));
        assert_eq!(original.as_slice(), &[1.0, 2.0]);
        assert_eq!(copy.as_slice(), &[5.0, 2.0]);
    }
}
