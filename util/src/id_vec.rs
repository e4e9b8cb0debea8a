use std::marker::PhantomData;

/// Vec wrapper that uses typed indexes.
#[derive(Debug, Hash, PartialEq, Eq, Clone)]
pub struct IdVec<K, V> {
    vec: Vec<V>,
    _phantom: PhantomData<K>,
}

impl<K, V> Default for IdVec<K, V> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<K, V> IdVec<K, V> {
    /// Create a new `IdVec` backed by the given vec.
    fn new(vec: Vec<V>) -> Self {
        Self {
            vec,
            _phantom: PhantomData,
        }
    }

    /// Create a new `IdVec` with the given capacity.
    pub fn with_capacity(cap: usize) -> Self {
        Self::new(Vec::with_capacity(cap))
    }

    /// Get the current length
    #[inline]
    pub fn len(&self) -> usize {
        self.vec.len()
    }

    /// True if len == 0
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vec.is_empty()
    }

    /// Iterate through immutable references to values
    pub fn iter(&self) -> std::slice::Iter<'_, V> {
        self.vec.iter()
    }

    /// Consume self and return the values in id order.
    pub fn into_inner(self) -> Vec<V> {
        self.vec
    }
}

impl<K: From<usize>, V> IdVec<K, V> {
    /// Iterate through (id, value) pairs in id order.
    pub fn iter_ids(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.vec.iter().enumerate().map(|(i, v)| (K::from(i), v))
    }

    /// Iterate through all ids currently in use.
    pub fn ids(&self) -> impl Iterator<Item = K> {
        (0..self.vec.len()).map(K::from)
    }
}

impl<K, V: Clone> IdVec<K, V> {
    /// Create a new `IdVec`, filled with `len` copies of `val`.
    pub fn fill(val: V, len: usize) -> Self {
        Self::new(vec![val; len])
    }
}

impl<K: Into<usize>, V> IdVec<K, V> {
    /// Get the value with id `k`.
    #[inline]
    pub fn get(&self, k: K) -> &V {
        &self.vec[k.into()]
    }

    /// Get a mutable reference to value with id `k`.
    #[inline]
    pub fn get_mut(&mut self, k: K) -> &mut V {
        &mut self.vec[k.into()]
    }
}

impl<K: From<usize>, V> IdVec<K, V> {
    /// Push `v` into the underlying vec, and return an id that can be used to retrieve it later.
    #[inline]
    pub fn push(&mut self, v: V) -> K {
        let id = self.vec.len().into();
        self.vec.push(v);
        id
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Id(usize);

    impl From<usize> for Id {
        fn from(val: usize) -> Self {
            Self(val)
        }
    }

    impl From<Id> for usize {
        fn from(id: Id) -> usize {
            id.0
        }
    }

    #[test]
    fn test_push_and_get() {
        let mut vec: IdVec<Id, &str> = IdVec::with_capacity(2);
        let a = vec.push("a");
        let b = vec.push("b");
        assert_eq!(a, Id(0));
        assert_eq!(*vec.get(b), "b");
        *vec.get_mut(a) = "z";
        assert_eq!(vec.iter_ids().collect::<Vec<_>>(), vec![(Id(0), &"z"), (Id(1), &"b")]);
    }
}
