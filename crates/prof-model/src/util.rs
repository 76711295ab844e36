//! Small shared helpers for the data model.

use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

/// An `Arc` wrapper that compares and hashes by pointer identity.
///
/// The uniquing stores guarantee one allocation per logical entity, so
/// pointer identity is entity identity. Used as the key type for every map
/// keyed on Modules, Metrics, Contexts and friends.
pub struct ByPtr<T>(pub Arc<T>);

impl<T> ByPtr<T> {
    pub fn new(v: Arc<T>) -> Self {
        ByPtr(v)
    }
    pub fn ptr(&self) -> *const T {
        Arc::as_ptr(&self.0)
    }
    pub fn inner(&self) -> &Arc<T> {
        &self.0
    }
}

impl<T> Clone for ByPtr<T> {
    fn clone(&self) -> Self {
        ByPtr(self.0.clone())
    }
}

impl<T> Deref for ByPtr<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> PartialEq for ByPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl<T> Eq for ByPtr<T> {}

impl<T> Hash for ByPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ByPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Hash an `Arc` by address, for manual `Hash` impls over enum payloads.
pub(crate) fn hash_arc<T, H: Hasher>(a: &Arc<T>, state: &mut H) {
    (Arc::as_ptr(a) as usize).hash(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn byptr_identity_not_value() {
        let a = Arc::new(7u32);
        let b = Arc::new(7u32);
        assert_ne!(ByPtr::new(a.clone()), ByPtr::new(b.clone()));
        assert_eq!(ByPtr::new(a.clone()), ByPtr::new(a.clone()));

        let mut set = HashSet::new();
        set.insert(ByPtr::new(a.clone()));
        set.insert(ByPtr::new(a));
        set.insert(ByPtr::new(b));
        assert_eq!(set.len(), 2);
    }
}
