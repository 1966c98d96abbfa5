//! Dependency validation handles.
//!
//! A [`DependencyValidation`] is an opaque handle shared between an asset
//! and whatever watches its source files. The validation index starts at
//! zero and is bumped whenever a source the asset was built from changes;
//! a non-zero index means the asset is stale.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Default)]
pub struct DependencyValidation {
    index: Arc<AtomicU32>,
}

impl DependencyValidation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current validation index; zero means still valid.
    pub fn validation_index(&self) -> u32 {
        self.index.load(Ordering::Acquire)
    }

    /// Marks every holder of this handle as invalidated.
    pub fn bump(&self) {
        self.index.fetch_add(1, Ordering::AcqRel);
    }

    /// Two handles compare equal when they share the same underlying index.
    pub fn same_as(&self, other: &DependencyValidation) -> bool {
        Arc::ptr_eq(&self.index, &other.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_valid() {
        let depval = DependencyValidation::new();
        assert_eq!(depval.validation_index(), 0);
    }

    #[test]
    fn test_bump_is_shared_across_clones() {
        let depval = DependencyValidation::new();
        let clone = depval.clone();
        depval.bump();
        assert_eq!(clone.validation_index(), 1);
        assert!(depval.same_as(&clone));
        assert!(!depval.same_as(&DependencyValidation::new()));
    }
}
