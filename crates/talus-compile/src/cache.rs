//! Compile-and-cache layer.
//!
//! Specialized kernel sources are compiled once and cached by source hash;
//! re-initialization with an unchanged configuration hits the cache instead
//! of re-parsing. The cache is shared between the two workers.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::error::CompileError;
use crate::program::Program;

/// Shared cache of compiled kernel programs, keyed by source hash.
#[derive(Debug, Default, Clone)]
pub struct KernelCache {
    inner: Arc<Mutex<HashMap<u64, Arc<Program>>>>,
}

impl KernelCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles `source`, or returns the cached program for identical
    /// source compiled earlier.
    pub fn compile(&self, source: &str) -> Result<Arc<Program>, CompileError> {
        let key = hash_source(source);
        if let Ok(guard) = self.inner.lock() {
            if let Some(hit) = guard.get(&key) {
                return Ok(Arc::clone(hit));
            }
        }
        let program = Arc::new(Program::compile(source)?);
        if let Ok(mut guard) = self.inner.lock() {
            guard.insert(key, Arc::clone(&program));
        }
        tracing::debug!(hash = key, bytes = source.len(), "compiled kernel source");
        Ok(program)
    }

    /// Compiles a bare expression (inspector predicates), cached the same
    /// way.
    pub fn compile_expression(&self, source: &str) -> Result<Arc<Program>, CompileError> {
        // Prefix distinguishes expression entries from statement entries
        // with identical text.
        let key = hash_source(&format!("expr\u{0}{source}"));
        if let Ok(guard) = self.inner.lock() {
            if let Some(hit) = guard.get(&key) {
                return Ok(Arc::clone(hit));
            }
        }
        let program = Arc::new(Program::compile_expression(source)?);
        if let Ok(mut guard) = self.inner.lock() {
            guard.insert(key, Arc::clone(&program));
        }
        Ok(program)
    }

    /// Number of cached programs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all cached programs.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.clear();
        }
    }
}

fn hash_source(source: &str) -> u64 {
    let mut h = DefaultHasher::new();
    source.hash(&mut h);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_source_hits_the_cache() {
        let cache = KernelCache::new();
        let a = cache.compile("x = 1;").unwrap();
        let b = cache.compile("x = 1;").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn different_source_compiles_fresh() {
        let cache = KernelCache::new();
        let _ = cache.compile("x = 1;").unwrap();
        let _ = cache.compile("x = 2;").unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = KernelCache::new();
        let _ = cache.compile("x = 1;").unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn expression_entries_do_not_collide_with_statements() {
        let cache = KernelCache::new();
        let expr = cache.compile_expression("Z + 1").unwrap();
        let again = cache.compile_expression("Z + 1").unwrap();
        assert!(Arc::ptr_eq(&expr, &again));

        let mut scope = crate::Scope::new();
        scope.set("Z", 2.0);
        expr.run(&mut scope).unwrap();
        assert_eq!(scope.get("value"), Some(3.0));
    }
}
