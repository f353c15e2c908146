//! Hierarchical memory accounting.
//!
//! Reservations form an explicit ownership tree: operators hold a
//! [`LocalMemoryContext`] leaf, leaves hang off [`AggregatedMemoryContext`]
//! nodes, and every node rolls its bytes up into its parent. Any node may
//! carry a byte limit; growing past a limit anywhere on the path to the root
//! fails the reservation and leaves the tree untouched.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SpillwayError};

/// Interior node of the accounting tree.
#[derive(Debug)]
pub struct AggregatedMemoryContext {
    name: String,
    parent: Option<Arc<AggregatedMemoryContext>>,
    limit_bytes: Option<usize>,
    reserved_bytes: AtomicUsize,
}

impl AggregatedMemoryContext {
    /// Create a root context. `None` means unbounded.
    #[must_use]
    pub fn new_root(name: impl Into<String>, limit_bytes: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: None,
            limit_bytes,
            reserved_bytes: AtomicUsize::new(0),
        })
    }

    /// Create an unbounded root, handy for tests and tools.
    #[must_use]
    pub fn new_simple() -> Arc<Self> {
        Self::new_root("root", None)
    }

    /// Create a child node whose usage counts against `self`.
    #[must_use]
    pub fn new_child(
        self: &Arc<Self>,
        name: impl Into<String>,
        limit_bytes: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parent: Some(Arc::clone(self)),
            limit_bytes,
            reserved_bytes: AtomicUsize::new(0),
        })
    }

    /// Create an empty leaf reservation under `self`.
    #[must_use]
    pub fn new_local(self: &Arc<Self>, name: impl Into<String>) -> LocalMemoryContext {
        LocalMemoryContext {
            owner: Arc::clone(self),
            name: name.into(),
            bytes: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit_bytes(&self) -> Option<usize> {
        self.limit_bytes
    }

    /// Bytes reserved by every leaf below this node.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes.load(Ordering::Acquire)
    }

    fn try_grow(&self, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        loop {
            let current = self.reserved_bytes.load(Ordering::Acquire);
            let next = current.checked_add(bytes).ok_or_else(|| {
                SpillwayError::ResourceExhausted(format!(
                    "memory context '{}' reservation overflow",
                    self.name
                ))
            })?;
            if let Some(limit) = self.limit_bytes {
                if next > limit {
                    return Err(SpillwayError::ResourceExhausted(format!(
                        "memory context '{}' limit of {limit} bytes exceeded: \
                         {current} reserved, {bytes} requested",
                        self.name
                    )));
                }
            }
            if self
                .reserved_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        if let Some(parent) = &self.parent {
            if let Err(e) = parent.try_grow(bytes) {
                self.reserved_bytes.fetch_sub(bytes, Ordering::AcqRel);
                return Err(e);
            }
        }
        Ok(())
    }

    fn shrink(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.reserved_bytes.fetch_sub(bytes, Ordering::AcqRel);
        if let Some(parent) = &self.parent {
            parent.shrink(bytes);
        }
    }
}

/// Leaf reservation held by exactly one owner.
///
/// Whatever is still reserved is released on drop.
#[derive(Debug)]
pub struct LocalMemoryContext {
    owner: Arc<AggregatedMemoryContext>,
    name: String,
    bytes: usize,
}

impl LocalMemoryContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes currently reserved through this leaf.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Reserve `bytes` more.
    pub fn reserve(&mut self, bytes: usize) -> Result<()> {
        if let Err(e) = self.owner.try_grow(bytes) {
            debug!(context = %self.name, bytes, error = %e, "memory reservation denied");
            return Err(e);
        }
        self.bytes += bytes;
        Ok(())
    }

    /// Release `bytes` previously reserved.
    pub fn free(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.bytes {
            return Err(SpillwayError::Execution(format!(
                "memory context '{}' cannot free {bytes} bytes, only {} reserved",
                self.name, self.bytes
            )));
        }
        self.owner.shrink(bytes);
        self.bytes -= bytes;
        Ok(())
    }

    /// Move the reservation to exactly `bytes`, growing or shrinking as needed.
    pub fn set_bytes(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.bytes {
            self.reserve(bytes - self.bytes)
        } else {
            self.free(self.bytes - bytes)
        }
    }

    /// Release everything. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.owner.shrink(self.bytes);
        self.bytes = 0;
    }
}

impl Drop for LocalMemoryContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_roll_up_to_every_ancestor() {
        let root = AggregatedMemoryContext::new_simple();
        let query = root.new_child("query", None);
        let mut a = query.new_local("a");
        let mut b = query.new_local("b");

        a.reserve(100).expect("reserve a");
        b.set_bytes(50).expect("set b");
        assert_eq!(query.reserved_bytes(), 150);
        assert_eq!(root.reserved_bytes(), 150);

        a.free(40).expect("free a");
        assert_eq!(a.bytes(), 60);
        assert_eq!(root.reserved_bytes(), 110);

        drop(b);
        assert_eq!(root.reserved_bytes(), 60);
        a.close();
        a.close();
        assert_eq!(root.reserved_bytes(), 0);
    }

    #[test]
    fn ancestor_limit_denies_and_rolls_back() {
        let root = AggregatedMemoryContext::new_root("root", Some(100));
        let child = root.new_child("child", None);
        let mut leaf = child.new_local("leaf");

        leaf.reserve(80).expect("first reserve");
        let err = leaf.reserve(30).expect_err("limit");
        assert!(matches!(err, SpillwayError::ResourceExhausted(_)));
        assert_eq!(leaf.bytes(), 80);
        assert_eq!(child.reserved_bytes(), 80);
        assert_eq!(root.reserved_bytes(), 80);
    }

    #[test]
    fn set_bytes_is_exact_not_additive() {
        let root = AggregatedMemoryContext::new_simple();
        let mut leaf = root.new_local("leaf");
        leaf.set_bytes(4096).expect("set");
        leaf.set_bytes(4096).expect("set again");
        assert_eq!(root.reserved_bytes(), 4096);
        leaf.set_bytes(0).expect("clear");
        assert_eq!(root.reserved_bytes(), 0);
    }

    #[test]
    fn free_never_goes_negative() {
        let root = AggregatedMemoryContext::new_simple();
        let mut leaf = root.new_local("leaf");
        leaf.reserve(10).expect("reserve");
        assert!(matches!(leaf.free(11), Err(SpillwayError::Execution(_))));
        assert_eq!(leaf.bytes(), 10);
        assert_eq!(root.reserved_bytes(), 10);
    }
}
