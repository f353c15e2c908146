//! Spill-space bookkeeping.
//!
//! Bytes written to spill files are charged up a small tree: every spiller
//! owns a [`LocalSpillContext`], which forwards to a per-query
//! [`QuerySpillContext`], which forwards to the node-wide
//! [`SpillSpaceTracker`]. Any level may refuse the charge.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use spillway_common::{QueryId, Result, SpillwayError};
use tracing::warn;

/// Receiver of spilled-byte deltas.
pub trait SpillContext: Send + Sync + Debug {
    /// Positive deltas reserve space and may fail; negative deltas release it.
    fn update_bytes(&self, delta: i64) -> Result<()>;
}

/// Node-wide cap on bytes held in spill files.
#[derive(Debug)]
pub struct SpillSpaceTracker {
    max_bytes: u64,
    current_bytes: AtomicU64,
}

impl SpillSpaceTracker {
    pub fn new(max_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            max_bytes,
            current_bytes: AtomicU64::new(0),
        })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Acquire)
    }

    pub fn reserve(&self, bytes: u64) -> Result<()> {
        let mut current = self.current_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.max_bytes {
                return Err(SpillwayError::ResourceExhausted(format!(
                    "node spill limit of {} bytes exceeded ({current} in use, {bytes} requested)",
                    self.max_bytes
                )));
            }
            match self.current_bytes.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn free(&self, bytes: u64) -> Result<()> {
        let mut current = self.current_bytes.load(Ordering::Acquire);
        loop {
            let Some(next) = current.checked_sub(bytes) else {
                return Err(SpillwayError::Execution(format!(
                    "freeing {bytes} spill bytes but only {current} are tracked"
                )));
            };
            match self.current_bytes.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }
}

impl SpillContext for SpillSpaceTracker {
    fn update_bytes(&self, delta: i64) -> Result<()> {
        if delta >= 0 {
            self.reserve(delta.unsigned_abs())
        } else {
            self.free(delta.unsigned_abs())
        }
    }
}

/// Spill bytes of one query, with an optional per-query limit.
#[derive(Debug)]
pub struct QuerySpillContext {
    query_id: QueryId,
    max_bytes: Option<u64>,
    spilled_bytes: AtomicU64,
    tracker: Option<Arc<SpillSpaceTracker>>,
}

impl QuerySpillContext {
    pub fn new(
        query_id: QueryId,
        max_bytes: Option<u64>,
        tracker: Option<Arc<SpillSpaceTracker>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            query_id,
            max_bytes,
            spilled_bytes: AtomicU64::new(0),
            tracker,
        })
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn spilled_bytes(&self) -> u64 {
        self.spilled_bytes.load(Ordering::Acquire)
    }

    fn grow(&self, bytes: u64) -> Result<()> {
        let mut current = self.spilled_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if let Some(max) = self.max_bytes {
                if next > max {
                    return Err(SpillwayError::ResourceExhausted(format!(
                        "query {} spill limit of {max} bytes exceeded",
                        self.query_id
                    )));
                }
            }
            match self.spilled_bytes.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn shrink(&self, bytes: u64) -> Result<()> {
        self.spilled_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(bytes)
            })
            .map(|_| ())
            .map_err(|current| {
                SpillwayError::Execution(format!(
                    "query {} freeing {bytes} spill bytes but only {current} are tracked",
                    self.query_id
                ))
            })
    }
}

impl SpillContext for QuerySpillContext {
    fn update_bytes(&self, delta: i64) -> Result<()> {
        let bytes = delta.unsigned_abs();
        if delta >= 0 {
            self.grow(bytes)?;
            if let Some(tracker) = &self.tracker {
                if let Err(e) = tracker.reserve(bytes) {
                    self.shrink(bytes)?;
                    return Err(e);
                }
            }
            Ok(())
        } else {
            self.shrink(bytes)?;
            if let Some(tracker) = &self.tracker {
                tracker.free(bytes)?;
            }
            Ok(())
        }
    }
}

/// Per-spiller leaf. Closing it returns everything it charged to its parent.
///
/// The closed flag, the parent charge and the local count change under one
/// lock, so a charge can never land after `close` has reverted the count.
#[derive(Debug)]
pub struct LocalSpillContext {
    parent: Arc<dyn SpillContext>,
    state: Mutex<LocalState>,
}

#[derive(Debug, Default)]
struct LocalState {
    spilled_bytes: i64,
    closed: bool,
}

impl LocalSpillContext {
    pub fn new(parent: Arc<dyn SpillContext>) -> Arc<Self> {
        Arc::new(Self {
            parent,
            state: Mutex::new(LocalState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes currently charged by this context.
    pub fn spilled_bytes(&self) -> u64 {
        self.state().spilled_bytes.max(0) as u64
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Revert every charged byte from the parent. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let bytes = std::mem::take(&mut state.spilled_bytes);
        if bytes != 0 {
            self.parent.update_bytes(-bytes)?;
        }
        Ok(())
    }
}

impl SpillContext for LocalSpillContext {
    fn update_bytes(&self, delta: i64) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(SpillwayError::Execution(
                "spill context is already closed".to_string(),
            ));
        }
        self.parent.update_bytes(delta)?;
        state.spilled_bytes += delta;
        Ok(())
    }
}

impl Drop for LocalSpillContext {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to revert spill bytes on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(
        id: &str,
        max_bytes: Option<u64>,
        tracker: &Arc<SpillSpaceTracker>,
    ) -> Arc<QuerySpillContext> {
        QuerySpillContext::new(QueryId(id.to_string()), max_bytes, Some(Arc::clone(tracker)))
    }

    #[test]
    fn tracker_enforces_node_limit() {
        let tracker = SpillSpaceTracker::new(100);
        tracker.update_bytes(60).expect("first");
        let err = tracker.update_bytes(41).expect_err("over limit");
        assert!(matches!(err, SpillwayError::ResourceExhausted(_)));
        assert_eq!(tracker.current_bytes(), 60);
        tracker.update_bytes(-60).expect("free");
        assert_eq!(tracker.current_bytes(), 0);
        assert!(tracker.update_bytes(-1).is_err());
    }

    #[test]
    fn query_limit_rolls_back_and_forwards_to_tracker() {
        let tracker = SpillSpaceTracker::new(1_000);
        let query = query("q1", Some(100), &tracker);
        query.update_bytes(80).expect("within");
        assert!(matches!(
            query.update_bytes(30),
            Err(SpillwayError::ResourceExhausted(_))
        ));
        assert_eq!(query.spilled_bytes(), 80);
        assert_eq!(tracker.current_bytes(), 80);
    }

    #[test]
    fn tracker_refusal_leaves_query_unchanged() {
        let tracker = SpillSpaceTracker::new(50);
        let query = query("q2", None, &tracker);
        assert!(query.update_bytes(51).is_err());
        assert_eq!(query.spilled_bytes(), 0);
        assert_eq!(tracker.current_bytes(), 0);
    }

    #[test]
    fn local_close_reverts_its_bytes_once() {
        let tracker = SpillSpaceTracker::new(1_000);
        let query = query("q3", None, &tracker);
        let a = LocalSpillContext::new(query.clone());
        let b = LocalSpillContext::new(query.clone());
        a.update_bytes(100).expect("a");
        b.update_bytes(40).expect("b");
        assert_eq!(query.spilled_bytes(), 140);

        a.close().expect("close");
        a.close().expect("close again");
        assert_eq!(query.spilled_bytes(), 40);
        assert_eq!(tracker.current_bytes(), 40);
        assert!(a.update_bytes(1).is_err());

        drop(b);
        assert_eq!(tracker.current_bytes(), 0);
    }

    #[test]
    fn close_racing_with_charges_leaves_nothing_behind() {
        for _ in 0..200 {
            let tracker = SpillSpaceTracker::new(u64::MAX);
            let local = LocalSpillContext::new(query("race", None, &tracker));
            let charger = {
                let local = Arc::clone(&local);
                std::thread::spawn(move || while local.update_bytes(1).is_ok() {})
            };
            std::thread::yield_now();
            local.close().expect("close");
            charger.join().expect("charger");
            drop(local);
            assert_eq!(tracker.current_bytes(), 0);
        }
    }
}
