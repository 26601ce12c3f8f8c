//! Best-effort hand-off to the storage layer.
//!
//! Persistence is eventual: a failure here is logged by the caller and never
//! rolls back the live view.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use pitchside_common::protocol::{Assignment, TrackedEvent};

use crate::error::{Result, SyncError};

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn persist_event(&self, event: &TrackedEvent) -> Result<()>;
    async fn persist_assignment(&self, assignment: &Assignment) -> Result<()>;
}

/// Discards everything. Default for clients without a storage layer.
pub struct NoopPersistence;

#[async_trait]
impl Persistence for NoopPersistence {
    async fn persist_event(&self, _event: &TrackedEvent) -> Result<()> {
        Ok(())
    }

    async fn persist_assignment(&self, _assignment: &Assignment) -> Result<()> {
        Ok(())
    }
}

/// Collects writes in memory (for tests), optionally failing every call.
pub struct MemoryPersistence {
    events: Mutex<Vec<TrackedEvent>>,
    assignments: Mutex<Vec<Assignment>>,
    failing: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            assignments: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<TrackedEvent> {
        self.events.lock().clone()
    }

    pub fn assignments(&self) -> Vec<Assignment> {
        self.assignments.lock().clone()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Persist("storage unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn persist_event(&self, event: &TrackedEvent) -> Result<()> {
        self.check()?;
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn persist_assignment(&self, assignment: &Assignment) -> Result<()> {
        self.check()?;
        self.assignments.lock().push(assignment.clone());
        Ok(())
    }
}
