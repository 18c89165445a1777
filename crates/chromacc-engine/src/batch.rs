//! Thread-safe state for the one in-flight batch.
//!
//! All mutation goes through a single mutex so pollers always observe a
//! consistent pairing of per-item statuses, aggregate counters, and the
//! results list. Status transitions per item are strictly
//! `pending -> queued -> completed | failed`; nothing ever leaves a
//! terminal state, which is what makes the counters increment exactly
//! once per item.

use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use chromacc_core::decoders::StageImages;
use chromacc_core::models::Stage;

/// Per-item lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Queued,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

/// Progress record for one item; identity key is `index`.
#[derive(Debug, Clone, Serialize)]
pub struct ItemProgress {
    pub index: usize,
    pub filename: String,
    pub status: ItemStatus,
    pub error: Option<String>,
}

/// Successful output for one item.
#[derive(Debug, Clone)]
pub struct ItemResult {
    pub index: usize,
    pub filename: String,
    /// Corrected image per stage that ran.
    pub images: StageImages,
    /// Which stage's output counts as the final corrected image.
    pub final_stage: Option<Stage>,
}

/// Deep, point-in-time copy of the batch state; safe to serialize without
/// holding any lock.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub batch_id: String,
    pub active: bool,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub progress: Vec<ItemProgress>,
    pub has_results: bool,
}

impl BatchSnapshot {
    /// True once every item has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.completed + self.failed == self.total
    }
}

#[derive(Debug, Default)]
struct Inner {
    batch_id: String,
    active: bool,
    total: usize,
    completed: usize,
    failed: usize,
    progress: Vec<ItemProgress>,
    results: Vec<ItemResult>,
}

/// Shared batch state; one instance per engine, reused across batches.
#[derive(Debug, Default)]
pub struct BatchState {
    inner: Mutex<Inner>,
}

impl BatchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admission: atomically check that no batch is active and, if so,
    /// reset for the new one. On conflict returns the running batch's id
    /// and leaves all state untouched.
    pub fn try_begin(&self, batch_id: &str, items: &[(usize, String)]) -> Result<(), String> {
        let mut inner = self.inner.lock().expect("batch state poisoned");
        if inner.active {
            return Err(inner.batch_id.clone());
        }
        Self::reset_inner(&mut inner, batch_id, items);
        Ok(())
    }

    /// Atomically replace all per-batch fields for a freshly admitted
    /// batch and flip it active. Items start as `pending`.
    pub fn reset(&self, batch_id: &str, items: &[(usize, String)]) {
        let mut inner = self.inner.lock().expect("batch state poisoned");
        Self::reset_inner(&mut inner, batch_id, items);
    }

    fn reset_inner(inner: &mut Inner, batch_id: &str, items: &[(usize, String)]) {
        inner.batch_id = batch_id.to_string();
        inner.active = true;
        inner.total = items.len();
        inner.completed = 0;
        inner.failed = 0;
        inner.progress = items
            .iter()
            .map(|(index, filename)| ItemProgress {
                index: *index,
                filename: filename.clone(),
                status: ItemStatus::Pending,
                error: None,
            })
            .collect();
        inner.results = Vec::new();
    }

    /// Transition one item's status. Terminal transitions bump the
    /// matching counter exactly once; attempts to move an item out of a
    /// terminal state (a late worker result after a timeout, say) are
    /// dropped. An unknown index is a logged no-op.
    pub fn update_status(&self, index: usize, status: ItemStatus, error: Option<String>) {
        let mut inner = self.inner.lock().expect("batch state poisoned");
        let Some(item) = inner.progress.iter_mut().find(|p| p.index == index) else {
            warn!(index, "Status update for unknown item index ignored");
            return;
        };
        if item.status.is_terminal() {
            warn!(
                index,
                current = ?item.status,
                requested = ?status,
                "Ignoring status transition out of a terminal state"
            );
            return;
        }

        item.status = status;
        if let Some(message) = error {
            item.error = Some(message);
        }

        match status {
            ItemStatus::Completed => inner.completed += 1,
            ItemStatus::Failed => inner.failed += 1,
            _ => {}
        }
    }

    /// Append a successful result under the same lock as status updates,
    /// so a snapshot never shows a completed count the results list
    /// contradicts.
    pub fn add_result(&self, result: ItemResult) {
        let mut inner = self.inner.lock().expect("batch state poisoned");
        inner.results.push(result);
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().expect("batch state poisoned").active
    }

    pub fn batch_id(&self) -> String {
        self.inner.lock().expect("batch state poisoned").batch_id.clone()
    }

    /// Flip the admission flag off. Idempotent.
    pub fn mark_complete(&self) {
        let mut inner = self.inner.lock().expect("batch state poisoned");
        inner.active = false;
    }

    /// Point-in-time deep copy for pollers.
    pub fn snapshot(&self) -> BatchSnapshot {
        let inner = self.inner.lock().expect("batch state poisoned");
        BatchSnapshot {
            batch_id: inner.batch_id.clone(),
            active: inner.active,
            total: inner.total,
            completed: inner.completed,
            failed: inner.failed,
            progress: inner.progress.clone(),
            has_results: !inner.results.is_empty(),
        }
    }

    /// Drain accumulated results, leaving progress records in place.
    pub fn take_results(&self) -> Vec<ItemResult> {
        let mut inner = self.inner.lock().expect("batch state poisoned");
        std::mem::take(&mut inner.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<(usize, String)> {
        (0..n).map(|i| (i, format!("img{i}.png"))).collect()
    }

    #[test]
    fn test_reset_initializes_pending_items() {
        let state = BatchState::new();
        state.reset("batch_1", &items(3));

        let snap = state.snapshot();
        assert_eq!(snap.batch_id, "batch_1");
        assert!(snap.active);
        assert_eq!(snap.total, 3);
        assert_eq!(snap.completed + snap.failed, 0);
        assert!(snap.progress.iter().all(|p| p.status == ItemStatus::Pending));
        assert!(!snap.has_results);
    }

    #[test]
    fn test_terminal_transition_increments_counter_once() {
        let state = BatchState::new();
        state.reset("batch_1", &items(2));

        state.update_status(0, ItemStatus::Queued, None);
        state.update_status(0, ItemStatus::Completed, None);
        // A late duplicate must not double-count
        state.update_status(0, ItemStatus::Completed, None);
        state.update_status(0, ItemStatus::Failed, Some("late".into()));

        let snap = state.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 0);
        assert_eq!(snap.progress[0].status, ItemStatus::Completed);
        assert_eq!(snap.progress[0].error, None);
    }

    #[test]
    fn test_failed_keeps_error_message() {
        let state = BatchState::new();
        state.reset("batch_1", &items(1));
        state.update_status(0, ItemStatus::Failed, Some("decode error".into()));

        let snap = state.snapshot();
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.progress[0].error.as_deref(), Some("decode error"));
    }

    #[test]
    fn test_unknown_index_is_a_no_op() {
        let state = BatchState::new();
        state.reset("batch_1", &items(1));
        state.update_status(42, ItemStatus::Completed, None);

        let snap = state.snapshot();
        assert_eq!(snap.completed, 0);
        assert_eq!(snap.total, 1);
    }

    #[test]
    fn test_try_begin_conflict_leaves_state_untouched() {
        let state = BatchState::new();
        state.reset("batch_1", &items(2));
        state.update_status(0, ItemStatus::Completed, None);

        let running = state.try_begin("batch_2", &items(5)).unwrap_err();
        assert_eq!(running, "batch_1");

        let snap = state.snapshot();
        assert_eq!(snap.batch_id, "batch_1");
        assert_eq!(snap.total, 2);
        assert_eq!(snap.completed, 1);

        // After completion the next admission succeeds
        state.mark_complete();
        state.try_begin("batch_2", &items(5)).unwrap();
        assert_eq!(state.snapshot().total, 5);
    }

    #[test]
    fn test_mark_complete_is_idempotent() {
        let state = BatchState::new();
        state.reset("batch_1", &items(1));
        assert!(state.is_active());

        state.mark_complete();
        state.mark_complete();
        assert!(!state.is_active());
    }

    #[test]
    fn test_counters_never_exceed_total_under_interleaving() {
        use std::sync::Arc;

        let state = Arc::new(BatchState::new());
        state.reset("batch_1", &items(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    state.update_status(i, ItemStatus::Queued, None);
                    // Two racing terminal transitions for the same item
                    state.update_status(i, ItemStatus::Completed, None);
                    state.update_status(i, ItemStatus::Failed, Some("race".into()));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = state.snapshot();
        assert_eq!(snap.completed + snap.failed, 8);
        assert_eq!(snap.completed, 8);
        assert!(snap.is_terminal());
    }
}
