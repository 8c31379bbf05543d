//! Debounced, coalescing persistence of replicated documents.
//!
//! Each document carries at most one debounce timer. Every scheduled update
//! either flushes immediately (enough updates piled up) or replaces the
//! timer, so a burst of edits ends in a single snapshot write.

use schemaflow_core::{now_millis, MergeableState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::registry::{DocState, ReplicatedDocument};
use crate::storage::SnapshotStore;

/// Flush threshold and debounce windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Pending updates that force an immediate flush.
    pub flush_threshold: u32,
    pub merge_debounce_ms: u64,
    pub schema_debounce_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 5,
            merge_debounce_ms: 300,
            schema_debounce_ms: 1000,
        }
    }
}

/// What caused a schedule call; selects the debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Merge,
    SchemaChange,
}

#[derive(Clone)]
pub struct PersistenceScheduler {
    store: Arc<dyn SnapshotStore>,
    config: PersistenceConfig,
}

impl PersistenceScheduler {
    pub fn new(store: Arc<dyn SnapshotStore>, config: PersistenceConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    fn window(&self, trigger: FlushTrigger) -> Duration {
        match trigger {
            FlushTrigger::Merge => Duration::from_millis(self.config.merge_debounce_ms),
            FlushTrigger::SchemaChange => Duration::from_millis(self.config.schema_debounce_ms),
        }
    }

    /// Lock `doc` and schedule it.
    pub async fn schedule<S: MergeableState>(
        &self,
        doc: &Arc<ReplicatedDocument<S>>,
        trigger: FlushTrigger,
    ) {
        let mut st = doc.lock().await;
        self.schedule_locked(doc, &mut st, trigger);
    }

    /// Schedule a document whose lock the caller already holds.
    pub fn schedule_locked<S: MergeableState>(
        &self,
        doc: &Arc<ReplicatedDocument<S>>,
        st: &mut DocState<S>,
        trigger: FlushTrigger,
    ) {
        if let Some(timer) = st.flush_timer.take() {
            timer.abort();
        }
        st.timer_generation = st.timer_generation.wrapping_add(1);

        if st.pending_updates >= self.config.flush_threshold {
            log::debug!(
                "{} pending updates on {}, flushing now",
                st.pending_updates,
                doc.workspace_id()
            );
            let scheduler = self.clone();
            let doc = doc.clone();
            tokio::spawn(async move {
                scheduler.flush(&doc).await;
            });
            return;
        }

        let delay = self.window(trigger);
        let generation = st.timer_generation;
        let scheduler = self.clone();
        let target = doc.clone();
        st.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut st = target.lock().await;
                if st.timer_generation != generation {
                    return;
                }
                // Dropping our own handle detaches rather than aborts.
                st.flush_timer = None;
            }
            scheduler.flush(&target).await;
        }));
    }

    /// Flush without waiting for the debounce window.
    pub async fn flush_now<S: MergeableState>(&self, doc: &Arc<ReplicatedDocument<S>>) -> bool {
        self.flush(doc).await
    }

    /// Write the document's full state to the store.
    ///
    /// Returns `false` if the write failed; the pending count is restored so
    /// the next trigger retries. A document with nothing pending is not
    /// written.
    pub async fn flush<S: MergeableState>(&self, doc: &Arc<ReplicatedDocument<S>>) -> bool {
        let _serial = doc.flush_lock.lock().await;

        let (state, taken) = {
            let mut st = doc.lock().await;
            if let Some(timer) = st.flush_timer.take() {
                timer.abort();
                st.timer_generation = st.timer_generation.wrapping_add(1);
            }
            if st.pending_updates == 0 {
                return true;
            }
            let taken = std::mem::take(&mut st.pending_updates);
            (st.state.encode(), taken)
        };

        let store = self.store.clone();
        let workspace_id = doc.workspace_id().clone();
        let ws = workspace_id.clone();
        let last_modified = now_millis();
        let result =
            tokio::task::spawn_blocking(move || store.upsert(&ws, &state, last_modified)).await;

        match result {
            Ok(Ok(record)) => {
                let mut st = doc.lock().await;
                st.version = record.version;
                st.last_modified = record.last_modified;
                log::info!(
                    "Flushed {workspace_id} at version {} ({taken} updates)",
                    record.version
                );
                true
            }
            Ok(Err(e)) => {
                log::error!("Failed to flush {workspace_id}: {e}");
                doc.lock().await.pending_updates += taken;
                false
            }
            Err(e) => {
                log::error!("Flush task for {workspace_id} failed: {e}");
                doc.lock().await.pending_updates += taken;
                false
            }
        }
    }
}
