//! Serialized writer for a state document during an apply.
//!
//! Worker tasks in the same batch finish concurrently; every record update
//! goes through [`StateLedger::update`], which holds the mutex for the whole
//! read-modify-persist cycle. The in-memory document only changes once the
//! store accepted the write, so memory and storage never disagree.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::graph::{resolve_attributes, Attributes, Reference, Value};

use super::store::StateStore;
use super::types::{StateDocument, StateRecord};

/// Mutex-guarded state document bound to one environment.
pub struct StateLedger {
    store: Arc<dyn StateStore>,
    environment: String,
    document: Mutex<StateDocument>,
}

impl StateLedger {
    /// Wraps a loaded document.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, environment: &str, document: StateDocument) -> Self {
        Self {
            store,
            environment: environment.to_string(),
            document: Mutex::new(document),
        }
    }

    /// Environment this ledger writes to.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Returns a copy of the current document.
    pub async fn snapshot(&self) -> StateDocument {
        self.document.lock().await.clone()
    }

    /// Returns a copy of one record.
    pub async fn record(&self, logical_id: &str) -> Option<StateRecord> {
        self.document.lock().await.get(logical_id).cloned()
    }

    /// Resolves a reference against the current document.
    pub async fn lookup(&self, reference: &Reference) -> Option<Value> {
        self.document.lock().await.lookup(reference)
    }

    /// Resolves every reference in `attributes` against the current document.
    ///
    /// # Errors
    ///
    /// Returns the first reference that has no value yet.
    pub async fn resolve(&self, attributes: &Attributes) -> std::result::Result<Attributes, Reference> {
        let document = self.document.lock().await;
        resolve_attributes(attributes, &|reference| document.lookup(reference))
    }

    /// Applies `change` to the document, bumps the serial and persists it.
    ///
    /// # Errors
    ///
    /// Returns the store error if persisting fails; the in-memory document is
    /// left unchanged in that case.
    pub async fn update<F, R>(&self, change: F) -> Result<R>
    where
        F: FnOnce(&mut StateDocument) -> R + Send,
        R: Send,
    {
        let mut guard = self.document.lock().await;
        let mut next = guard.clone();
        let result = change(&mut next);
        next.serial += 1;
        next.last_updated = chrono::Utc::now();

        self.store.save(&self.environment, &next).await?;
        trace!("State serial advanced to {}", next.serial);

        *guard = next;
        Ok(result)
    }

    /// Consumes the ledger and returns the final document.
    #[must_use]
    pub fn into_inner(self) -> StateDocument {
        self.document.into_inner()
    }
}

impl std::fmt::Debug for StateLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLedger")
            .field("backend", &self.store.backend_type())
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{LocalStateStore, RecordStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let temp = TempDir::new().expect("temp dir");
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let ledger = Arc::new(StateLedger::new(
            Arc::clone(&store),
            "dev",
            StateDocument::new("app", "dev"),
        ));

        let mut handles = Vec::new();
        for i in 0..16 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger
                    .update(|doc| {
                        doc.set_record(StateRecord::pending(&format!("r{i}"), "test.item"));
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("update");
        }

        let snapshot = ledger.snapshot().await;
        assert_eq!(snapshot.serial, 16);
        assert_eq!(snapshot.records.len(), 16);

        let stored = store.load("dev").await.expect("load").expect("exists");
        assert_eq!(stored, snapshot);
    }

    #[tokio::test]
    async fn test_update_returns_closure_result() {
        let temp = TempDir::new().expect("temp dir");
        let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let mut doc = StateDocument::new("app", "dev");
        doc.set_record(StateRecord::pending("vpc", "network.vpc"));
        let ledger = StateLedger::new(store, "dev", doc);

        let changed = ledger
            .update(|doc| doc.record_status("vpc", RecordStatus::Failed))
            .await
            .expect("update");
        assert!(changed);
        assert_eq!(ledger.into_inner().serial, 1);
    }
}
