//! State types for tracking applied resources.
//!
//! The state document is the only durable entity: one per environment,
//! holding the last-known-applied record of every resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::StateError;
use crate::graph::{Attributes, Reference, Value};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept in a document.
const MAX_HISTORY: usize = 100;

/// The persisted state of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Revision counter, bumped by every executor write.
    #[serde(default)]
    pub serial: u64,
    /// Hash of the specification last applied.
    #[serde(default)]
    pub spec_hash: String,
    /// Records by logical id.
    #[serde(default)]
    pub records: BTreeMap<String, StateRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Apply history (recent entries).
    #[serde(default)]
    pub history: Vec<ApplyHistoryEntry>,
}

/// Last-known-applied state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Logical id from the specification.
    pub logical_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Provider-assigned identifier, once created.
    #[serde(default)]
    pub physical_id: Option<String>,
    /// Desired attributes as last applied, references unresolved.
    #[serde(default)]
    pub attributes: Attributes,
    /// Attributes reported by the provider, used to resolve references.
    #[serde(default)]
    pub outputs: Attributes,
    /// Dependencies at the time of the last apply.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Superseded physical ids still awaiting deletion.
    #[serde(default)]
    pub deposed: Vec<String>,
    /// Record status.
    pub status: RecordStatus,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// Status of a state record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// An operation was started but not confirmed.
    Pending,
    /// Matches the recorded attributes.
    Applied,
    /// The last operation failed.
    Failed,
    /// The resource was destroyed.
    Deleted,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyHistoryEntry {
    /// When the apply finished.
    pub timestamp: DateTime<Utc>,
    /// Plan that was applied.
    pub plan_id: String,
    /// Specification hash of the plan.
    pub spec_hash: String,
    /// Type of operation.
    pub operation: ApplyOperation,
    /// Resources touched.
    pub resources: Vec<String>,
    /// Whether the apply succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of apply runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOperation {
    /// Converge to a specification.
    Apply,
    /// Converge to the empty specification.
    Destroy,
}

impl StateDocument {
    /// Creates a new empty state document.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            serial: 0,
            spec_hash: String::new(),
            records: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Parses and validates a serialized document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupted`] if the content is not a valid
    /// document, or [`StateError::VersionMismatch`] for an unsupported format.
    pub fn from_json(content: &str) -> std::result::Result<Self, StateError> {
        let document: Self = serde_json::from_str(content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;
        document.validate()?;
        Ok(document)
    }

    /// Serializes the document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the document cannot be encoded.
    pub fn to_json(&self) -> std::result::Result<String, StateError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))
    }

    /// Checks record invariants.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated invariant.
    pub fn validate(&self) -> std::result::Result<(), StateError> {
        let major = |v: &str| v.split('.').next().unwrap_or_default().to_string();
        if major(&self.version) != major(STATE_VERSION) {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            });
        }

        for (key, record) in &self.records {
            if *key != record.logical_id {
                return Err(StateError::corrupted(format!(
                    "Record key '{key}' does not match logical id '{}'",
                    record.logical_id
                )));
            }
            if record.status == RecordStatus::Applied && record.physical_id.is_none() {
                return Err(StateError::corrupted(format!(
                    "Applied record '{key}' has no physical id"
                )));
            }
        }

        Ok(())
    }

    /// Gets a record by logical id.
    #[must_use]
    pub fn get(&self, logical_id: &str) -> Option<&StateRecord> {
        self.records.get(logical_id)
    }

    /// Gets a mutable record by logical id.
    pub fn get_mut(&mut self, logical_id: &str) -> Option<&mut StateRecord> {
        self.records.get_mut(logical_id)
    }

    /// Adds or replaces a record.
    pub fn set_record(&mut self, record: StateRecord) {
        self.records.insert(record.logical_id.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record.
    pub fn remove(&mut self, logical_id: &str) -> Option<StateRecord> {
        let result = self.records.remove(logical_id);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Updates the status of a record.
    ///
    /// Returns false if no record exists for `logical_id`.
    pub fn record_status(&mut self, logical_id: &str, status: RecordStatus) -> bool {
        let Some(record) = self.records.get_mut(logical_id) else {
            return false;
        };
        record.set_status(status);
        self.last_updated = Utc::now();
        true
    }

    /// Records that still describe real-world resources.
    pub fn live_records(&self) -> impl Iterator<Item = &StateRecord> {
        self.records.values().filter(|r| r.is_live())
    }

    /// Drops tombstones that have nothing left to clean up.
    ///
    /// Returns the number of records removed.
    pub fn compact(&mut self) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| r.status != RecordStatus::Deleted || !r.deposed.is_empty());
        before - self.records.len()
    }

    /// Resolves a reference against recorded physical ids and outputs.
    #[must_use]
    pub fn lookup(&self, reference: &Reference) -> Option<Value> {
        let record = self.records.get(reference.resource())?;
        if !record.is_live() {
            return None;
        }
        if reference.is_physical_id() {
            return record.physical_id.clone().map(Value::String);
        }
        record.outputs.get(reference.attribute()).cloned()
    }

    /// Adds a history entry, keeping only the most recent ones.
    pub fn add_history(&mut self, entry: ApplyHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl StateRecord {
    /// Creates a pending record for a resource about to be created.
    #[must_use]
    pub fn pending(logical_id: &str, resource_type: &str) -> Self {
        Self {
            logical_id: logical_id.to_string(),
            resource_type: resource_type.to_string(),
            physical_id: None,
            attributes: Attributes::new(),
            outputs: Attributes::new(),
            dependencies: BTreeSet::new(),
            deposed: Vec::new(),
            status: RecordStatus::Pending,
            updated_at: Utc::now(),
        }
    }

    /// Updates the status.
    pub fn set_status(&mut self, status: RecordStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Returns true if the record may describe an existing resource.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.status != RecordStatus::Deleted
    }

    /// Returns true if the resource is known to exist as recorded.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.status == RecordStatus::Applied && self.physical_id.is_some()
    }
}

impl ApplyHistoryEntry {
    /// Creates a history entry.
    #[must_use]
    pub fn new(
        operation: ApplyOperation,
        plan_id: &str,
        spec_hash: &str,
        resources: Vec<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            plan_id: plan_id.to_string(),
            spec_hash: spec_hash.to_string(),
            operation,
            resources,
            success: error.is_none(),
            error,
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for ApplyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(logical_id: &str, physical_id: &str) -> StateRecord {
        let mut record = StateRecord::pending(logical_id, "network.vpc");
        record.physical_id = Some(physical_id.to_string());
        record
            .outputs
            .insert(String::from("arn"), Value::from(format!("arn:{physical_id}")));
        record.set_status(RecordStatus::Applied);
        record
    }

    #[test]
    fn test_lookup_references() {
        let mut state = StateDocument::new("app", "dev");
        state.set_record(applied("vpc", "vpc-1"));

        assert_eq!(
            state.lookup(&Reference::new("vpc")),
            Some(Value::from("vpc-1"))
        );
        assert_eq!(
            state.lookup(&Reference::new("vpc.arn")),
            Some(Value::from("arn:vpc-1"))
        );
        assert_eq!(state.lookup(&Reference::new("vpc.missing")), None);
        assert_eq!(state.lookup(&Reference::new("other")), None);
    }

    #[test]
    fn test_validate_rejects_applied_without_physical_id() {
        let mut state = StateDocument::new("app", "dev");
        let mut record = StateRecord::pending("vpc", "network.vpc");
        record.status = RecordStatus::Applied;
        state.set_record(record);

        assert!(matches!(state.validate(), Err(StateError::Corrupted { .. })));
    }

    #[test]
    fn test_from_json_ignores_unknown_fields() {
        let json = r#"{
            "version": "1.4",
            "project": "app",
            "environment": "dev",
            "last_updated": "2026-01-01T00:00:00Z",
            "future_field": {"anything": true},
            "records": {
                "vpc": {
                    "logical_id": "vpc",
                    "resource_type": "network.vpc",
                    "physical_id": "vpc-1",
                    "status": "applied",
                    "updated_at": "2026-01-01T00:00:00Z",
                    "another_future_field": 1
                }
            }
        }"#;

        let state = StateDocument::from_json(json).expect("forward compatible");
        assert!(state.get("vpc").expect("record").is_applied());
    }

    #[test]
    fn test_from_json_rejects_garbage_and_new_major() {
        assert!(matches!(
            StateDocument::from_json("{not json"),
            Err(StateError::Corrupted { .. })
        ));

        let mut state = StateDocument::new("app", "dev");
        state.version = String::from("2.0");
        let json = state.to_json().expect("serialize");
        assert!(matches!(
            StateDocument::from_json(&json),
            Err(StateError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_compact_keeps_deposed_tombstones() {
        let mut state = StateDocument::new("app", "dev");
        let mut gone = applied("gone", "x-1");
        gone.set_status(RecordStatus::Deleted);
        let mut deposed = applied("deposed", "x-2");
        deposed.set_status(RecordStatus::Deleted);
        deposed.deposed.push(String::from("x-0"));
        state.set_record(gone);
        state.set_record(deposed);
        state.set_record(applied("kept", "x-3"));

        assert_eq!(state.compact(), 1);
        assert!(state.get("gone").is_none());
        assert!(state.get("deposed").is_some());
        assert_eq!(state.live_records().count(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = StateDocument::new("app", "dev");
        for i in 0..150 {
            state.add_history(ApplyHistoryEntry::new(
                ApplyOperation::Apply,
                &format!("plan-{i}"),
                "hash",
                vec![],
                None,
            ));
        }
        assert_eq!(state.history.len(), 100);
        assert_eq!(state.history[0].plan_id, "plan-50");
    }
}
