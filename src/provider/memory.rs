//! In-process provider.
//!
//! Keeps resources in a map, records every call, and can be scripted to fail
//! so retry, halt and rollback behavior can be exercised without a cloud.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ProviderError;
use crate::graph::{Attributes, Value, ID_ATTRIBUTE};

use super::{Provider, ProviderResult, ResourceSchema};

/// Provider verbs, for fault scripting and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProviderOperation {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

/// A scripted failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Retryable failure.
    Transient,
    /// Retryable failure with a retry-after hint.
    Throttled(Duration),
    /// Non-retryable failure.
    Permanent,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Verb invoked.
    pub operation: ProviderOperation,
    /// Resource type.
    pub resource_type: String,
    /// Physical id, when the verb takes one.
    pub physical_id: Option<String>,
    /// Whether the call succeeded.
    pub succeeded: bool,
}

#[derive(Debug, Clone)]
struct StoredResource {
    resource_type: String,
    attributes: Attributes,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<String, StoredResource>,
    faults: BTreeMap<(ProviderOperation, String), VecDeque<Fault>>,
    calls: Vec<ProviderCall>,
    next_id: u64,
}

/// In-memory provider.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    schemas: BTreeMap<String, ResourceSchema>,
    inner: Mutex<Inner>,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the schema of a resource type.
    #[must_use]
    pub fn with_schema(mut self, resource_type: &str, schema: ResourceSchema) -> Self {
        self.schemas.insert(resource_type.to_string(), schema);
        self
    }

    /// Queues `fault` for the next `operation` on `resource_type`.
    ///
    /// Faults are consumed one per call, in the order they were queued.
    pub async fn inject(&self, operation: ProviderOperation, resource_type: &str, fault: Fault) {
        self.inner
            .lock()
            .await
            .faults
            .entry((operation, resource_type.to_string()))
            .or_default()
            .push_back(fault);
    }

    /// Number of calls made for `operation`.
    pub async fn calls(&self, operation: ProviderOperation) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Number of mutating calls (create, update, delete).
    pub async fn mutation_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.operation != ProviderOperation::Read)
            .count()
    }

    /// Every call made so far, in order.
    pub async fn call_log(&self) -> Vec<ProviderCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Returns true if a resource with `physical_id` exists.
    pub async fn contains(&self, physical_id: &str) -> bool {
        self.inner.lock().await.resources.contains_key(physical_id)
    }

    /// Number of existing resources.
    pub async fn resource_count(&self) -> usize {
        self.inner.lock().await.resources.len()
    }

    /// Stored attributes of a resource.
    pub async fn attributes(&self, physical_id: &str) -> Option<Attributes> {
        self.inner
            .lock()
            .await
            .resources
            .get(physical_id)
            .map(|r| r.attributes.clone())
    }

    /// Changes an attribute behind the engine's back.
    ///
    /// Returns false if the resource does not exist.
    pub async fn tamper(&self, physical_id: &str, key: &str, value: Value) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(resource) = inner.resources.get_mut(physical_id) else {
            return false;
        };
        resource.attributes.insert(key.to_string(), value);
        true
    }

    /// Removes a resource behind the engine's back.
    pub async fn forget(&self, physical_id: &str) -> bool {
        self.inner.lock().await.resources.remove(physical_id).is_some()
    }

    fn next_fault(inner: &mut Inner, operation: ProviderOperation, resource_type: &str) -> Option<Fault> {
        inner
            .faults
            .get_mut(&(operation, resource_type.to_string()))
            .and_then(VecDeque::pop_front)
    }

    fn record(
        inner: &mut Inner,
        operation: ProviderOperation,
        resource_type: &str,
        physical_id: Option<&str>,
        succeeded: bool,
    ) {
        inner.calls.push(ProviderCall {
            operation,
            resource_type: resource_type.to_string(),
            physical_id: physical_id.map(str::to_string),
            succeeded,
        });
    }

    /// Applies a scripted fault, if one is queued, and records the call.
    fn check_fault(
        inner: &mut Inner,
        operation: ProviderOperation,
        resource_type: &str,
        physical_id: Option<&str>,
    ) -> ProviderResult<()> {
        let Some(fault) = Self::next_fault(inner, operation, resource_type) else {
            return Ok(());
        };
        Self::record(inner, operation, resource_type, physical_id, false);
        debug!("Injecting {fault:?} into {operation:?} of {resource_type}");

        let message = format!("injected failure in {operation:?} of {resource_type}");
        Err(match fault {
            Fault::Transient => ProviderError::transient(message),
            Fault::Throttled(delay) => ProviderError::throttled(message, delay),
            Fault::Permanent => ProviderError::permanent(message),
        })
    }

    fn outputs(physical_id: &str, attributes: &Attributes) -> Attributes {
        let mut outputs = attributes.clone();
        outputs.insert(ID_ATTRIBUTE.to_string(), Value::from(physical_id));
        outputs
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn schema(&self, resource_type: &str) -> ResourceSchema {
        self.schemas.get(resource_type).cloned().unwrap_or_default()
    }

    async fn create(&self, resource_type: &str, attributes: &Attributes) -> ProviderResult<String> {
        let mut inner = self.inner.lock().await;
        Self::check_fault(&mut inner, ProviderOperation::Create, resource_type, None)?;

        inner.next_id += 1;
        let kind = resource_type
            .split_once('.')
            .map_or(resource_type, |(_, kind)| kind);
        let physical_id = format!("{kind}-{:04}", inner.next_id);

        inner.resources.insert(
            physical_id.clone(),
            StoredResource {
                resource_type: resource_type.to_string(),
                attributes: attributes.clone(),
            },
        );
        Self::record(&mut inner, ProviderOperation::Create, resource_type, Some(&physical_id), true);
        Ok(physical_id)
    }

    async fn read(&self, resource_type: &str, physical_id: &str) -> ProviderResult<Attributes> {
        let mut inner = self.inner.lock().await;
        Self::check_fault(&mut inner, ProviderOperation::Read, resource_type, Some(physical_id))?;

        let found = inner
            .resources
            .get(physical_id)
            .filter(|r| r.resource_type == resource_type)
            .map(|r| Self::outputs(physical_id, &r.attributes));
        Self::record(&mut inner, ProviderOperation::Read, resource_type, Some(physical_id), found.is_some());
        found.ok_or_else(|| ProviderError::not_found(physical_id))
    }

    async fn update(
        &self,
        resource_type: &str,
        physical_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<Attributes> {
        let mut inner = self.inner.lock().await;
        Self::check_fault(&mut inner, ProviderOperation::Update, resource_type, Some(physical_id))?;

        let updated = inner.resources.get_mut(physical_id).map(|r| {
            r.attributes = attributes.clone();
            Self::outputs(physical_id, attributes)
        });
        Self::record(&mut inner, ProviderOperation::Update, resource_type, Some(physical_id), updated.is_some());
        updated.ok_or_else(|| ProviderError::not_found(physical_id))
    }

    async fn delete(&self, resource_type: &str, physical_id: &str) -> ProviderResult<()> {
        let mut inner = self.inner.lock().await;
        Self::check_fault(&mut inner, ProviderOperation::Delete, resource_type, Some(physical_id))?;

        let removed = inner.resources.remove(physical_id).is_some();
        Self::record(&mut inner, ProviderOperation::Delete, resource_type, Some(physical_id), removed);
        if removed {
            Ok(())
        } else {
            Err(ProviderError::not_found(physical_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(cidr: &str) -> Attributes {
        Attributes::from([(String::from("cidr"), Value::from(cidr))])
    }

    #[tokio::test]
    async fn test_crud_cycle() {
        let provider = MemoryProvider::new();

        let id = provider
            .create("network.vpc", &attrs("10.0.0.0/16"))
            .await
            .expect("create");
        assert_eq!(id, "vpc-0001");

        let read = provider.read("network.vpc", &id).await.expect("read");
        assert_eq!(read.get("id"), Some(&Value::from("vpc-0001")));
        assert_eq!(read.get("cidr"), Some(&Value::from("10.0.0.0/16")));

        let updated = provider
            .update("network.vpc", &id, &attrs("10.1.0.0/16"))
            .await
            .expect("update");
        assert_eq!(updated.get("cidr"), Some(&Value::from("10.1.0.0/16")));

        provider.delete("network.vpc", &id).await.expect("delete");
        assert!(!provider.contains(&id).await);
        assert!(matches!(
            provider.delete("network.vpc", &id).await,
            Err(ProviderError::NotFound { .. })
        ));

        assert_eq!(provider.calls(ProviderOperation::Create).await, 1);
        assert_eq!(provider.mutation_count().await, 4);
    }

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let provider = MemoryProvider::new();
        provider
            .inject(ProviderOperation::Create, "network.vpc", Fault::Transient)
            .await;
        provider
            .inject(ProviderOperation::Create, "network.vpc", Fault::Permanent)
            .await;

        let first = provider.create("network.vpc", &attrs("a")).await;
        assert!(first.expect_err("transient").is_retryable());

        let second = provider.create("network.vpc", &attrs("a")).await;
        assert!(!second.expect_err("permanent").is_retryable());

        // other types are unaffected, and the queue is now empty
        provider.create("network.subnet", &attrs("b")).await.expect("subnet");
        provider.create("network.vpc", &attrs("a")).await.expect("vpc");

        let log = provider.call_log().await;
        assert_eq!(log.len(), 4);
        assert!(!log[0].succeeded && !log[1].succeeded);
    }

    #[tokio::test]
    async fn test_schema_and_tampering() {
        let provider = MemoryProvider::new()
            .with_schema("network.vpc", ResourceSchema::with_immutable(["cidr"]));
        assert!(provider.schema("network.vpc").is_immutable("cidr"));
        assert!(provider.schema("network.subnet").immutable.is_empty());

        let id = provider.create("network.vpc", &attrs("a")).await.expect("create");
        assert!(provider.tamper(&id, "cidr", Value::from("b")).await);
        assert_eq!(
            provider.attributes(&id).await.and_then(|a| a.get("cidr").cloned()),
            Some(Value::from("b"))
        );
        assert!(provider.forget(&id).await);
        assert_eq!(provider.resource_count().await, 0);
    }
}
