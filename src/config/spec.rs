//! Specification document types.
//!
//! This module defines the structs that map to the `groundwork.yaml` file:
//! project identity, state backend, execution settings, feature toggles,
//! resource type schemas and the resource declaration tree.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use ::validator::Validate;

use crate::graph::Attributes;

/// The root structure of a specification document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecDocument {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Executor settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Local sandbox provider settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Feature toggles gating optional declarations.
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
    /// Per resource type schema overrides.
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaConfig>,
    /// Resource declarations by logical id.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceDeclaration>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct ExecutionConfig {
    /// Maximum concurrent provider operations within a batch.
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, max = 256))]
    pub concurrency: usize,
    /// What to do when a resource operation fails.
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Retry policy for transient provider errors.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
}

/// Behavior after a failed resource operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop scheduling further batches; keep applied changes.
    #[default]
    Halt,
    /// Restore the previous state of every resource in the failing batch.
    Rollback,
}

/// Retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct RetryConfig {
    /// Total attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    #[validate(range(min = 1))]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,
}

/// Local sandbox provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Directory holding sandbox resources.
    #[serde(default)]
    pub path: Option<String>,
}

/// Schema override for one resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaConfig {
    /// Attributes that force replacement when changed.
    #[serde(default)]
    pub immutable: BTreeSet<String>,
}

/// A declared resource, possibly with nested children.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDeclaration {
    /// Resource type, e.g. `network.vpc`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Desired attributes.
    #[serde(default)]
    pub properties: Attributes,
    /// Explicit dependencies by logical id.
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    /// Nested declarations.
    #[serde(default)]
    pub children: BTreeMap<String, ResourceDeclaration>,
    /// Feature that must be enabled for this declaration to exist.
    #[serde(default)]
    pub feature: Option<String>,
}

impl SpecDocument {
    /// Creates an empty document for a project.
    #[must_use]
    pub fn new(name: &str, environment: &str) -> Self {
        Self {
            project: ProjectConfig {
                name: name.to_string(),
                environment: environment.to_string(),
            },
            state: StateConfig::default(),
            execution: ExecutionConfig::default(),
            sandbox: SandboxConfig::default(),
            features: BTreeMap::new(),
            schemas: BTreeMap::new(),
            resources: BTreeMap::new(),
        }
    }

    /// Counts declarations including nested children.
    #[must_use]
    pub fn declaration_count(&self) -> usize {
        fn count(decls: &BTreeMap<String, ResourceDeclaration>) -> usize {
            decls.values().map(|d| 1 + count(&d.children)).sum()
        }
        count(&self.resources)
    }
}

impl ResourceDeclaration {
    /// Creates a declaration of the given type.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties: Attributes::new(),
            depends_on: Vec::new(),
            children: BTreeMap::new(),
            feature: None,
        }
    }
}

impl RetryConfig {
    /// Delay before the first retry.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Maximum delay between attempts.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            on_failure: FailurePolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Halt => write!(f, "halt"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "halt" => Ok(Self::Halt),
            "rollback" => Ok(Self::Rollback),
            other => Err(format!("unknown failure policy '{other}'")),
        }
    }
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_multiplier() -> f64 {
    2.0
}
