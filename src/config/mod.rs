//! Specification module for the groundwork engine.
//!
//! This module handles the declarative input document:
//! - Parsing and deserializing `groundwork.yaml`
//! - Validation of structural settings
//! - Computing specification hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::SpecHasher;
pub use parser::{find_spec_file, SpecParser, DEFAULT_SPEC_FILES};
pub use spec::{
    ExecutionConfig, FailurePolicy, ProjectConfig, ResourceDeclaration, RetryConfig,
    SandboxConfig, SchemaConfig, SpecDocument, StateBackend, StateConfig,
};
pub use self::validator::{SpecValidator, ValidationError, ValidationResult};
