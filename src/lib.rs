// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![warn(unused_imports)]
#![warn(unused_variables)]
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::too_many_arguments)]
#![warn(clippy::cognitive_complexity)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # groundwork
//!
//! A declarative resource-reconciliation engine.
//!
//! ## Overview
//!
//! A specification declares typed resources and the references between them.
//! groundwork turns it into a dependency graph, compares that graph with the
//! last applied state, and derives a parallel execution plan that providers
//! carry out:
//!
//! 1. **Graph**: declarations become an acyclic graph of resource nodes
//! 2. **Diff**: each node is classified as create, update, replace, delete or no-op
//! 3. **Plan**: changes are batched so that every batch is independent
//! 4. **Apply**: batches run in order, steps within a batch run concurrently
//!
//! ## Modules
//!
//! - [`config`]: Specification document parsing and validation
//! - [`graph`]: Resource graph builder and symbolic references
//! - [`state`]: State documents and storage backends (local, S3)
//! - [`provider`]: Provider plugin interface and built-in providers
//! - [`planner`]: Diff engine, scheduler and executor
//! - [`engine`]: Environment-scoped plan, apply, destroy and drift operations
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!   environment: dev
//!
//! schemas:
//!   network.vpc:
//!     immutable: [cidr]
//!
//! resources:
//!   Net:
//!     type: network.vpc
//!     properties:
//!       cidr: 10.0.0.0/16
//!   Server:
//!     type: compute.instance
//!     properties:
//!       subnet: { $ref: Net }
//!       size: small
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{SpecDocument, SpecHasher, SpecParser, SpecValidator};
pub use engine::{DriftReport, Engine};
pub use error::{GroundworkError, Result};
pub use graph::{DependencyGraph, GraphBuilder};
pub use planner::{ApplyResult, ExecutionPlan, Executor};
pub use provider::{Provider, ProviderRegistry};
pub use state::{LocalStateStore, S3StateStore, StateDocument, StateStore};
