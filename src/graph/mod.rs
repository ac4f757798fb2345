//! Resource graph module.
//!
//! This module turns declarative resource specifications into an acyclic
//! dependency graph of typed resource nodes.

mod builder;
mod dag;
mod node;
mod value;

pub use builder::{GraphBuilder, NESTING_SEPARATOR};
pub use dag::DependencyGraph;
pub use node::ResourceNode;
pub use value::{
    attribute_references, resolve_attributes, Attributes, Reference, Value, ID_ATTRIBUTE,
};
