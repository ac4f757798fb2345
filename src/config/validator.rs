//! Specification validation.
//!
//! Structural checks that do not need the dependency graph: project identity,
//! state backend settings, execution limits, feature and schema usage.
//! Reference resolution and cycle detection belong to the graph builder.

use crate::error::{GroundworkError, Result, SpecificationError};
use ::validator::Validate;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::spec::{ExecutionConfig, ResourceDeclaration, SpecDocument, StateBackend, StateConfig};

/// Validator for specification documents.
#[derive(Debug, Default)]
pub struct SpecValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl SpecValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a specification document.
    ///
    /// # Errors
    ///
    /// Returns the first error found if validation fails.
    pub fn validate(&self, document: &SpecDocument) -> Result<ValidationResult> {
        let result = self.check(document);

        if result.errors.is_empty() {
            debug!("Specification validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(GroundworkError::Specification(SpecificationError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all findings without failing.
    #[must_use]
    pub fn check(&self, document: &SpecDocument) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(document, &mut result);
        Self::validate_state(&document.state, &mut result);
        Self::validate_execution(&document.execution, &mut result);
        Self::validate_schemas(document, &mut result);
        Self::validate_resources(document, &mut result);

        result
    }

    /// Validates project identity.
    fn validate_project(document: &SpecDocument, result: &mut ValidationResult) {
        let project = &document.project;

        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        // The environment names a state document, so it must be path safe
        if !is_valid_name(&project.environment) {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: format!(
                    "Environment '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.environment
                ),
            });
        }
    }

    /// Validates state backend configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    /// Validates executor limits.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if let Err(errors) = execution.validate() {
            for (field, _) in errors.errors() {
                result.errors.push(ValidationError {
                    field: format!("execution.{field}"),
                    message: format!("Invalid execution setting: {field}"),
                });
            }
        }

        let retry = &execution.retry;
        if retry.initial_delay_ms > retry.max_delay_ms {
            result.errors.push(ValidationError {
                field: String::from("execution.retry.initial_delay_ms"),
                message: String::from("Initial retry delay cannot exceed max_delay_ms"),
            });
        }

        if execution.concurrency > 64 {
            result.warnings.push(format!(
                "execution.concurrency: {} concurrent operations may trip provider rate limits",
                execution.concurrency
            ));
        }
    }

    /// Validates schema overrides.
    fn validate_schemas(document: &SpecDocument, result: &mut ValidationResult) {
        for resource_type in document.schemas.keys() {
            if !is_valid_type(resource_type) {
                result.errors.push(ValidationError {
                    field: format!("schemas.{resource_type}"),
                    message: format!(
                        "Schema key '{resource_type}' is not a resource type (expected family.kind)"
                    ),
                });
            }
        }
    }

    /// Validates the declaration tree.
    fn validate_resources(document: &SpecDocument, result: &mut ValidationResult) {
        if document.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources declared; apply would destroy everything"));
            return;
        }

        let mut used_features = BTreeSet::new();
        Self::validate_declarations(
            &document.resources,
            "resources",
            &document.features,
            &mut used_features,
            result,
        );

        for feature in document.features.keys() {
            if !used_features.contains(feature.as_str()) {
                result
                    .warnings
                    .push(format!("features.{feature}: Feature is not used by any resource"));
            }
        }
    }

    /// Validates declarations recursively.
    fn validate_declarations<'a>(
        declarations: &'a BTreeMap<String, ResourceDeclaration>,
        prefix: &str,
        features: &BTreeMap<String, bool>,
        used_features: &mut BTreeSet<&'a str>,
        result: &mut ValidationResult,
    ) {
        for (name, declaration) in declarations {
            let field = format!("{prefix}.{name}");

            if !is_valid_type(&declaration.resource_type) {
                result.errors.push(ValidationError {
                    field: format!("{field}.type"),
                    message: format!(
                        "Resource type '{}' is invalid (expected family.kind)",
                        declaration.resource_type
                    ),
                });
            }

            if declaration.depends_on.iter().any(|d| d == name) && prefix == "resources" {
                result.errors.push(ValidationError {
                    field: format!("{field}.depends_on"),
                    message: format!("Resource '{name}' depends on itself"),
                });
            }

            let mut seen = BTreeSet::new();
            for dep in &declaration.depends_on {
                if !seen.insert(dep) {
                    result
                        .warnings
                        .push(format!("{field}.depends_on: Duplicate dependency '{dep}'"));
                }
            }

            if let Some(feature) = &declaration.feature {
                if features.contains_key(feature) {
                    used_features.insert(feature.as_str());
                } else {
                    result.errors.push(ValidationError {
                        field: format!("{field}.feature"),
                        message: format!("Feature '{feature}' is not declared under features"),
                    });
                }
            }

            Self::validate_declarations(
                &declaration.children,
                &format!("{field}.children"),
                features,
                used_features,
                result,
            );
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Validates a `family.kind` resource type.
fn is_valid_type(resource_type: &str) -> bool {
    resource_type.split_once('.').is_some_and(|(family, kind)| {
        !family.is_empty()
            && !kind.is_empty()
            && resource_type
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    })
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpecParser;

    fn parse(yaml: &str) -> SpecDocument {
        SpecParser::new().parse_yaml(yaml, None).expect("parse")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("flask-app"));
        assert!(is_valid_name("beta"));
        assert!(is_valid_name("a1"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Flask")); // uppercase
        assert!(!is_valid_name("1app")); // starts with number
        assert!(!is_valid_name("flask_app")); // underscore
        assert!(!is_valid_name("app-")); // ends with hyphen
        assert!(!is_valid_name("flask--app")); // consecutive hyphens
    }

    #[test]
    fn test_resource_types() {
        assert!(is_valid_type("network.vpc"));
        assert!(is_valid_type("compute.autoscaling_group"));
        assert!(!is_valid_type("vpc"));
        assert!(!is_valid_type(".vpc"));
        assert!(!is_valid_type("network. vpc"));
    }

    #[test]
    fn test_valid_document() {
        let document = parse(
            r"
project: { name: flask-app, environment: beta }
features: { wheels: true }
resources:
  vpc: { type: network.vpc }
  wheels: { type: storage.bucket, feature: wheels }
",
        );
        let result = SpecValidator::new().validate(&document).expect("valid");
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_collects_errors() {
        let document = parse(
            r"
project: { name: Flask }
state: { backend: s3 }
execution: { concurrency: 0 }
resources:
  vpc: { type: vpc, depends_on: [vpc], feature: ghost }
",
        );
        let result = SpecValidator::new().check(&document);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"project.name"));
        assert!(fields.contains(&"state.bucket"));
        assert!(fields.contains(&"execution.concurrency"));
        assert!(fields.contains(&"resources.vpc.type"));
        assert!(fields.contains(&"resources.vpc.depends_on"));
        assert!(fields.contains(&"resources.vpc.feature"));

        assert!(SpecValidator::new().validate(&document).is_err());
    }

    #[test]
    fn test_unused_feature_warns() {
        let document = parse(
            r"
project: { name: app }
features: { gunicorn: false }
resources:
  vpc: { type: network.vpc }
",
        );
        let result = SpecValidator::new().check(&document);
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
    }
}
