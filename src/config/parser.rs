//! Specification parser for loading documents from disk.
//!
//! This module handles loading the specification from YAML files and
//! environment variables, with proper precedence and error handling.

use crate::error::{GroundworkError, Result, SpecificationError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{SpecDocument, StateBackend};

/// Parser for specification documents.
#[derive(Debug, Default)]
pub struct SpecParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl SpecParser {
    /// Creates a new specification parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a specification from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<SpecDocument> {
        let path = path.as_ref();
        info!("Loading specification from: {}", path.display());

        if !path.exists() {
            return Err(GroundworkError::Specification(SpecificationError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            GroundworkError::Specification(SpecificationError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a specification from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<SpecDocument> {
        debug!("Parsing YAML specification");

        let document: SpecDocument = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            GroundworkError::Specification(SpecificationError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed specification for project {} ({} declarations)",
            document.project.name,
            document.declaration_count()
        );
        Ok(document)
    }

    /// Loads a specification with environment variable overrides.
    ///
    /// Variables use the `GROUNDWORK_` prefix (e.g. `GROUNDWORK_ENVIRONMENT`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// is malformed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<SpecDocument> {
        let mut document = self.load_file(path)?;
        Self::apply_env_overrides(&mut document)?;
        Ok(document)
    }

    /// Applies environment variable overrides to the document.
    ///
    /// # Errors
    ///
    /// Returns an error if `GROUNDWORK_CONCURRENCY` is not a number.
    pub fn apply_env_overrides(document: &mut SpecDocument) -> Result<()> {
        if let Ok(name) = std::env::var("GROUNDWORK_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            document.project.name = name;
        }

        if let Ok(env) = std::env::var("GROUNDWORK_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            document.project.environment = env;
        }

        if let Ok(path) = std::env::var("GROUNDWORK_STATE_PATH") {
            debug!("Overriding state.path from environment");
            document.state.path = Some(path);
        }

        if let Ok(bucket) = std::env::var("GROUNDWORK_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            document.state.backend = StateBackend::S3;
            document.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("GROUNDWORK_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            document.state.prefix = Some(prefix);
        }

        if let Ok(concurrency) = std::env::var("GROUNDWORK_CONCURRENCY") {
            debug!("Overriding execution.concurrency from environment");
            document.execution.concurrency = concurrency.parse().map_err(|_| {
                GroundworkError::Specification(SpecificationError::InvalidEnvVar {
                    name: String::from("GROUNDWORK_CONCURRENCY"),
                })
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                GroundworkError::Specification(SpecificationError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default specification file names to search for.
pub const DEFAULT_SPEC_FILES: &[&str] = &[
    "groundwork.yaml",
    "groundwork.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the specification file in the start directory or its parents.
///
/// # Errors
///
/// Returns an error if no specification file is found.
pub fn find_spec_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_SPEC_FILES {
            let spec_path = current.join(filename);
            if spec_path.exists() {
                info!("Found specification file: {}", spec_path.display());
                return Ok(spec_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(GroundworkError::Specification(SpecificationError::FileNotFound {
        path: start.join(DEFAULT_SPEC_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailurePolicy;
    use crate::graph::{Reference, Value};

    #[test]
    fn test_parse_minimal_document() {
        let yaml = r"
project:
  name: flask-app
";
        let document = SpecParser::new().parse_yaml(yaml, None).expect("parse");
        assert_eq!(document.project.name, "flask-app");
        assert_eq!(document.project.environment, "dev");
        assert_eq!(document.execution.concurrency, 4);
        assert_eq!(document.execution.on_failure, FailurePolicy::Halt);
        assert!(document.resources.is_empty());
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
project:
  name: flask-app
  environment: beta

state:
  backend: local
  path: .groundwork

execution:
  concurrency: 2
  on_failure: rollback
  retry:
    max_attempts: 5
    initial_delay_ms: 100

features:
  wheels: true
  gunicorn: false

schemas:
  network.vpc:
    immutable: [cidr]

resources:
  vpc:
    type: network.vpc
    properties:
      cidr: 10.0.0.0/16
      max_azs: 2
  sg:
    type: network.security_group
    properties:
      vpc: { $ref: vpc }
      ingress:
        - { port: 80, description: "Allow HTTP traffic" }
        - { port: 5000, description: "Allow Flask app traffic" }
  wheels:
    type: storage.bucket
    feature: wheels
    children:
      deployment:
        type: storage.deployment
        properties:
          prefix: wheels
  asg:
    type: compute.autoscaling_group
    dependsOn: [sg]
    properties:
      instance_type: t2.micro
      min_capacity: 1
"#;
        let document = SpecParser::new().parse_yaml(yaml, None).expect("parse");
        assert_eq!(document.project.environment, "beta");
        assert_eq!(document.execution.on_failure, FailurePolicy::Rollback);
        assert_eq!(document.execution.retry.max_attempts, 5);
        assert_eq!(document.execution.retry.max_delay_ms, 30_000);
        assert_eq!(document.declaration_count(), 5);
        assert!(document.schemas["network.vpc"].immutable.contains("cidr"));
        // `dependsOn` is accepted as an alias
        assert_eq!(document.resources["asg"].depends_on, vec![String::from("sg")]);
        assert_eq!(
            document.resources["sg"].properties["vpc"],
            Value::Ref(Reference::new("vpc"))
        );
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = SpecParser::new()
            .parse_yaml("project: [", Some(Path::new("broken.yaml")))
            .unwrap_err();
        assert!(matches!(
            err,
            GroundworkError::Specification(SpecificationError::ParseError { location: Some(_), .. })
        ));
    }

    #[test]
    fn test_find_spec_file_walks_up() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("groundwork.yaml"), "project: { name: x }")
            .expect("write");
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_spec_file(&nested).expect("found");
        assert_eq!(found, dir.path().join("groundwork.yaml"));
    }
}
