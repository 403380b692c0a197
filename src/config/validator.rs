//! Configuration validation for project files.
//!
//! Collects every error and warning in one pass so that `validate` can
//! report them together before anything touches state or providers.

use crate::error::{ConfigError, Result, StackweaveError};
use crate::model::{Reference, REPLACED_SEPARATOR};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::parser::parse_value;
use super::spec::{EngineConfig, ProjectConfig, ProjectFile, ProviderConfig, ProviderType, StackConfig, StateBackend, StateConfig};

/// Validator for project files.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Skip checks that read the process environment.
    skip_env_checks: bool,
}

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

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self { skip_env_checks: false }
    }

    /// Disables warnings about unset token variables.
    #[must_use]
    pub const fn without_env_checks(mut self) -> Self {
        self.skip_env_checks = true;
        self
    }

    /// Validates a project file.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &ProjectFile) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(StackweaveError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all findings.
    #[must_use]
    pub fn check(&self, config: &ProjectFile) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        self.validate_providers(&config.providers, &mut result);
        Self::validate_stacks(config, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result.warn("state.bucket is ignored for local backend");
                }
            }
            StateBackend::Memory => {
                result.warn("memory state backend discards all state when the process exits");
            }
        }
    }

    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.parallelism == 0 {
            result.error("engine.parallelism", "Parallelism must be at least 1");
        }
        if engine.max_attempts == 0 {
            result.error("engine.max_attempts", "max_attempts must be at least 1");
        }
        if engine.retry_base_delay_ms > engine.retry_max_delay_ms {
            result.error(
                "engine.retry_base_delay_ms",
                "retry_base_delay_ms cannot exceed retry_max_delay_ms",
            );
        }
    }

    fn validate_providers(&self, providers: &[ProviderConfig], result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, provider) in providers.iter().enumerate() {
            let field = format!("providers[{i}]");

            if provider.name.is_empty() {
                result.error(format!("{field}.name"), "Provider name cannot be empty");
            } else if !seen.insert(provider.name.as_str()) {
                result.error(format!("{field}.name"), format!("Duplicate provider name: {}", provider.name));
            }

            if provider.provider_type == ProviderType::Http {
                match provider.endpoint.as_deref() {
                    None | Some("") => {
                        result.error(format!("{field}.endpoint"), "HTTP providers require an endpoint");
                    }
                    Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                        result.error(
                            format!("{field}.endpoint"),
                            format!("Endpoint '{url}' must start with http:// or https://"),
                        );
                    }
                    Some(_) => {}
                }
                if provider.timeout_secs == 0 {
                    result.error(format!("{field}.timeout_secs"), "Timeout must be at least 1 second");
                }
            }

            for (key, raw) in &provider.settings {
                match parse_value(raw, &BTreeMap::new()) {
                    Err(e) => result.error(format!("{field}.settings.{key}"), e.to_string()),
                    Ok(value) if value.references().iter().any(|r| matches!(r, Reference::Resource { .. })) => {
                        result.error(
                            format!("{field}.settings.{key}"),
                            "Provider settings cannot read resource outputs; use $stack",
                        );
                    }
                    Ok(_) => {}
                }
            }

            if !self.skip_env_checks
                && let Some(var) = &provider.token_env
                && std::env::var(var).is_err()
            {
                result.warn(format!(
                    "Provider '{}' reads its token from {var}, which is not set",
                    provider.name
                ));
            }
        }
    }

    fn validate_stacks(config: &ProjectFile, result: &mut ValidationResult) {
        if config.stacks.is_empty() {
            result.warn("No stacks defined in configuration");
        }

        let providers: HashSet<&str> = config.providers.iter().map(|p| p.name.as_str()).collect();
        let mut seen = HashSet::new();

        for (i, stack) in config.stacks.iter().enumerate() {
            let field = format!("stacks[{i}]");

            if !is_valid_name(&stack.name) {
                result.error(
                    format!("{field}.name"),
                    format!(
                        "Stack name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        stack.name
                    ),
                );
            } else if !seen.insert(stack.name.as_str()) {
                result.error(format!("{field}.name"), format!("Duplicate stack name: {}", stack.name));
            }

            Self::validate_resources(stack, &field, &providers, result);
        }
    }

    fn validate_resources(stack: &StackConfig, field: &str, providers: &HashSet<&str>, result: &mut ValidationResult) {
        if stack.resources.is_empty() && stack.outputs.is_empty() {
            result.warn(format!("Stack '{}' declares no resources or outputs", stack.name));
        }

        for (j, resource) in stack.resources.iter().enumerate() {
            let field = format!("{field}.resources[{j}]");

            if resource.id.is_empty() {
                result.error(format!("{field}.id"), "Resource id cannot be empty");
            } else if resource.id.contains(REPLACED_SEPARATOR) {
                result.error(
                    format!("{field}.id"),
                    format!("Resource id '{}' must not contain '{REPLACED_SEPARATOR}'", resource.id),
                );
            }
            if resource.kind.is_empty() {
                result.error(format!("{field}.kind"), "Resource kind cannot be empty");
                continue;
            }

            let provider = resource.provider_id();
            if !providers.contains(provider.as_str()) {
                result.error(
                    format!("{field}.provider"),
                    format!(
                        "Resource '{}' uses provider '{provider}', which is not configured",
                        resource.id
                    ),
                );
            }

            if resource.depends_on.iter().any(|d| d == &resource.id) {
                result.error(
                    format!("{field}.depends_on"),
                    format!("Resource '{}' cannot depend on itself", resource.id),
                );
            }
        }
    }
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

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
