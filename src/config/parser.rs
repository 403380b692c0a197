//! Configuration parser for loading project files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, and turns declared stacks into the resource model.

use crate::error::{ConfigError, Result, StackweaveError};
use crate::model::{Inputs, Resource, Stack, Value};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{ProjectFile, StackConfig, StateBackend};

/// Prefix of environment variables overriding configuration values.
pub const ENV_PREFIX: &str = "STACKWEAVE_";

/// Configuration parser for loading project files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
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

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ProjectFile> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(StackweaveError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackweaveError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ProjectFile> {
        debug!("Parsing YAML configuration");

        let config: ProjectFile = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StackweaveError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Successfully parsed configuration for project: {}", config.project.name);
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `STACKWEAVE_<SECTION>_<KEY>` (e.g., `STACKWEAVE_PROJECT_ENVIRONMENT`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<ProjectFile> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies environment overrides using `lookup` to read variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be parsed.
    pub fn apply_env_overrides<F>(config: &mut ProjectFile, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            let name = format!("{ENV_PREFIX}{key}");
            lookup(&name).inspect(|_| debug!("Overriding configuration from {name}"))
        };

        if let Some(name) = var("PROJECT_NAME") {
            config.project.name = name;
        }
        if let Some(env) = var("PROJECT_ENVIRONMENT") {
            config.project.environment = env;
        }

        if let Some(backend) = var("STATE_BACKEND") {
            config.state.backend = match backend.to_ascii_lowercase().as_str() {
                "local" => StateBackend::Local,
                "s3" => StateBackend::S3,
                "memory" => StateBackend::Memory,
                other => return Err(invalid_override("STATE_BACKEND", other)),
            };
        }
        if let Some(bucket) = var("STATE_BUCKET") {
            config.state.bucket = Some(bucket);
        }
        if let Some(prefix) = var("STATE_PREFIX") {
            config.state.prefix = Some(prefix);
        }
        if let Some(region) = var("STATE_REGION") {
            config.state.region = Some(region);
        }
        if let Some(path) = var("STATE_PATH") {
            config.state.path = Some(path);
        }

        if let Some(value) = var("ENGINE_PARALLELISM") {
            config.engine.parallelism = value
                .parse()
                .map_err(|_| invalid_override("ENGINE_PARALLELISM", &value))?;
        }
        if let Some(value) = var("ENGINE_MAX_ATTEMPTS") {
            config.engine.max_attempts = value
                .parse()
                .map_err(|_| invalid_override("ENGINE_MAX_ATTEMPTS", &value))?;
        }
        if let Some(value) = var("ENGINE_OUTPUT_WAIT_SECS") {
            config.engine.output_wait_secs = value
                .parse()
                .map_err(|_| invalid_override("ENGINE_OUTPUT_WAIT_SECS", &value))?;
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
                StackweaveError::Config(ConfigError::ParseError {
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

fn invalid_override(key: &str, value: &str) -> StackweaveError {
    StackweaveError::Config(ConfigError::ParseError {
        message: format!("Invalid value '{value}'"),
        location: Some(format!("{ENV_PREFIX}{key}")),
    })
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stackweave.yaml", "stackweave.yml"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackweaveError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

/// Converts declared stacks into the resource model.
///
/// # Errors
///
/// Returns an error for malformed value references or duplicate resource ids.
pub fn build_stacks(file: &ProjectFile) -> Result<Vec<Stack>> {
    file.stacks
        .iter()
        .map(|config| build_stack(file, config))
        .collect()
}

fn build_stack(file: &ProjectFile, config: &StackConfig) -> Result<Stack> {
    let placeholders = BTreeMap::from([
        ("project", file.project.name.as_str()),
        ("environment", file.project.environment.as_str()),
        ("stack", config.name.as_str()),
    ]);

    let mut stack = Stack::new(&config.name);
    for resource in &config.resources {
        let inputs: Inputs = resource
            .inputs
            .iter()
            .map(|(key, raw)| Ok((key.clone(), parse_value(raw, &placeholders)?)))
            .collect::<Result<_>>()?;

        let mut declared = Resource::new(
            resource.kind.as_str(),
            resource.id.as_str(),
            inputs,
            resource.depends_on.iter().map(String::as_str),
        );
        if let Some(provider) = &resource.provider {
            declared = declared.with_provider(provider.as_str());
        }
        stack.add(declared)?;
    }

    for (key, raw) in &config.outputs {
        stack.export(key.as_str(), parse_value(raw, &placeholders)?);
    }

    debug!("Built stack {} with {} resource(s)", stack.name(), stack.len());
    Ok(stack)
}

/// Parses the YAML encoding of a [`Value`].
///
/// `{ $ref: "resource.key" }`, `{ $stack: "stack.key" }` and
/// `{ $concat: [...] }` become placeholders; strings have `${...}`
/// placeholders substituted.
///
/// # Errors
///
/// Returns an error for malformed references or unknown `$` directives.
pub fn parse_value(raw: &JsonValue, placeholders: &BTreeMap<&str, &str>) -> Result<Value> {
    match raw {
        JsonValue::Object(map) if map.len() == 1 && map.keys().all(|k| k.starts_with('$')) => {
            let (directive, body) = map.iter().next().ok_or_else(|| StackweaveError::internal("empty directive"))?;
            match directive.as_str() {
                "$ref" => {
                    let (resource, key) = split_reference(directive, body)?;
                    Ok(Value::deferred(resource, key))
                }
                "$stack" => {
                    let (stack, key) = split_reference(directive, body)?;
                    Ok(Value::stack_output(stack, key))
                }
                "$concat" => {
                    let parts = body.as_array().ok_or_else(|| invalid_reference(directive, body, "expected a list"))?;
                    let parts = parts
                        .iter()
                        .map(|part| parse_value(part, placeholders))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Value::Concat(parts))
                }
                _ => Err(invalid_reference(directive, body, "unknown directive")),
            }
        }
        JsonValue::Object(map) => {
            let entries = map
                .iter()
                .map(|(k, v)| Ok((k.clone(), parse_value(v, placeholders)?)))
                .collect::<Result<BTreeMap<_, _>>>()?;
            if entries.values().all(|v| matches!(v, Value::Literal(_))) {
                Ok(Value::Literal(JsonValue::Object(
                    entries.into_iter().filter_map(|(k, v)| literal(v).map(|v| (k, v))).collect(),
                )))
            } else {
                Ok(Value::Map(entries))
            }
        }
        JsonValue::Array(items) => {
            let items = items
                .iter()
                .map(|item| parse_value(item, placeholders))
                .collect::<Result<Vec<_>>>()?;
            if items.iter().all(|v| matches!(v, Value::Literal(_))) {
                Ok(Value::Literal(JsonValue::Array(items.into_iter().filter_map(literal).collect())))
            } else {
                Ok(Value::List(items))
            }
        }
        JsonValue::String(s) => Ok(Value::Literal(JsonValue::String(substitute(s, placeholders)))),
        other => Ok(Value::Literal(other.clone())),
    }
}

fn literal(value: Value) -> Option<JsonValue> {
    match value {
        Value::Literal(v) => Some(v),
        _ => None,
    }
}

fn split_reference<'a>(directive: &str, body: &'a JsonValue) -> Result<(&'a str, &'a str)> {
    let text = body
        .as_str()
        .ok_or_else(|| invalid_reference(directive, body, "expected a string"))?;
    match text.rsplit_once('.') {
        Some((source, key)) if !source.is_empty() && !key.is_empty() => Ok((source, key)),
        _ => Err(invalid_reference(directive, body, "expected '<source>.<key>'")),
    }
}

fn invalid_reference(directive: &str, body: &JsonValue, reason: &str) -> StackweaveError {
    StackweaveError::Config(ConfigError::InvalidReference {
        reference: format!("{directive}: {body}"),
        reason: reason.to_string(),
    })
}

fn substitute(text: &str, placeholders: &BTreeMap<&str, &str>) -> String {
    if !text.contains("${") {
        return text.to_string();
    }
    placeholders
        .iter()
        .fold(text.to_string(), |acc, (name, value)| acc.replace(&format!("${{{name}}}"), value))
}
