//! Configuration module.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stackweave.yaml`
//! - Environment overrides and `.env` loading
//! - Validation of configuration values
//! - Converting declared stacks into the resource model
//! - Hashing resolved inputs for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::InputsHasher;
pub use parser::{build_stacks, find_config_file, parse_value, ConfigParser, DEFAULT_CONFIG_FILES, ENV_PREFIX};
pub use spec::{
    EngineConfig, ProjectConfig, ProjectFile, ProviderConfig, ProviderType, ResourceConfig, StackConfig, StateBackend,
    StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
