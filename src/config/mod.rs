//! Configuration module for podlease.
//!
//! This module handles all configuration-related functionality:
//! - Loading `.env` files and the process environment
//! - Validation of configuration values
//! - Writing a `.env` template for `podlease init`

mod parser;
mod settings;
mod template;
mod validator;

pub use parser::{ConfigParser, DEFAULT_ENV_FILE};
pub use settings::{ConfigOverrides, ProvisionTimeoutPolicy, Settings};
pub use template::EnvTemplate;
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
