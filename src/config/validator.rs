//! Configuration validation for run settings.
//!
//! Every value is checked before orchestration begins, so a bad setting is
//! a startup error rather than a failure halfway through a billed run.

use crate::error::{ConfigError, PodleaseError, Result};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use super::settings::{Settings, DEFAULT_SSH_PASSWORD, MIN_CONTAINER_DISK_GB};

/// Prefix every `RunPod` API key carries.
const API_KEY_PREFIX: &str = "rpa_";

/// Validator for run settings.
#[derive(Debug, Default)]
pub struct ConfigValidator;

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
    /// The variable that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates run settings.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self, settings: &Settings) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_credentials(settings, &mut result);
        Self::validate_selection(settings, &mut result);
        Self::validate_pod(settings, &mut result);
        Self::validate_tunnels(settings, &mut result);
        Self::validate_timing(settings, &mut result);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(PodleaseError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    fn validate_credentials(settings: &Settings, result: &mut ValidationResult) {
        if !settings.api_key.starts_with(API_KEY_PREFIX) {
            result.error(
                "RUNPOD_API_KEY",
                format!("RUNPOD_API_KEY should start with '{API_KEY_PREFIX}'. Check your API key."),
            );
        }

        if settings.ssh_password.is_empty() {
            result.error("SSH_PASSWORD", "SSH password cannot be empty");
        } else if settings.ssh_password == DEFAULT_SSH_PASSWORD {
            result.warnings.push(String::from(
                "SSH_PASSWORD is publicly known; anyone who can reach the pod can log in",
            ));
        }

        if let Some(path) = &settings.ssh_key_path
            && !path.is_file() {
                result.error(
                    "SSH_KEY_PATH",
                    format!("SSH key not found: {}", path.display()),
                );
            }
    }

    fn validate_selection(settings: &Settings, result: &mut ValidationResult) {
        if settings.min_vram_gb < 1 {
            result.error("MIN_VRAM_GB", "MIN_VRAM_GB must be at least 1.");
        }

        if !(settings.max_cost_per_hour.is_finite() && settings.max_cost_per_hour > 0.0) {
            result.error("MAX_COST_PER_HOUR", "MAX_COST_PER_HOUR must be greater than 0.");
        }

        if !(settings.spot_max_cost_per_hour.is_finite() && settings.spot_max_cost_per_hour > 0.0) {
            result.error(
                "SPOT_MAX_COST_PER_HOUR",
                "SPOT_MAX_COST_PER_HOUR must be greater than 0.",
            );
        } else if settings.spot_max_cost_per_hour > settings.max_cost_per_hour {
            result.warnings.push(format!(
                "SPOT_MAX_COST_PER_HOUR (${:.2}) exceeds MAX_COST_PER_HOUR (${:.2}); spot runs use the lower value",
                settings.spot_max_cost_per_hour, settings.max_cost_per_hour
            ));
        }
    }

    fn validate_pod(settings: &Settings, result: &mut ValidationResult) {
        if settings.docker_image.trim().is_empty() {
            result.error("DOCKER_IMAGE", "DOCKER_IMAGE cannot be empty");
        }

        if settings.container_disk_gb < MIN_CONTAINER_DISK_GB {
            result.error(
                "CONTAINER_DISK_GB",
                format!("CONTAINER_DISK_GB must be at least {MIN_CONTAINER_DISK_GB} GB."),
            );
        }

        if !is_valid_name(&settings.pod_name_prefix) {
            result.error(
                "POD_NAME_PREFIX",
                format!(
                    "Pod name prefix '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    settings.pod_name_prefix
                ),
            );
        }
    }

    fn validate_tunnels(settings: &Settings, result: &mut ValidationResult) {
        if settings.tunnels.is_empty() {
            result.error("TUNNEL_PORTS", "At least one tunnel is required");
            return;
        }

        let mut seen = HashSet::new();
        for tunnel in &settings.tunnels {
            if !seen.insert(tunnel.local_port) {
                result.error(
                    "TUNNEL_PORTS",
                    format!("Local port {} is used by more than one tunnel", tunnel.local_port),
                );
            }
        }

        if !settings.tunnels.iter().any(|t| t.remote_port == 22) {
            debug!("No tunnel forwards the pod's SSH port");
        }
    }

    fn validate_timing(settings: &Settings, result: &mut ValidationResult) {
        let poll = settings.poll;
        if poll.interval < Duration::from_secs(1) {
            result.error("POLL_INTERVAL_SECS", "POLL_INTERVAL_SECS must be at least 1");
        }
        if poll.timeout < poll.interval {
            result.error(
                "POLL_TIMEOUT_SECS",
                "POLL_TIMEOUT_SECS must not be shorter than POLL_INTERVAL_SECS",
            );
        }

        let retry = settings.retry;
        if retry.max_attempts < 1 {
            result.error("RETRY_MAX_ATTEMPTS", "RETRY_MAX_ATTEMPTS must be at least 1");
        }
        if !(retry.factor.is_finite() && retry.factor >= 1.0) {
            result.error("RETRY_FACTOR", "RETRY_FACTOR must be at least 1");
        }
        if retry.max_delay < retry.base_delay {
            result.warnings.push(String::from(
                "RETRY_MAX_DELAY_MS is below RETRY_BASE_MS; every retry waits RETRY_MAX_DELAY_MS",
            ));
        }

        if settings.tunnel.startup_timeout < Duration::from_secs(1) {
            result.error(
                "TUNNEL_STARTUP_TIMEOUT_SECS",
                "TUNNEL_STARTUP_TIMEOUT_SECS must be at least 1",
            );
        } else if settings.tunnel.startup_timeout <= settings.tunnel.settle {
            result.warnings.push(format!(
                "TUNNEL_STARTUP_TIMEOUT_SECS is shorter than the {}s settle window of a single tunnel",
                settings.tunnel.settle.as_secs()
            ));
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
