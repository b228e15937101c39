//! Configuration loading from the environment and `.env` files.
//!
//! Sources, lowest precedence first: built-in defaults, the process
//! environment, the `.env` file, then command line overrides. Empty values
//! count as unset.

use crate::error::{ConfigError, PodleaseError, Result};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::settings::{ConfigOverrides, Settings};
use super::validator::ConfigValidator;
use crate::tunnel::TunnelSpec;

/// Default `.env` location, relative to the working directory.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// `RunPod` API key.
pub const ENV_API_KEY: &str = "RUNPOD_API_KEY";
/// SSH password.
pub const ENV_SSH_PASSWORD: &str = "SSH_PASSWORD";
/// Private key path.
pub const ENV_SSH_KEY_PATH: &str = "SSH_KEY_PATH";
/// Minimum VRAM.
pub const ENV_MIN_VRAM_GB: &str = "MIN_VRAM_GB";
/// On-demand cost ceiling.
pub const ENV_MAX_COST_PER_HOUR: &str = "MAX_COST_PER_HOUR";
/// Interruptible cost ceiling.
pub const ENV_SPOT_MAX_COST_PER_HOUR: &str = "SPOT_MAX_COST_PER_HOUR";
/// Image.
pub const ENV_DOCKER_IMAGE: &str = "DOCKER_IMAGE";
/// Container disk.
pub const ENV_CONTAINER_DISK_GB: &str = "CONTAINER_DISK_GB";
/// Forward list.
pub const ENV_TUNNEL_PORTS: &str = "TUNNEL_PORTS";
/// Pod name prefix.
pub const ENV_POD_NAME_PREFIX: &str = "POD_NAME_PREFIX";
/// Poll interval.
pub const ENV_POLL_INTERVAL_SECS: &str = "POLL_INTERVAL_SECS";
/// Poll ceiling.
pub const ENV_POLL_TIMEOUT_SECS: &str = "POLL_TIMEOUT_SECS";
/// Retry attempts.
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "RETRY_MAX_ATTEMPTS";
/// First retry delay.
pub const ENV_RETRY_BASE_MS: &str = "RETRY_BASE_MS";
/// Retry growth factor.
pub const ENV_RETRY_FACTOR: &str = "RETRY_FACTOR";
/// Retry delay cap.
pub const ENV_RETRY_MAX_DELAY_MS: &str = "RETRY_MAX_DELAY_MS";
/// Tunnel startup ceiling.
pub const ENV_TUNNEL_STARTUP_TIMEOUT_SECS: &str = "TUNNEL_STARTUP_TIMEOUT_SECS";
/// Provisioning timeout policy.
pub const ENV_ON_PROVISION_TIMEOUT: &str = "ON_PROVISION_TIMEOUT";
/// REST API base URL.
pub const ENV_REST_URL: &str = "RUNPOD_REST_URL";
/// GraphQL API URL.
pub const ENV_GRAPHQL_URL: &str = "RUNPOD_GRAPHQL_URL";

/// Configuration parser for loading run settings.
#[derive(Debug)]
pub struct ConfigParser {
    /// `.env` file to read.
    env_file: PathBuf,
    /// Whether the file was named explicitly and must exist.
    explicit: bool,
}

impl Default for ConfigParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigParser {
    /// Creates a parser reading `./.env` when present.
    #[must_use]
    pub fn new() -> Self {
        Self {
            env_file: PathBuf::from(DEFAULT_ENV_FILE),
            explicit: false,
        }
    }

    /// Reads the given file instead; it must exist.
    #[must_use]
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = path.into();
        self.explicit = true;
        self
    }

    /// Returns the `.env` path in use.
    #[must_use]
    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    /// Loads settings from every source and validates them.
    ///
    /// # Errors
    ///
    /// Returns an error if the `.env` file cannot be read, a value cannot be
    /// parsed, or validation fails.
    pub fn load(&self, overrides: &ConfigOverrides) -> Result<Settings> {
        let mut vars: HashMap<String, String> = std::env::vars().collect();
        vars.extend(self.load_dotenv()?);
        Self::from_vars(&vars, overrides)
    }

    /// Reads the `.env` file into key/value pairs.
    ///
    /// A missing default file yields nothing; a missing explicit file is an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_dotenv(&self) -> Result<Vec<(String, String)>> {
        let path = &self.env_file;

        if !path.exists() {
            if self.explicit {
                return Err(PodleaseError::Config(ConfigError::FileNotFound {
                    path: path.clone(),
                }));
            }
            debug!(".env file not found at: {}", path.display());
            return Ok(Vec::new());
        }

        info!("Loading environment from: {}", path.display());
        let location = path.display().to_string();
        let iter = dotenvy::from_path_iter(path).map_err(|e| {
            ConfigError::parse(format!("Failed to load .env file: {e}"), location.clone())
        })?;

        iter.map(|item| {
            item.map_err(|e| {
                ConfigError::parse(format!("Failed to parse .env file: {e}"), location.clone())
                    .into()
            })
        })
        .collect()
    }

    /// Builds settings from a variable map and validates them.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing, a value cannot
    /// be parsed, or validation fails.
    pub fn from_vars(vars: &HashMap<String, String>, overrides: &ConfigOverrides) -> Result<Settings> {
        let vars = Vars(vars);

        let mut settings = Settings::with_api_key(Self::get_runpod_api_key(vars.0)?);

        if let Some(password) = vars.get(ENV_SSH_PASSWORD) {
            settings.ssh_password = password.to_string();
        }
        settings.ssh_key_path = vars.get(ENV_SSH_KEY_PATH).map(expand_home);
        settings.min_vram_gb = vars.parse(ENV_MIN_VRAM_GB, settings.min_vram_gb)?;
        settings.max_cost_per_hour = vars.parse(ENV_MAX_COST_PER_HOUR, settings.max_cost_per_hour)?;
        settings.spot_max_cost_per_hour =
            vars.parse(ENV_SPOT_MAX_COST_PER_HOUR, settings.spot_max_cost_per_hour)?;
        if let Some(image) = vars.get(ENV_DOCKER_IMAGE) {
            settings.docker_image = image.to_string();
        }
        settings.container_disk_gb = vars.parse(ENV_CONTAINER_DISK_GB, settings.container_disk_gb)?;
        if let Some(list) = vars.get(ENV_TUNNEL_PORTS) {
            settings.tunnels = TunnelSpec::parse_list(list)?;
        }
        if let Some(prefix) = vars.get(ENV_POD_NAME_PREFIX) {
            settings.pod_name_prefix = prefix.to_string();
        }

        settings.poll.interval = vars.secs(ENV_POLL_INTERVAL_SECS, settings.poll.interval)?;
        settings.poll.timeout = vars.secs(ENV_POLL_TIMEOUT_SECS, settings.poll.timeout)?;

        settings.retry.max_attempts = vars.parse(ENV_RETRY_MAX_ATTEMPTS, settings.retry.max_attempts)?;
        settings.retry.base_delay = vars.millis(ENV_RETRY_BASE_MS, settings.retry.base_delay)?;
        settings.retry.factor = vars.parse(ENV_RETRY_FACTOR, settings.retry.factor)?;
        settings.retry.max_delay = vars.millis(ENV_RETRY_MAX_DELAY_MS, settings.retry.max_delay)?;

        settings.tunnel.startup_timeout =
            vars.secs(ENV_TUNNEL_STARTUP_TIMEOUT_SECS, settings.tunnel.startup_timeout)?;
        settings.on_provision_timeout =
            vars.parse(ENV_ON_PROVISION_TIMEOUT, settings.on_provision_timeout)?;

        if let Some(url) = vars.get(ENV_REST_URL) {
            debug!("Overriding REST API URL from environment");
            settings.rest_url = url.to_string();
        }
        if let Some(url) = vars.get(ENV_GRAPHQL_URL) {
            debug!("Overriding GraphQL API URL from environment");
            settings.graphql_url = url.to_string();
        }

        overrides.apply(&mut settings);

        let result = ConfigValidator::new().validate(&settings)?;
        for warning in &result.warnings {
            warn!("{warning}");
        }

        Ok(settings)
    }

    /// Gets the `RunPod` API key from a variable map.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is not set.
    pub fn get_runpod_api_key(vars: &HashMap<String, String>) -> Result<String> {
        Vars(vars)
            .get(ENV_API_KEY)
            .map(String::from)
            .ok_or_else(|| {
                PodleaseError::Config(ConfigError::MissingEnvVar {
                    name: String::from(ENV_API_KEY),
                })
            })
    }
}

/// Typed lookups over the merged variables.
struct Vars<'a>(&'a HashMap<String, String>);

impl Vars<'_> {
    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(name).map_or(Ok(default), |raw| {
            raw.parse().map_err(|e| {
                PodleaseError::Config(ConfigError::parse(format!("invalid value '{raw}': {e}"), name))
            })
        })
    }

    fn secs(&self, name: &str, default: Duration) -> Result<Duration> {
        self.parse(name, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, name: &str, default: Duration) -> Result<Duration> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(name, default).map(Duration::from_millis)
    }
}

/// Expands a leading `~/` to the home directory.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisionTimeoutPolicy;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_with_only_api_key() {
        let settings = ConfigParser::from_vars(&vars(&[(ENV_API_KEY, "rpa_abc")]), &ConfigOverrides::default())
            .expect("defaults are valid");

        assert_eq!(settings.min_vram_gb, 16);
        assert_eq!(settings.container_disk_gb, 50);
        assert_eq!(settings.docker_image, "kajdo/kokoro-fastapi:latest");
        assert_eq!(settings.poll.interval, Duration::from_secs(5));
        assert_eq!(settings.poll.timeout, Duration::from_secs(600));
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.tunnels.len(), 3);
        assert_eq!(settings.on_provision_timeout, ProvisionTimeoutPolicy::Fail);
    }

    #[test]
    fn test_unset_password_differs_between_loads() {
        let load = || {
            ConfigParser::from_vars(&vars(&[(ENV_API_KEY, "rpa_abc")]), &ConfigOverrides::default())
                .expect("valid")
                .ssh_password
        };
        let (first, second) = (load(), load());
        assert_eq!(first.len(), 32);
        assert_eq!(second.len(), 32);
        assert_ne!(first, second);

        let configured = ConfigParser::from_vars(
            &vars(&[(ENV_API_KEY, "rpa_abc"), (ENV_SSH_PASSWORD, "hunter2")]),
            &ConfigOverrides::default(),
        )
        .expect("valid");
        assert_eq!(configured.ssh_password, "hunter2");
    }

    #[test]
    fn test_missing_api_key_is_fatal() {
        let err = ConfigParser::from_vars(&vars(&[(ENV_API_KEY, "  ")]), &ConfigOverrides::default())
            .expect_err("empty key");
        assert!(matches!(
            err,
            PodleaseError::Config(ConfigError::MissingEnvVar { ref name }) if name == ENV_API_KEY
        ));
    }

    #[test]
    fn test_values_and_overrides() {
        let map = vars(&[
            (ENV_API_KEY, "rpa_abc"),
            (ENV_MIN_VRAM_GB, "24"),
            (ENV_MAX_COST_PER_HOUR, "0.75"),
            (ENV_TUNNEL_PORTS, "9000:8880/api"),
            (ENV_RETRY_BASE_MS, "250"),
            (ENV_ON_PROVISION_TIMEOUT, "next-offering"),
            (ENV_DOCKER_IMAGE, ""),
        ]);
        let overrides = ConfigOverrides {
            min_vram_gb: Some(48),
            ..ConfigOverrides::default()
        };

        let settings = ConfigParser::from_vars(&map, &overrides).expect("valid");
        assert_eq!(settings.min_vram_gb, 48);
        assert!((settings.max_cost_per_hour - 0.75).abs() < f64::EPSILON);
        assert_eq!(settings.tunnels[0].local_port, 9000);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(250));
        assert_eq!(settings.on_provision_timeout, ProvisionTimeoutPolicy::NextOffering);
        assert_eq!(settings.docker_image, "kajdo/kokoro-fastapi:latest");
    }

    #[test]
    fn test_unparseable_value_names_variable() {
        let err = ConfigParser::from_vars(
            &vars(&[(ENV_API_KEY, "rpa_abc"), (ENV_MIN_VRAM_GB, "lots")]),
            &ConfigOverrides::default(),
        )
        .expect_err("not a number");
        assert!(matches!(
            err,
            PodleaseError::Config(ConfigError::ParseError { location: Some(ref l), .. }) if l == ENV_MIN_VRAM_GB
        ));
    }

    #[test]
    fn test_load_dotenv_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "# comment\nRUNPOD_API_KEY=rpa_fromfile\nMIN_VRAM_GB=20").expect("write");

        let pairs = ConfigParser::new()
            .with_env_file(file.path())
            .load_dotenv()
            .expect("parses");

        let mut merged = vars(&[(ENV_API_KEY, "rpa_fromenv"), (ENV_MIN_VRAM_GB, "12")]);
        merged.extend(pairs);
        let settings = ConfigParser::from_vars(&merged, &ConfigOverrides::default()).expect("valid");
        assert_eq!(settings.api_key, "rpa_fromfile");
        assert_eq!(settings.min_vram_gb, 20);
    }

    #[test]
    fn test_missing_explicit_env_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parser = ConfigParser::new().with_env_file(dir.path().join("missing.env"));
        assert!(matches!(
            parser.load_dotenv(),
            Err(PodleaseError::Config(ConfigError::FileNotFound { .. }))
        ));
    }
}
