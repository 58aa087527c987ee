//! Configuration Loader
//!
//! Environment-aware configuration loading. Discovers `base.toml` in the
//! configuration directory, deep-merges `environments/{env}.toml` over it,
//! expands environment variables in string values and validates the result.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::DispatchConfig;

const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;
const ENV_VAR_PATTERN: &str = r"\$\{([^}:]+)(?::-([^}]*))?\}";

/// Detect current environment from environment variables
pub fn detect_environment() -> String {
    env::var("TASKER_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
        .to_lowercase()
}

/// Loaded and validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigLoader {
    config: DispatchConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigLoader {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigLoader>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigLoader>> {
        let environment = detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    ///
    /// Useful for testing without modifying global environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigLoader>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = %environment,
            config_directory = %config_directory.display(),
            "Loading dispatch configuration"
        );

        let merged = Self::load_and_merge_config(&config_directory, environment)?;
        let config: DispatchConfig =
            merged
                .try_into()
                .map_err(|e: toml::de::Error| ConfigurationError::InvalidToml {
                    file_path: config_directory.display().to_string(),
                    error: e.to_string(),
                })?;

        config.validate_config()?;

        let loader = ConfigLoader {
            config,
            environment: environment.to_string(),
            config_directory,
        };

        debug!(
            config = %serde_json::to_string(&loader.sanitized_config())
                .unwrap_or_else(|_| "[serialization error]".to_string()),
            "Configuration loaded"
        );
        info!(
            environment = %loader.environment,
            queue_backend = %loader.config.queue.backend,
            "Dispatch configuration loaded successfully"
        );

        Ok(Arc::new(loader))
    }

    /// Wrap an already-built configuration (tests and embedded use)
    pub fn from_config(config: DispatchConfig, environment: &str) -> ConfigResult<Arc<Self>> {
        config.validate_config()?;
        Ok(Arc::new(ConfigLoader {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Configuration as JSON with sensitive fields masked, safe for logs
    pub fn sanitized_config(&self) -> serde_json::Value {
        let mut value = serde_json::json!(self.config);
        sanitize_json_recursive(&mut value);
        value
    }

    fn default_config_directory() -> PathBuf {
        env::var("TASKER_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config").join("dispatch"))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<toml::Value> {
        let base_path = config_directory.join("base.toml");
        if !base_path.is_file() {
            return Err(ConfigurationError::ConfigFileNotFound {
                searched_paths: vec![base_path],
            });
        }

        let mut base = Self::load_toml_with_env_substitution(&base_path)?;

        let override_path = config_directory
            .join("environments")
            .join(format!("{environment}.toml"));
        if override_path.is_file() {
            let overlay = Self::load_toml_with_env_substitution(&override_path)?;
            merge_toml_values(&mut base, overlay)?;
            debug!(path = %override_path.display(), "Applied environment overrides");
        }

        Ok(base)
    }

    fn load_toml_with_env_substitution(path: &Path) -> ConfigResult<toml::Value> {
        let contents = read_config_file_safely(path)?;
        let mut value: toml::Value =
            toml::from_str(&contents).map_err(|e| ConfigurationError::InvalidToml {
                file_path: path.display().to_string(),
                error: e.to_string(),
            })?;
        substitute_env_vars_in_value(&mut value)?;
        Ok(value)
    }
}

fn read_config_file_safely(path: &Path) -> ConfigResult<String> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))?;

    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigurationError::invalid_value(
            "file_size",
            metadata.len().to_string(),
            format!("configuration file exceeds {MAX_CONFIG_FILE_SIZE} bytes"),
        ));
    }

    std::fs::read_to_string(path)
        .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))
}

/// Deep-merge `overlay` into `base`; tables merge key by key, everything else replaces
fn merge_toml_values(base: &mut toml::Value, overlay: toml::Value) -> ConfigResult<()> {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                let both_tables = overlay_value.is_table()
                    && base_table.get(&key).is_some_and(toml::Value::is_table);

                match base_table.get_mut(&key) {
                    Some(existing) if both_tables => merge_toml_values(existing, overlay_value)?,
                    _ => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
            Ok(())
        }
        (_, overlay) if !overlay.is_table() => Err(ConfigurationError::ConfigMergeError {
            error: "environment override root must be a table".to_string(),
        }),
        (base, overlay) => {
            *base = overlay;
            Ok(())
        }
    }
}

/// Recursively substitute environment variables in a TOML value
fn substitute_env_vars_in_value(value: &mut toml::Value) -> ConfigResult<()> {
    match value {
        toml::Value::String(s) => {
            *s = expand_env_vars(s)?;
        }
        toml::Value::Table(table) => {
            for (_, v) in table.iter_mut() {
                substitute_env_vars_in_value(v)?;
            }
        }
        toml::Value::Array(array) => {
            for v in array.iter_mut() {
                substitute_env_vars_in_value(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Expand `${VAR}` and `${VAR:-default}` in a string
///
/// A variable without a default that is not set fails fast.
pub(crate) fn expand_env_vars(input: &str) -> ConfigResult<String> {
    let re = Regex::new(ENV_VAR_PATTERN)
        .map_err(|e| ConfigurationError::validation_error(e.to_string()))?;

    let mut result = String::with_capacity(input.len());
    let mut last_end = 0;

    for cap in re.captures_iter(input) {
        let Some(whole_match) = cap.get(0) else {
            continue;
        };
        let var_name = cap.get(1).map_or("", |m| m.as_str());
        let default_value = cap.get(2).map(|m| m.as_str());

        result.push_str(&input[last_end..whole_match.start()]);

        match (env::var(var_name), default_value) {
            (Ok(value), _) => result.push_str(&value),
            (Err(_), Some(default)) => result.push_str(default),
            (Err(_), None) => {
                return Err(ConfigurationError::environment_variable(
                    var_name,
                    "variable is not set and no default was provided",
                ));
            }
        }

        last_end = whole_match.end();
    }

    result.push_str(&input[last_end..]);
    Ok(result)
}

fn sanitize_json_recursive(value: &mut serde_json::Value) {
    const SENSITIVE_PATTERNS: [&str; 6] = ["password", "secret", "key", "token", "credential", "auth"];

    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                if SENSITIVE_PATTERNS.iter().any(|p| key_lower.contains(p)) {
                    *val = serde_json::Value::String("[MASKED]".to_string());
                } else if key_lower == "url" {
                    if let serde_json::Value::String(url) = val {
                        *url = redact_url_credentials(url);
                    }
                } else {
                    sanitize_json_recursive(val);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                sanitize_json_recursive(item);
            }
        }
        _ => {}
    }
}

/// Strip `user:password@` from a connection URL
pub(crate) fn redact_url_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***@{}", &url[..scheme_end + 3], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
