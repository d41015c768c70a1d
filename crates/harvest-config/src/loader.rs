// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Configuration loading and processing.
//!
//! # Loading Pipeline
//!
//! 1. Read the file and pick the format from its extension
//! 2. Resolve `${VAR}` and `${VAR:default}` placeholders in the raw text
//! 3. Parse into [`HarvestConfig`]
//! 4. Apply environment variable overrides
//! 5. Resolve relative credential paths against the file's directory
//! 6. Validate
//!
//! # Environment Variable Override
//!
//! ```text
//! HARVEST_CONNECTION_STRING=opc.tcp://plc-2:4840
//! HARVEST_AUTO_ACCEPT=true
//! HARVEST_LOG_LEVEL=debug
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::schema::{HarvestConfig, LogLevel};

/// Looks up an environment variable by name.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

// =============================================================================
// ConfigLoader
// =============================================================================

/// Configuration loader.
///
/// ```no_run
/// use harvest_config::loader::ConfigLoader;
///
/// let config = ConfigLoader::new().load("harvest.yaml").unwrap();
/// ```
#[derive(Clone)]
pub struct ConfigLoader {
    /// Base directory for resolving relative paths.
    base_path: Option<PathBuf>,

    /// Environment variable prefix.
    env_prefix: String,

    /// Whether to resolve placeholders and apply overrides.
    resolve_env_vars: bool,

    /// Whether to resolve relative paths.
    resolve_paths: bool,

    env: EnvLookup,
}

impl fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigLoader")
            .field("base_path", &self.base_path)
            .field("env_prefix", &self.env_prefix)
            .field("resolve_env_vars", &self.resolve_env_vars)
            .field("resolve_paths", &self.resolve_paths)
            .finish_non_exhaustive()
    }
}

impl ConfigLoader {
    /// Creates a loader reading the process environment.
    pub fn new() -> Self {
        Self {
            base_path: None,
            env_prefix: "HARVEST".to_string(),
            resolve_env_vars: true,
            resolve_paths: true,
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Sets the base path for resolving relative paths.
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Sets the environment variable prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Enables or disables placeholder resolution and overrides.
    pub fn with_env_vars(mut self, enabled: bool) -> Self {
        self.resolve_env_vars = enabled;
        self
    }

    /// Enables or disables relative path resolution.
    pub fn with_path_resolution(mut self, enabled: bool) -> Self {
        self.resolve_paths = enabled;
        self
    }

    /// Replaces the environment lookup.
    pub fn with_env_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Arc::new(lookup);
        self
    }

    /// Loads configuration from a file.
    ///
    /// The file format is determined by the file extension:
    /// - `.yaml` or `.yml` - YAML format
    /// - `.toml` - TOML format
    /// - `.json` - JSON format
    pub fn load(&self, path: impl AsRef<Path>) -> ConfigResult<HarvestConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let base_path = self.base_path.clone().unwrap_or_else(|| {
            path.parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });

        let format = ConfigFormat::from_path(path)?;
        let content = read_file(path)?;
        let content = self.prepare(&content)?;
        let mut config = parse_str(&content, format).map_err(|e| match e {
            ConfigError::Serialization { message } => ConfigError::parse(path, message),
            ConfigError::Parse { message, line, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
                line,
            },
            other => other,
        })?;

        self.finish(&mut config, Some(&base_path))?;

        info!("Configuration loaded successfully");
        debug!(
            adapter = %config.adapter.name,
            measurements = config.measurements.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Loads configuration from a string.
    ///
    /// Relative paths are resolved only when a base path was set.
    pub fn load_from_str(
        &self,
        content: &str,
        format: ConfigFormat,
    ) -> ConfigResult<HarvestConfig> {
        let content = self.prepare(content)?;
        let mut config = parse_str(&content, format)?;
        let base_path = self.base_path.clone();
        self.finish(&mut config, base_path.as_deref())?;
        Ok(config)
    }

    fn prepare(&self, content: &str) -> ConfigResult<String> {
        if self.resolve_env_vars {
            self.resolve_env_placeholders(content)
        } else {
            Ok(content.to_string())
        }
    }

    fn finish(&self, config: &mut HarvestConfig, base_path: Option<&Path>) -> ConfigResult<()> {
        if self.resolve_env_vars {
            self.apply_env_overrides(config)?;
        }
        if self.resolve_paths {
            if let Some(base_path) = base_path {
                resolve_relative_paths(config, base_path);
            }
        }
        config.validate()
    }

    /// Resolves environment variable placeholders in content.
    ///
    /// Supports `${VAR_NAME}` and `${VAR_NAME:default}`. An unterminated
    /// placeholder is kept as written.
    fn resolve_env_placeholders(&self, content: &str) -> ConfigResult<String> {
        let mut result = String::with_capacity(content.len());
        let mut chars = content.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '$' || chars.peek() != Some(&'{') {
                result.push(c);
                continue;
            }
            chars.next();

            let mut var_content = String::new();
            let mut found_close = false;
            for c in chars.by_ref() {
                if c == '}' {
                    found_close = true;
                    break;
                }
                var_content.push(c);
            }

            if !found_close {
                result.push_str("${");
                result.push_str(&var_content);
                continue;
            }

            let (var_name, default_value) = match var_content.split_once(':') {
                Some((name, default)) => (name, Some(default)),
                None => (var_content.as_str(), None),
            };

            match ((self.env)(var_name), default_value) {
                (Some(value), _) => result.push_str(&value),
                (None, Some(default)) => result.push_str(default),
                (None, None) => return Err(ConfigError::env_var_not_found(var_name)),
            }
        }

        Ok(result)
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&self, config: &mut HarvestConfig) -> ConfigResult<()> {
        let name = format!("{}_CONNECTION_STRING", self.env_prefix);
        if let Some(value) = (self.env)(&name) {
            debug!(variable = %name, "Connection string overridden");
            config.adapter.connection_string = value;
        }

        let name = format!("{}_AUTO_ACCEPT", self.env_prefix);
        if let Some(value) = (self.env)(&name) {
            config.adapter.auto_accept_untrusted_certificates = parse_bool(&value)
                .ok_or_else(|| ConfigError::invalid_env_var(&name, "expected true or false"))?;
        }

        let name = format!("{}_LOG_LEVEL", self.env_prefix);
        if let Some(value) = (self.env)(&name) {
            config.logging.level = value
                .parse::<LogLevel>()
                .map_err(|message| ConfigError::invalid_env_var(&name, message))?;
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves relative credential paths in configuration.
fn resolve_relative_paths(config: &mut HarvestConfig, base_path: &Path) {
    let application = &mut config.adapter.application;
    for path in [
        &mut application.certificate_path,
        &mut application.private_key_path,
        &mut application.pki_dir,
    ] {
        if path.is_relative() {
            *path = base_path.join(&*path);
        }
    }
}

fn read_file(path: &Path) -> ConfigResult<String> {
    if !path.exists() {
        return Err(ConfigError::file_not_found(path));
    }
    fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))
}

fn parse_str(content: &str, format: ConfigFormat) -> ConfigResult<HarvestConfig> {
    match format {
        ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| match e.location() {
            Some(location) => ConfigError::parse_at_line("<yaml>", e.to_string(), location.line()),
            None => ConfigError::serialization(e.to_string()),
        }),
        ConfigFormat::Toml => {
            toml::from_str(content).map_err(|e| ConfigError::serialization(e.to_string()))
        }
        ConfigFormat::Json => serde_json::from_str(content)
            .map_err(|e| ConfigError::parse_at_line("<json>", e.to_string(), e.line())),
    }
}

// =============================================================================
// ConfigFormat
// =============================================================================

/// Supported configuration file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format.
    Yaml,
    /// TOML format.
    Toml,
    /// JSON format.
    Json,
}

impl ConfigFormat {
    /// Determines the format from a file path.
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        match ext.as_deref() {
            Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            Some("json") => Ok(ConfigFormat::Json),
            Some(other) => Err(ConfigError::unsupported_format(other)),
            None => Err(ConfigError::unsupported_format("(no extension)")),
        }
    }

    /// Returns the file extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Yaml => "yaml",
            ConfigFormat::Toml => "toml",
            ConfigFormat::Json => "json",
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Loads configuration from a file with default settings.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<HarvestConfig> {
    ConfigLoader::new().load(path)
}

/// Loads configuration from a string with the specified format.
pub fn load_config_str(content: &str, format: ConfigFormat) -> ConfigResult<HarvestConfig> {
    ConfigLoader::new().load_from_str(content, format)
}

// =============================================================================
// Tests
// =============================================================================
