// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Implementation of the `validate` command.

use std::path::{Path, PathBuf};

use harvest_config::HarvestConfig;

use crate::cli::{Cli, OutputFormat, ValidateArgs};
use crate::error::{BinError, BinResult};

/// Outcome of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// File that was validated.
    pub config_path: PathBuf,
    /// Device name.
    pub device: String,
    /// Server address.
    pub server_url: String,
    /// Number of tag bindings.
    pub measurements: usize,
    /// Whether secured endpoints are preferred.
    pub use_security: bool,
    /// Non-fatal findings.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Checks a loaded configuration, including the application
    /// certificate files.
    pub fn build(config_path: &Path, config: &HarvestConfig) -> BinResult<Self> {
        let spec = config.adapter.connection_spec()?;
        config
            .adapter
            .application
            .check()
            .map_err(|e| BinError::from(harvest_opcua::OpcUaError::from(e)))?;

        let mut warnings = Vec::new();
        if config.measurements.is_empty() {
            warnings.push("No measurements configured; nothing will be subscribed".to_string());
        }
        if config.adapter.auto_accept_untrusted_certificates {
            warnings.push("Untrusted server certificates are accepted automatically".to_string());
        }
        if !spec.reserved.is_empty() {
            warnings.push(format!(
                "Connection string fields after the server address are ignored: {}",
                spec.reserved.join(";")
            ));
        }

        Ok(Self {
            config_path: config_path.to_path_buf(),
            device: config.adapter.name.clone(),
            server_url: spec.server_url,
            measurements: config.measurements.len(),
            use_security: config.adapter.use_security,
            warnings,
        })
    }

    /// Renders the report as JSON.
    pub fn to_json(&self, config: Option<&HarvestConfig>) -> serde_json::Value {
        serde_json::json!({
            "valid": true,
            "config_path": self.config_path.display().to_string(),
            "summary": {
                "device": self.device,
                "server_url": self.server_url,
                "measurement_count": self.measurements,
                "use_security": self.use_security,
            },
            "warnings": self.warnings,
            "config": config,
        })
    }
}

/// Executes the `validate` command to validate configuration.
pub fn validate(cli: &Cli, args: ValidateArgs) -> BinResult<()> {
    let config_path = &cli.config;

    let config = harvest_config::load_config(config_path).map_err(|e| {
        BinError::from(e).with_context("Configuration validation failed")
    })?;
    let report = ValidationReport::build(config_path, &config)?;

    match args.format {
        OutputFormat::Text => {
            println!("✓ Configuration is valid: {}", config_path.display());
            println!();
            println!("Summary:");
            println!("  Device:       {}", report.device);
            println!("  Server:       {}", report.server_url);
            println!("  Measurements: {}", report.measurements);
            println!(
                "  Security:     {}",
                if report.use_security { "preferred" } else { "none" }
            );

            if !report.warnings.is_empty() {
                println!();
                println!("Warnings:");
                for warning in &report.warnings {
                    println!("  ⚠ {}", warning);
                }
            }

            if args.show_config {
                println!();
                println!("Parsed configuration:");
                println!(
                    "{}",
                    serde_json::to_string_pretty(&config)
                        .unwrap_or_else(|_| "(serialization error)".to_string())
                );
            }
        }
        OutputFormat::Json => {
            let output = report.to_json(args.show_config.then_some(&config));
            println!(
                "{}",
                serde_json::to_string_pretty(&output)
                    .map_err(|e| BinError::runtime(e.to_string()))?
            );
        }
    }

    if args.strict && !report.warnings.is_empty() {
        return Err(BinError::config(format!(
            "Strict mode: {} warning(s) found",
            report.warnings.len()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_opcua::{AdapterConfig, ApplicationIdentity, TagBinding};

    fn config(dir: &tempfile::TempDir) -> HarvestConfig {
        let der = [0x30u8, 0x03, 0x02, 0x01, 0x00];
        let cert = dir.path().join("cert.der");
        let key = dir.path().join("key.der");
        std::fs::write(&cert, der).unwrap();
        std::fs::write(&key, der).unwrap();

        let mut adapter = AdapterConfig::new("opc.tcp://plc-1:4840");
        adapter.application = ApplicationIdentity::new(cert, key);
        HarvestConfig {
            adapter,
            measurements: vec![TagBinding::new("DEVICE1:TEMP1", "ns=2;s=Temp1")],
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = ValidationReport::build(Path::new("harvest.yaml"), &config(&dir)).unwrap();

        assert_eq!(report.server_url, "opc.tcp://plc-1:4840");
        assert_eq!(report.measurements, 1);
        assert!(report.warnings.is_empty());

        let json = report.to_json(None);
        assert_eq!(json["valid"], true);
        assert_eq!(json["summary"]["measurement_count"], 1);
        assert!(json["config"].is_null());
    }

    #[test]
    fn test_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.measurements.clear();
        config.adapter.auto_accept_untrusted_certificates = true;
        config.adapter.connection_string = "opc.tcp://plc-1:4840;Device1".to_string();

        let report = ValidationReport::build(Path::new("harvest.yaml"), &config).unwrap();
        assert_eq!(report.warnings.len(), 3);
        assert!(report.warnings[2].ends_with("Device1"));
    }

    #[test]
    fn test_missing_certificate_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        std::fs::remove_file(&config.adapter.application.private_key_path).unwrap();

        let err = ValidationReport::build(Path::new("harvest.yaml"), &config).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
