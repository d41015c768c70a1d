// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Process-level errors and how they are reported.
//!
//! | exit | meaning                                             |
//! |------|-----------------------------------------------------|
//! | 1    | configuration, including a fatal adapter error      |
//! | 2    | initialization (logging)                            |
//! | 3    | runtime                                             |
//! | 4    | the adapter gave up reconnecting                    |

use harvest_config::ConfigError;
use harvest_opcua::OpcUaError;
use thiserror::Error;

/// Configuration could not be used.
pub const EXIT_CONFIG: i32 = 1;
/// The process could not set itself up.
pub const EXIT_INIT: i32 = 2;
/// Failure while running.
pub const EXIT_RUNTIME: i32 = 3;
/// The adapter exhausted its connection attempts.
pub const EXIT_ADAPTER: i32 = 4;

/// Result type alias for harvest-bin operations.
pub type BinResult<T> = Result<T, BinError>;

/// Errors that end the `harvest` process.
#[derive(Debug, Error)]
pub enum BinError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Initialization error.
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Runtime error.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The configuration file could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The adapter stopped with an error.
    #[error("OPC UA {category} error: {source}", category = .source.category())]
    Adapter {
        /// What the adapter reported.
        #[from]
        source: OpcUaError,
    },

    /// Another error with a description of what was being done.
    #[error("{context}: {source}")]
    WithContext {
        /// What was being done.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<BinError>,
    },
}

impl BinError {
    /// Creates a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates an initialization error.
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Initialization(msg.into())
    }

    /// Creates a runtime error.
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Wraps this error with what was being done.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The adapter error behind this one, if any.
    pub fn adapter_error(&self) -> Option<&OpcUaError> {
        match self {
            Self::Adapter { source } | Self::Config(ConfigError::Adapter(source)) => Some(source),
            Self::WithContext { source, .. } => source.adapter_error(),
            _ => None,
        }
    }

    /// Process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) | Self::Config(_) => EXIT_CONFIG,
            Self::Adapter { source } if source.is_fatal() => EXIT_CONFIG,
            Self::Adapter { .. } => EXIT_ADAPTER,
            Self::Initialization(_) => EXIT_INIT,
            Self::Runtime(_) => EXIT_RUNTIME,
            Self::WithContext { source, .. } => source.exit_code(),
        }
    }
}

// =============================================================================
// Reporting
// =============================================================================

/// Lines printed for `error`: the message, distinct causes, and for adapter
/// errors the code and recovery hints.
pub fn report_lines(error: &BinError) -> Vec<String> {
    let mut lines = vec![format!("Error: {error}")];

    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        let text = cause.to_string();
        // Transparent wrappers repeat their inner message.
        if !lines.iter().any(|line| line.ends_with(&text)) {
            lines.push(format!("  Caused by: {text}"));
        }
        source = cause.source();
    }

    if let Some(adapter) = error.adapter_error() {
        lines.push(format!("  Code: {}", adapter.error_code()));
        for hint in adapter.recovery_hints() {
            lines.push(format!("  Hint: {hint}"));
        }
    }
    lines
}

/// Prints the report for `error` on stderr.
pub fn report_error(error: &BinError) {
    for line in report_lines(error) {
        eprintln!("{line}");
    }
}

/// Reports an error and exits with its exit code.
pub fn report_error_and_exit(error: BinError) -> ! {
    report_error(&error);
    std::process::exit(error.exit_code())
}
