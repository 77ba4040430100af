//! Observability helpers for the context memory subsystem.
//!
//! Hosts call [`init_tracing`] once at startup; the memory crates attach
//! their work to the spans built here so log lines carry the cycle or
//! operation they belong to.

#![warn(missing_docs, clippy::pedantic)]

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{Span, info_span};
use tracing_subscriber::EnvFilter;

/// Subscriber settings used by [`init_tracing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter directive applied when `RUST_LOG` is unset (e.g. `info` or
    /// `context_memory=debug`).
    pub default_directive: String,
    /// Include the event target in each line.
    pub with_target: bool,
    /// Emit ANSI colour codes.
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_owned(),
            with_target: false,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Overrides the fallback filter directive.
    #[must_use]
    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    /// Toggles event targets in the output.
    #[must_use]
    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    /// Toggles ANSI colour output.
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    fn filter(&self) -> anyhow::Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.default_directive).with_context(|| {
                format!("invalid tracing directive `{}`", self.default_directive)
            }),
        }
    }
}

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `config.default_directive`.
///
/// Returns `Ok(false)` when a global subscriber was already installed, so
/// calling this more than once (as test binaries do) is harmless.
///
/// # Errors
///
/// Returns an error when the fallback directive cannot be parsed.
pub fn init_tracing(config: &TelemetryConfig) -> anyhow::Result<bool> {
    let filter = config.filter()?;
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_ansi(config.ansi)
        .try_init()
        .is_ok();
    Ok(installed)
}

/// Span covering one maintenance cycle.
#[must_use]
pub fn maintenance_span(cycle: u64) -> Span {
    info_span!("maintenance", cycle)
}

/// Span covering one coordinator operation.
#[must_use]
pub fn operation_span(operation: &'static str) -> Span {
    info_span!("memory_op", operation)
}
