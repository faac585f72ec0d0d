// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum TracingError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("tracing subscriber already set: {0}")]
    AlreadyInitialized(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TracingConfiguration {
    /// EnvFilter directive, e.g. `info` or `info,tern=debug`
    #[serde(default = "default_log_level")]
    log_level: String,

    #[serde(default)]
    display_thread_names: bool,

    #[serde(default)]
    display_thread_ids: bool,
}

impl Default for TracingConfiguration {
    fn default() -> Self {
        TracingConfiguration {
            log_level: default_log_level(),
            display_thread_names: false,
            display_thread_ids: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TracingConfiguration {
    pub fn with_log_level(mut self, log_level: &str) -> Self {
        self.log_level = log_level.to_string();
        self
    }

    pub fn with_thread_names(mut self, display: bool) -> Self {
        self.display_thread_names = display;
        self
    }

    pub fn with_thread_ids(mut self, display: bool) -> Self {
        self.display_thread_ids = display;
        self
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn env_filter(&self) -> Result<EnvFilter, TracingError> {
        EnvFilter::try_new(&self.log_level).map_err(|e| TracingError::InvalidFilter(e.to_string()))
    }

    /// Install a global fmt subscriber. Fails if one is already installed.
    pub fn setup_tracing_subscriber(&self) -> Result<(), TracingError> {
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter()?)
            .with_thread_names(self.display_thread_names)
            .with_thread_ids(self.display_thread_ids)
            .try_init()
            .map_err(|e| TracingError::AlreadyInitialized(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        let cfg = TracingConfiguration::default();
        assert_eq!(cfg.log_level(), "info");
        assert!(cfg.env_filter().is_ok());
    }

    #[test]
    fn test_invalid_filter() {
        let cfg = TracingConfiguration::default().with_log_level("tern=[[");
        assert!(matches!(
            cfg.env_filter(),
            Err(TracingError::InvalidFilter(_))
        ));
    }
}
