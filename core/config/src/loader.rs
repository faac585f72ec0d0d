// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0
//
// ConfigLoader reads a YAML file once and exposes cached accessors for the
// tracing and endpoint sections. The endpoint section is validated on first
// access.

use std::collections::HashSet;

use lazy_static::lazy_static;
use serde_yaml::{Value, from_str};
use thiserror::Error;
use tracing::{debug, warn};

use crate::component::configuration::{Configuration, ConfigurationError};
use crate::endpoint::EndpointConfig;
use crate::logging::TracingConfiguration;

#[derive(Error, Debug)]
pub enum ConfigError {
    // File / I/O
    #[error("not found: {0}")]
    NotFound(String),

    // Parsing / structural validity
    #[error("invalid configuration - impossible to parse yaml")]
    InvalidYaml,
    #[error("invalid configuration - key {0} not valid")]
    InvalidKey(String),

    // YAML decoding
    #[error("yaml parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    // Semantic validation
    #[error("invalid endpoint configuration: {0}")]
    InvalidEndpoint(#[from] ConfigurationError),
}

lazy_static! {
    static ref CONFIG_KEYS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("tracing");
        s.insert("endpoint");
        s
    };
}

#[derive(Debug)]
pub struct ConfigLoader {
    root: Value,
    tracing: Option<TracingConfiguration>,
    endpoint: Option<EndpointConfig>,
}

impl ConfigLoader {
    pub fn new(file_path: &str) -> Result<Self, ConfigError> {
        let config_str =
            std::fs::read_to_string(file_path).map_err(|e| ConfigError::NotFound(e.to_string()))?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let root: Value = from_str(config_str).map_err(|_| ConfigError::InvalidYaml)?;

        let mapping = root.as_mapping().ok_or(ConfigError::InvalidYaml)?;
        for key in mapping.keys() {
            let k = key.as_str().ok_or(ConfigError::InvalidYaml)?;
            if !CONFIG_KEYS.contains(k) {
                return Err(ConfigError::InvalidKey(k.to_string()));
            }
        }

        Ok(Self {
            root,
            tracing: None,
            endpoint: None,
        })
    }

    /// Tracing section; an invalid section falls back to the defaults.
    pub fn tracing(&mut self) -> &TracingConfiguration {
        let root = &self.root;
        self.tracing.get_or_insert_with(|| {
            let cfg = root
                .get("tracing")
                .cloned()
                .map(|v| {
                    serde_yaml::from_value(v).unwrap_or_else(|e| {
                        warn!(error = ?e, "invalid tracing config, falling back to default");
                        TracingConfiguration::default()
                    })
                })
                .unwrap_or_default();
            debug!(?cfg, "tracing configuration loaded");
            cfg
        })
    }

    /// Endpoint section; a missing section yields the defaults.
    pub fn endpoint(&mut self) -> Result<&EndpointConfig, ConfigError> {
        if self.endpoint.is_none() {
            let cfg: EndpointConfig = match self.root.get("endpoint") {
                Some(v) => serde_yaml::from_value(v.clone())?,
                None => EndpointConfig::default(),
            };
            cfg.validate()?;
            debug!(?cfg, "endpoint configuration loaded");
            self.endpoint = Some(cfg);
        }

        Ok(self.endpoint.get_or_insert_with(EndpointConfig::default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracing_test::traced_test;

    static TEST_DATA_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata");

    #[test]
    #[traced_test]
    fn test_load_full_file() {
        let mut loader = ConfigLoader::new(&format!("{}/config.yaml", TEST_DATA_PATH)).unwrap();
        assert_eq!(loader.tracing().log_level(), "debug");

        let endpoint = loader.endpoint().unwrap();
        assert_eq!(endpoint.listen_port, 46000);
        assert_eq!(endpoint.default_body_codec, "protobuf");
        assert_eq!(endpoint.context_age(), Some(Duration::from_secs(10)));
        assert_eq!(endpoint.redial_times, 3);
    }

    #[test]
    fn test_missing_file() {
        let res = ConfigLoader::new(&format!("{}/missing.yaml", TEST_DATA_PATH));
        assert!(matches!(res, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_unknown_key() {
        let res = ConfigLoader::from_yaml("runtime:\n  n_cores: 1\n");
        assert!(matches!(res, Err(ConfigError::InvalidKey(k)) if k == "runtime"));
    }

    #[test]
    fn test_not_a_mapping() {
        let res = ConfigLoader::from_yaml("- a\n- b\n");
        assert!(matches!(res, Err(ConfigError::InvalidYaml)));
    }

    #[test]
    #[traced_test]
    fn test_invalid_tracing_falls_back() {
        let mut loader = ConfigLoader::from_yaml("tracing:\n  log_level: [1, 2]\n").unwrap();
        assert_eq!(loader.tracing(), &TracingConfiguration::default());
        assert!(logs_contain("invalid tracing config"));
    }

    #[test]
    fn test_endpoint_defaults_and_validation() {
        let mut loader = ConfigLoader::from_yaml("tracing:\n  log_level: info\n").unwrap();
        assert_eq!(loader.endpoint().unwrap(), &EndpointConfig::default());

        let mut loader =
            ConfigLoader::from_yaml("endpoint:\n  default_body_codec: xml\n").unwrap();
        assert!(matches!(
            loader.endpoint(),
            Err(ConfigError::InvalidEndpoint(ConfigurationError::UnknownBodyCodec(_)))
        ));
    }
}
