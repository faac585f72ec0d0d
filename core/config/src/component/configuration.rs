// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigurationError {
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),
    #[error("unknown body codec: {0}")]
    UnknownBodyCodec(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

pub trait Configuration {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate the component configuration
    fn validate(&self) -> Result<(), Self::Error>;
}
