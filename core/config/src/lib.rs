// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod backoff;
pub mod component;
pub mod endpoint;
pub mod loader;
pub mod logging;
pub mod tls;

pub use endpoint::{EndpointConfig, Network};
pub use loader::ConfigLoader;
pub use logging::TracingConfiguration;
