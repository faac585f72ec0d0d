// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod auth;
pub mod errors;
pub mod heartbeat;
pub mod ignorecase;
pub mod registration;
pub mod securebody;
