// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use tern::{Code, Status};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SecureBodyError {
    #[error("invalid key length {0}, want 16 or 32 bytes")]
    InvalidKeyLength(usize),
    #[error("random source failure")]
    RandomFailure,
    #[error("seal failed")]
    SealFailed,
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
    #[error("open failed: wrong key or corrupted body")]
    OpenFailed,
    #[error("reply body is not encrypted")]
    PlaintextReply,
}

impl From<SecureBodyError> for Status {
    fn from(err: SecureBodyError) -> Self {
        match err {
            SecureBodyError::InvalidKeyLength(_)
            | SecureBodyError::RandomFailure
            | SecureBodyError::SealFailed => {
                Status::with_code(Code::INTERNAL_SERVER_ERROR).with_cause(err.to_string())
            }
            _ => Status::bad_message(err.to_string()),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service {0} already registered at {1}")]
    AlreadyRegistered(String, String),
    #[error("service {0} not registered at {1}")]
    NotRegistered(String, String),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

impl From<RegistryError> for Status {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyRegistered(..) => {
                Status::with_code(Code::CONFLICT).with_cause(err.to_string())
            }
            RegistryError::NotRegistered(..) => Status::not_found(err.to_string()),
            RegistryError::Unavailable(_) => {
                Status::with_code(Code::BAD_GATEWAY).with_cause(err.to_string())
            }
        }
    }
}
