// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use lazy_static::lazy_static;
use rustls::crypto::CryptoProvider;

lazy_static! {
    // aws-lc is the only provider compiled in
    static ref PROVIDER: Arc<CryptoProvider> =
        Arc::new(rustls::crypto::aws_lc_rs::default_provider());
}

pub fn crypto_provider() -> Arc<CryptoProvider> {
    PROVIDER.clone()
}
