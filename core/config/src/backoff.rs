// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod fixedinterval;

use std::time::Duration;

/// Produces the delays between consecutive reconnection attempts.
/// The iterator ends when no more attempts are allowed.
pub trait Strategy {
    fn get_strategy(&self) -> Box<dyn Iterator<Item = Duration> + Send>;
}
