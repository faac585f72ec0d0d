// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use super::Strategy;
use std::time::Duration;
use tokio_retry::strategy::FixedInterval;

/// Fixed delay between attempts, optionally bounded.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    interval: Duration,
    // None means retry forever
    max_attempts: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interval: Duration::from_millis(1000),
            max_attempts: Some(0),
        }
    }
}

impl Config {
    pub fn new(interval: Duration, max_attempts: Option<usize>) -> Self {
        Config {
            interval,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }
}

impl Strategy for Config {
    fn get_strategy(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let it = FixedInterval::new(self.interval);
        match self.max_attempts {
            Some(n) => Box::new(it.take(n)),
            None => Box::new(it),
        }
    }
}
