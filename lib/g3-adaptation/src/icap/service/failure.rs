/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2023-2025 ByteDance and/or its affiliates.
 */

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Counts failures, optionally forgetting the ones older than the horizon.
pub(super) struct FailureCounter {
    horizon: Duration,
    events: VecDeque<Instant>,
    total: usize,
}

impl FailureCounter {
    /// A zero horizon remembers everything.
    pub(super) fn new(horizon: Duration) -> Self {
        FailureCounter {
            horizon,
            events: VecDeque::new(),
            total: 0,
        }
    }

    /// Record one more failure and return how many are remembered.
    pub(super) fn count(&mut self, now: Instant) -> usize {
        if self.horizon.is_zero() {
            self.total += 1;
            return self.total;
        }
        self.events.push_back(now);
        while let Some(oldest) = self.events.front() {
            if now.duration_since(*oldest) > self.horizon {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.len()
    }

    pub(super) fn clear(&mut self) {
        self.events.clear();
        self.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forever() {
        let now = Instant::now();
        let mut c = FailureCounter::new(Duration::ZERO);
        assert_eq!(c.count(now), 1);
        assert_eq!(c.count(now + Duration::from_secs(3600)), 2);
        c.clear();
        assert_eq!(c.count(now), 1);
    }

    #[test]
    fn horizon() {
        let now = Instant::now();
        let mut c = FailureCounter::new(Duration::from_secs(10));
        assert_eq!(c.count(now), 1);
        assert_eq!(c.count(now + Duration::from_secs(5)), 2);
        assert_eq!(c.count(now + Duration::from_secs(12)), 2);
        assert_eq!(c.count(now + Duration::from_secs(30)), 1);
    }
}
