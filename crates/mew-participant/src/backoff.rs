// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exponential reconnect backoff.

use std::time::Duration;

/// Reconnection behavior: exponential delay, doubled per attempt, capped,
/// and reset on a successful welcome.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Whether to reconnect at all.
    pub enabled: bool,
    /// First retry delay.
    pub base: Duration,
    /// Upper bound on the delay.
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base: Duration::from_millis(250),
            cap: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Stateful delay sequence for one outage.
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: self.base,
            cap: self.cap,
        }
    }
}

/// Iterator over retry delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = (self.next * 2).min(self.cap);
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_cap() {
        let policy = ReconnectPolicy {
            enabled: true,
            base: Duration::from_millis(250),
            cap: Duration::from_secs(2),
        };
        let delays: Vec<Duration> = policy.delays().take(6).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(2),
                Duration::from_secs(2),
            ]
        );
    }
}
