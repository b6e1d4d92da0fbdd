// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client configuration.

use std::time::Duration;

use crate::correlator::DEFAULT_SETTLE_DELAY;
use crate::scheduler::{DEFAULT_TICK_INTERVAL, MIN_TICK_INTERVAL};

/// Topics and timings used by [`Open3eClient`](crate::Open3eClient).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use open3e_lib::Open3eConfig;
///
/// let config = Open3eConfig::new("heating")
///     .with_tick_interval(Duration::from_secs(10))
///     .with_exchange_timeout(Duration::from_secs(20));
///
/// assert_eq!(config.command_topic(), "heating/cmnd");
/// assert_eq!(config.availability_topic(), "heating/LWT");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Open3eConfig {
    base_topic: String,
    command_topic: String,
    tick_interval: Duration,
    settle_delay: Duration,
    exchange_timeout: Duration,
    probe_timeout: Duration,
    write_refresh_delay: Duration,
}

impl Default for Open3eConfig {
    fn default() -> Self {
        Self::new("open3e")
    }
}

impl Open3eConfig {
    /// Creates a configuration for a server publishing below `base_topic`.
    ///
    /// The command topic defaults to `<base_topic>/cmnd`.
    #[must_use]
    pub fn new(base_topic: impl Into<String>) -> Self {
        let base_topic = base_topic.into();
        Self {
            command_topic: format!("{base_topic}/cmnd"),
            base_topic,
            tick_interval: DEFAULT_TICK_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            exchange_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(10),
            write_refresh_delay: Duration::from_secs(2),
        }
    }

    /// Sets the topic requests are published on.
    #[must_use]
    pub fn with_command_topic(mut self, topic: impl Into<String>) -> Self {
        self.command_topic = topic.into();
        self
    }

    /// Sets how often the refresh scheduler runs (default: 5 seconds).
    ///
    /// Values below [`MIN_TICK_INTERVAL`] are raised to it.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(MIN_TICK_INTERVAL);
        self
    }

    /// Sets the wait between subscribing and publishing (default: 1 second).
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Sets the timeout of availability, discovery and one-shot reads
    /// (default: 10 seconds).
    #[must_use]
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Sets the timeout of one device's capability probe (default: 10
    /// seconds).
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the wait before re-reading a written feature (default: 2
    /// seconds).
    #[must_use]
    pub fn with_write_refresh_delay(mut self, delay: Duration) -> Self {
        self.write_refresh_delay = delay;
        self
    }

    /// The topic prefix of the server.
    #[must_use]
    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    /// The topic requests are published on.
    #[must_use]
    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    /// The refresh scheduler tick.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// The wait between subscribing and publishing.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// The timeout of availability, discovery and one-shot reads.
    #[must_use]
    pub fn exchange_timeout(&self) -> Duration {
        self.exchange_timeout
    }

    /// The timeout of one device's capability probe.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// The wait before re-reading a written feature.
    #[must_use]
    pub fn write_refresh_delay(&self) -> Duration {
        self.write_refresh_delay
    }

    /// Topic of the server's last-will availability message.
    #[must_use]
    pub fn availability_topic(&self) -> String {
        format!("{}/LWT", self.base_topic)
    }

    /// Topic the topology is published on.
    #[must_use]
    pub fn config_topic(&self) -> String {
        format!("{}/config", self.base_topic)
    }

    /// Topic the system information is published on.
    #[must_use]
    pub fn system_information_topic(&self) -> String {
        format!("{}/system-information", self.base_topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Open3eConfig::default();
        assert_eq!(config.base_topic(), "open3e");
        assert_eq!(config.command_topic(), "open3e/cmnd");
        assert_eq!(config.tick_interval(), Duration::from_secs(5));
        assert_eq!(config.settle_delay(), Duration::from_secs(1));
        assert_eq!(config.exchange_timeout(), Duration::from_secs(10));
        assert_eq!(config.probe_timeout(), Duration::from_secs(10));
        assert_eq!(config.write_refresh_delay(), Duration::from_secs(2));
    }

    #[test]
    fn derived_topics() {
        let config = Open3eConfig::default();
        assert_eq!(config.availability_topic(), "open3e/LWT");
        assert_eq!(config.config_topic(), "open3e/config");
        assert_eq!(config.system_information_topic(), "open3e/system-information");
    }

    #[test]
    fn builder_overrides() {
        let config = Open3eConfig::new("heating")
            .with_command_topic("heating/command")
            .with_settle_delay(Duration::ZERO)
            .with_probe_timeout(Duration::from_secs(3))
            .with_write_refresh_delay(Duration::from_secs(5));

        assert_eq!(config.command_topic(), "heating/command");
        assert_eq!(config.settle_delay(), Duration::ZERO);
        assert_eq!(config.probe_timeout(), Duration::from_secs(3));
        assert_eq!(config.write_refresh_delay(), Duration::from_secs(5));
    }

    #[test]
    fn tick_interval_has_a_floor() {
        let config = Open3eConfig::default().with_tick_interval(Duration::ZERO);
        assert_eq!(config.tick_interval(), MIN_TICK_INTERVAL);
    }
}
