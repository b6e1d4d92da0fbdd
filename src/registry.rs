// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registry of live features and their refresh bookkeeping.
//!
//! Every feature that at least one consumer is interested in has an
//! [`Endpoint`] in the [`EndpointRegistry`]. The refresh scheduler asks the
//! registry which features are due and the registry marks them refreshed in
//! the same step.
//!
//! # Interval policy
//!
//! When several consumers register the same feature, the most demanding
//! (shortest) interval wins. Deregistering does not loosen the interval
//! again; only removing the last consumer discards it.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::feature::{DeviceId, FeatureId, FeatureKey, RefreshInterval};

/// Margin subtracted from the interval when deciding whether a feature is
/// due, so jitter in the tick timing does not skip a whole period.
pub const DUE_TOLERANCE: Duration = Duration::from_millis(500);

/// Refresh bookkeeping for one live feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    refresh_interval: RefreshInterval,
    last_refreshed_at: Option<Instant>,
    subscriber_count: usize,
}

impl Endpoint {
    fn new(refresh_interval: RefreshInterval) -> Self {
        Self {
            refresh_interval,
            last_refreshed_at: None,
            subscriber_count: 1,
        }
    }

    /// The effective refresh interval.
    #[must_use]
    pub fn refresh_interval(&self) -> RefreshInterval {
        self.refresh_interval
    }

    /// When a refresh was last requested, if ever.
    #[must_use]
    pub fn last_refreshed_at(&self) -> Option<Instant> {
        self.last_refreshed_at
    }

    /// Number of consumers interested in the feature.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    fn is_due(&self, now: Instant) -> bool {
        let Some(interval) = self.refresh_interval.as_duration() else {
            return false;
        };
        match self.last_refreshed_at {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last) > interval.saturating_sub(DUE_TOLERANCE)
            }
        }
    }
}

/// Tracks which features are live and when they were last refreshed.
///
/// All operations take one internal lock and never fail.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: Mutex<HashMap<FeatureKey, Endpoint>>,
}

impl EndpointRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records interest of one consumer in `features` of `device`.
    ///
    /// Unknown features are added with a count of one. Known features gain
    /// one subscriber and keep the shorter of the current and requested
    /// intervals. Intervals below the minimum are raised to it.
    pub fn register_interest(
        &self,
        device: DeviceId,
        features: &[FeatureId],
        interval: RefreshInterval,
    ) {
        let interval = interval.floored();
        let mut endpoints = self.endpoints.lock();
        for &feature in features {
            let key = FeatureKey::new(device, feature);
            endpoints
                .entry(key)
                .and_modify(|endpoint| {
                    endpoint.subscriber_count += 1;
                    endpoint.refresh_interval = endpoint.refresh_interval.tightest(interval);
                })
                .or_insert_with(|| Endpoint::new(interval));
        }
        tracing::debug!(device, ?features, ?interval, "Registered interest");
    }

    /// Withdraws interest of one consumer in `features` of `device`.
    ///
    /// A feature whose last consumer leaves is removed. Unknown features are
    /// ignored.
    pub fn deregister_interest(&self, device: DeviceId, features: &[FeatureId]) {
        let mut endpoints = self.endpoints.lock();
        for &feature in features {
            let key = FeatureKey::new(device, feature);
            let Some(endpoint) = endpoints.get_mut(&key) else {
                continue;
            };
            endpoint.subscriber_count = endpoint.subscriber_count.saturating_sub(1);
            if endpoint.subscriber_count == 0 {
                endpoints.remove(&key);
                tracing::debug!(%key, "Removed endpoint");
            }
        }
    }

    /// Returns the features due for refresh at `now`, grouped by device.
    ///
    /// Every returned feature is marked as refreshed at `now`. Devices are
    /// listed in ascending order and so are the features of each device.
    pub fn due_features(&self, now: Instant) -> BTreeMap<DeviceId, Vec<FeatureId>> {
        let mut due: BTreeMap<DeviceId, Vec<FeatureId>> = BTreeMap::new();
        let mut endpoints = self.endpoints.lock();
        for (key, endpoint) in endpoints.iter_mut() {
            if endpoint.is_due(now) {
                endpoint.last_refreshed_at = Some(now);
                due.entry(key.device).or_default().push(key.feature);
            }
        }
        drop(endpoints);

        for features in due.values_mut() {
            features.sort_unstable();
        }
        due
    }

    /// Returns a snapshot of the endpoint for `key`.
    #[must_use]
    pub fn endpoint(&self, key: FeatureKey) -> Option<Endpoint> {
        self.endpoints.lock().get(&key).copied()
    }

    /// Returns true if `key` has at least one consumer.
    #[must_use]
    pub fn contains(&self, key: FeatureKey) -> bool {
        self.endpoints.lock().contains_key(&key)
    }

    /// Returns the number of live features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    /// Returns true if no feature is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().is_empty()
    }
}
