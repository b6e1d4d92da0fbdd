// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Feature identifiers and refresh intervals.
//!
//! A feature is a single numerically identified datum on a device, such as
//! the flow temperature or the hot-water mode. Features are addressed by a
//! [`FeatureKey`] made of the device id and the feature id.

use std::fmt;
use std::time::Duration;

/// Device address on the Open3e server (the `addr` of a request).
pub type DeviceId = u16;

/// Feature identifier, unique per device.
pub type FeatureId = u16;

/// Shortest refresh interval the server is polled with.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Identifies a monitorable or writable datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureKey {
    /// The device the feature belongs to.
    pub device: DeviceId,
    /// The feature id on that device.
    pub feature: FeatureId,
}

impl FeatureKey {
    /// Creates a new feature key.
    #[must_use]
    pub const fn new(device: DeviceId, feature: FeatureId) -> Self {
        Self { device, feature }
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.feature)
    }
}

/// How often a feature should be re-read.
///
/// `Never` marks a write-only feature: it is tracked like any other but is
/// never picked up by the refresh scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshInterval {
    /// Refresh at most this often.
    Every(Duration),
    /// Never refresh automatically.
    Never,
}

impl RefreshInterval {
    /// Creates an interval, raised to [`MIN_REFRESH_INTERVAL`] if shorter.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use open3e_lib::RefreshInterval;
    ///
    /// let interval = RefreshInterval::every(Duration::from_secs(1));
    /// assert_eq!(interval.as_duration(), Some(Duration::from_secs(5)));
    /// ```
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        Self::Every(interval.max(MIN_REFRESH_INTERVAL))
    }

    /// Creates an interval from whole seconds.
    #[must_use]
    pub fn secs(secs: u64) -> Self {
        Self::every(Duration::from_secs(secs))
    }

    /// Returns the interval, or `None` for write-only features.
    #[must_use]
    pub const fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Every(d) => Some(*d),
            Self::Never => None,
        }
    }

    /// Returns the same interval raised to [`MIN_REFRESH_INTERVAL`].
    #[must_use]
    pub fn floored(self) -> Self {
        match self {
            Self::Every(d) => Self::every(d),
            Self::Never => Self::Never,
        }
    }

    /// Returns the more demanding of the two intervals.
    ///
    /// `Never` loses against any concrete interval.
    #[must_use]
    pub fn tightest(self, other: Self) -> Self {
        match (self, other) {
            (Self::Every(a), Self::Every(b)) => Self::Every(a.min(b)),
            (Self::Every(a), Self::Never) | (Self::Never, Self::Every(a)) => Self::Every(a),
            (Self::Never, Self::Never) => Self::Never,
        }
    }
}

/// A feature definition: its id and how often it should be polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Feature {
    /// The id used by the Open3e server.
    pub id: FeatureId,
    /// Requested refresh interval.
    pub refresh: RefreshInterval,
}

impl Feature {
    /// A feature polled every `secs` seconds.
    #[must_use]
    pub const fn polled(id: FeatureId, secs: u64) -> Self {
        Self {
            id,
            refresh: RefreshInterval::Every(Duration::from_secs(secs)),
        }
    }

    /// A write-only feature.
    #[must_use]
    pub const fn write_only(id: FeatureId) -> Self {
        Self {
            id,
            refresh: RefreshInterval::Never,
        }
    }
}

/// Features referenced by the library itself.
pub mod known {
    use super::Feature;

    pub const FLOW_TEMPERATURE: Feature = Feature::polled(268, 5);
    pub const RETURN_TEMPERATURE: Feature = Feature::polled(269, 5);
    pub const OUTSIDE_TEMPERATURE: Feature = Feature::polled(274, 5);
    pub const FLOW_CIRCUIT_2_TEMPERATURE: Feature = Feature::polled(286, 5);
    pub const FLOW_CIRCUIT_3_TEMPERATURE: Feature = Feature::polled(288, 5);
    pub const FLOW_CIRCUIT_4_TEMPERATURE: Feature = Feature::polled(290, 5);
    pub const ROOM_1_TEMPERATURE: Feature = Feature::polled(334, 5);
    pub const ROOM_2_TEMPERATURE: Feature = Feature::polled(335, 5);
    pub const ROOM_3_TEMPERATURE: Feature = Feature::polled(336, 5);
    pub const ROOM_4_TEMPERATURE: Feature = Feature::polled(337, 5);
    pub const FAN_2_POWER: Feature = Feature::polled(1776, 5);
    pub const FLOW_CIRCUIT_1_COOLING: Feature = Feature::polled(2405, 30);
    pub const HVAC_STATE: Feature = Feature::polled(1415, 30);
    pub const DOMESTIC_HOT_WATER_TARGET: Feature = Feature::polled(396, 300);
}
