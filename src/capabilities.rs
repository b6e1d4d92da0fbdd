// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Optional device capabilities and their detection.
//!
//! Which optional parts an appliance has (a second heating circuit, room
//! sensors, cooling) depends on how it was installed, not on its model. The
//! [`CapabilityProber`] reads one probe feature per candidate capability in a
//! single batched request per device and checks each reply against a
//! [`ProbePredicate`]. A capability whose probe stays silent, cannot be
//! parsed or reports the "unavailable" value is simply absent.
//!
//! # Examples
//!
//! ```
//! use open3e_lib::capabilities::{Capability, Capabilities};
//!
//! let caps: Capabilities = [Capability::Cooling, Capability::Fan2].into_iter().collect();
//! assert!(caps.contains(Capability::Cooling));
//! assert!(!caps.contains(Capability::HeatingCircuit2));
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::correlator::Correlator;
use crate::error::ProtocolError;
use crate::feature::{DeviceId, FeatureId, known};
use crate::protocol::{Bus, Request};
use crate::system::{Device, DeviceModel, SystemInformation};

/// Value reported for a temperature whose sensor or circuit is not present.
pub const UNAVAILABLE_VALUE: f64 = -3276.8;

/// Raw value reported by a fan that is not installed.
pub const FAN_NOT_INSTALLED: f64 = 255.0;

/// An optional part of an installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Cooling through heating circuit 1.
    Cooling,
    /// Room temperature sensor of circuit 1.
    Room1Temperature,
    /// Room temperature sensor of circuit 2.
    Room2Temperature,
    /// Room temperature sensor of circuit 3.
    Room3Temperature,
    /// Room temperature sensor of circuit 4.
    Room4Temperature,
    /// Second fan.
    Fan2,
    /// Heating circuit 2.
    HeatingCircuit2,
    /// Heating circuit 3.
    HeatingCircuit3,
    /// Heating circuit 4.
    HeatingCircuit4,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Decides from a probe reply whether a capability is present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbePredicate {
    /// The reply is anything but the sentinel number.
    DiffersFrom(f64),
    /// The reply is an object whose `field` is anything but the sentinel
    /// number.
    FieldDiffersFrom {
        /// Name of the field to inspect.
        field: &'static str,
        /// Value meaning "not present".
        sentinel: f64,
    },
}

impl ProbePredicate {
    /// Evaluates the predicate against a raw reply payload.
    ///
    /// Non-numeric values differ from every sentinel. Unparsable payloads
    /// and missing fields evaluate to `false`.
    #[must_use]
    pub fn evaluate(&self, payload: &str) -> bool {
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            return false;
        };
        let (candidate, sentinel) = match self {
            Self::DiffersFrom(sentinel) => (Some(&value), *sentinel),
            Self::FieldDiffersFrom { field, sentinel } => (value.get(field), *sentinel),
        };
        candidate.is_some_and(|v| !is_sentinel(v, sentinel))
    }
}

fn is_sentinel(value: &Value, sentinel: f64) -> bool {
    value
        .as_f64()
        .is_some_and(|n| (n - sentinel).abs() <= f64::EPSILON)
}

/// Ties a capability to the feature that reveals it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapabilityProbe {
    /// The capability granted when the predicate holds.
    pub capability: Capability,
    /// The feature read to decide.
    pub feature: FeatureId,
    /// The check applied to the reply.
    pub predicate: ProbePredicate,
}

impl CapabilityProbe {
    const fn field(capability: Capability, feature: FeatureId, field: &'static str) -> Self {
        Self {
            capability,
            feature,
            predicate: ProbePredicate::FieldDiffersFrom {
                field,
                sentinel: UNAVAILABLE_VALUE,
            },
        }
    }
}

const VITOCAL_PROBES: [CapabilityProbe; 9] = [
    CapabilityProbe::field(
        Capability::Cooling,
        known::FLOW_CIRCUIT_1_COOLING.id,
        "EffectiveSetTemperature",
    ),
    CapabilityProbe::field(Capability::Room1Temperature, known::ROOM_1_TEMPERATURE.id, "Actual"),
    CapabilityProbe::field(Capability::Room2Temperature, known::ROOM_2_TEMPERATURE.id, "Actual"),
    CapabilityProbe::field(Capability::Room3Temperature, known::ROOM_3_TEMPERATURE.id, "Actual"),
    CapabilityProbe::field(Capability::Room4Temperature, known::ROOM_4_TEMPERATURE.id, "Actual"),
    CapabilityProbe {
        capability: Capability::Fan2,
        feature: known::FAN_2_POWER.id,
        predicate: ProbePredicate::DiffersFrom(FAN_NOT_INSTALLED),
    },
    CapabilityProbe::field(
        Capability::HeatingCircuit2,
        known::FLOW_CIRCUIT_2_TEMPERATURE.id,
        "Actual",
    ),
    CapabilityProbe::field(
        Capability::HeatingCircuit3,
        known::FLOW_CIRCUIT_3_TEMPERATURE.id,
        "Actual",
    ),
    CapabilityProbe::field(
        Capability::HeatingCircuit4,
        known::FLOW_CIRCUIT_4_TEMPERATURE.id,
        "Actual",
    ),
];

/// The probes that apply to devices of `model`.
#[must_use]
pub fn probes_for(model: DeviceModel) -> &'static [CapabilityProbe] {
    match model {
        DeviceModel::Vitocal => &VITOCAL_PROBES,
        DeviceModel::Vitoair | DeviceModel::Vitodens | DeviceModel::Vitocharge => &[],
    }
}

/// The set of capabilities detected for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    set: BTreeSet<Capability>,
}

impl Capabilities {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `capability` was detected.
    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.set.contains(&capability)
    }

    /// Adds a capability.
    pub fn insert(&mut self, capability: Capability) {
        self.set.insert(capability);
    }

    /// Iterates over the detected capabilities in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.set.iter().copied()
    }

    /// Number of detected capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Returns true if nothing was detected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self {
            set: iter.into_iter().collect(),
        }
    }
}

/// Detects device capabilities with one batched read per device.
pub struct CapabilityProber<B: Bus> {
    correlator: Arc<Correlator<B>>,
    timeout: Duration,
}

impl<B: Bus> CapabilityProber<B> {
    /// Creates a prober waiting at most `timeout` for the probe replies of
    /// one device.
    #[must_use]
    pub fn new(correlator: Arc<Correlator<B>>, timeout: Duration) -> Self {
        Self {
            correlator,
            timeout,
        }
    }

    /// Detects the capabilities of `device` from its model's probe table.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Timeout` if none of the probe features
    /// replied, or the transport error if the exchange failed.
    pub async fn probe(&self, device: &Device) -> Result<Capabilities, ProtocolError> {
        self.probe_with(device, probes_for(device.model())).await
    }

    /// Detects capabilities of `device` using explicit probes.
    ///
    /// Probes for features the device does not publish are skipped. Without
    /// any applicable probe nothing is sent and the result is empty.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Timeout` if none of the probe features
    /// replied, or the transport error if the exchange failed.
    pub async fn probe_with(
        &self,
        device: &Device,
        probes: &[CapabilityProbe],
    ) -> Result<Capabilities, ProtocolError> {
        let applicable: Vec<(&CapabilityProbe, &str)> = probes
            .iter()
            .filter_map(|probe| device.topic_for(probe.feature).map(|topic| (probe, topic)))
            .collect();
        if applicable.is_empty() {
            tracing::debug!(device = device.id(), "No capability probes apply");
            return Ok(Capabilities::new());
        }

        let features: Vec<FeatureId> = applicable
            .iter()
            .map(|(probe, _)| probe.feature)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let topics: Vec<String> = applicable
            .iter()
            .map(|(_, topic)| (*topic).to_string())
            .collect();

        let request = Request::read(device.id(), features);
        let replies: HashMap<String, String> = self
            .correlator
            .exchange_partial(Some(&request), &topics, self.timeout)
            .await?;

        let capabilities: Capabilities = applicable
            .iter()
            .filter(|(probe, topic)| {
                replies
                    .get(*topic)
                    .is_some_and(|payload| probe.predicate.evaluate(payload))
            })
            .map(|(probe, _)| probe.capability)
            .collect();

        tracing::info!(
            device = device.id(),
            probed = applicable.len(),
            replied = replies.len(),
            detected = capabilities.len(),
            "Capability probe finished"
        );
        Ok(capabilities)
    }

    /// Probes every device of the installation, one after another.
    ///
    /// # Errors
    ///
    /// Stops at the first device whose probe fails and returns its error.
    pub async fn probe_all(
        &self,
        system: &SystemInformation,
    ) -> Result<BTreeMap<DeviceId, Capabilities>, ProtocolError> {
        let mut all = BTreeMap::new();
        for device in system.devices() {
            let capabilities = self.probe(device).await?;
            all.insert(device.id(), capabilities);
        }
        Ok(all)
    }
}

impl<B: Bus> fmt::Debug for CapabilityProber<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityProber")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MemoryBus;

    const COMMAND: &str = "open3e/cmnd";

    fn prober(bus: &Arc<MemoryBus>) -> CapabilityProber<MemoryBus> {
        let correlator = Arc::new(Correlator::new(Arc::clone(bus), COMMAND));
        CapabilityProber::new(correlator, Duration::from_secs(10))
    }

    fn vitocal() -> Device {
        Device::new(1, DeviceModel::Vitocal)
            .with_feature_topic(2405, "open3e/1_2405")
            .with_feature_topic(334, "open3e/1_334")
            .with_feature_topic(286, "open3e/1_286")
            .with_feature_topic(1776, "open3e/1_1776")
    }

    fn respond_with(bus: &MemoryBus, replies: Vec<(&'static str, &'static str)>) {
        bus.on_publish(move |topic, _| {
            if topic == COMMAND {
                replies
                    .iter()
                    .map(|(t, p)| ((*t).to_string(), (*p).to_string()))
                    .collect()
            } else {
                Vec::new()
            }
        });
    }

    #[test]
    fn predicate_differs_from() {
        let predicate = ProbePredicate::DiffersFrom(FAN_NOT_INSTALLED);
        assert!(predicate.evaluate("40"));
        assert!(!predicate.evaluate("255"));
        assert!(!predicate.evaluate("255.0"));
        assert!(predicate.evaluate("\"on\""));
        assert!(!predicate.evaluate("garbage"));
    }

    #[test]
    fn predicate_field_differs_from() {
        let predicate = ProbePredicate::FieldDiffersFrom {
            field: "Actual",
            sentinel: UNAVAILABLE_VALUE,
        };
        assert!(predicate.evaluate(r#"{"Actual": 21.5, "Minimum": 18.0}"#));
        assert!(!predicate.evaluate(r#"{"Actual": -3276.8}"#));
        assert!(predicate.evaluate(r#"{"Actual": "n/a"}"#));
        assert!(!predicate.evaluate(r#"{"Minimum": 18.0}"#));
        assert!(!predicate.evaluate("21.5"));
    }

    #[test]
    fn only_vitocal_has_probes() {
        assert_eq!(probes_for(DeviceModel::Vitocal).len(), 9);
        assert!(probes_for(DeviceModel::Vitoair).is_empty());
        assert!(probes_for(DeviceModel::Vitodens).is_empty());
        assert!(probes_for(DeviceModel::Vitocharge).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn three_probes_two_replies_one_match() {
        let bus = Arc::new(MemoryBus::new());
        respond_with(
            &bus,
            vec![
                ("open3e/1_334", r#"{"Actual": 21.5}"#),
                ("open3e/1_286", r#"{"Actual": -3276.8}"#),
            ],
        );
        let probes = [
            CapabilityProbe::field(Capability::Room1Temperature, 334, "Actual"),
            CapabilityProbe::field(Capability::HeatingCircuit2, 286, "Actual"),
            CapabilityProbe::field(Capability::Cooling, 2405, "EffectiveSetTemperature"),
        ];

        let caps = prober(&bus).probe_with(&vitocal(), &probes).await.unwrap();

        assert_eq!(caps.len(), 1);
        assert!(caps.contains(Capability::Room1Temperature));
        assert_eq!(bus.unsubscribed().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_sends_one_batched_request() {
        let bus = Arc::new(MemoryBus::new());
        respond_with(
            &bus,
            vec![
                ("open3e/1_2405", r#"{"EffectiveSetTemperature": 18.0}"#),
                ("open3e/1_1776", "40"),
                ("open3e/1_334", "not json"),
            ],
        );

        let caps = prober(&bus).probe(&vitocal()).await.unwrap();

        assert_eq!(
            bus.published_to(COMMAND),
            vec![r#"{"mode":"read-json","addr":"1","data":[286,334,1776,2405]}"#.to_string()]
        );
        assert_eq!(
            caps.iter().collect::<Vec<_>>(),
            vec![Capability::Cooling, Capability::Fan2]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_numeric_reply_counts_as_present() {
        let bus = Arc::new(MemoryBus::new());
        respond_with(
            &bus,
            vec![
                ("open3e/1_1776", "\"on\""),
                ("open3e/1_334", r#"{"Actual": "n/a"}"#),
                ("open3e/1_286", r#"{"Minimum": 10.0}"#),
            ],
        );

        let caps = prober(&bus).probe(&vitocal()).await.unwrap();

        assert_eq!(
            caps.iter().collect::<Vec<_>>(),
            vec![Capability::Room1Temperature, Capability::Fan2]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn total_silence_is_an_error() {
        let bus = Arc::new(MemoryBus::new());

        let err = prober(&bus).probe(&vitocal()).await.unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn device_without_probes_skips_bus() {
        let bus = Arc::new(MemoryBus::new());
        let device = Device::new(2, DeviceModel::Vitoair).with_feature_topic(268, "open3e/2_268");

        let caps = prober(&bus).probe(&device).await.unwrap();

        assert!(caps.is_empty());
        assert!(bus.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_all_covers_every_device() {
        let bus = Arc::new(MemoryBus::new());
        respond_with(&bus, vec![("open3e/1_286", r#"{"Actual": 35.0}"#)]);
        let system = SystemInformation::new(vec![
            vitocal(),
            Device::new(2, DeviceModel::Vitodens),
        ]);

        let all = prober(&bus).probe_all(&system).await.unwrap();

        assert_eq!(all.len(), 2);
        assert!(all[&1].contains(Capability::HeatingCircuit2));
        assert!(all[&2].is_empty());
    }
}
