// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Devices reported by the Open3e server.
//!
//! The server answers a system-information request with every device on the
//! bus and the topic each of its features is published on:
//!
//! ```json
//! {"devices": [{
//!     "id": 1,
//!     "name": "HPMUMASTER",
//!     "serial_number": "7723456789012345",
//!     "software_version": "2.14.0",
//!     "hardware_version": "1.0",
//!     "features": [{"id": 268, "topic": "open3e/1_268_FlowTemperature"}]
//! }]}
//! ```
//!
//! Devices whose name matches no [`DeviceModel`] are skipped.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Deserialize;

use crate::error::ParseError;
use crate::feature::{DeviceId, FeatureId};

/// Appliance families known to the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceModel {
    /// Heat pump (`HPMU` controller).
    Vitocal,
    /// Ventilation unit (`VCU` controller).
    Vitoair,
    /// Gas boiler (`HMU` controller).
    Vitodens,
    /// Battery storage (`EMCU` controller).
    Vitocharge,
}

impl DeviceModel {
    /// All known models, in matching order.
    pub const ALL: [Self; 4] = [
        Self::Vitocal,
        Self::Vitoair,
        Self::Vitodens,
        Self::Vitocharge,
    ];

    /// The controller identifier contained in the reported device name.
    #[must_use]
    pub const fn controller(self) -> &'static str {
        match self {
            Self::Vitocal => "HPMU",
            Self::Vitoair => "VCU",
            Self::Vitodens => "HMU",
            Self::Vitocharge => "EMCU",
        }
    }

    /// Human-readable model name.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Vitocal => "Vitocal",
            Self::Vitoair => "Vitoair",
            Self::Vitodens => "Vitodens",
            Self::Vitocharge => "Vitocharge",
        }
    }

    /// Identifies the model from the name reported by the server.
    ///
    /// # Examples
    ///
    /// ```
    /// use open3e_lib::DeviceModel;
    ///
    /// assert_eq!(DeviceModel::from_reported_name("HPMUMASTER"), Some(DeviceModel::Vitocal));
    /// assert_eq!(DeviceModel::from_reported_name("UNKNOWN"), None);
    /// ```
    #[must_use]
    pub fn from_reported_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|model| name.contains(model.controller()))
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// A device discovered on the Open3e server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    id: DeviceId,
    model: DeviceModel,
    serial_number: Option<String>,
    software_version: Option<String>,
    hardware_version: Option<String>,
    feature_topics: BTreeMap<FeatureId, String>,
}

impl Device {
    /// Creates a device without serial number, versions or features.
    #[must_use]
    pub fn new(id: DeviceId, model: DeviceModel) -> Self {
        Self {
            id,
            model,
            serial_number: None,
            software_version: None,
            hardware_version: None,
            feature_topics: BTreeMap::new(),
        }
    }

    /// Sets the serial number.
    #[must_use]
    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    /// Adds the topic a feature is published on.
    #[must_use]
    pub fn with_feature_topic(mut self, feature: FeatureId, topic: impl Into<String>) -> Self {
        self.feature_topics.insert(feature, topic.into());
        self
    }

    /// The device address.
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// The appliance family.
    #[must_use]
    pub fn model(&self) -> DeviceModel {
        self.model
    }

    /// The model name, e.g. `Vitocal`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.model.display_name()
    }

    /// The serial number, if reported.
    #[must_use]
    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    /// The software version, if reported.
    #[must_use]
    pub fn software_version(&self) -> Option<&str> {
        self.software_version.as_deref()
    }

    /// The hardware version, if reported.
    #[must_use]
    pub fn hardware_version(&self) -> Option<&str> {
        self.hardware_version.as_deref()
    }

    /// Feature id to reply topic.
    #[must_use]
    pub fn feature_topics(&self) -> &BTreeMap<FeatureId, String> {
        &self.feature_topics
    }

    /// Returns true if the device publishes `feature`.
    #[must_use]
    pub fn has_feature(&self, feature: FeatureId) -> bool {
        self.feature_topics.contains_key(&feature)
    }

    /// The topic `feature` is published on.
    #[must_use]
    pub fn topic_for(&self, feature: FeatureId) -> Option<&str> {
        self.feature_topics.get(&feature).map(String::as_str)
    }

    /// Topics of the given features; features the device lacks are skipped.
    #[must_use]
    pub fn topics_for(&self, features: &[FeatureId]) -> Vec<String> {
        features
            .iter()
            .filter_map(|f| self.feature_topics.get(f).cloned())
            .collect()
    }

    /// The feature published on `topic`, if any.
    #[must_use]
    pub fn feature_for_topic(&self, topic: &str) -> Option<FeatureId> {
        self.feature_topics
            .iter()
            .find(|(_, t)| t.as_str() == topic)
            .map(|(id, _)| *id)
    }
}

/// The devices of one Open3e installation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemInformation {
    devices: Vec<Device>,
}

#[derive(Deserialize)]
struct SystemInformationPayload {
    devices: Vec<DevicePayload>,
}

#[derive(Deserialize)]
struct DevicePayload {
    id: DeviceId,
    name: String,
    #[serde(default)]
    serial_number: Option<String>,
    #[serde(default)]
    software_version: Option<String>,
    #[serde(default)]
    hardware_version: Option<String>,
    #[serde(default)]
    features: Vec<FeaturePayload>,
}

#[derive(Deserialize)]
struct FeaturePayload {
    id: FeatureId,
    topic: String,
}

impl SystemInformation {
    /// Wraps an already known device list.
    #[must_use]
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    /// Parses the system-information reply.
    ///
    /// # Errors
    ///
    /// Returns `ParseError::Json` if the payload is not the expected JSON
    /// document and `ParseError::UnexpectedFormat` if a device id is
    /// reported twice.
    pub fn from_json(payload: &str) -> Result<Self, ParseError> {
        let parsed: SystemInformationPayload = serde_json::from_str(payload)?;

        let mut seen = HashSet::with_capacity(parsed.devices.len());
        if let Some(duplicate) = parsed.devices.iter().find(|raw| !seen.insert(raw.id)) {
            return Err(ParseError::UnexpectedFormat(format!(
                "device {} reported twice",
                duplicate.id
            )));
        }

        let devices = parsed
            .devices
            .into_iter()
            .filter_map(|raw| {
                let Some(model) = DeviceModel::from_reported_name(&raw.name) else {
                    tracing::debug!(device = raw.id, name = %raw.name, "Skipping unknown device");
                    return None;
                };
                Some(Device {
                    id: raw.id,
                    model,
                    serial_number: raw.serial_number,
                    software_version: raw.software_version,
                    hardware_version: raw.hardware_version,
                    feature_topics: raw.features.into_iter().map(|f| (f.id, f.topic)).collect(),
                })
            })
            .collect();
        Ok(Self { devices })
    }

    /// Every known device, in reported order.
    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The device with address `id`.
    #[must_use]
    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Name to show for `device`.
    ///
    /// When several devices share a model name, the last four characters of
    /// the serial number are appended to tell them apart.
    #[must_use]
    pub fn display_name(&self, device: &Device) -> String {
        let duplicates = self
            .devices
            .iter()
            .filter(|d| d.model == device.model)
            .count();
        match device.serial_number() {
            Some(serial) if duplicates > 1 => {
                let start = serial
                    .char_indices()
                    .rev()
                    .nth(3)
                    .map_or(0, |(index, _)| index);
                format!("{} ({})", device.name(), &serial[start..])
            }
            _ => device.name().to_string(),
        }
    }
}
