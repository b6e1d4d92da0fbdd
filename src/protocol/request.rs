// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request payloads understood by the Open3e server.
//!
//! All requests are compact JSON objects published on the command topic.
//! Field order matters to some server versions and is fixed: `mode`, then
//! `addr`, then `data`.
//!
//! | Request | Payload |
//! |---------|---------|
//! | read | `{"mode":"read-json","addr":"7","data":[268,269]}` |
//! | write | `{"mode":"write","addr":"7","data":[[396,"50.0"]]}` |
//! | raw write | `{"mode":"write-raw","addr":"7","data":[[1415,"0102"]]}` |
//! | topology | `{"mode":"config"}` |
//! | system information | `{"mode":"system-information"}` |

use std::fmt;

use serde::{Serialize, Serializer};

use crate::error::ProtocolError;
use crate::feature::{DeviceId, FeatureId};

/// The target of a write: a whole feature or one field of a structured
/// feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WriteTarget {
    /// The whole feature, encoded as its numeric id.
    Feature(FeatureId),
    /// A named sub-field, encoded as `"<id>.<field>"`.
    SubField(FeatureId, String),
}

impl WriteTarget {
    /// Returns the feature id being written.
    #[must_use]
    pub fn feature(&self) -> FeatureId {
        match self {
            Self::Feature(id) | Self::SubField(id, _) => *id,
        }
    }
}

impl From<FeatureId> for WriteTarget {
    fn from(id: FeatureId) -> Self {
        Self::Feature(id)
    }
}

impl fmt::Display for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feature(id) => write!(f, "{id}"),
            Self::SubField(id, field) => write!(f, "{id}.{field}"),
        }
    }
}

impl Serialize for WriteTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Feature(id) => serializer.serialize_u16(*id),
            Self::SubField(..) => serializer.collect_str(self),
        }
    }
}

/// A request published on the Open3e command topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode")]
pub enum Request {
    /// Read features; each is answered on its own topic as JSON.
    #[serde(rename = "read-json")]
    Read {
        /// The device address.
        #[serde(serialize_with = "addr_as_string")]
        addr: DeviceId,
        /// The features to read.
        data: Vec<FeatureId>,
    },

    /// Write JSON-encoded values.
    #[serde(rename = "write")]
    Write {
        /// The device address.
        #[serde(serialize_with = "addr_as_string")]
        addr: DeviceId,
        /// `(target, json-encoded value)` pairs.
        data: Vec<(WriteTarget, String)>,
    },

    /// Write raw hex-encoded values.
    #[serde(rename = "write-raw")]
    WriteRaw {
        /// The device address.
        #[serde(serialize_with = "addr_as_string")]
        addr: DeviceId,
        /// `(feature, hex string)` pairs.
        data: Vec<(FeatureId, String)>,
    },

    /// Request the server topology.
    #[serde(rename = "config")]
    Config,

    /// Request the system information (devices and their feature topics).
    #[serde(rename = "system-information")]
    SystemInformation,
}

fn addr_as_string<S: Serializer>(addr: &DeviceId, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(addr)
}

impl Request {
    /// Creates a batched read request for one device.
    #[must_use]
    pub fn read(device: DeviceId, features: Vec<FeatureId>) -> Self {
        Self::Read {
            addr: device,
            data: features,
        }
    }

    /// Creates a write request; `value` is JSON-encoded into a string.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Encode` if the value cannot be serialized.
    pub fn write<T: Serialize + ?Sized>(
        device: DeviceId,
        target: WriteTarget,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        let encoded =
            serde_json::to_string(value).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self::Write {
            addr: device,
            data: vec![(target, encoded)],
        })
    }

    /// Creates a raw write request with a hex-encoded value.
    #[must_use]
    pub fn write_raw(device: DeviceId, feature: FeatureId, hex: impl Into<String>) -> Self {
        Self::WriteRaw {
            addr: device,
            data: vec![(feature, hex.into())],
        }
    }

    /// Returns the device this request addresses, if any.
    #[must_use]
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Self::Read { addr, .. } | Self::Write { addr, .. } | Self::WriteRaw { addr, .. } => {
                Some(*addr)
            }
            Self::Config | Self::SystemInformation => None,
        }
    }

    /// Encodes the request as the JSON payload sent on the wire.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Encode` if serialization fails.
    pub fn to_payload(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}
