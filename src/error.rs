// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `open3e` library.
//!
//! Failures are split by layer: bus communication ([`ProtocolError`]),
//! payload parsing ([`ParseError`]) and the top-level [`Error`] surfaced by
//! the client facade.

use thiserror::Error;

use crate::feature::{DeviceId, FeatureId};

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Error occurred during bus communication.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error occurred while parsing a reply.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The Open3e server reported itself as not online.
    #[error("open3e server is unavailable (status: {0})")]
    ServerUnavailable(String),

    /// The device does not expose a topic for the requested feature.
    #[error("device {device} has no topic for feature {feature}")]
    UnknownFeature {
        /// The device that was queried.
        device: DeviceId,
        /// The feature that has no topic.
        feature: FeatureId,
    },

    /// No device with this id was discovered.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
}

/// Errors related to bus communication.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// MQTT client call failed.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// A publish, subscribe or unsubscribe call failed.
    #[error("transport failed: {0}")]
    Transport(String),

    /// Connection to the broker failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not every expected reply arrived in time.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Invalid broker address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A request could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// Returns true if the publish/subscribe call itself failed.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        match self {
            #[cfg(feature = "mqtt")]
            Self::Mqtt(_) => true,
            Self::Transport(_) | Self::ConnectionFailed(_) => true,
            Self::Timeout(_) | Self::InvalidAddress(_) | Self::Encode(_) => false,
        }
    }

    /// Returns true if the error is a reply timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Errors related to parsing Open3e replies.
#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Expected field is missing from the reply.
    #[error("missing field in reply: {0}")]
    MissingField(String),

    /// Unexpected reply format.
    #[error("unexpected reply format: {0}")]
    UnexpectedFormat(String),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
