// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus abstraction and wire protocol for talking to an Open3e server.
//!
//! The Open3e server listens on a command topic for JSON requests and answers
//! on per-feature topics. This module provides:
//!
//! - [`Bus`]: the publish/subscribe primitives the engine is built on
//! - [`MqttBus`]: a [`Bus`] backed by an MQTT broker connection
//! - [`MemoryBus`]: an in-process [`Bus`] with scripted replies
//! - [`Request`] and [`CommandSender`]: the bit-exact request payloads

mod command;
mod memory_bus;
#[cfg(feature = "mqtt")]
mod mqtt_bus;
pub(crate) mod reply_collector;
mod request;
mod topic_router;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub use command::CommandSender;
pub use memory_bus::MemoryBus;
#[cfg(feature = "mqtt")]
pub use mqtt_bus::{MqttBus, MqttBusBuilder, MqttBusConfig};
pub use reply_collector::ReplyPolicy;
pub use request::{Request, WriteTarget};

use crate::error::ProtocolError;

/// Callback invoked with `(topic, payload)` for every message on a
/// subscribed topic.
///
/// Callbacks run on the transport's receive path and must not block.
pub type MessageCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Handle identifying one subscription, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64, topic: impl Into<String>) -> Self {
        Self {
            id,
            topic: topic.into(),
        }
    }

    /// Returns the raw subscription id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the topic filter this handle subscribes to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({}, {})", self.id, self.topic)
    }
}

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BusMessage {
    /// The topic the message arrived on.
    pub(crate) topic: String,
    /// The raw payload.
    pub(crate) payload: String,
}

impl BusMessage {
    #[must_use]
    pub(crate) fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Publish/subscribe primitives of the underlying message bus.
///
/// Delivery is at-most-once per publish and ordered per topic only.
/// Implementations hand every incoming message to the callbacks of matching
/// subscriptions.
pub trait Bus: Send + Sync + 'static {
    /// Publishes a payload to a topic.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the transport rejects the publish.
    fn publish(
        &self,
        topic: &str,
        payload: String,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;

    /// Subscribes a callback to a topic filter.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the transport rejects the subscription.
    fn subscribe(
        &self,
        topic: &str,
        callback: MessageCallback,
    ) -> impl Future<Output = Result<SubscriptionHandle, ProtocolError>> + Send;

    /// Removes a subscription. Unknown handles are ignored.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the transport rejects the unsubscribe.
    fn unsubscribe(
        &self,
        handle: &SubscriptionHandle,
    ) -> impl Future<Output = Result<(), ProtocolError>> + Send;
}
