// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fire-and-forget publishing of requests on the command topic.

use std::sync::Arc;
use std::time::Duration;

use super::{Bus, Request};
use crate::error::ProtocolError;
use crate::feature::{DeviceId, FeatureId};

/// Publishes [`Request`]s on the Open3e command topic.
///
/// Writes and reads sent through the sender are not correlated with replies;
/// replies reach whoever subscribed to the feature topics.
pub struct CommandSender<B: Bus> {
    bus: Arc<B>,
    command_topic: String,
}

impl<B: Bus> CommandSender<B> {
    /// Creates a sender publishing on `command_topic`.
    #[must_use]
    pub fn new(bus: Arc<B>, command_topic: impl Into<String>) -> Self {
        Self {
            bus,
            command_topic: command_topic.into(),
        }
    }

    /// Returns the command topic.
    #[must_use]
    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    /// Publishes a request.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if encoding or publishing fails.
    pub async fn send(&self, request: &Request) -> Result<(), ProtocolError> {
        let payload = request.to_payload()?;
        tracing::debug!(
            topic = %self.command_topic,
            payload = %payload,
            "Publishing Open3e request"
        );
        self.bus.publish(&self.command_topic, payload).await
    }

    /// Publishes a batched read request for one device.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if publishing fails.
    pub async fn request_read(
        &self,
        device: DeviceId,
        features: Vec<FeatureId>,
    ) -> Result<(), ProtocolError> {
        self.send(&Request::read(device, features)).await
    }

    /// Re-reads features after `delay` in a background task.
    ///
    /// The server applies writes asynchronously; reading back immediately
    /// returns the old value. Failures are logged.
    pub fn request_read_after(&self, device: DeviceId, features: Vec<FeatureId>, delay: Duration) {
        let sender = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = sender.request_read(device, features).await {
                tracing::warn!(device, error = %e, "Delayed refresh failed");
            }
        });
    }
}

impl<B: Bus> Clone for CommandSender<B> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
            command_topic: self.command_topic.clone(),
        }
    }
}

impl<B: Bus> std::fmt::Debug for CommandSender<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSender")
            .field("command_topic", &self.command_topic)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MemoryBus;

    #[tokio::test]
    async fn send_publishes_on_command_topic() {
        let bus = Arc::new(MemoryBus::new());
        let sender = CommandSender::new(Arc::clone(&bus), "open3e/cmnd");

        sender.request_read(1, vec![268, 269]).await.unwrap();

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "open3e/cmnd");
        assert_eq!(
            published[0].1,
            r#"{"mode":"read-json","addr":"1","data":[268,269]}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_read_waits() {
        let bus = Arc::new(MemoryBus::new());
        let sender = CommandSender::new(Arc::clone(&bus), "open3e/cmnd");

        sender.request_read_after(1, vec![396], Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert!(bus.published().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn send_propagates_publish_failure() {
        let bus = Arc::new(MemoryBus::new());
        bus.fail_publishes_to("open3e/cmnd");
        let sender = CommandSender::new(Arc::clone(&bus), "open3e/cmnd");

        let err = sender.request_read(1, vec![268]).await.unwrap_err();
        assert!(err.is_transport());
    }
}
