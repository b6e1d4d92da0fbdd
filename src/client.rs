// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level client for an Open3e server.
//!
//! [`Open3eClient`] ties the pieces together: discovery and availability
//! through one-shot exchanges, capability probing, interest tracking in the
//! [`EndpointRegistry`], the [`RefreshScheduler`] and fire-and-forget
//! writes.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use open3e_lib::{DeviceId, FeatureId, Open3eClient, Open3eConfig, RefreshInterval};
//! use open3e_lib::protocol::MqttBus;
//!
//! # async fn example() -> open3e_lib::Result<()> {
//! let bus = MqttBus::builder().host("192.168.1.50").build().await?;
//! let client = Open3eClient::new(Arc::new(bus), Open3eConfig::default());
//!
//! let discovered = client.setup().await?;
//! let device = &discovered.system.devices()[0];
//!
//! let watch = client
//!     .watch_features(
//!         device,
//!         &[268, 269],
//!         RefreshInterval::secs(5),
//!         Arc::new(|device: DeviceId, feature: FeatureId, payload: &str| {
//!             println!("{device}:{feature} = {payload}");
//!         }),
//!     )
//!     .await?;
//! client.start();
//!
//! // ...
//!
//! client.unwatch_features(watch).await;
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, watch};

use crate::availability::Availability;
use crate::capabilities::{Capabilities, CapabilityProber};
use crate::config::Open3eConfig;
use crate::correlator::Correlator;
use crate::error::{Error, ParseError, Result};
use crate::feature::{DeviceId, FeatureId, RefreshInterval};
use crate::protocol::{Bus, CommandSender, MessageCallback, Request, SubscriptionHandle, WriteTarget};
use crate::registry::EndpointRegistry;
use crate::scheduler::RefreshScheduler;
use crate::system::{Device, SystemInformation};

/// Callback invoked with `(device, feature, raw payload)` for every message
/// on a watched feature topic.
pub type FeatureCallback = Arc<dyn Fn(DeviceId, FeatureId, &str) + Send + Sync>;

/// Feature subscriptions and registered interest created by
/// [`Open3eClient::watch_features`].
///
/// Pass it back to [`Open3eClient::unwatch_features`] to release both.
#[derive(Debug)]
#[must_use = "dropping a FeatureWatch leaks its subscriptions; pass it to unwatch_features"]
pub struct FeatureWatch {
    device: DeviceId,
    features: Vec<FeatureId>,
    handles: Vec<SubscriptionHandle>,
}

impl FeatureWatch {
    /// The watched device.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The watched features.
    #[must_use]
    pub fn features(&self) -> &[FeatureId] {
        &self.features
    }
}

/// Everything learned while setting up the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredSystem {
    /// The devices on the server.
    pub system: SystemInformation,
    /// Detected capabilities per device.
    pub capabilities: BTreeMap<DeviceId, Capabilities>,
}

impl DiscoveredSystem {
    /// The discovered device with address `id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownDevice` if no such device was discovered.
    pub fn device(&self, id: DeviceId) -> Result<&Device> {
        self.system.device(id).ok_or(Error::UnknownDevice(id))
    }

    /// The capabilities detected for `device`.
    #[must_use]
    pub fn capabilities_of(&self, device: DeviceId) -> Option<&Capabilities> {
        self.capabilities.get(&device)
    }
}

/// Client for one Open3e server.
pub struct Open3eClient<B: Bus> {
    bus: Arc<B>,
    config: Open3eConfig,
    registry: Arc<EndpointRegistry>,
    sender: CommandSender<B>,
    correlator: Arc<Correlator<B>>,
    prober: CapabilityProber<B>,
    scheduler: RefreshScheduler<B>,
    availability: Arc<watch::Sender<Availability>>,
    availability_watch: Mutex<Option<SubscriptionHandle>>,
}

impl<B: Bus> Open3eClient<B> {
    /// Creates a client; nothing is sent until a method is called.
    #[must_use]
    pub fn new(bus: Arc<B>, config: Open3eConfig) -> Self {
        let registry = Arc::new(EndpointRegistry::new());
        let sender = CommandSender::new(Arc::clone(&bus), config.command_topic());
        let correlator = Arc::new(
            Correlator::new(Arc::clone(&bus), config.command_topic())
                .with_settle_delay(config.settle_delay()),
        );
        let prober = CapabilityProber::new(Arc::clone(&correlator), config.probe_timeout());
        let scheduler = RefreshScheduler::new(Arc::clone(&registry), sender.clone());
        let (availability, _) = watch::channel(Availability::Unknown);

        Self {
            bus,
            config,
            registry,
            sender,
            correlator,
            prober,
            scheduler,
            availability: Arc::new(availability),
            availability_watch: Mutex::new(None),
        }
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &Open3eConfig {
        &self.config
    }

    /// The interest registry driving the scheduler.
    #[must_use]
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// The correlator used for one-shot exchanges.
    #[must_use]
    pub fn correlator(&self) -> &Arc<Correlator<B>> {
        &self.correlator
    }

    // ---- Availability ----

    /// The last known server availability.
    #[must_use]
    pub fn availability(&self) -> Availability {
        *self.availability.borrow()
    }

    /// Reads the retained availability message once.
    ///
    /// # Errors
    ///
    /// Returns `Error::ServerUnavailable` if the server reports anything
    /// other than online, or a protocol error if no message arrives.
    pub async fn check_availability(&self) -> Result<()> {
        let topic = self.config.availability_topic();
        let replies = self
            .correlator
            .exchange(None, std::slice::from_ref(&topic), self.config.exchange_timeout())
            .await?;

        let payload = replies.get(&topic).map(String::as_str).unwrap_or_default();
        let state = Availability::from_payload(payload);
        self.availability.send_replace(state);
        tracing::debug!(%state, "Checked Open3e availability");

        if state.is_online() {
            Ok(())
        } else {
            Err(Error::ServerUnavailable(payload.to_string()))
        }
    }

    /// Follows the availability topic for the lifetime of the client.
    ///
    /// Once watched, the refresh scheduler only publishes while the server
    /// is online. Calling this again returns a new receiver for the same
    /// subscription.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if subscribing fails.
    pub async fn watch_availability(&self) -> Result<watch::Receiver<Availability>> {
        let mut slot = self.availability_watch.lock().await;
        if slot.is_none() {
            let tx = Arc::clone(&self.availability);
            let callback: MessageCallback = Arc::new(move |_: &str, payload: &str| {
                let state = Availability::from_payload(payload);
                if tx.send_replace(state) != state {
                    tracing::info!(%state, "Open3e server availability changed");
                }
            });
            let handle = self
                .bus
                .subscribe(&self.config.availability_topic(), callback)
                .await?;
            *slot = Some(handle);
            self.scheduler
                .set_availability_gate(self.availability.subscribe());
        }
        Ok(self.availability.subscribe())
    }

    // ---- Discovery ----

    /// Requests the devices of the installation.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the server does not answer and a parse
    /// error if the answer is malformed.
    pub async fn system_information(&self) -> Result<SystemInformation> {
        let payload = self
            .single_reply(&Request::SystemInformation, self.config.system_information_topic())
            .await?;
        let system = SystemInformation::from_json(&payload)?;
        tracing::info!(devices = system.devices().len(), "Received system information");
        Ok(system)
    }

    /// Requests the raw server topology.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the server does not answer and a parse
    /// error if the answer is not JSON.
    pub async fn topology(&self) -> Result<serde_json::Value> {
        let payload = self
            .single_reply(&Request::Config, self.config.config_topic())
            .await?;
        serde_json::from_str(&payload).map_err(|e| Error::Parse(ParseError::Json(e)))
    }

    /// Detects the capabilities of every device.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a device answers none of its probes.
    pub async fn probe_capabilities(
        &self,
        system: &SystemInformation,
    ) -> Result<BTreeMap<DeviceId, Capabilities>> {
        Ok(self.prober.probe_all(system).await?)
    }

    /// Checks availability, starts following it, discovers the devices and
    /// probes their capabilities.
    ///
    /// # Errors
    ///
    /// Fails with the first step that fails.
    pub async fn setup(&self) -> Result<DiscoveredSystem> {
        self.check_availability().await?;
        self.watch_availability().await?;
        let system = self.system_information().await?;
        let capabilities = self.probe_capabilities(&system).await?;

        tracing::info!(devices = system.devices().len(), "Open3e setup complete");
        Ok(DiscoveredSystem {
            system,
            capabilities,
        })
    }

    async fn single_reply(&self, request: &Request, topic: String) -> Result<String> {
        let mut replies = self
            .correlator
            .exchange(
                Some(request),
                std::slice::from_ref(&topic),
                self.config.exchange_timeout(),
            )
            .await?;
        replies
            .remove(&topic)
            .ok_or(Error::Parse(ParseError::MissingField(topic)))
    }

    // ---- Interest and watches ----

    /// Records interest in features so the scheduler refreshes them.
    pub fn register_interest(
        &self,
        device: DeviceId,
        features: &[FeatureId],
        interval: RefreshInterval,
    ) {
        self.registry.register_interest(device, features, interval);
    }

    /// Withdraws interest recorded with
    /// [`register_interest`](Self::register_interest).
    pub fn deregister_interest(&self, device: DeviceId, features: &[FeatureId]) {
        self.registry.deregister_interest(device, features);
    }

    /// Subscribes `callback` to the topics of `features` and registers
    /// interest in them.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownFeature` if the device does not publish one of
    /// the features, or a protocol error if subscribing fails. Nothing is
    /// left subscribed or registered on error.
    pub async fn watch_features(
        &self,
        device: &Device,
        features: &[FeatureId],
        interval: RefreshInterval,
        callback: FeatureCallback,
    ) -> Result<FeatureWatch> {
        let topics = feature_topics(device, features)?;
        let device_id = device.id();

        let mut handles = Vec::with_capacity(topics.len());
        for (feature, topic) in topics {
            let callback = Arc::clone(&callback);
            let forward: MessageCallback = Arc::new(move |_: &str, payload: &str| {
                callback(device_id, feature, payload);
            });
            match self.bus.subscribe(&topic, forward).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.release(&handles).await;
                    return Err(e.into());
                }
            }
        }

        self.registry
            .register_interest(device_id, features, interval);
        tracing::debug!(device = device_id, ?features, "Watching features");
        Ok(FeatureWatch {
            device: device_id,
            features: features.to_vec(),
            handles,
        })
    }

    /// Releases the subscriptions and interest of a watch.
    pub async fn unwatch_features(&self, watch: FeatureWatch) {
        self.release(&watch.handles).await;
        self.registry
            .deregister_interest(watch.device, &watch.features);
        tracing::debug!(device = watch.device, features = ?watch.features, "Unwatched features");
    }

    async fn release(&self, handles: &[SubscriptionHandle]) {
        for handle in handles {
            if let Err(e) = self.bus.unsubscribe(handle).await {
                tracing::warn!(topic = %handle.topic(), error = %e, "Failed to unsubscribe");
            }
        }
    }

    // ---- Commands ----

    /// Writes a JSON-encodable value and re-reads the feature shortly
    /// after.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if encoding or publishing fails.
    pub async fn request_write<T: Serialize + ?Sized>(
        &self,
        device: DeviceId,
        target: WriteTarget,
        value: &T,
    ) -> Result<()> {
        let feature = target.feature();
        let request = Request::write(device, target, value)?;
        self.sender.send(&request).await?;
        self.sender
            .request_read_after(device, vec![feature], self.config.write_refresh_delay());
        Ok(())
    }

    /// Writes a raw hex-encoded value and re-reads the feature shortly
    /// after.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if publishing fails.
    pub async fn request_write_raw(
        &self,
        device: DeviceId,
        feature: FeatureId,
        hex: impl Into<String>,
    ) -> Result<()> {
        self.sender
            .send(&Request::write_raw(device, feature, hex))
            .await?;
        self.sender
            .request_read_after(device, vec![feature], self.config.write_refresh_delay());
        Ok(())
    }

    /// Requests an immediate read; replies reach the feature watches.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if publishing fails.
    pub async fn request_refresh(&self, device: DeviceId, features: Vec<FeatureId>) -> Result<()> {
        Ok(self.sender.request_read(device, features).await?)
    }

    /// Reads features once and waits for every reply.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownFeature` if the device does not publish one of
    /// the features and a protocol error on timeout or transport failure.
    pub async fn request_one_shot(
        &self,
        device: &Device,
        features: &[FeatureId],
    ) -> Result<HashMap<FeatureId, String>> {
        let topics: Vec<String> = feature_topics(device, features)?
            .into_iter()
            .map(|(_, topic)| topic)
            .collect();
        let request = Request::read(device.id(), features.to_vec());
        let replies = self
            .correlator
            .exchange(Some(&request), &topics, self.config.exchange_timeout())
            .await?;

        Ok(replies
            .into_iter()
            .filter_map(|(topic, payload)| {
                device.feature_for_topic(&topic).map(|feature| (feature, payload))
            })
            .collect())
    }

    // ---- Scheduler ----

    /// Starts the refresh scheduler with the configured tick interval.
    pub fn start(&self) {
        self.scheduler.start(self.config.tick_interval());
    }

    /// Stops the refresh scheduler.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Returns true while the refresh scheduler runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Stops the scheduler and releases the availability subscription.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        if let Some(handle) = self.availability_watch.lock().await.take() {
            self.release(std::slice::from_ref(&handle)).await;
        }
    }
}

impl<B: Bus> std::fmt::Debug for Open3eClient<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Open3eClient")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .field("availability", &self.availability())
            .finish_non_exhaustive()
    }
}

/// Pairs each feature with its topic on `device`.
fn feature_topics(device: &Device, features: &[FeatureId]) -> Result<Vec<(FeatureId, String)>> {
    features
        .iter()
        .map(|&feature| {
            device
                .topic_for(feature)
                .map(|topic| (feature, topic.to_string()))
                .ok_or(Error::UnknownFeature {
                    device: device.id(),
                    feature,
                })
        })
        .collect()
}
