// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT broker connection implementing [`Bus`].
//!
//! One connection is shared by everything talking to the Open3e server:
//! the refresh scheduler, one-shot exchanges and feature watches. Several
//! local subscriptions to the same topic filter share one broker
//! subscription.
//!
//! # Examples
//!
//! ```no_run
//! use open3e_lib::protocol::{Bus, MqttBus};
//!
//! # async fn example() -> Result<(), open3e_lib::ProtocolError> {
//! let bus = MqttBus::builder()
//!     .host("192.168.1.50")
//!     .port(1883)
//!     .credentials("user", "password")
//!     .build()
//!     .await?;
//!
//! bus.publish("open3e/cmnd", r#"{"mode":"config"}"#.to_string()).await?;
//!
//! bus.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use tokio::sync::{Mutex, oneshot};

use super::topic_router::{Removal, TopicRouter};
use super::{Bus, MessageCallback, SubscriptionHandle};
use crate::error::ProtocolError;

/// Global counter for generating unique client IDs.
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Configuration for an MQTT broker connection.
#[derive(Debug, Clone)]
pub struct MqttBusConfig {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    connection_timeout: Duration,
}

impl Default for MqttBusConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            credentials: None,
            keep_alive: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl MqttBusConfig {
    /// The broker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns true if credentials are configured.
    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// The keep-alive interval.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// How long [`MqttBusBuilder::build`] waits for the broker.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }
}

/// Local subscriptions whose first/last transitions reach the broker one at
/// a time.
///
/// The router change and the broker call it triggers happen under one lock,
/// so a last unsubscribe and a new first subscribe on the same filter cannot
/// reach the broker in the wrong order.
#[derive(Default)]
struct BrokerSubscriptions {
    router: TopicRouter,
    transitions: Mutex<()>,
}

impl BrokerSubscriptions {
    /// Registers `callback`, calling `broker_subscribe` for the first
    /// subscription of the filter.
    ///
    /// Returns the handle and whether the broker was subscribed.
    async fn subscribe<F, Fut>(
        &self,
        topic: &str,
        callback: MessageCallback,
        broker_subscribe: F,
    ) -> Result<(SubscriptionHandle, bool), ProtocolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ProtocolError>>,
    {
        let _transition = self.transitions.lock().await;
        let (handle, first) = self.router.register(topic, callback);
        if first && let Err(e) = broker_subscribe().await {
            self.router.remove(&handle);
            return Err(e);
        }
        Ok((handle, first))
    }

    /// Removes a subscription, calling `broker_unsubscribe` when it was the
    /// last one of its filter.
    ///
    /// Returns whether the broker was unsubscribed.
    async fn unsubscribe<F, Fut>(
        &self,
        handle: &SubscriptionHandle,
        broker_unsubscribe: F,
    ) -> Result<bool, ProtocolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ProtocolError>>,
    {
        let _transition = self.transitions.lock().await;
        if self.router.remove(handle) == Removal::Last {
            broker_unsubscribe().await?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// A [`Bus`] backed by an MQTT broker.
///
/// `MqttBus` is cheaply cloneable (via `Arc`); clones share the connection.
#[derive(Clone)]
pub struct MqttBus {
    inner: Arc<MqttBusInner>,
}

struct MqttBusInner {
    /// The MQTT async client for publishing and subscribing.
    client: AsyncClient,
    /// Local subscriptions, keyed by topic filter.
    subscriptions: BrokerSubscriptions,
    /// Configuration used for this connection.
    config: MqttBusConfig,
    /// Connection status.
    connected: AtomicBool,
}

impl MqttBus {
    /// Creates a new builder for configuring an MQTT connection.
    #[must_use]
    pub fn builder() -> MqttBusBuilder {
        MqttBusBuilder::default()
    }

    /// Returns the connection configuration.
    #[must_use]
    pub fn config(&self) -> &MqttBusConfig {
        &self.inner.config
    }

    /// Returns whether the broker is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Returns the host address of the broker.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.config.host
    }

    /// Returns the port of the broker.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    /// Returns the number of live local subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.router.subscription_count()
    }

    /// Disconnects from the broker and drops every local subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the disconnect operation fails.
    pub async fn disconnect(&self) -> Result<(), ProtocolError> {
        tracing::info!(
            host = %self.inner.config.host,
            port = %self.inner.config.port,
            "Disconnecting from MQTT broker"
        );

        self.inner.subscriptions.router.clear();
        self.inner.client.disconnect().await?;
        self.inner.connected.store(false, Ordering::Release);
        Ok(())
    }
}

impl Bus for MqttBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), ProtocolError> {
        self.inner
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionHandle, ProtocolError> {
        let client = &self.inner.client;
        let (handle, first) = self
            .inner
            .subscriptions
            .subscribe(topic, callback, move || async move {
                client
                    .subscribe(topic, QoS::AtLeastOnce)
                    .await
                    .map_err(ProtocolError::from)
            })
            .await?;
        tracing::debug!(topic = %topic, shared = !first, "Subscribed");
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), ProtocolError> {
        let client = &self.inner.client;
        let topic = handle.topic();
        let last = self
            .inner
            .subscriptions
            .unsubscribe(handle, move || async move {
                client.unsubscribe(topic).await.map_err(ProtocolError::from)
            })
            .await?;
        if last {
            tracing::debug!(topic = %topic, "Unsubscribed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Builder for an [`MqttBus`].
///
/// # Examples
///
/// ```no_run
/// use open3e_lib::protocol::MqttBus;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), open3e_lib::ProtocolError> {
/// let bus = MqttBus::builder()
///     .host("192.168.1.50")
///     .keep_alive(Duration::from_secs(60))
///     .connection_timeout(Duration::from_secs(5))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MqttBusBuilder {
    config: MqttBusConfig,
}

impl MqttBusBuilder {
    /// Sets the broker host address.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the broker port (default: 1883).
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets authentication credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the keep-alive interval (default: 30 seconds).
    #[must_use]
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.config.keep_alive = duration;
        self
    }

    /// Sets the connection timeout (default: 10 seconds).
    #[must_use]
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connection_timeout = duration;
        self
    }

    /// Connects to the broker and waits for the connection acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAddress` if no host is set and `ConnectionFailed` if
    /// the broker does not acknowledge within the connection timeout.
    pub async fn build(self) -> Result<MqttBus, ProtocolError> {
        if self.config.host.is_empty() {
            return Err(ProtocolError::InvalidAddress(
                "MQTT broker host is required".to_string(),
            ));
        }

        let counter = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("open3e_{}_{}", std::process::id(), counter);

        let mut mqtt_options = MqttOptions::new(&client_id, &self.config.host, self.config.port);
        mqtt_options.set_keep_alive(self.config.keep_alive);
        mqtt_options.set_clean_session(true);
        if let Some((ref username, ref password)) = self.config.credentials {
            mqtt_options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 64);
        let bus = MqttBus {
            inner: Arc::new(MqttBusInner {
                client,
                subscriptions: BrokerSubscriptions::default(),
                config: self.config.clone(),
                connected: AtomicBool::new(false),
            }),
        };

        let (connack_tx, connack_rx) = oneshot::channel();
        tokio::spawn(handle_events(event_loop, Arc::clone(&bus.inner), connack_tx));

        let timeout = self.config.connection_timeout;
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(())) => {
                tracing::info!(
                    host = %self.config.host,
                    port = %self.config.port,
                    client_id = %client_id,
                    "Connected to MQTT broker"
                );
                Ok(bus)
            }
            Ok(Err(_)) => Err(ProtocolError::ConnectionFailed(
                "MQTT event loop terminated unexpectedly".to_string(),
            )),
            Err(_) => Err(ProtocolError::ConnectionFailed(format!(
                "MQTT connection timeout after {}s",
                timeout.as_secs()
            ))),
        }
    }
}

/// Drives the MQTT event loop and routes incoming publishes.
async fn handle_events(
    mut event_loop: EventLoop,
    inner: Arc<MqttBusInner>,
    connack_tx: oneshot::Sender<()>,
) {
    use rumqttc::{Event, Packet};

    let mut connack_tx = Some(connack_tx);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "MQTT broker connected");
                inner.connected.store(true, Ordering::Release);
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(());
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::debug!(?suback, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match std::str::from_utf8(&publish.payload) {
                    Ok(payload) => {
                        tracing::debug!(
                            topic = %publish.topic,
                            payload = %payload,
                            "MQTT message received"
                        );
                        inner.subscriptions.router.route(&publish.topic, payload);
                    }
                    Err(_) => {
                        tracing::debug!(topic = %publish.topic, "Dropping non-UTF-8 payload");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("MQTT broker disconnected");
                inner.connected.store(false, Ordering::Release);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "MQTT event loop error");
                inner.connected.store(false, Ordering::Release);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_default_values() {
        let builder = MqttBusBuilder::default();
        assert_eq!(builder.config.port, 1883);
        assert!(builder.config.host.is_empty());
        assert!(builder.config.credentials.is_none());
        assert_eq!(builder.config.keep_alive, Duration::from_secs(30));
        assert_eq!(builder.config.connection_timeout, Duration::from_secs(10));
    }

    #[test]
    fn builder_chain() {
        let builder = MqttBusBuilder::default()
            .host("192.168.1.50")
            .port(8883)
            .credentials("admin", "secret")
            .keep_alive(Duration::from_secs(45))
            .connection_timeout(Duration::from_secs(15));

        assert_eq!(builder.config.host, "192.168.1.50");
        assert_eq!(builder.config.port, 8883);
        assert_eq!(
            builder.config.credentials,
            Some(("admin".to_string(), "secret".to_string()))
        );
        assert_eq!(builder.config.keep_alive, Duration::from_secs(45));
        assert_eq!(builder.config.connection_timeout, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn builder_missing_host_fails() {
        let err = MqttBusBuilder::default().build().await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_to_connect() {
        let err = MqttBus::builder()
            .host("127.0.0.1")
            .port(1)
            .connection_timeout(Duration::from_millis(500))
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionFailed(_)));
    }

    fn noop() -> MessageCallback {
        Arc::new(|_: &str, _: &str| {})
    }

    #[tokio::test(start_paused = true)]
    async fn last_unsubscribe_reaches_broker_before_next_subscribe() {
        let subscriptions = BrokerSubscriptions::default();
        let log = parking_lot::Mutex::new(Vec::new());
        let record = |op: &'static str| {
            log.lock().push(op);
            Ok::<(), ProtocolError>(())
        };

        let (first, _) = subscriptions
            .subscribe("open3e/1_268", noop(), || async { record("subscribe") })
            .await
            .unwrap();

        let leave = subscriptions.unsubscribe(&first, || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            record("unsubscribe")
        });
        let rejoin =
            subscriptions.subscribe("open3e/1_268", noop(), || async { record("subscribe") });
        let (left, rejoined) = tokio::join!(leave, rejoin);

        assert!(left.unwrap());
        assert!(rejoined.unwrap().1);
        assert_eq!(*log.lock(), vec!["subscribe", "unsubscribe", "subscribe"]);
        assert_eq!(subscriptions.router.subscription_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_first_subscribe_hands_over_to_next_subscriber() {
        let subscriptions = BrokerSubscriptions::default();
        let broker_calls = parking_lot::Mutex::new(0);

        let failing = subscriptions.subscribe("open3e/LWT", noop(), || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            *broker_calls.lock() += 1;
            Err::<(), _>(ProtocolError::Transport("rejected".to_string()))
        });
        let second = subscriptions.subscribe("open3e/LWT", noop(), || async {
            *broker_calls.lock() += 1;
            Ok::<(), ProtocolError>(())
        });
        let (failed, second) = tokio::join!(failing, second);

        assert!(failed.is_err());
        let (handle, first) = second.unwrap();
        assert!(first);
        assert_eq!(*broker_calls.lock(), 2);
        assert_eq!(subscriptions.router.subscription_count(), 1);

        let last = subscriptions
            .unsubscribe(&handle, || async { Ok::<(), ProtocolError>(()) })
            .await
            .unwrap();
        assert!(last);
    }

    #[test]
    fn config_accessors() {
        let builder = MqttBusBuilder::default()
            .host("broker.local")
            .credentials("user", "pass");
        let config = &builder.config;

        assert_eq!(config.host(), "broker.local");
        assert_eq!(config.port(), 1883);
        assert!(config.has_credentials());
        assert_eq!(config.keep_alive(), Duration::from_secs(30));
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
    }
}
