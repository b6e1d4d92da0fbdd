// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process message bus.
//!
//! [`MemoryBus`] delivers published messages to local subscribers without a
//! broker. Responders can be installed to answer requests the way an Open3e
//! server would, which makes it suitable for embedding the engine in tests
//! or simulations.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use open3e_lib::protocol::{Bus, MemoryBus};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), open3e_lib::ProtocolError> {
//! let bus = MemoryBus::new();
//! bus.on_publish(|topic, _payload| {
//!     if topic == "open3e/cmnd" {
//!         vec![("open3e/1_268".to_string(), r#"{"Actual":41.2}"#.to_string())]
//!     } else {
//!         Vec::new()
//!     }
//! });
//!
//! let handle = bus
//!     .subscribe(
//!         "open3e/1_268",
//!         Arc::new(|topic: &str, payload: &str| println!("{topic}: {payload}")),
//!     )
//!     .await?;
//! bus.publish("open3e/cmnd", r#"{"mode":"read-json","addr":"1","data":[268]}"#.into())
//!     .await?;
//! bus.unsubscribe(&handle).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::topic_router::{Removal, TopicRouter, topic_matches};
use super::{Bus, MessageCallback, SubscriptionHandle};
use crate::error::ProtocolError;

/// Produces `(topic, payload)` replies for a published message.
type Responder = Arc<dyn Fn(&str, &str) -> Vec<(String, String)> + Send + Sync>;

/// A [`Bus`] that lives entirely in memory.
#[derive(Default)]
pub struct MemoryBus {
    /// Local subscriptions.
    router: TopicRouter,
    /// Every successful publish, in order.
    published: Mutex<Vec<(String, String)>>,
    /// Retained payload per topic, replayed to new subscriptions.
    retained: Mutex<HashMap<String, String>>,
    /// Simulated remote parties answering publishes.
    responders: RwLock<Vec<Responder>>,
    /// Topics whose publishes fail.
    failing_publish: Mutex<HashSet<String>>,
    /// Topic filters whose subscriptions fail.
    failing_subscribe: Mutex<HashSet<String>>,
    /// Every successful unsubscribe, in order.
    unsubscribed: Mutex<Vec<SubscriptionHandle>>,
}

impl MemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a responder called for every successful publish.
    ///
    /// The returned messages are delivered to subscribers right away.
    pub fn on_publish<F>(&self, responder: F)
    where
        F: Fn(&str, &str) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.responders.write().push(Arc::new(responder));
    }

    /// Delivers a message to subscribers as if it came from a remote party.
    ///
    /// Returns the number of callbacks invoked.
    pub fn inject(&self, topic: &str, payload: &str) -> usize {
        self.router.route(topic, payload)
    }

    /// Stores a retained message and delivers it to current subscribers.
    ///
    /// Later subscriptions matching the topic receive it immediately.
    pub fn retain(&self, topic: &str, payload: &str) {
        self.retained
            .lock()
            .insert(topic.to_string(), payload.to_string());
        self.router.route(topic, payload);
    }

    /// Makes every publish to `topic` fail with a transport error.
    pub fn fail_publishes_to(&self, topic: &str) {
        self.failing_publish.lock().insert(topic.to_string());
    }

    /// Makes every subscription to `filter` fail with a transport error.
    pub fn fail_subscriptions_to(&self, filter: &str) {
        self.failing_subscribe.lock().insert(filter.to_string());
    }

    /// Removes all simulated failures.
    pub fn clear_failures(&self) {
        self.failing_publish.lock().clear();
        self.failing_subscribe.lock().clear();
    }

    /// Returns every successful publish as `(topic, payload)`.
    #[must_use]
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    /// Returns the payloads published to `topic`.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Forgets recorded publishes.
    pub fn clear_published(&self) {
        self.published.lock().clear();
    }

    /// Returns every handle that was unsubscribed, in order.
    #[must_use]
    pub fn unsubscribed(&self) -> Vec<SubscriptionHandle> {
        self.unsubscribed.lock().clone()
    }

    /// Returns the number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.router.subscription_count()
    }
}

impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), ProtocolError> {
        if self.failing_publish.lock().contains(topic) {
            return Err(ProtocolError::Transport(format!("publish to {topic} rejected")));
        }

        self.published
            .lock()
            .push((topic.to_string(), payload.clone()));
        self.router.route(topic, &payload);

        let responders: Vec<Responder> = self.responders.read().clone();
        for responder in responders {
            for (reply_topic, reply) in responder(topic, &payload) {
                self.router.route(&reply_topic, &reply);
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionHandle, ProtocolError> {
        if self.failing_subscribe.lock().contains(topic) {
            return Err(ProtocolError::Transport(format!(
                "subscription to {topic} rejected"
            )));
        }

        let (handle, _) = self.router.register(topic, Arc::clone(&callback));

        let retained: Vec<(String, String)> = self
            .retained
            .lock()
            .iter()
            .filter(|(t, _)| topic_matches(topic, t))
            .map(|(t, p)| (t.clone(), p.clone()))
            .collect();
        for (t, p) in retained {
            callback(&t, &p);
        }

        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), ProtocolError> {
        if self.router.remove(handle) != Removal::Unknown {
            self.unsubscribed.lock().push(handle.clone());
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("router", &self.router)
            .field("published", &self.published.lock().len())
            .finish_non_exhaustive()
    }
}
