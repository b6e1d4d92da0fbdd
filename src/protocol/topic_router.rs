// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topic routing for bus subscriptions.
//!
//! The [`TopicRouter`] keeps the callbacks registered per topic filter and
//! dispatches incoming messages to every filter that matches. Several
//! subscriptions may share one filter; the router reports when the first
//! subscription for a filter is added and when the last one is removed so the
//! transport only subscribes to the broker once per filter.
//!
//! ```text
//! MQTT Message: open3e/1_268_FlowTemperature → {"Actual":41.2}
//!                     ↓
//!             TopicRouter.route()
//!                     ↓
//!     Match filters ("open3e/1_268_FlowTemperature", "open3e/#", ...)
//!                     ↓
//!        callback(topic, payload) for each subscription
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{MessageCallback, SubscriptionHandle};

/// Outcome of removing a subscription from the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    /// The handle was not registered.
    Unknown,
    /// Other subscriptions still use the same filter.
    Shared,
    /// This was the last subscription for its filter.
    Last,
}

/// Routes bus messages to subscription callbacks.
#[derive(Default)]
pub(crate) struct TopicRouter {
    /// Counter for generating subscription ids.
    next_id: AtomicU64,
    /// Callbacks keyed by topic filter, then by subscription id.
    filters: RwLock<HashMap<String, HashMap<u64, MessageCallback>>>,
}

impl TopicRouter {
    /// Creates a new empty topic router.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for a topic filter.
    ///
    /// Returns the subscription handle and whether this is the first
    /// subscription for the filter.
    pub(crate) fn register(
        &self,
        filter: &str,
        callback: MessageCallback,
    ) -> (SubscriptionHandle, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut filters = self.filters.write();
        let entry = filters.entry(filter.to_string()).or_default();
        let first = entry.is_empty();
        entry.insert(id, callback);

        tracing::debug!(filter = %filter, id, first, "Registered subscription");
        (SubscriptionHandle::new(id, filter), first)
    }

    /// Removes a subscription.
    pub(crate) fn remove(&self, handle: &SubscriptionHandle) -> Removal {
        let mut filters = self.filters.write();
        let Some(entry) = filters.get_mut(handle.topic()) else {
            return Removal::Unknown;
        };
        if entry.remove(&handle.id()).is_none() {
            return Removal::Unknown;
        }

        tracing::debug!(filter = %handle.topic(), id = handle.id(), "Removed subscription");
        if entry.is_empty() {
            filters.remove(handle.topic());
            Removal::Last
        } else {
            Removal::Shared
        }
    }

    /// Dispatches a message to every matching subscription.
    ///
    /// Callbacks are invoked outside the lock. Returns the number of callbacks
    /// invoked.
    pub(crate) fn route(&self, topic: &str, payload: &str) -> usize {
        let callbacks: Vec<MessageCallback> = {
            let filters = self.filters.read();
            filters
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .flat_map(|(_, subs)| subs.values().cloned())
                .collect()
        };

        if callbacks.is_empty() {
            tracing::trace!(topic = %topic, "No subscription for topic");
        }

        for callback in &callbacks {
            callback(topic, payload);
        }
        callbacks.len()
    }

    /// Returns the topic filters that currently have subscriptions.
    #[must_use]
    pub(crate) fn active_filters(&self) -> Vec<String> {
        self.filters.read().keys().cloned().collect()
    }

    /// Returns the total number of subscriptions.
    #[must_use]
    pub(crate) fn subscription_count(&self) -> usize {
        self.filters.read().values().map(HashMap::len).sum()
    }

    /// Removes every subscription.
    pub(crate) fn clear(&self) {
        self.filters.write().clear();
    }
}

impl std::fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRouter")
            .field("filters", &self.active_filters())
            .finish_non_exhaustive()
    }
}

/// Returns true if `topic` matches the MQTT topic `filter`.
///
/// Supports the single-level (`+`) and multi-level (`#`) wildcards.
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
