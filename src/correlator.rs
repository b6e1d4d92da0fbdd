// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot request/reply exchanges.
//!
//! An exchange subscribes to the reply topics, waits for the broker to
//! activate the subscriptions, publishes the request and collects replies
//! until every expected topic answered or the timeout passed. Subscriptions
//! are released on every exit path.
//!
//! ```text
//! subscribe(expected topics) ──▶ settle delay ──▶ publish(request)
//!                                                      │
//!        unsubscribe(all handles) ◀── collect until complete or timeout
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::ProtocolError;
use crate::protocol::reply_collector::{ReplyCollector, collect_replies};
use crate::protocol::{
    Bus, BusMessage, CommandSender, MessageCallback, ReplyPolicy, Request, SubscriptionHandle,
};

/// Default wait between subscribing and publishing.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Performs one-shot request/reply exchanges over a [`Bus`].
///
/// Every call owns its own subscriptions and reply collector, so any number
/// of exchanges may run concurrently.
pub struct Correlator<B: Bus> {
    bus: Arc<B>,
    sender: CommandSender<B>,
    settle_delay: Duration,
}

impl<B: Bus> Correlator<B> {
    /// Creates a correlator publishing requests on `command_topic`.
    #[must_use]
    pub fn new(bus: Arc<B>, command_topic: impl Into<String>) -> Self {
        Self {
            sender: CommandSender::new(Arc::clone(&bus), command_topic),
            bus,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    /// Sets the wait between subscribing and publishing.
    #[must_use]
    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Returns the settle delay.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Publishes `request` and waits for a reply on every expected topic.
    ///
    /// With `request` set to `None` nothing is published and the settle
    /// delay is skipped; this waits for messages another party publishes on
    /// its own, such as a retained availability message.
    ///
    /// The timeout starts once the request has been published. A second
    /// reply on the same topic replaces the first.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Timeout` if any expected topic stays silent
    /// and the transport error if subscribing or publishing fails.
    pub async fn exchange(
        &self,
        request: Option<&Request>,
        expected: &[String],
        timeout: Duration,
    ) -> Result<HashMap<String, String>, ProtocolError> {
        self.run(request, expected, timeout, ReplyPolicy::All).await
    }

    /// Like [`exchange`](Self::exchange) but accepts partial results.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Timeout` only if no expected topic replied at
    /// all, and the transport error if subscribing or publishing fails.
    pub async fn exchange_partial(
        &self,
        request: Option<&Request>,
        expected: &[String],
        timeout: Duration,
    ) -> Result<HashMap<String, String>, ProtocolError> {
        self.run(request, expected, timeout, ReplyPolicy::AnyPartial)
            .await
    }

    async fn run(
        &self,
        request: Option<&Request>,
        expected: &[String],
        timeout: Duration,
        policy: ReplyPolicy,
    ) -> Result<HashMap<String, String>, ProtocolError> {
        if expected.is_empty() {
            tracing::debug!("Exchange without reply topics, nothing to do");
            return Ok(HashMap::new());
        }

        let mut handles = Vec::with_capacity(expected.len());
        let result = self
            .subscribe_and_collect(request, expected, timeout, policy, &mut handles)
            .await;

        for handle in &handles {
            if let Err(e) = self.bus.unsubscribe(handle).await {
                tracing::warn!(topic = %handle.topic(), error = %e, "Failed to unsubscribe");
            }
        }

        match &result {
            Ok(replies) => tracing::debug!(
                expected = expected.len(),
                received = replies.len(),
                "Exchange completed"
            ),
            Err(e) => tracing::debug!(error = %e, "Exchange failed"),
        }
        result
    }

    async fn subscribe_and_collect(
        &self,
        request: Option<&Request>,
        expected: &[String],
        timeout: Duration,
        policy: ReplyPolicy,
        handles: &mut Vec<SubscriptionHandle>,
    ) -> Result<HashMap<String, String>, ProtocolError> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let topics: BTreeSet<&String> = expected.iter().collect();
        for topic in &topics {
            let tx = tx.clone();
            let callback: MessageCallback = Arc::new(move |topic: &str, payload: &str| {
                let _ = tx.send(BusMessage::new(topic, payload));
            });
            handles.push(self.bus.subscribe(topic, callback).await?);
        }
        drop(tx);

        if let Some(request) = request {
            tokio::time::sleep(self.settle_delay).await;
            self.sender.send(request).await?;
        }

        let collector = ReplyCollector::new(topics, timeout);
        collect_replies(&mut rx, collector, policy, timeout).await
    }
}

impl<B: Bus> std::fmt::Debug for Correlator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("command_topic", &self.sender.command_topic())
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::protocol::MemoryBus;

    const COMMAND: &str = "open3e/cmnd";

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn setup() -> (Arc<MemoryBus>, Correlator<MemoryBus>) {
        let bus = Arc::new(MemoryBus::new());
        let correlator = Correlator::new(Arc::clone(&bus), COMMAND);
        (bus, correlator)
    }

    /// Answers every command with the given replies, in order.
    fn respond_with(bus: &MemoryBus, replies: &[(&str, &str)]) {
        let replies: Vec<(String, String)> = replies
            .iter()
            .map(|(t, p)| ((*t).to_string(), (*p).to_string()))
            .collect();
        bus.on_publish(move |topic, _| {
            if topic == COMMAND {
                replies.clone()
            } else {
                Vec::new()
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn responsive_bus_returns_within_settle_delay() {
        let (bus, correlator) = setup();
        respond_with(&bus, &[("open3e/1_268", "41.2"), ("open3e/1_269", "30.1")]);
        let expected = topics(&["open3e/1_268", "open3e/1_269"]);

        let start = Instant::now();
        let replies = correlator
            .exchange(
                Some(&Request::read(1, vec![268, 269])),
                &expected,
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert_eq!(start.elapsed(), DEFAULT_SETTLE_DELAY);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies["open3e/1_268"], "41.2");
        assert_eq!(
            bus.published_to(COMMAND),
            vec![r#"{"mode":"read-json","addr":"1","data":[268,269]}"#.to_string()]
        );
        assert_eq!(bus.unsubscribed().len(), 2);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_and_duplicate_replies() {
        let (bus, correlator) = setup();
        respond_with(
            &bus,
            &[
                ("open3e/1_269", "b"),
                ("open3e/1_268", "first"),
                ("open3e/9_999", "noise"),
                ("open3e/1_268", "second"),
            ],
        );
        let expected = topics(&["open3e/1_268", "open3e/1_269"]);

        let replies = correlator
            .exchange(
                Some(&Request::read(1, vec![268, 269])),
                &expected,
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        assert_eq!(replies.len(), 2);
        assert_eq!(replies["open3e/1_268"], "second");
        assert_eq!(replies["open3e/1_269"], "b");

        let mut released: Vec<String> = bus
            .unsubscribed()
            .iter()
            .map(|h| h.topic().to_string())
            .collect();
        released.sort();
        assert_eq!(released, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_after_timeout() {
        let (bus, correlator) = setup();
        let expected = topics(&["open3e/1_268", "open3e/1_269", "open3e/1_274"]);
        let timeout = Duration::from_secs(10);

        let start = Instant::now();
        let err = correlator
            .exchange(Some(&Request::read(1, vec![268, 269, 274])), &expected, timeout)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(start.elapsed(), DEFAULT_SETTLE_DELAY + timeout);
        assert_eq!(bus.unsubscribed().len(), 3);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_reply_times_out_with_all_policy() {
        let (bus, correlator) = setup();
        respond_with(&bus, &[("open3e/1_268", "41.2")]);
        let expected = topics(&["open3e/1_268", "open3e/1_269"]);

        let err = correlator
            .exchange(
                Some(&Request::read(1, vec![268, 269])),
                &expected,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_exchange_returns_what_arrived() {
        let (bus, correlator) = setup();
        respond_with(&bus, &[("open3e/1_268", "41.2")]);
        let expected = topics(&["open3e/1_268", "open3e/1_269"]);

        let replies = correlator
            .exchange_partial(
                Some(&Request::read(1, vec![268, 269])),
                &expected,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(bus.unsubscribed().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn passive_exchange_reads_retained_message() {
        let (bus, correlator) = setup();
        bus.retain("open3e/LWT", "online");

        let start = Instant::now();
        let replies = correlator
            .exchange(None, &topics(&["open3e/LWT"]), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(replies["open3e/LWT"], "online");
        assert!(bus.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_failure_releases_earlier_handles() {
        let (bus, correlator) = setup();
        // Topics are subscribed in sorted order, so "b" fails after "a".
        bus.fail_subscriptions_to("b");

        let err = correlator
            .exchange(
                Some(&Request::Config),
                &topics(&["a", "b", "c"]),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert!(err.is_transport());
        assert_eq!(bus.unsubscribed().len(), 1);
        assert_eq!(bus.unsubscribed()[0].topic(), "a");
        assert!(bus.published().is_empty());
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_releases_handles() {
        let (bus, correlator) = setup();
        bus.fail_publishes_to(COMMAND);

        let err = correlator
            .exchange(
                Some(&Request::Config),
                &topics(&["open3e/config"]),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert!(err.is_transport());
        assert_eq!(bus.unsubscribed().len(), 1);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn empty_expected_set_skips_bus() {
        let (bus, correlator) = setup();

        let replies = correlator
            .exchange(Some(&Request::Config), &[], Duration::from_secs(5))
            .await
            .unwrap();

        assert!(replies.is_empty());
        assert!(bus.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_settle_delay() {
        let (bus, correlator) = setup();
        let correlator = correlator.with_settle_delay(Duration::from_millis(250));
        respond_with(&bus, &[("open3e/config", "{}")]);

        let start = Instant::now();
        correlator
            .exchange(
                Some(&Request::Config),
                &topics(&["open3e/config"]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }
}
