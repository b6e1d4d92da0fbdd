// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reply collection for one-shot request/reply exchanges.
//!
//! A request to the Open3e server is answered asynchronously on one topic per
//! requested feature. The [`ReplyCollector`] tracks which topics are still
//! outstanding for one exchange and gathers the payloads that arrive before
//! the deadline.
//!
//! # Public API
//!
//! Only [`ReplyPolicy`] is part of the public API. The collector itself is
//! owned by a single exchange and never shared.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::BusMessage;
use crate::error::ProtocolError;

/// What an exchange accepts when the deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyPolicy {
    /// Every expected topic must reply; otherwise the exchange times out.
    #[default]
    All,
    /// Whatever arrived is returned; the exchange only times out when no
    /// expected topic replied at all.
    AnyPartial,
}

/// Collects replies for a set of expected topics until a deadline.
#[derive(Debug)]
pub(crate) struct ReplyCollector {
    /// Every topic this exchange waits on.
    expected: HashSet<String>,
    /// Topics that have not replied yet.
    pending: HashSet<String>,
    /// Latest payload per topic.
    received: HashMap<String, String>,
    /// Deadline for collection.
    deadline: Instant,
}

impl ReplyCollector {
    /// Creates a collector whose deadline starts now.
    #[must_use]
    pub(crate) fn new<'a>(
        expected: impl IntoIterator<Item = &'a String>,
        timeout: Duration,
    ) -> Self {
        let expected: HashSet<String> = expected.into_iter().cloned().collect();
        Self {
            pending: expected.clone(),
            received: HashMap::with_capacity(expected.len()),
            expected,
            deadline: Instant::now() + timeout,
        }
    }

    /// Returns the remaining time until the deadline.
    #[must_use]
    fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Returns true if the deadline has been reached.
    #[must_use]
    fn is_timed_out(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Returns true if every expected topic has replied.
    #[must_use]
    pub(crate) fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Processes a received message.
    ///
    /// A repeated reply on the same topic replaces the earlier payload.
    /// Returns `true` if the message was for an expected topic.
    pub(crate) fn process_message(&mut self, msg: BusMessage) -> bool {
        if !self.expected.contains(&msg.topic) {
            tracing::debug!(topic = %msg.topic, "Ignoring reply on unexpected topic");
            return false;
        }
        self.pending.remove(&msg.topic);
        self.received.insert(msg.topic, msg.payload);
        true
    }

    /// Returns the number of topics still outstanding.
    #[must_use]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns the number of topics that replied.
    #[must_use]
    pub(crate) fn received_count(&self) -> usize {
        self.received.len()
    }

    /// Consumes the collector, returning the replies.
    #[must_use]
    pub(crate) fn into_replies(self) -> HashMap<String, String> {
        self.received
    }
}

/// Collects replies from `rx` according to `policy`.
///
/// # Errors
///
/// Returns `ProtocolError::Timeout` if the policy is not satisfied when the
/// deadline passes.
pub(crate) async fn collect_replies(
    rx: &mut mpsc::UnboundedReceiver<BusMessage>,
    mut collector: ReplyCollector,
    policy: ReplyPolicy,
    timeout: Duration,
) -> Result<HashMap<String, String>, ProtocolError> {
    while !collector.is_complete() && !collector.is_timed_out() {
        let remaining = collector.remaining_time();

        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(msg)) => {
                tracing::trace!(
                    topic = %msg.topic,
                    received = collector.received_count(),
                    pending = collector.pending_count(),
                    "Received reply"
                );
                collector.process_message(msg);
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(
                    received = collector.received_count(),
                    pending = collector.pending_count(),
                    "Reply collection timed out"
                );
                break;
            }
        }
    }

    let satisfied = match policy {
        ReplyPolicy::All => collector.is_complete(),
        ReplyPolicy::AnyPartial => collector.received_count() > 0,
    };

    if !satisfied {
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = timeout.as_millis() as u64;
        return Err(ProtocolError::Timeout(timeout_ms));
    }

    Ok(collector.into_replies())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn collector_processes_expected_message() {
        let expected = topics(&["a", "b"]);
        let mut collector = ReplyCollector::new(&expected, Duration::from_secs(5));

        assert!(collector.process_message(BusMessage::new("a", "1")));
        assert_eq!(collector.received_count(), 1);
        assert_eq!(collector.pending_count(), 1);
        assert!(!collector.is_complete());
    }

    #[test]
    fn collector_ignores_unexpected_message() {
        let expected = topics(&["a"]);
        let mut collector = ReplyCollector::new(&expected, Duration::from_secs(5));

        assert!(!collector.process_message(BusMessage::new("z", "1")));
        assert_eq!(collector.received_count(), 0);
        assert_eq!(collector.pending_count(), 1);
    }

    #[test]
    fn collector_keeps_latest_duplicate() {
        let expected = topics(&["a", "b"]);
        let mut collector = ReplyCollector::new(&expected, Duration::from_secs(5));

        collector.process_message(BusMessage::new("a", "first"));
        collector.process_message(BusMessage::new("a", "second"));
        assert_eq!(collector.pending_count(), 1);

        let replies = collector.into_replies();
        assert_eq!(replies.get("a").map(String::as_str), Some("second"));
    }

    #[tokio::test]
    async fn collect_all_replies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let expected = topics(&["a", "b"]);
        let collector = ReplyCollector::new(&expected, Duration::from_secs(5));

        tx.send(BusMessage::new("b", "2")).unwrap();
        tx.send(BusMessage::new("a", "1")).unwrap();

        let replies = collect_replies(&mut rx, collector, ReplyPolicy::All, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies["a"], "1");
        assert_eq!(replies["b"], "2");
    }

    #[tokio::test(start_paused = true)]
    async fn all_policy_times_out_on_partial() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let expected = topics(&["a", "b"]);
        let collector = ReplyCollector::new(&expected, Duration::from_millis(100));

        tx.send(BusMessage::new("a", "1")).unwrap();

        let err = collect_replies(
            &mut rx,
            collector,
            ReplyPolicy::All,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_policy_returns_what_arrived() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let expected = topics(&["a", "b"]);
        let collector = ReplyCollector::new(&expected, Duration::from_millis(100));

        tx.send(BusMessage::new("a", "1")).unwrap();

        let replies = collect_replies(
            &mut rx,
            collector,
            ReplyPolicy::AnyPartial,
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert_eq!(replies.len(), 1);
        assert!(!replies.contains_key("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_policy_times_out_on_silence() {
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let expected = topics(&["a"]);
        let collector = ReplyCollector::new(&expected, Duration::from_millis(50));

        let result = collect_replies(
            &mut rx,
            collector,
            ReplyPolicy::AnyPartial,
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout(50))));
    }
}
