// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic refresh of live features.
//!
//! The [`RefreshScheduler`] runs a background task that wakes up at a fixed
//! rate, asks the [`EndpointRegistry`] which features are due and publishes
//! one batched read request per device. It never waits for the replies:
//! they reach the feature watches out of band.
//!
//! # Availability gate
//!
//! When a gate is installed, ticks publish nothing until the server has
//! announced itself online.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::availability::Availability;
use crate::error::ProtocolError;
use crate::feature::{DeviceId, FeatureId};
use crate::protocol::{Bus, CommandSender};
use crate::registry::EndpointRegistry;

/// Default time between two ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Shortest accepted time between two ticks.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Devices that were sent a read request, with the features requested.
    pub published: BTreeMap<DeviceId, Vec<FeatureId>>,
    /// Devices whose read request could not be published.
    pub failed: Vec<(DeviceId, ProtocolError)>,
    /// The tick was skipped because the server is not known to be online.
    pub skipped: bool,
}

impl TickReport {
    /// Returns true if nothing was published and nothing failed.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.published.is_empty() && self.failed.is_empty()
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct SchedulerInner<B: Bus> {
    registry: Arc<EndpointRegistry>,
    sender: CommandSender<B>,
    gate: Mutex<Option<watch::Receiver<Availability>>>,
}

impl<B: Bus> SchedulerInner<B> {
    async fn tick(&self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        let availability = self.gate.lock().as_ref().map(|rx| *rx.borrow());
        if let Some(availability) = availability
            && !availability.is_online()
        {
            tracing::debug!(%availability, "Server not online, skipping refresh");
            report.skipped = true;
            return report;
        }

        let due = self.registry.due_features(now);
        for (device, features) in due {
            match self.sender.request_read(device, features.clone()).await {
                Ok(()) => {
                    tracing::debug!(device, ?features, "Requested refresh");
                    report.published.insert(device, features);
                }
                Err(e) => {
                    tracing::warn!(device, error = %e, "Failed to request refresh");
                    report.failed.push((device, e));
                }
            }
        }
        report
    }
}

/// Issues batched read requests for due features at a fixed rate.
///
/// Cycles between stopped and running. Starting a running scheduler or
/// stopping a stopped one has no effect.
pub struct RefreshScheduler<B: Bus> {
    inner: Arc<SchedulerInner<B>>,
    running: Mutex<Option<Running>>,
    /// Task of the last stopped run, possibly still finishing a tick.
    stopping: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Bus> RefreshScheduler<B> {
    /// Creates a stopped scheduler.
    #[must_use]
    pub fn new(registry: Arc<EndpointRegistry>, sender: CommandSender<B>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                sender,
                gate: Mutex::new(None),
            }),
            running: Mutex::new(None),
            stopping: Mutex::new(None),
        }
    }

    /// Only publish while `availability` reports the server online.
    pub fn set_availability_gate(&self, availability: watch::Receiver<Availability>) {
        *self.inner.gate.lock() = Some(availability);
    }

    /// Runs one tick right away, independent of the background task.
    pub async fn tick(&self, now: Instant) -> TickReport {
        self.inner.tick(now).await
    }

    /// Starts the background task, ticking every `tick_interval`.
    ///
    /// The first tick fires immediately, or as soon as a tick of a
    /// previous run has finished. A tick that overruns the interval makes
    /// the missed ticks be skipped rather than fired in a burst. Intervals
    /// below [`MIN_TICK_INTERVAL`] are raised to it.
    pub fn start(&self, tick_interval: Duration) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            tracing::debug!("Refresh scheduler already running");
            return;
        }

        let tick_interval = tick_interval.max(MIN_TICK_INTERVAL);
        let previous = self
            .stopping
            .lock()
            .take()
            .or_else(|| running.take().map(|r| r.task));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(run(inner, tick_interval, shutdown_rx, previous));

        tracing::info!(?tick_interval, "Refresh scheduler started");
        *running = Some(Running {
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Stops the background task.
    ///
    /// A tick in progress finishes its publishes; no further tick starts.
    /// A later [`start`](Self::start) waits for that tick before ticking.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.shutdown.send_replace(true);
            *self.stopping.lock() = Some(running.task);
            tracing::info!("Refresh scheduler stopped");
        }
    }

    /// Returns true while the background task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }
}

impl<B: Bus> Drop for RefreshScheduler<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<B: Bus> std::fmt::Debug for RefreshScheduler<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn run<B: Bus>(
    inner: Arc<SchedulerInner<B>>,
    tick_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    previous: Option<JoinHandle<()>>,
) {
    // One tick at a time: the previous run finishes its tick first.
    if let Some(previous) = previous
        && let Err(e) = previous.await
    {
        tracing::warn!(error = %e, "Previous refresh task ended abnormally");
    }

    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            tick = interval.tick() => {
                let report = inner.tick(tick).await;
                if !report.is_idle() {
                    tracing::trace!(
                        published = report.published.len(),
                        failed = report.failed.len(),
                        "Refresh tick done"
                    );
                }
            }
        }
    }
}
