// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `Open3e` Lib - A Rust library to keep Open3e heating data fresh.
//!
//! An Open3e server bridges Viessmann heating appliances to MQTT. It answers
//! read requests by publishing each feature value on its own topic. This
//! library decides which features to re-read and when, and correlates
//! one-shot requests with their asynchronous replies.
//!
//! # Building Blocks
//!
//! - **Endpoint registry**: Reference-counted interest in features with the
//!   tightest requested refresh interval
//! - **Refresh scheduler**: Fixed-rate tick publishing one batched read per
//!   device for every due feature
//! - **Correlator**: Subscribe, publish, then wait for replies on a set of
//!   topics with a timeout
//! - **Capability prober**: Detects optional hardware by reading sentinel
//!   values
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use open3e_lib::{Open3eClient, Open3eConfig, RefreshInterval};
//! use open3e_lib::protocol::MqttBus;
//!
//! #[tokio::main]
//! async fn main() -> open3e_lib::Result<()> {
//!     let bus = MqttBus::builder()
//!         .host("192.168.1.50")
//!         .build()
//!         .await?;
//!     let client = Open3eClient::new(Arc::new(bus), Open3eConfig::default());
//!
//!     let discovered = client.setup().await?;
//!     for device in discovered.system.devices() {
//!         println!("{}: {:?}", device.name(), discovered.capabilities_of(device.id()));
//!     }
//!
//!     client.register_interest(1, &[268, 269], RefreshInterval::secs(10));
//!     client.start();
//!     Ok(())
//! }
//! ```
//!
//! ## Testing Without a Broker
//!
//! [`MemoryBus`](protocol::MemoryBus) implements the same
//! [`Bus`](protocol::Bus) trait in memory and can answer requests:
//!
//! ```
//! use std::sync::Arc;
//! use open3e_lib::{Open3eClient, Open3eConfig, Availability};
//! use open3e_lib::protocol::MemoryBus;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> open3e_lib::Result<()> {
//! let bus = Arc::new(MemoryBus::new());
//! bus.retain("open3e/LWT", "online");
//!
//! let client = Open3eClient::new(Arc::clone(&bus), Open3eConfig::default());
//! client.check_availability().await?;
//! assert_eq!(client.availability(), Availability::Online);
//! # Ok(())
//! # }
//! ```

pub mod availability;
pub mod capabilities;
mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod feature;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod system;

pub use availability::Availability;
pub use capabilities::{Capabilities, Capability, CapabilityProber};
pub use client::{DiscoveredSystem, FeatureCallback, FeatureWatch, Open3eClient};
pub use config::Open3eConfig;
pub use correlator::Correlator;
pub use error::{Error, ParseError, ProtocolError, Result};
pub use feature::{DeviceId, Feature, FeatureId, FeatureKey, RefreshInterval};
pub use registry::{Endpoint, EndpointRegistry};
pub use scheduler::{RefreshScheduler, TickReport};
pub use system::{Device, DeviceModel, SystemInformation};
