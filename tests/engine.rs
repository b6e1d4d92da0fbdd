// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests of the client against a simulated Open3e server.

use std::sync::Arc;
use std::time::Duration;

use open3e_lib::protocol::{MemoryBus, WriteTarget};
use open3e_lib::{
    Availability, Capability, DeviceId, DeviceModel, FeatureId, Open3eClient, Open3eConfig,
    RefreshInterval,
};
use parking_lot::Mutex;
use tokio::time::sleep;

const COMMAND: &str = "open3e/cmnd";

const SYSTEM_INFORMATION: &str = r#"{"devices": [
    {"id": 1, "name": "HPMU", "serial_number": "7654321012345678",
     "features": [
        {"id": 268, "topic": "open3e/1_268"},
        {"id": 286, "topic": "open3e/1_286"},
        {"id": 334, "topic": "open3e/1_334"}
     ]},
    {"id": 2, "name": "VCU",
     "features": [{"id": 274, "topic": "open3e/2_274"}]}
]}"#;

/// A bus that answers like an Open3e server with one heat pump and one
/// ventilation unit.
fn simulated_server() -> Arc<MemoryBus> {
    let bus = Arc::new(MemoryBus::new());
    bus.retain("open3e/LWT", "online");
    bus.on_publish(|topic, payload| {
        if topic != COMMAND {
            return Vec::new();
        }
        if payload == r#"{"mode":"system-information"}"# {
            return vec![(
                "open3e/system-information".to_string(),
                SYSTEM_INFORMATION.to_string(),
            )];
        }
        if payload.starts_with(r#"{"mode":"read-json","addr":"1""#) {
            return vec![
                ("open3e/1_268".to_string(), "41.0".to_string()),
                ("open3e/1_286".to_string(), r#"{"Actual":31.5}"#.to_string()),
                ("open3e/1_334".to_string(), r#"{"Actual":-3276.8}"#.to_string()),
            ];
        }
        Vec::new()
    });
    bus
}

fn reads_for(bus: &MemoryBus, device: DeviceId) -> usize {
    let prefix = format!(r#"{{"mode":"read-json","addr":"{device}""#);
    bus.published_to(COMMAND)
        .iter()
        .filter(|payload| payload.starts_with(&prefix))
        .count()
}

#[tokio::test(start_paused = true)]
async fn setup_discovers_devices_and_capabilities() {
    let bus = simulated_server();
    let client = Open3eClient::new(Arc::clone(&bus), Open3eConfig::default());

    let discovered = client.setup().await.unwrap();

    assert_eq!(client.availability(), Availability::Online);
    let devices = discovered.system.devices();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].model(), DeviceModel::Vitocal);
    assert_eq!(devices[1].model(), DeviceModel::Vitoair);

    let heat_pump = discovered.capabilities_of(1).unwrap();
    assert!(heat_pump.contains(Capability::HeatingCircuit2));
    assert!(!heat_pump.contains(Capability::Room1Temperature));
    assert_eq!(heat_pump.len(), 1);
    assert!(discovered.capabilities_of(2).unwrap().is_empty());

    // Only the heat pump is probed, with one batched read.
    assert_eq!(
        bus.published_to(COMMAND),
        vec![
            r#"{"mode":"system-information"}"#.to_string(),
            r#"{"mode":"read-json","addr":"1","data":[286,334]}"#.to_string(),
        ]
    );

    client.shutdown().await;
    assert_eq!(bus.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn watched_features_are_refreshed_while_online() {
    let bus = simulated_server();
    let client = Open3eClient::new(Arc::clone(&bus), Open3eConfig::default());
    let discovered = client.setup().await.unwrap();
    bus.clear_published();

    let values: Arc<Mutex<Vec<(DeviceId, FeatureId, String)>>> = Arc::default();
    let sink = Arc::clone(&values);
    let heat_pump = discovered.device(1).unwrap();
    let watch = client
        .watch_features(
            heat_pump,
            &[268],
            RefreshInterval::secs(10),
            Arc::new(move |device: DeviceId, feature: FeatureId, payload: &str| {
                sink.lock().push((device, feature, payload.to_string()));
            }),
        )
        .await
        .unwrap();

    client.start();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(reads_for(&bus, 1), 1);
    assert_eq!(values.lock()[0], (1, 268, "41.0".to_string()));

    // The 5 s tick passes once before the 10 s interval is due again.
    sleep(Duration::from_secs(10)).await;
    assert_eq!(reads_for(&bus, 1), 2);
    assert_eq!(values.lock().len(), 2);

    bus.inject("open3e/LWT", "offline");
    sleep(Duration::from_secs(30)).await;
    assert_eq!(reads_for(&bus, 1), 2);

    bus.inject("open3e/LWT", "online");
    sleep(Duration::from_secs(5)).await;
    assert_eq!(reads_for(&bus, 1), 3);

    client.unwatch_features(watch).await;
    assert!(client.registry().is_empty());
    client.shutdown().await;
    assert!(!client.is_running());
}

#[tokio::test(start_paused = true)]
async fn shared_interest_keeps_tightest_interval() {
    let bus = simulated_server();
    let client = Open3eClient::new(Arc::clone(&bus), Open3eConfig::default());

    client.register_interest(2, &[274], RefreshInterval::secs(60));
    client.register_interest(2, &[274], RefreshInterval::secs(10));
    client.start();

    sleep(Duration::from_secs(21)).await;
    assert_eq!(reads_for(&bus, 2), 3);

    // One consumer leaves; the tightened interval stays.
    client.deregister_interest(2, &[274]);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(reads_for(&bus, 2), 4);

    client.deregister_interest(2, &[274]);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(reads_for(&bus, 2), 4);

    client.stop();
}

#[tokio::test(start_paused = true)]
async fn write_is_followed_by_refresh() {
    let bus = simulated_server();
    let client = Open3eClient::new(Arc::clone(&bus), Open3eConfig::default());

    client
        .request_write(1, WriteTarget::SubField(424, "Comfort".to_string()), &21.5)
        .await
        .unwrap();
    sleep(Duration::from_secs(3)).await;

    assert_eq!(
        bus.published_to(COMMAND),
        vec![
            r#"{"mode":"write","addr":"1","data":[["424.Comfort","21.5"]]}"#.to_string(),
            r#"{"mode":"read-json","addr":"1","data":[424]}"#.to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn offline_server_fails_setup() {
    let bus = Arc::new(MemoryBus::new());
    bus.retain("open3e/LWT", "offline");
    let client = Open3eClient::new(Arc::clone(&bus), Open3eConfig::default());

    let err = client.setup().await.unwrap_err();

    assert!(matches!(err, open3e_lib::Error::ServerUnavailable(_)));
    assert!(bus.published_to(COMMAND).is_empty());
}
