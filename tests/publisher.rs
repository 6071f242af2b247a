mod support;

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Value, json};

use support::{Behavior, RecordingBus, SimulatedTransport, device, sgs01_a};
use tuya_ble_bridge_lib::config::{HomeAssistantConfig, PollingConfig};
use tuya_ble_bridge_lib::core::{MetricValue, Poller, Reading, SensorProfile};
use tuya_ble_bridge_lib::publish::{PublishEvent, Publisher, PublisherSettings, Topics};

const A: &str = "A4:C1:38:00:00:0A";

fn topics() -> Topics {
    Topics::new(&HomeAssistantConfig::default())
}

fn reading(moisture: i64) -> Reading {
    let metrics: BTreeMap<String, MetricValue> = [
        ("moisture", MetricValue::Integer(moisture)),
        ("temperature", MetricValue::Decimal(21.0)),
        ("battery", MetricValue::Integer(90)),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value))
    .collect();
    Reading::new("sgs01_a", metrics)
}

/// Lets the publisher task drain its channel.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn once_mode_publishes_discovery_state_and_proxy_status() {
    let transport = SimulatedTransport::new().with_device(A, Behavior::default());
    let bus = RecordingBus::connected();
    let (handle, task) = Publisher::new(
        bus.clone(),
        topics(),
        &[sgs01_a()],
        SensorProfile::sgs01(),
        PublisherSettings::default(),
    )
    .spawn();

    let mut poller =
        Poller::new(transport, vec![sgs01_a()], PollingConfig::default()).with_publisher(handle);
    let outcomes = poller.run_once().await;
    assert!(outcomes[0].is_success());
    drop(poller);
    task.await.unwrap();

    let published = bus.published();
    let discovery: Vec<_> = published
        .iter()
        .filter(|(topic, _, _)| topic == "homeassistant/device/sgs01_a/config")
        .collect();
    let state: Vec<_> = published
        .iter()
        .filter(|(topic, _, _)| topic == "sgs01/sgs01_a/state")
        .collect();
    assert_eq!(discovery.len(), 1);
    assert_eq!(state.len(), 1);
    assert!(published.iter().all(|(_, _, retain)| *retain));

    let values: Value = serde_json::from_str(&state[0].1).unwrap();
    assert_eq!(
        values,
        json!({"moisture": 45, "temperature": 22.5, "battery": 87, "battery_state": "high"})
    );

    let config: Value = serde_json::from_str(&discovery[0].1).unwrap();
    assert_eq!(config["state_topic"], "sgs01/sgs01_a/state");
    assert_eq!(config["components"].as_object().unwrap().len(), 4);

    assert_eq!(
        bus.topics(),
        vec![
            "homeassistant/binary_sensor/ble_proxy_status/config",
            "ble_proxy/ble_proxy/status",
            "homeassistant/device/sgs01_a/config",
            "sgs01/sgs01_a/state",
            "sgs01/sgs01_a/availability",
            "ble_proxy/ble_proxy/status",
        ]
    );
    assert_eq!(published[1].1, "online");
    assert_eq!(published[4].1, "online");
    assert_eq!(published[5].1, "offline");
}

#[tokio::test(start_paused = true)]
async fn discovery_is_sent_once_per_device() {
    let bus = RecordingBus::connected();
    let (handle, task) = Publisher::new(
        bus.clone(),
        topics(),
        &[sgs01_a()],
        SensorProfile::sgs01(),
        PublisherSettings::default(),
    )
    .spawn();

    handle.send(PublishEvent::Reading(reading(40)));
    handle.send(PublishEvent::Reading(reading(41)));
    drop(handle);
    task.await.unwrap();

    let topics = bus.topics();
    assert_eq!(topics.iter().filter(|t| t.ends_with("/config")).count(), 1);
    assert_eq!(topics.iter().filter(|t| t.ends_with("/state")).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn queue_keeps_only_newest_messages_while_disconnected() {
    let bus = RecordingBus::disconnected();
    let settings = PublisherSettings {
        max_pending: 4,
        ..PublisherSettings::default()
    };
    let devices: Vec<_> = (0..6)
        .map(|i| device(&format!("sgs01_{}", i), &format!("A4:C1:38:00:00:0{}", i)))
        .collect();
    let (handle, task) =
        Publisher::new(bus.clone(), topics(), &devices, SensorProfile::sgs01(), settings).spawn();

    for d in &devices {
        handle.send(PublishEvent::Availability {
            unique_id: d.unique_id.clone(),
            online: false,
        });
    }
    settle().await;
    assert!(bus.published().is_empty());

    bus.set_connected(true);
    drop(handle);
    task.await.unwrap();

    assert_eq!(
        bus.topics(),
        vec![
            "sgs01/sgs01_2/availability",
            "sgs01/sgs01_3/availability",
            "sgs01/sgs01_4/availability",
            "sgs01/sgs01_5/availability",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn dropped_discovery_is_sent_again() {
    let bus = RecordingBus::disconnected();
    let settings = PublisherSettings {
        max_pending: 2,
        ..PublisherSettings::default()
    };
    let (handle, task) =
        Publisher::new(bus.clone(), topics(), &[sgs01_a()], SensorProfile::sgs01(), settings)
            .spawn();

    handle.send(PublishEvent::Reading(reading(40)));
    handle.send(PublishEvent::Availability {
        unique_id: "sgs01_a".into(),
        online: true,
    });
    handle.send(PublishEvent::Reading(reading(41)));
    settle().await;

    bus.set_connected(true);
    drop(handle);
    task.await.unwrap();

    let published = bus.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].0, "homeassistant/device/sgs01_a/config");
    assert_eq!(published[1].0, "sgs01/sgs01_a/state");
    let values: Value = serde_json::from_str(&published[1].1).unwrap();
    assert_eq!(values["moisture"], 41);
}

#[tokio::test(start_paused = true)]
async fn queued_messages_flush_after_reconnect() {
    let bus = RecordingBus::disconnected();
    let (handle, task) = Publisher::new(
        bus.clone(),
        topics(),
        &[sgs01_a()],
        SensorProfile::sgs01(),
        PublisherSettings::default(),
    )
    .spawn();

    handle.send(PublishEvent::Reading(reading(40)));
    settle().await;
    assert!(bus.published().is_empty());

    bus.set_connected(true);
    // The periodic flush picks the queue up without a new event.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(bus.published().len(), 2);

    drop(handle);
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn proxy_status_is_announced_once() {
    let bus = RecordingBus::connected();
    let (handle, task) = Publisher::new(
        bus.clone(),
        topics(),
        &[],
        SensorProfile::sgs01(),
        PublisherSettings::default(),
    )
    .spawn();

    handle.send(PublishEvent::ProxyStatus { online: true });
    handle.send(PublishEvent::ProxyStatus { online: false });
    handle.send(PublishEvent::ProxyStatus { online: true });
    drop(handle);
    task.await.unwrap();

    let published = bus.published();
    assert_eq!(published[0].0, "homeassistant/binary_sensor/ble_proxy_status/config");
    let statuses: Vec<_> = published[1..]
        .iter()
        .map(|(topic, payload, _)| (topic.as_str(), payload.as_str()))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("ble_proxy/ble_proxy/status", "online"),
            ("ble_proxy/ble_proxy/status", "offline"),
            ("ble_proxy/ble_proxy/status", "online"),
        ]
    );
}
