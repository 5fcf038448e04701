// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! End-to-end tests: Modbus queries in, pub/sub traffic and replies out.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeBackend, RecordingPubSub};
use modbus_gateway::config::{PointConfig, RegisterFormat, RegistersConfig};
use modbus_gateway::gateway::{build_gateway, PubSubClient};
use modbus_gateway::modbus::cache::lock_cache;
use modbus_gateway::modbus::{ModbusServer, StoreKind};

fn point(topic: &str, unit_id: u8, address: i64) -> PointConfig {
    PointConfig {
        enabled: true,
        topic: topic.to_string(),
        unit_id,
        address,
        format: RegisterFormat::Unsigned,
        size: None,
        scale: 1.0,
        byteswap: false,
        wordswap: false,
    }
}

fn gateway(config: &RegistersConfig) -> (ModbusServer, FakeBackend, Arc<RecordingPubSub>) {
    let backend = FakeBackend::new();
    let mut server = ModbusServer::new(Box::new(backend.clone()));
    let bus = Arc::new(RecordingPubSub::default());
    let client: Arc<dyn PubSubClient> = bus.clone();
    build_gateway(&mut server, &client, config).unwrap();
    server.allocate_cache();
    (server, backend, bus)
}

async fn run_once(server: &mut ModbusServer) {
    server.loop_once(Some(Duration::from_millis(10))).await.unwrap();
}

#[tokio::test]
async fn multi_register_write_publishes_each_point() {
    let mut config = RegistersConfig::default();
    config.holdings.push(point("devices/a", 0, 0));
    config.holdings.push(point("devices/b", 0, 1));
    let (mut server, backend, bus) = gateway(&config);

    backend.push_query(
        vec![0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78],
        0,
    );
    run_once(&mut server).await;

    assert_eq!(
        bus.published(),
        vec![
            ("devices/a/on".to_string(), "4660".to_string()),
            ("devices/b/on".to_string(), "22136".to_string()),
        ]
    );
    // The write is applied to the cache and echoed.
    assert_eq!(
        backend.take_replies(),
        vec![vec![0x10, 0x00, 0x00, 0x00, 0x02]]
    );
    let cache = backend.cache();
    assert_eq!(
        lock_cache(&cache)
            .words(StoreKind::HoldingRegister, 0, 0, 2)
            .unwrap(),
        &[0x1234, 0x5678]
    );
}

#[tokio::test]
async fn scaled_write_publishes_the_divided_value() {
    let mut config = RegistersConfig::default();
    config.holdings.push(PointConfig {
        format: RegisterFormat::Signed,
        scale: 10.0,
        ..point("devices/temperature", 0, 0)
    });
    let (mut server, backend, bus) = gateway(&config);

    backend.push_query(vec![0x06, 0x00, 0x00, 0x00, 0x7B], 0);
    run_once(&mut server).await;

    assert_eq!(
        bus.published(),
        vec![("devices/temperature/on".to_string(), "12.3".to_string())]
    );
}

#[tokio::test]
async fn float_write_publishes_the_decoded_value() {
    let mut config = RegistersConfig::default();
    config.holdings.push(PointConfig {
        format: RegisterFormat::Float,
        size: Some(4),
        ..point("devices/pressure", 0, 0)
    });
    let (mut server, backend, bus) = gateway(&config);

    backend.push_query(
        vec![0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0xBF, 0x9E, 0x04, 0x19],
        0,
    );
    run_once(&mut server).await;

    assert_eq!(
        bus.published(),
        vec![("devices/pressure/on".to_string(), "-1.2345".to_string())]
    );
}

#[tokio::test]
async fn partial_write_reuses_the_cached_remainder() {
    let mut config = RegistersConfig::default();
    config.holdings.push(PointConfig {
        format: RegisterFormat::Float,
        size: Some(4),
        ..point("devices/flow", 0, 0)
    });
    let (mut server, backend, bus) = gateway(&config);

    bus.deliver("devices/flow", "-1.2345");
    // Flip the sign bit register only; the low register stays cached.
    backend.push_query(vec![0x06, 0x00, 0x00, 0x3F, 0x9E], 0);
    run_once(&mut server).await;

    assert_eq!(
        bus.published(),
        vec![("devices/flow/on".to_string(), "1.2345".to_string())]
    );
}

#[tokio::test]
async fn bus_message_is_visible_to_the_next_read() {
    let mut config = RegistersConfig::default();
    config.holdings.push(point("devices/a", 0, 0));
    let (mut server, backend, bus) = gateway(&config);

    bus.deliver("devices/a", "4660");
    backend.push_query(vec![0x03, 0x00, 0x00, 0x00, 0x01], 0);
    run_once(&mut server).await;

    assert_eq!(backend.take_replies(), vec![vec![0x03, 0x02, 0x12, 0x34]]);
    // A read does not republish anything.
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn unregistered_span_gets_an_illegal_address_exception() {
    let mut config = RegistersConfig::default();
    config.holdings.push(point("devices/a", 0, 0));
    let (mut server, backend, _bus) = gateway(&config);

    backend.push_query(vec![0x03, 0x00, 0x05, 0x00, 0x01], 0);
    run_once(&mut server).await;

    assert_eq!(backend.take_replies(), vec![vec![0x83, 0x02]]);
}

#[tokio::test]
async fn coil_write_publishes_and_reads_back() {
    let mut config = RegistersConfig::default();
    config.coils.push(point("devices/relay", 0, 3));
    let (mut server, backend, bus) = gateway(&config);

    backend.push_query(vec![0x05, 0x00, 0x03, 0xFF, 0x00], 0);
    run_once(&mut server).await;
    assert_eq!(
        bus.published(),
        vec![("devices/relay/on".to_string(), "1".to_string())]
    );
    assert_eq!(
        backend.take_replies(),
        vec![vec![0x05, 0x00, 0x03, 0xFF, 0x00]]
    );

    backend.push_query(vec![0x01, 0x00, 0x03, 0x00, 0x01], 0);
    run_once(&mut server).await;
    assert_eq!(backend.take_replies(), vec![vec![0x01, 0x01, 0x01]]);
}

#[tokio::test]
async fn mbap_queries_are_routed_by_unit_id() {
    let mut config = RegistersConfig::default();
    config.holdings.push(point("devices/s1", 1, 0));
    config.holdings.push(point("devices/s2", 2, 0));
    let (mut server, backend, bus) = gateway(&config);

    backend.push_query(
        vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x00, 0x30, 0x39],
        7,
    );
    // A query for a unit nobody observes is dropped silently.
    backend.push_query(
        vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x05, 0x06, 0x00, 0x00, 0x30, 0x39],
        7,
    );
    run_once(&mut server).await;

    assert_eq!(
        bus.published(),
        vec![("devices/s1/on".to_string(), "12345".to_string())]
    );
    let replies = backend.take_replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0][6], 0x01);
}

#[test]
fn overlapping_points_fail_the_build() {
    let mut config = RegistersConfig::default();
    config.holdings.push(point("devices/a", 1, 0));
    config.holdings.push(point("devices/b", 1, 0));
    let backend = FakeBackend::new();
    let mut server = ModbusServer::new(Box::new(backend));
    let bus: Arc<dyn PubSubClient> = Arc::new(RecordingPubSub::default());
    let err = build_gateway(&mut server, &bus, &config).unwrap_err();
    assert_eq!(
        err.to_string(),
        "address overlapping: holding registers: topic devices/b"
    );
}

#[test]
fn empty_configuration_is_rejected() {
    let config = RegistersConfig::default();
    let backend = FakeBackend::new();
    let mut server = ModbusServer::new(Box::new(backend));
    let bus: Arc<dyn PubSubClient> = Arc::new(RecordingPubSub::default());
    assert!(build_gateway(&mut server, &bus, &config).is_err());
}
