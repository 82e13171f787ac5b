//! Integration tests for gattkit
//!
//! Every test drives the full client against the in-memory host stack with a
//! paused clock, so timeouts elapse instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use gattkit::ble::fake::{FakeHost, FakePeripheral, HostCall, Reply};
use gattkit::ble::{Advertisement, DuplicatePolicy, FnHandshake, HostEvent, NamedProfile};
use gattkit::{
    AdapterState, BleConfig, BleDevice, BleError, ConnectOptions, ConnectionState, GatePolicy,
    GattClient, PeerId, ScanFilter,
};
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
const CONFIG_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
const CONFIG: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

struct Harness {
    host: Arc<FakeHost>,
    client: GattClient,
}

fn sensor(id: &str) -> FakePeripheral {
    FakePeripheral::new(id, Some("Sensor"))
        .with_service(BATTERY_SERVICE, &[BATTERY_LEVEL])
        .with_service(CONFIG_SERVICE, &[CONFIG])
        .with_value(BATTERY_LEVEL, &[0x5a])
}

async fn harness_with(config: BleConfig) -> Harness {
    let (host, events) = FakeHost::new();
    host.add_peripheral(sensor("sensor-1"));
    host.add_peripheral(sensor("sensor-2"));
    let client = GattClient::new(host.clone(), events, config).unwrap();
    host.set_adapter_state(AdapterState::PoweredOn);
    client.central().wait_ready().await.unwrap();
    Harness { host, client }
}

async fn harness() -> Harness {
    harness_with(BleConfig::default()).await
}

async fn device(harness: &Harness, id: &str) -> BleDevice {
    harness
        .client
        .retrieve_devices(&[PeerId::from(id)])
        .await
        .unwrap()
        .pop()
        .unwrap()
}

async fn connected(harness: &Harness, id: &str) -> BleDevice {
    let device = device(harness, id).await;
    harness
        .client
        .connect(&device, ConnectOptions::default())
        .await
        .unwrap();
    device
}

fn is_read(call: &HostCall) -> bool {
    matches!(call, HostCall::ReadValue { .. })
}

fn is_write(call: &HostCall) -> bool {
    matches!(call, HostCall::WriteValue { .. })
}

fn is_connect(call: &HostCall) -> bool {
    matches!(call, HostCall::Connect { .. })
}

fn notify_toggle(call: &HostCall, on: bool) -> bool {
    matches!(call, HostCall::SetNotifyValue { enabled, .. } if *enabled == on)
}

#[tokio::test(start_paused = true)]
async fn test_connect_reports_each_state() {
    let h = harness().await;
    let device = device(&h, "sensor-1").await;
    let mut events = h.client.connection_events();

    h.client
        .connect(&device, ConnectOptions::default())
        .await
        .unwrap();

    let mut states = Vec::new();
    for _ in 0..3 {
        let event = events.next().await.unwrap();
        assert_eq!(event.device, device);
        states.push(event.state);
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Discovering,
            ConnectionState::Connected,
        ]
    );
    assert!(device.is_connected());
    let mut characteristics = device.characteristics();
    characteristics.sort();
    let mut expected = vec![BATTERY_LEVEL, CONFIG];
    expected.sort();
    assert_eq!(characteristics, expected);
    assert_eq!(h.client.connected_devices(), vec![device]);
}

#[tokio::test(start_paused = true)]
async fn test_read_before_connect_resolves_after_connected() {
    let h = harness().await;
    let device = device(&h, "sensor-1").await;
    h.host.update_behavior(|b| b.read = Reply::Silent);
    let mut events = h.client.connection_events();

    let connecting = device.clone();
    let connect =
        tokio::spawn(async move { connecting.connect(ConnectOptions::default()).await });
    h.host.wait_for_calls(is_connect, 1).await;

    let read = h.client.read(&device, BATTERY_LEVEL);
    h.host.wait_for_calls(is_read, 1).await;
    assert_eq!(device.connection_state(), ConnectionState::Connected);

    h.host.notify("sensor-1", BATTERY_LEVEL, &[0x64]);
    assert_eq!(read.await.unwrap(), vec![0x64]);
    connect.await.unwrap().unwrap();

    let mut states = Vec::new();
    for _ in 0..3 {
        states.push(events.next().await.unwrap().state);
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Discovering,
            ConnectionState::Connected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_one_operation_in_flight() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;
    h.host.update_behavior(|b| b.read = Reply::Silent);

    let first = device.read(BATTERY_LEVEL);
    let second = device.read(CONFIG);
    let third = device.read(BATTERY_LEVEL);

    h.host.wait_for_calls(is_read, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.host.count(is_read), 1);
    assert_eq!(device.operation_queue().len(), 2);

    h.host.notify("sensor-1", BATTERY_LEVEL, &[1]);
    assert_eq!(first.await.unwrap(), vec![1]);

    h.host.wait_for_calls(is_read, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.host.count(is_read), 2);

    h.host.notify("sensor-1", CONFIG, &[2]);
    assert_eq!(second.await.unwrap(), vec![2]);
    h.host.wait_for_calls(is_read, 3).await;
    h.host.notify("sensor-1", BATTERY_LEVEL, &[3]);
    assert_eq!(third.await.unwrap(), vec![3]);

    let order: Vec<Uuid> = h
        .host
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            HostCall::ReadValue { characteristic, .. } => Some(characteristic),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec![BATTERY_LEVEL, CONFIG, BATTERY_LEVEL]);
    assert!(device.operation_queue().is_idle());
}

#[tokio::test(start_paused = true)]
async fn test_completion_order_matches_enqueue_order() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;
    let completed = Arc::new(Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for i in 0..6u8 {
        let handle = if i % 2 == 0 {
            device.read(BATTERY_LEVEL)
        } else {
            device.write(CONFIG, vec![i])
        };
        let completed = completed.clone();
        tasks.push(tokio::spawn(async move {
            handle.await.unwrap();
            completed.lock().push(i);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*completed.lock(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(h.host.count(is_read), 3);
    assert_eq!(h.host.count(is_write), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_read_times_out_and_queue_moves_on() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;
    h.host.update_behavior(|b| b.read = Reply::Silent);

    let started = Instant::now();
    let stalled = device.read(BATTERY_LEVEL);
    let next = device.read(CONFIG);
    h.host.wait_for_calls(is_read, 1).await;
    h.host.update_behavior(|b| b.read = Reply::Respond);

    assert_eq!(stalled.await, Err(BleError::CommunicationTimeout));
    let timed_out = Instant::now();
    let elapsed = timed_out - started;
    assert!(elapsed >= Duration::from_millis(3000));
    assert!(elapsed < Duration::from_millis(3100));

    assert_eq!(next.await.unwrap(), Vec::<u8>::new());
    assert_eq!(Instant::now(), timed_out);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_every_pending_operation() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;
    h.host.update_behavior(|b| b.read = Reply::Silent);

    let pending: Vec<_> = (0..4).map(|_| device.read(BATTERY_LEVEL)).collect();
    h.host.wait_for_calls(is_read, 1).await;

    h.client.disconnect(&device).await;

    for handle in pending {
        assert_eq!(handle.await, Err(BleError::Disconnected));
    }
    assert_eq!(h.host.count(is_read), 1);
    assert!(device.operation_queue().is_idle());
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    assert!(h.client.connected_devices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_fails_pending_operations() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;
    h.host.update_behavior(|b| b.read = Reply::Silent);

    let pending: Vec<_> = (0..3).map(|_| device.read(BATTERY_LEVEL)).collect();
    h.host.wait_for_calls(is_read, 1).await;
    h.host.drop_link("sensor-1");

    for handle in pending {
        assert_eq!(handle.await, Err(BleError::Disconnected));
    }
    assert!(device.operation_queue().is_idle());
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    assert!(device.characteristics().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_share_one_notify_toggle() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;

    let mut first_subscription = h.client.subscribe(&device, BATTERY_LEVEL);
    let mut second_subscription = h.client.subscribe(&device, BATTERY_LEVEL);
    let mut first = first_subscription.next().await.unwrap().unwrap();
    let mut second = second_subscription.next().await.unwrap().unwrap();
    assert_eq!(h.host.count(|c| notify_toggle(c, true)), 1);

    h.host.notify("sensor-1", BATTERY_LEVEL, &[0x42]);
    assert_eq!(first.next().await, Some(Ok(vec![0x42])));
    assert_eq!(second.next().await, Some(Ok(vec![0x42])));

    drop(first);
    drop(first_subscription);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.host.count(|c| notify_toggle(c, false)), 0);

    drop(second);
    h.host.wait_for_calls(|c| notify_toggle(c, false), 1).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.host.count(|c| notify_toggle(c, false)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_closes_on_link_loss() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;

    let mut notifications = h
        .client
        .subscribe(&device, BATTERY_LEVEL)
        .next()
        .await
        .unwrap()
        .unwrap();
    h.host.drop_link("sensor-1");

    assert_eq!(notifications.next().await, Some(Err(BleError::Disconnected)));
    assert_eq!(notifications.next().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_notify_failure_reaches_subscriber() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;
    h.host
        .update_behavior(|b| b.notify = Reply::Fail("not permitted".to_string()));

    let result = h.client.subscribe(&device, CONFIG).next().await.unwrap();
    assert!(matches!(
        result,
        Err(BleError::CommunicationError { cause }) if cause == "not permitted"
    ));

    h.host.update_behavior(|b| b.notify = Reply::Respond);
    assert!(h
        .client
        .subscribe(&device, CONFIG)
        .next()
        .await
        .unwrap()
        .is_ok());
    assert_eq!(h.host.count(|c| notify_toggle(c, true)), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_share_one_attempt() {
    let h = harness().await;
    let device = device(&h, "sensor-1").await;
    h.host.update_behavior(|b| b.connect = Reply::Silent);

    let a = device.clone();
    let b = device.clone();
    let first = tokio::spawn(async move { a.connect(ConnectOptions::default()).await });
    let second = tokio::spawn(async move { b.connect(ConnectOptions::default()).await });

    h.host.wait_for_calls(is_connect, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.host.count(is_connect), 1);
    assert_eq!(device.connection_state(), ConnectionState::Connecting);

    h.host.emit(HostEvent::Connected {
        peer: PeerId::from("sensor-1"),
    });
    assert_eq!(first.await.unwrap(), Ok(()));
    assert_eq!(second.await.unwrap(), Ok(()));
    assert_eq!(h.host.count(is_connect), 1);
    assert!(device.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_returns_to_disconnected() {
    let h = harness().await;
    let device = device(&h, "sensor-1").await;
    h.host
        .update_behavior(|b| b.connect = Reply::Fail("out of range".to_string()));

    let result = h.client.connect(&device, ConnectOptions::default()).await;
    assert_eq!(
        result,
        Err(BleError::ConnectFailed {
            cause: "out of range".to_string()
        })
    );
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.host.count(|c| matches!(c, HostCall::DiscoverServices(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_discovery_timeout_fails_connect() {
    let h = harness().await;
    let device = device(&h, "sensor-1").await;
    h.host.update_behavior(|b| b.discovery = Reply::Silent);

    let started = Instant::now();
    let result = h.client.connect(&device, ConnectOptions::default()).await;
    assert_eq!(
        result,
        Err(BleError::ConnectFailed {
            cause: "service discovery timed out".to_string()
        })
    );
    assert!(Instant::now() - started >= Duration::from_secs(10));
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        h.host
            .count(|c| matches!(c, HostCall::CancelConnection(_))),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_unknown_characteristic() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;
    let missing = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);

    let started = Instant::now();
    assert_eq!(
        device.read(missing).await,
        Err(BleError::CharacteristicNotFound { id: missing })
    );
    let elapsed = Instant::now() - started;
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1100));
    assert_eq!(h.host.count(is_read), 0);
}

#[tokio::test(start_paused = true)]
async fn test_read_on_disconnected_device_fails_fast() {
    let h = harness().await;
    let device = device(&h, "sensor-1").await;

    assert_eq!(
        device.read(BATTERY_LEVEL).await,
        Err(BleError::Disconnected)
    );
    assert_eq!(h.host.count(is_read), 0);
}

#[tokio::test(start_paused = true)]
async fn test_powered_off_scan_fails_without_radio() {
    let (host, events) = FakeHost::new();
    let client = GattClient::new(host.clone(), events, BleConfig::default()).unwrap();
    host.set_adapter_state(AdapterState::PoweredOff);

    let mut scan = client.scan(ScanFilter::new());
    assert!(matches!(
        scan.next().await,
        Some(Err(BleError::AdapterUnavailable {
            reason: AdapterState::PoweredOff
        }))
    ));
    assert!(scan.next().await.is_none());
    assert_eq!(host.count(|c| matches!(c, HostCall::StartScan(_))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_writes_reach_radio_one_at_a_time() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;
    h.host.update_behavior(|b| b.write = Reply::Silent);

    let first = device.write(CONFIG, vec![0x01]);
    let second = device.write(CONFIG, vec![0x02]);

    h.host.wait_for_calls(is_write, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.host.count(is_write), 1);

    h.host.acknowledge_write("sensor-1", CONFIG, None);
    assert_eq!(first.await.unwrap(), vec![0x01]);

    h.host.wait_for_calls(is_write, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.host.count(is_write), 2);

    h.host.acknowledge_write("sensor-1", CONFIG, None);
    assert_eq!(second.await.unwrap(), vec![0x02]);
}

#[tokio::test(start_paused = true)]
async fn test_write_resolves_with_echoed_payload() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;
    h.host.set_echo_writes(true);

    assert_eq!(device.write(CONFIG, vec![7, 8]).await.unwrap(), vec![7, 8]);
    assert_eq!(device.read(CONFIG).await.unwrap(), vec![7, 8]);
}

#[tokio::test(start_paused = true)]
async fn test_global_gate_spans_devices() {
    let h = harness().await;
    let one = connected(&h, "sensor-1").await;
    let two = connected(&h, "sensor-2").await;
    h.host.update_behavior(|b| b.read = Reply::Silent);

    let first = one.read(BATTERY_LEVEL);
    let _second = two.read(BATTERY_LEVEL);
    h.host.wait_for_calls(is_read, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.host.count(is_read), 1);

    h.host.notify("sensor-1", BATTERY_LEVEL, &[1]);
    assert_eq!(first.await.unwrap(), vec![1]);
    h.host.wait_for_calls(is_read, 2).await;
}

#[tokio::test(start_paused = true)]
async fn test_per_device_gate_runs_devices_in_parallel() {
    let h = harness_with(BleConfig {
        gate_policy: GatePolicy::PerDevice,
        ..Default::default()
    })
    .await;
    let one = connected(&h, "sensor-1").await;
    let two = connected(&h, "sensor-2").await;
    h.host.update_behavior(|b| b.read = Reply::Silent);

    let first = one.read(BATTERY_LEVEL);
    let queued = one.read(BATTERY_LEVEL);
    let second = two.read(BATTERY_LEVEL);
    h.host.wait_for_calls(is_read, 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.host.count(is_read), 2);
    assert!(!Arc::ptr_eq(one.operation_queue(), two.operation_queue()));

    h.host.notify("sensor-2", BATTERY_LEVEL, &[2]);
    h.host.notify("sensor-1", BATTERY_LEVEL, &[1]);
    assert_eq!(second.await.unwrap(), vec![2]);
    assert_eq!(first.await.unwrap(), vec![1]);
    drop(queued);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_gates_connected_state() {
    let (host, events) = FakeHost::new();
    host.add_peripheral(sensor("sensor-1"));
    let handshake = FnHandshake::new(|device: BleDevice| async move {
        assert_eq!(device.connection_state(), ConnectionState::Discovering);
        device.write(CONFIG, vec![0xa5]).await.map(|_| ())
    });
    let client = GattClient::with_profile(
        host.clone(),
        events,
        BleConfig::default(),
        Arc::new(NamedProfile::new("Sensor").with_handshake(handshake)),
    )
    .unwrap();
    host.set_adapter_state(AdapterState::PoweredOn);

    let device = client
        .retrieve_devices(&[PeerId::from("sensor-1")])
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert!(device.has_handshake());
    let mut events = client.connection_events();

    client
        .connect(&device, ConnectOptions::default())
        .await
        .unwrap();
    assert!(device.is_connected());
    assert_eq!(host.count(is_write), 1);

    let mut states = Vec::new();
    for _ in 0..3 {
        states.push(events.next().await.unwrap().state);
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Discovering,
            ConnectionState::Connected,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_handshake_disconnects() {
    let (host, events) = FakeHost::new();
    host.add_peripheral(sensor("sensor-1"));
    let handshake = FnHandshake::new(|_device: BleDevice| async move {
        Err(BleError::CommunicationError {
            cause: "bad token".to_string(),
        })
    });
    let client = GattClient::with_profile(
        host.clone(),
        events,
        BleConfig::default(),
        Arc::new(NamedProfile::new("Sensor").with_handshake(handshake)),
    )
    .unwrap();
    host.set_adapter_state(AdapterState::PoweredOn);
    let device = client
        .retrieve_devices(&[PeerId::from("sensor-1")])
        .await
        .unwrap()
        .pop()
        .unwrap();

    let result = client.connect(&device, ConnectOptions::default()).await;
    assert!(matches!(result, Err(BleError::CommunicationError { .. })));
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    assert_eq!(host.count(|c| matches!(c, HostCall::CancelConnection(_))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_settles_before_discovery() {
    let h = harness().await;
    let device = device(&h, "sensor-1").await;
    h.client
        .connect(
            &device,
            ConnectOptions {
                auto_reconnect: true,
            },
        )
        .await
        .unwrap();

    let started = Instant::now();
    device.reconnect().await.unwrap();
    assert!(Instant::now() - started >= Duration::from_millis(500));
    assert!(device.is_connected());

    let connects: Vec<_> = h
        .host
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            HostCall::Connect { options, .. } => Some(options.auto_reconnect),
            _ => None,
        })
        .collect();
    assert_eq!(connects, vec![true, true]);
    assert_eq!(h.host.count(|c| matches!(c, HostCall::DiscoverServices(_))), 2);
    assert_eq!(h.host.count(|c| matches!(c, HostCall::CancelConnection(_))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_adapter_power_loss_drops_connections() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;
    h.host.update_behavior(|b| b.read = Reply::Silent);

    let pending = device.read(BATTERY_LEVEL);
    h.host.wait_for_calls(is_read, 1).await;
    h.host.set_adapter_state(AdapterState::PoweredOff);

    assert_eq!(pending.await, Err(BleError::Disconnected));
    assert_eq!(device.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        h.client.connect(&device, ConnectOptions::default()).await,
        Err(BleError::AdapterUnavailable {
            reason: AdapterState::PoweredOff
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_scan_devices_accumulates_distinct_peers() {
    let h = harness().await;
    let mut updates = h
        .client
        .central()
        .scan_devices_for(ScanFilter::new(), Duration::from_secs(5));
    assert!(futures::poll!(updates.next()).is_pending());

    h.host.advertise("sensor-1", Advertisement::default(), -40);
    h.host.advertise("sensor-1", Advertisement::default(), -42);
    h.host.advertise("sensor-2", Advertisement::default(), -60);

    let sizes: Vec<usize> = updates
        .map(|update| update.unwrap().len())
        .collect()
        .await;
    assert_eq!(sizes, vec![1, 2]);
    assert_eq!(h.client.devices().len(), 2);
    h.host.wait_for_calls(|c| matches!(c, HostCall::StopScan), 1).await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_scans_share_one_radio_scan() {
    let h = harness().await;
    let mut battery = h
        .client
        .scan(ScanFilter::new().with_service(BATTERY_SERVICE));
    let mut everything = h
        .client
        .scan(ScanFilter::new().with_duplicates(DuplicatePolicy::EmitAll));
    assert!(futures::poll!(battery.next()).is_pending());
    assert!(futures::poll!(everything.next()).is_pending());

    let starts: Vec<_> = h
        .host
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            HostCall::StartScan(request) => Some(request),
            _ => None,
        })
        .collect();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0].services, vec![BATTERY_SERVICE]);
    assert!(starts[1].services.is_empty());
    assert!(starts[1].allow_duplicates);

    let unrelated = Advertisement {
        services: vec![CONFIG_SERVICE],
        ..Default::default()
    };
    let battery_ad = Advertisement {
        services: vec![BATTERY_SERVICE],
        ..Default::default()
    };
    h.host.advertise("sensor-2", unrelated, -70);
    h.host.advertise("sensor-1", battery_ad, -50);

    let seen = everything.next().await.unwrap().unwrap();
    assert_eq!(seen.device.identifier(), &PeerId::from("sensor-2"));
    let seen = battery.next().await.unwrap().unwrap();
    assert_eq!(seen.device.identifier(), &PeerId::from("sensor-1"));
    assert_eq!(seen.rssi, -50);

    drop(battery);
    drop(everything);
    assert_eq!(h.host.count(|c| matches!(c, HostCall::StopScan)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_registry_tracks_connected_devices() {
    let h = harness().await;
    let first = connected(&h, "sensor-1").await;
    let second = device(&h, "sensor-2").await;

    assert_eq!(h.client.devices().len(), 2);
    assert_eq!(h.client.connected_devices(), vec![first.clone()]);

    let removed = h.client.central().remove_device(second.identifier());
    assert_eq!(removed, Some(second.clone()));
    assert!(h.client.central().device(second.identifier()).is_none());

    let again = device(&h, "sensor-2").await;
    assert_eq!(again.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.client.devices().len(), 2);

    h.client.disconnect(&first).await;
    assert!(h.client.connected_devices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_failed_connect_reaches_host() {
    let h = harness().await;
    let device = device(&h, "sensor-1").await;
    h.host
        .update_behavior(|b| b.connect = Reply::Fail("busy".to_string()));

    // Joins the attempt but is not awaited until after the retry
    let waiting = h.client.connect(&device, ConnectOptions::default());
    tokio::pin!(waiting);
    assert!(futures::poll!(&mut waiting).is_pending());

    let failed = h.client.connect(&device, ConnectOptions::default()).await;
    assert!(matches!(failed, Err(BleError::ConnectFailed { .. })));

    h.host.update_behavior(|b| b.connect = Reply::Respond);
    h.client
        .connect(&device, ConnectOptions::default())
        .await
        .unwrap();
    assert_eq!(h.host.count(is_connect), 2);
    assert!(device.is_connected());

    assert!(matches!(
        waiting.await,
        Err(BleError::ConnectFailed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_characteristic_lookup() {
    let h = harness().await;
    let device = connected(&h, "sensor-1").await;
    let missing = Uuid::from_u128(0x0000ffff_0000_1000_8000_00805f9b34fb);

    let started = Instant::now();
    let looking_up = h.client.read(&device, missing);
    let queued = h.client.read(&device, BATTERY_LEVEL);
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.client.disconnect(&device).await;
    assert_eq!(looking_up.await, Err(BleError::Disconnected));
    assert_eq!(queued.await, Err(BleError::Disconnected));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(h.host.count(is_read), 0);
}
