//! Poll scheduler behavior: interval bucketing, failure isolation, reload

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{device, table, variable, MockClient, MockProbe};
use gatewaysrv::broker::MqttManager;
use gatewaysrv::events::NotificationHub;
use gatewaysrv::history::HistoryWriter;
use gatewaysrv::model::FieldValue;
use gatewaysrv::pipeline::stages::build_pipeline;
use gatewaysrv::pipeline::StageKind;
use gatewaysrv::registry::Registry;
use gatewaysrv::scheduler::PollScheduler;
use gatewaysrv::session::DeviceManager;
use gatewaysrv::storage::MemoryHistoryStore;
use gatewaysrv::trigger::{HttpActionDispatcher, TriggerEngine};

struct Rig {
    registry: Arc<Registry>,
    hub: Arc<NotificationHub>,
    devices: Arc<DeviceManager>,
    token: CancellationToken,
}

fn rig(quantum: Duration) -> (Rig, tokio::task::JoinHandle<()>) {
    let registry = Arc::new(Registry::new());
    let hub = Arc::new(NotificationHub::new());
    let devices = Arc::new(DeviceManager::new(
        Arc::clone(&registry),
        Arc::clone(&hub),
        10,
        Duration::from_secs(5),
    ));
    let mqtt = Arc::new(MqttManager::new(Arc::clone(&registry), Arc::clone(&hub), 10));
    let triggers = Arc::new(TriggerEngine::new(
        Arc::clone(&registry),
        Arc::new(HttpActionDispatcher::new()),
    ));
    let token = CancellationToken::new();
    let history = Arc::new(HistoryWriter::spawn(
        Arc::new(MemoryHistoryStore::new()),
        50,
        Duration::from_secs(3600),
        token.child_token(),
    ));
    let pipeline = Arc::new(build_pipeline(
        StageKind::default_order(),
        Arc::clone(&registry),
        Arc::clone(&hub),
        mqtt,
        triggers,
        history,
    ));
    let task = PollScheduler::new(
        Arc::clone(&registry),
        Arc::clone(&devices),
        pipeline,
        quantum,
        token.child_token(),
        hub.subscribe_reloaded(),
    )
    .spawn();
    (
        Rig {
            registry,
            hub,
            devices,
            token,
        },
        task,
    )
}

#[tokio::test]
async fn fast_variables_poll_more_often_than_slow_ones() {
    let (rig, task) = rig(Duration::from_millis(10));

    rig.registry.load_devices(vec![device(1)]);
    rig.registry.load_tables(vec![table(10, 1)]);
    rig.registry.load_variables(vec![
        variable(1, 10, "DB1.DBW0", 10),     // fast: 10 ms interval
        variable(2, 10, "DB1.DBW2", 60_000), // slow: 60 s interval
    ]);

    let probe = MockProbe::with_values(&[
        ("DB1.DBW0", FieldValue::Int(1)),
        ("DB1.DBW2", FieldValue::Int(2)),
    ]);
    rig.devices
        .add_device_with_client(1, Box::new(MockClient::new(Arc::clone(&probe))));

    rig.hub.registry_reloaded();
    tokio::time::sleep(Duration::from_millis(400)).await;
    rig.token.cancel();
    let _ = task.await;

    let fast = probe.read_count("DB1.DBW0");
    let slow = probe.read_count("DB1.DBW2");
    assert_eq!(slow, 1, "60 s variable is read once in a 400 ms window");
    assert!(
        fast > slow,
        "10 ms variable must be read more often (fast={fast}, slow={slow})"
    );
    assert!(fast >= 5, "expected several fast polls, got {fast}");
}

#[tokio::test]
async fn one_failing_device_does_not_stall_the_others() {
    let (rig, task) = rig(Duration::from_millis(10));

    rig.registry.load_devices(vec![device(1), device(2)]);
    rig.registry
        .load_tables(vec![table(10, 1), table(20, 2)]);
    rig.registry.load_variables(vec![
        variable(1, 10, "DB1.DBW0", 10),
        variable(2, 20, "DB1.DBW0", 10),
    ]);

    let broken = MockProbe::with_values(&[("DB1.DBW0", FieldValue::Int(1))]);
    broken.fail_reads.store(true, Ordering::SeqCst);
    let healthy = MockProbe::with_values(&[("DB1.DBW0", FieldValue::Int(1))]);

    rig.devices
        .add_device_with_client(1, Box::new(MockClient::new(Arc::clone(&broken))));
    rig.devices
        .add_device_with_client(2, Box::new(MockClient::new(Arc::clone(&healthy))));

    rig.hub.registry_reloaded();
    tokio::time::sleep(Duration::from_millis(300)).await;
    rig.token.cancel();
    let _ = task.await;

    assert!(
        healthy.read_count("DB1.DBW0") >= 5,
        "healthy device keeps polling while its sibling fails"
    );
    let failed_device = rig.registry.device(1).unwrap();
    assert!(!failed_device.connected, "read failure surfaces as a state flag");
}

#[tokio::test]
async fn empty_registry_waits_for_next_reload() {
    let (rig, task) = rig(Duration::from_millis(10));

    let probe = MockProbe::with_values(&[("DB1.DBW0", FieldValue::Int(1))]);
    rig.devices
        .add_device_with_client(1, Box::new(MockClient::new(Arc::clone(&probe))));

    // Reload with nothing loaded: the scheduler must go back to waiting
    rig.hub.registry_reloaded();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(probe.read_count("DB1.DBW0"), 0);

    // Populate and reload again
    rig.registry.load_devices(vec![device(1)]);
    rig.registry.load_tables(vec![table(10, 1)]);
    rig.registry
        .load_variables(vec![variable(1, 10, "DB1.DBW0", 10)]);
    rig.hub.registry_reloaded();
    tokio::time::sleep(Duration::from_millis(200)).await;
    rig.token.cancel();
    let _ = task.await;

    assert!(probe.read_count("DB1.DBW0") >= 1);
}

#[tokio::test]
async fn deactivating_a_variable_applies_without_a_reload() {
    let (rig, task) = rig(Duration::from_millis(10));

    rig.registry.load_devices(vec![device(1)]);
    rig.registry.load_tables(vec![table(10, 1)]);
    rig.registry
        .load_variables(vec![variable(1, 10, "DB1.DBW0", 10)]);

    let probe = MockProbe::with_values(&[("DB1.DBW0", FieldValue::Int(1))]);
    rig.devices
        .add_device_with_client(1, Box::new(MockClient::new(Arc::clone(&probe))));

    rig.hub.registry_reloaded();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(probe.read_count("DB1.DBW0") >= 1);

    // Management-layer mutation, no reload signal
    rig.registry.apply_variable_active_changed(1, false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let frozen = probe.read_count("DB1.DBW0");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(
        probe.read_count("DB1.DBW0"),
        frozen,
        "deactivated variable must stop polling immediately"
    );

    rig.token.cancel();
    let _ = task.await;
}

#[tokio::test]
async fn scheduler_disconnects_devices_on_shutdown() {
    let (rig, task) = rig(Duration::from_millis(10));

    rig.registry.load_devices(vec![device(1)]);
    rig.registry.load_tables(vec![table(10, 1)]);
    rig.registry
        .load_variables(vec![variable(1, 10, "DB1.DBW0", 10)]);

    let probe = MockProbe::with_values(&[("DB1.DBW0", FieldValue::Int(1))]);
    rig.devices
        .add_device_with_client(1, Box::new(MockClient::new(Arc::clone(&probe))));

    rig.hub.registry_reloaded();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig.devices.context(1).unwrap().is_connected());

    rig.token.cancel();
    let _ = task.await;
    assert!(!rig.devices.context(1).unwrap().is_connected());
}
