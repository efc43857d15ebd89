//! Device session manager behavior: bounded connects, timeouts, idempotency

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{MockClient, MockProbe};
use gatewaysrv::events::NotificationHub;
use gatewaysrv::model::DataType;
use gatewaysrv::registry::Registry;
use gatewaysrv::session::{DeviceManager, PollVariable};

fn manager(connect_limit: usize, connect_timeout: Duration) -> Arc<DeviceManager> {
    let registry = Arc::new(Registry::new());
    let hub = Arc::new(NotificationHub::new());
    Arc::new(DeviceManager::new(registry, hub, connect_limit, connect_timeout))
}

#[tokio::test]
async fn connect_fanout_is_bounded_by_the_semaphore() {
    let manager = manager(10, Duration::from_secs(5));
    let probe = Arc::new(MockProbe::default());

    for id in 0..20 {
        manager.add_device_with_client(
            id,
            Box::new(MockClient::with_connect_delay(
                Arc::clone(&probe),
                Duration::from_millis(50),
            )),
        );
    }

    let attempts = (0..20).map(|id| {
        let manager = Arc::clone(&manager);
        async move {
            let _ = manager.connect(id).await;
        }
    });
    futures::future::join_all(attempts).await;

    assert_eq!(probe.connects.load(Ordering::SeqCst), 20);
    let max_inflight = probe.max_inflight_connects.load(Ordering::SeqCst);
    assert!(
        max_inflight <= 10,
        "never more than 10 connects in flight, saw {max_inflight}"
    );
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_is_independent_of_cancellation() {
    let manager = manager(10, Duration::from_millis(100));
    let probe = Arc::new(MockProbe::default());
    manager.add_device_with_client(
        1,
        Box::new(MockClient::with_connect_delay(
            Arc::clone(&probe),
            Duration::from_secs(60), // hung connect
        )),
    );

    let result = manager.connect(1).await;
    assert!(result.is_err());
    let context = manager.context(1).unwrap();
    assert!(!context.is_connected());
    assert_eq!(context.reconnect_attempts(), 1);

    // Another failure keeps counting
    let _ = manager.connect(1).await;
    assert_eq!(manager.context(1).unwrap().reconnect_attempts(), 2);
}

#[tokio::test]
async fn successful_connect_resets_the_reconnect_counter() {
    let manager = manager(10, Duration::from_secs(1));
    let probe = Arc::new(MockProbe::default());
    probe.fail_connects.store(true, Ordering::SeqCst);
    manager.add_device_with_client(1, Box::new(MockClient::new(Arc::clone(&probe))));

    let _ = manager.connect(1).await;
    let _ = manager.connect(1).await;
    assert_eq!(manager.context(1).unwrap().reconnect_attempts(), 2);

    probe.fail_connects.store(false, Ordering::SeqCst);
    manager.connect(1).await.unwrap();
    let context = manager.context(1).unwrap();
    assert!(context.is_connected());
    assert_eq!(context.reconnect_attempts(), 0);
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let manager = manager(10, Duration::from_secs(1));
    let probe = Arc::new(MockProbe::default());
    manager.add_device_with_client(1, Box::new(MockClient::new(Arc::clone(&probe))));

    manager.connect(1).await.unwrap();
    manager.disconnect(1).await;
    manager.disconnect(1).await; // no-op
    manager.disconnect(99).await; // unknown device, no-op
    assert!(!manager.context(1).unwrap().is_connected());
}

#[tokio::test]
async fn re_adding_a_device_overwrites_its_context() {
    let manager = manager(10, Duration::from_secs(1));
    let probe_a = Arc::new(MockProbe::default());
    let probe_b = Arc::new(MockProbe::default());

    manager.add_device_with_client(1, Box::new(MockClient::new(Arc::clone(&probe_a))));
    manager.connect(1).await.unwrap();

    manager.add_device_with_client(1, Box::new(MockClient::new(Arc::clone(&probe_b))));
    let context = manager.context(1).unwrap();
    assert!(
        !context.is_connected(),
        "fresh context starts disconnected"
    );

    manager.connect(1).await.unwrap();
    assert_eq!(probe_a.connects.load(Ordering::SeqCst), 1);
    assert_eq!(probe_b.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn update_variables_replaces_the_tracked_set() {
    let manager = manager(10, Duration::from_secs(1));
    let probe = Arc::new(MockProbe::default());
    manager.add_device_with_client(1, Box::new(MockClient::new(Arc::clone(&probe))));

    let set_a = vec![PollVariable {
        variable_id: 1,
        address: "DB1.DBW0".into(),
        data_type: DataType::Int16,
        interval: Duration::from_millis(100),
    }];
    manager.update_variables(1, set_a).await.unwrap();

    let set_b = vec![
        PollVariable {
            variable_id: 2,
            address: "DB1.DBW2".into(),
            data_type: DataType::Int16,
            interval: Duration::from_millis(100),
        },
        PollVariable {
            variable_id: 3,
            address: "DB1.DBW4".into(),
            data_type: DataType::Int16,
            interval: Duration::from_millis(100),
        },
    ];
    manager.update_variables(1, set_b).await.unwrap();

    let tracked = manager.context(1).unwrap().tracked_variables().await;
    assert_eq!(tracked.len(), 2);
    assert!(tracked.iter().all(|pv| pv.variable_id != 1));
}

#[tokio::test]
async fn device_state_notifications_fire_on_both_outcomes() {
    let registry = Arc::new(Registry::new());
    let hub = Arc::new(NotificationHub::new());
    let manager = DeviceManager::new(
        Arc::clone(&registry),
        Arc::clone(&hub),
        10,
        Duration::from_secs(1),
    );
    let mut events = hub.subscribe_device_state();

    let probe = Arc::new(MockProbe::default());
    probe.fail_connects.store(true, Ordering::SeqCst);
    manager.add_device_with_client(1, Box::new(MockClient::new(Arc::clone(&probe))));

    let _ = manager.connect(1).await;
    let event = events.try_recv().unwrap();
    assert!(!event.connected);
    assert!(event.error.is_some());

    probe.fail_connects.store(false, Ordering::SeqCst);
    manager.connect(1).await.unwrap();
    let event = events.try_recv().unwrap();
    assert!(event.connected);
    assert!(event.error.is_none());
}
