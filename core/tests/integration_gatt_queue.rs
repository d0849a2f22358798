// Integration test: per-device GATT queue through the spawned bridge
//
// Covers strict FIFO correlation, stray results, timeouts, link loss with
// pending operations, subscriptions and backpressure.

mod common;

use blebridge_core::{
    BridgeConfig, BridgeError, GattOpKind, Notification, PeripheralId, PlatformCallback,
    WriteType,
};
use common::{
    ccc, target, Harness, RadioCall, BODY_SENSOR_LOCATION, CONTROL_POINT, HEART_RATE_MEASUREMENT,
};
use futures::future::join_all;
use std::time::Duration;

const DEVICE: &str = "AA:BB:CC:DD:EE:01";
const OTHER: &str = "AA:BB:CC:DD:EE:02";

fn device() -> PeripheralId {
    PeripheralId::new(DEVICE)
}

fn gatt_calls(calls: Vec<RadioCall>) -> Vec<RadioCall> {
    calls
        .into_iter()
        .filter(|c| {
            matches!(
                c,
                RadioCall::Read(..)
                    | RadioCall::Write(..)
                    | RadioCall::SetNotify(..)
                    | RadioCall::ReadDescriptor(..)
                    | RadioCall::WriteDescriptor(..)
            )
        })
        .collect()
}

#[tokio::test]
async fn test_stray_write_result_stays_behind_read() {
    let h = Harness::start();
    h.connect_ready(DEVICE).await;

    let mut read = h
        .bridge
        .read(&device(), target(BODY_SENSOR_LOCATION))
        .await
        .expect("read accepted");
    let mut write = h
        .bridge
        .write(&device(), target(CONTROL_POINT), vec![0x01])
        .await
        .expect("write accepted");

    // Result for the queued write arrives before the read's own result
    h.write_response(DEVICE, CONTROL_POINT, 0);
    h.sync().await;
    assert!(read.try_result().is_none());
    assert!(write.try_result().is_none());
    assert_eq!(
        gatt_calls(h.radio.calls()),
        vec![RadioCall::Read(device(), target(BODY_SENSOR_LOCATION))]
    );

    h.read_response(DEVICE, BODY_SENSOR_LOCATION, vec![0x02]);
    assert_eq!(read.await, Ok(Some(vec![0x02])));

    // Only now is the write handed to the radio
    h.sync().await;
    assert_eq!(
        gatt_calls(h.radio.calls()).last(),
        Some(&RadioCall::Write(
            device(),
            target(CONTROL_POINT),
            vec![0x01],
            WriteType::WithResponse
        ))
    );
    assert!(write.try_result().is_none());

    h.write_response(DEVICE, CONTROL_POINT, 0);
    assert_eq!(write.await, Ok(None));
    println!("✓ Stray write result dropped; write dispatched after read resolved");
}

#[tokio::test]
async fn test_resolution_order_matches_enqueue_order() {
    let h = Harness::start();
    h.connect_ready(DEVICE).await;

    let characteristics = [
        HEART_RATE_MEASUREMENT,
        BODY_SENSOR_LOCATION,
        CONTROL_POINT,
        BODY_SENSOR_LOCATION,
        HEART_RATE_MEASUREMENT,
    ];
    let mut handles = Vec::new();
    for c in characteristics {
        handles.push(h.bridge.read(&device(), target(c)).await.expect("read"));
    }

    // Answer each head, preceded by results for characteristics still queued
    for (i, c) in characteristics.iter().enumerate() {
        for other in characteristics.iter().skip(i + 1).filter(|o| *o != c) {
            h.read_response(DEVICE, other, vec![0xEE]);
        }
        h.read_response(DEVICE, c, vec![i as u8]);
        h.sync().await;
    }

    let results = join_all(handles).await;
    let values: Vec<u8> = results
        .into_iter()
        .map(|r| r.expect("read ok").expect("value")[0])
        .collect();
    assert_eq!(values, vec![0, 1, 2, 3, 4]);

    let dispatched: Vec<RadioCall> = characteristics
        .iter()
        .map(|c| RadioCall::Read(device(), target(c)))
        .collect();
    assert_eq!(gatt_calls(h.radio.calls()), dispatched);
}

#[tokio::test]
async fn test_disconnect_fails_all_pending_with_link_lost() {
    let h = Harness::start();
    h.connect_ready(DEVICE).await;

    let mut handles = Vec::new();
    for i in 0..5u8 {
        handles.push(
            h.bridge
                .write(&device(), target(CONTROL_POINT), vec![i])
                .await
                .expect("write"),
        );
    }

    let _disconnect = h.bridge.disconnect(&device()).await.expect("disconnect");
    // All five resolved in the same loop turn as the disconnect command
    for handle in handles.iter_mut() {
        assert_eq!(
            handle.try_result(),
            Some(Err(BridgeError::LinkLost { id: device() }))
        );
    }

    let result = h.bridge.read(&device(), target(CONTROL_POINT)).await;
    assert!(matches!(result, Err(BridgeError::InvalidState { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_operation_does_not_block_queue() {
    let h = Harness::start();
    h.connect_ready(DEVICE).await;

    let first = h
        .bridge
        .read(&device(), target(HEART_RATE_MEASUREMENT))
        .await
        .expect("first");
    let second = h
        .bridge
        .read(&device(), target(BODY_SENSOR_LOCATION))
        .await
        .expect("second");

    match first.await {
        Err(BridgeError::OperationTimeout { id, kind, .. }) => {
            assert_eq!(id, device());
            assert_eq!(kind, GattOpKind::Read);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    h.sync().await;
    assert_eq!(
        gatt_calls(h.radio.calls()).last(),
        Some(&RadioCall::Read(device(), target(BODY_SENSOR_LOCATION)))
    );
    h.read_response(DEVICE, BODY_SENSOR_LOCATION, vec![0x01]);
    assert_eq!(second.await, Ok(Some(vec![0x01])));
}

#[tokio::test]
async fn test_subscription_routes_notifications() {
    let mut h = Harness::start();
    h.connect_ready(DEVICE).await;
    h.drain_notifications();

    // Not subscribed yet: dropped
    h.value_changed(DEVICE, HEART_RATE_MEASUREMENT, vec![0x00, 60]);

    let subscribe = h
        .bridge
        .subscribe(&device(), target(HEART_RATE_MEASUREMENT))
        .await
        .expect("subscribe");
    h.notify_state(DEVICE, HEART_RATE_MEASUREMENT, true);
    subscribe.await.expect("subscribed");

    h.value_changed(DEVICE, HEART_RATE_MEASUREMENT, vec![0x00, 72]);
    h.value_changed(DEVICE, HEART_RATE_MEASUREMENT, vec![0x00, 74]);
    h.sync().await;

    let values: Vec<Vec<u8>> = h
        .drain_notifications()
        .into_iter()
        .filter_map(|n| match n {
            Notification::ValueChanged { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(values, vec![vec![0x00, 72], vec![0x00, 74]]);

    let unsubscribe = h
        .bridge
        .unsubscribe(&device(), target(HEART_RATE_MEASUREMENT))
        .await
        .expect("unsubscribe");
    h.notify_state(DEVICE, HEART_RATE_MEASUREMENT, false);
    unsubscribe.await.expect("unsubscribed");

    h.value_changed(DEVICE, HEART_RATE_MEASUREMENT, vec![0x00, 80]);
    h.sync().await;
    assert!(h.drain_notifications().is_empty());
    println!("✓ Notifications routed only while subscribed");
}

#[tokio::test]
async fn test_notification_bypasses_queue() {
    let mut h = Harness::start();
    h.connect_ready(DEVICE).await;

    let subscribe = h
        .bridge
        .subscribe(&device(), target(HEART_RATE_MEASUREMENT))
        .await
        .expect("subscribe");
    h.notify_state(DEVICE, HEART_RATE_MEASUREMENT, true);
    subscribe.await.expect("subscribed");
    h.drain_notifications();

    // A read on another characteristic is in flight; notifications still flow
    let mut read = h
        .bridge
        .read(&device(), target(BODY_SENSOR_LOCATION))
        .await
        .expect("read");
    h.value_changed(DEVICE, HEART_RATE_MEASUREMENT, vec![0x00, 90]);
    h.sync().await;

    assert!(read.try_result().is_none());
    assert!(h
        .drain_notifications()
        .iter()
        .any(|n| matches!(n, Notification::ValueChanged { value, .. } if value == &vec![0x00, 90])));
}

#[tokio::test]
async fn test_queue_full_backpressure() {
    let config = BridgeConfig {
        max_queued_operations: 2,
        ..Default::default()
    };
    let h = Harness::with_config(config);
    h.connect_ready(DEVICE).await;

    let _a = h.bridge.read(&device(), target(CONTROL_POINT)).await.expect("a");
    let _b = h.bridge.read(&device(), target(CONTROL_POINT)).await.expect("b");
    let c = h.bridge.read(&device(), target(CONTROL_POINT)).await;
    assert_eq!(
        c.map(|_| ()),
        Err(BridgeError::QueueFull {
            id: device(),
            capacity: 2
        })
    );
}

#[tokio::test]
async fn test_failed_write_status() {
    let h = Harness::start();
    h.connect_ready(DEVICE).await;

    let write = h
        .bridge
        .write(&device(), target(CONTROL_POINT), vec![0xFF])
        .await
        .expect("write");
    h.write_response(DEVICE, CONTROL_POINT, 0x03);

    match write.await {
        Err(BridgeError::OperationFailed { kind, status, .. }) => {
            assert_eq!(kind, GattOpKind::Write);
            assert_eq!(status.0, 0x03);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_write_without_response_and_mtu_limit() {
    let h = Harness::start();
    h.connect_ready(DEVICE).await;

    let quick = h
        .bridge
        .write_without_response(&device(), target(CONTROL_POINT), vec![0u8; 20])
        .await
        .expect("accepted");
    assert_eq!(quick.await, Ok(None));

    let too_big = h
        .bridge
        .write_without_response(&device(), target(CONTROL_POINT), vec![0u8; 21])
        .await;
    assert!(matches!(too_big, Err(BridgeError::InvalidCommand(_))));

    h.deliver(PlatformCallback::MtuChanged {
        identifier: DEVICE.to_string(),
        mtu: 247,
        status: 0,
    });
    let larger = h
        .bridge
        .write_without_response(&device(), target(CONTROL_POINT), vec![0u8; 244])
        .await
        .expect("fits the negotiated MTU");
    assert_eq!(larger.await, Ok(None));
}

#[tokio::test]
async fn test_descriptor_read_and_write() {
    let h = Harness::start();
    h.connect_ready(DEVICE).await;

    let read = h
        .bridge
        .read_descriptor(&device(), target(HEART_RATE_MEASUREMENT), ccc())
        .await
        .expect("descriptor read");
    h.deliver(PlatformCallback::DescriptorRead {
        identifier: DEVICE.to_string(),
        service: common::HEART_RATE_SERVICE.to_string(),
        characteristic: HEART_RATE_MEASUREMENT.to_string(),
        descriptor: common::CCC_DESCRIPTOR.to_string(),
        status: 0,
        value: vec![0x00, 0x00],
    });
    assert_eq!(read.await, Ok(Some(vec![0x00, 0x00])));

    let write = h
        .bridge
        .write_descriptor(&device(), target(HEART_RATE_MEASUREMENT), ccc(), vec![0x01, 0x00])
        .await
        .expect("descriptor write");
    h.deliver(PlatformCallback::DescriptorWrite {
        identifier: DEVICE.to_string(),
        service: common::HEART_RATE_SERVICE.to_string(),
        characteristic: HEART_RATE_MEASUREMENT.to_string(),
        descriptor: common::CCC_DESCRIPTOR.to_string(),
        status: 0,
    });
    assert_eq!(write.await, Ok(None));

    assert_eq!(
        gatt_calls(h.radio.calls()),
        vec![
            RadioCall::ReadDescriptor(device(), target(HEART_RATE_MEASUREMENT), ccc()),
            RadioCall::WriteDescriptor(
                device(),
                target(HEART_RATE_MEASUREMENT),
                ccc(),
                vec![0x01, 0x00]
            ),
        ]
    );
}

#[tokio::test]
async fn test_devices_progress_independently() {
    let h = Harness::start();
    h.connect_ready(DEVICE).await;
    h.connect_ready(OTHER).await;

    let mut stalled = h
        .bridge
        .read(&device(), target(CONTROL_POINT))
        .await
        .expect("stalled read");
    let other = h
        .bridge
        .read(&PeripheralId::new(OTHER), target(CONTROL_POINT))
        .await
        .expect("other read");

    h.read_response(OTHER, CONTROL_POINT, vec![0x42]);
    assert_eq!(other.await, Ok(Some(vec![0x42])));
    assert!(stalled.try_result().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_late_result_after_timeout_is_dropped() {
    let h = Harness::start();
    h.connect_ready(DEVICE).await;

    let first = h
        .bridge
        .read(&device(), target(CONTROL_POINT))
        .await
        .expect("first");
    assert!(matches!(
        first.await,
        Err(BridgeError::OperationTimeout { .. })
    ));

    // The platform finally answers the timed-out read; nothing is waiting
    h.read_response(DEVICE, CONTROL_POINT, vec![0x99]);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = h
        .bridge
        .read(&device(), target(BODY_SENSOR_LOCATION))
        .await
        .expect("second");
    h.read_response(DEVICE, BODY_SENSOR_LOCATION, vec![0x07]);
    assert_eq!(second.await, Ok(Some(vec![0x07])));
}
