//! End-to-end orchestrator scenarios under a paused clock.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, timeout, Instant};

use common::{next_peripheral_status, next_resources, TestHub};
use cuehub::status::BRIDGE_NOT_CONNECTED;
use cuehub::BridgeConfig;
use cueproto::{
    BridgeMessage, HubMessage, Mapping, Mappings, PeripheralConnection, Resource, TimelineObject,
    RECONNECT_INTERVAL,
};

fn b1() -> BridgeConfig {
    BridgeConfig::outgoing("b1", "ws://x:1")
        .with_device("ccg0", json!({"type": "virtual", "resources": ["amb"]}))
        .with_device("atem0", json!({"type": "tcpProbe", "host": "10.0.0.5", "port": 9910}))
}

fn mappings() -> Mappings {
    let mut mappings = Mappings::new();
    mappings.insert("casparLayer1".into(), Mapping::new("ccg0"));
    mappings.insert("atemME1".into(), Mapping::new("atem0"));
    mappings
}

fn resource(id: &str) -> Resource {
    Resource::new(id, "ccg0", id)
}

#[tokio::test(start_paused = true)]
async fn outgoing_bridge_is_synced_once_after_retries() {
    let mut hub = TestHub::start();
    hub.connector.refuse_next(3);
    let started = Instant::now();

    hub.handle.set_mappings(mappings()).unwrap();
    hub.handle.set_bridges(vec![b1()]).unwrap();

    let (url, mut bridge) = hub.next_dialed().await;
    assert_eq!(url, "ws://x:1");
    assert_eq!(started.elapsed(), RECONNECT_INTERVAL * 3);
    assert_eq!(hub.connector.attempts(), 4);

    assert_eq!(bridge.next().await, HubMessage::SetId { id: "b1".into() });
    bridge.send(BridgeMessage::Init {
        id: "b1".into(),
        version: "0.1.0".into(),
        incoming: false,
    });

    match bridge.next().await {
        HubMessage::SetSettings { devices } => assert_eq!(devices, b1().device_settings),
        other => panic!("expected setSettings, got {:?}", other),
    }
    match bridge.next().await {
        HubMessage::SetMappings { mappings: pushed, .. } => assert_eq!(pushed, mappings()),
        other => panic!("expected setMappings, got {:?}", other),
    }
    assert_eq!(bridge.next().await, HubMessage::GetTimelineIds);

    // Reapplying identical state is a no-op on the wire
    hub.handle.set_bridges(vec![b1()]).unwrap();
    hub.handle.set_mappings(mappings()).unwrap();
    bridge.assert_quiet(&hub.handle).await;

    let status = hub.handle.status();
    assert!(status["b1"].connected);
}

#[tokio::test(start_paused = true)]
async fn resource_reports_become_deltas() {
    let hub = TestHub::start();
    let mut events = hub.handle.subscribe();

    let mut bridge = hub.accept();
    bridge.init("b2");
    bridge.expect_handshake_push().await;

    bridge.send(BridgeMessage::UpdatedResources {
        device_id: "ccg0".into(),
        resources: vec![resource("A")],
    });
    let (device_id, delta) = next_resources(&mut events).await;
    assert_eq!(device_id, "ccg0");
    assert!(delta.added.is_empty());
    assert!(delta.removed.is_empty());

    bridge.send(BridgeMessage::UpdatedResources {
        device_id: "ccg0".into(),
        resources: vec![resource("A"), resource("B")],
    });
    let (_, delta) = next_resources(&mut events).await;
    assert_eq!(delta.added, vec![resource("B")]);
    assert!(delta.removed.is_empty());

    assert_eq!(
        hub.handle.resources("ccg0").await.unwrap(),
        vec![resource("A"), resource("B")]
    );

    bridge.send(BridgeMessage::DeviceRemoved { device_id: "ccg0".into() });
    let (_, delta) = next_resources(&mut events).await;
    assert_eq!(delta.removed.len(), 2);
    assert!(hub.handle.resources("ccg0").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn timelines_are_pushed_once_and_removed_once() {
    let hub = TestHub::start();
    let mut bridge = hub.accept();
    bridge.init("b3");
    bridge.expect_handshake_push().await;

    let timeline = vec![TimelineObject::new("o1", "casparLayer1").with_field("content", json!({"file": "amb"}))];
    hub.handle.set_timeline("t1", Some(timeline.clone())).unwrap();
    hub.handle.set_timeline("t1", Some(timeline.clone())).unwrap();

    match bridge.next().await {
        HubMessage::AddTimeline { timeline_id, timeline: pushed, .. } => {
            assert_eq!(timeline_id, "t1");
            assert_eq!(pushed, timeline);
        }
        other => panic!("expected addTimeline, got {:?}", other),
    }
    bridge.assert_quiet(&hub.handle).await;

    hub.handle.set_timeline("t1", None).unwrap();
    hub.handle.set_timeline("t1", None).unwrap();
    assert!(matches!(
        bridge.next().await,
        HubMessage::RemoveTimeline { ref timeline_id, .. } if timeline_id == "t1"
    ));
    bridge.assert_quiet(&hub.handle).await;
}

#[tokio::test(start_paused = true)]
async fn stale_timelines_on_the_bridge_are_removed() {
    let hub = TestHub::start();
    hub.handle
        .set_timeline("t1", Some(vec![TimelineObject::new("o1", "l1")]))
        .unwrap();

    let mut bridge = hub.accept();
    bridge.init("b4");
    assert!(matches!(bridge.next().await, HubMessage::SetSettings { .. }));
    assert!(matches!(bridge.next().await, HubMessage::SetMappings { .. }));
    assert!(matches!(bridge.next().await, HubMessage::AddTimeline { .. }));
    assert_eq!(bridge.next().await, HubMessage::GetTimelineIds);

    bridge.send(BridgeMessage::TimelineIds {
        timeline_ids: vec!["t1".into(), "leftover".into()],
    });
    assert!(matches!(
        bridge.next().await,
        HubMessage::RemoveTimeline { ref timeline_id, .. } if timeline_id == "leftover"
    ));
    bridge.assert_quiet(&hub.handle).await;
}

#[tokio::test(start_paused = true)]
async fn sessions_follow_config_and_inbound_bridges() {
    let mut hub = TestHub::start();
    hub.handle
        .set_bridges(vec![
            BridgeConfig::outgoing("b1", "ws://x:1"),
            BridgeConfig::outgoing("b2", "ws://x:2"),
        ])
        .unwrap();
    let (url_a, a) = hub.next_dialed().await;
    let (_, b) = hub.next_dialed().await;
    let (mut first, _second) = if url_a == "ws://x:1" { (a, b) } else { (b, a) };

    let mut inbound = hub.accept();
    inbound.init("b9");
    inbound.expect_handshake_push().await;

    assert_eq!(hub.session_ids().await, vec!["b1", "b2", "b9"]);

    hub.handle
        .set_bridges(vec![BridgeConfig::outgoing("b2", "ws://x:2")])
        .unwrap();
    assert_eq!(hub.session_ids().await, vec!["b2", "b9"]);
    first.closed().await;

    let attempts = hub.connector.attempts();
    sleep(RECONNECT_INTERVAL * 4).await;
    assert_eq!(hub.connector.attempts(), attempts, "removed bridge is not redialed");
    assert!(!hub.handle.status().contains_key("b1"));
}

#[tokio::test(start_paused = true)]
async fn url_change_redials_the_same_bridge() {
    let mut hub = TestHub::start();
    hub.handle
        .set_bridges(vec![BridgeConfig::outgoing("b1", "ws://x:1")])
        .unwrap();
    let (_, mut old) = hub.next_dialed().await;
    assert_eq!(old.next().await, HubMessage::SetId { id: "b1".into() });

    hub.handle
        .set_bridges(vec![BridgeConfig::outgoing("b1", "ws://y:1")])
        .unwrap();
    old.closed().await;

    let (url, mut new) = hub.next_dialed().await;
    assert_eq!(url, "ws://y:1");
    assert_eq!(new.next().await, HubMessage::SetId { id: "b1".into() });
    assert_eq!(hub.session_ids().await, vec!["b1"]);
}

#[tokio::test(start_paused = true)]
async fn id_mismatch_drops_the_link_and_redials() {
    let mut hub = TestHub::start();
    hub.handle
        .set_bridges(vec![BridgeConfig::outgoing("b1", "ws://x:1")])
        .unwrap();

    let (_, mut bridge) = hub.next_dialed().await;
    assert_eq!(bridge.next().await, HubMessage::SetId { id: "b1".into() });
    bridge.init("imposter");
    bridge.closed().await;
    let failed_at = Instant::now();

    assert!(!hub.handle.status()["b1"].connected);

    let (_, mut retry) = hub.next_dialed().await;
    let waited = failed_at.elapsed();
    assert!(waited >= RECONNECT_INTERVAL && waited < RECONNECT_INTERVAL + Duration::from_secs(1));
    assert_eq!(retry.next().await, HubMessage::SetId { id: "b1".into() });
}

#[tokio::test(start_paused = true)]
async fn bridge_without_id_is_assigned_one() {
    let hub = TestHub::start();
    let mut bridge = hub.accept();
    bridge.send(BridgeMessage::InitRequestId);

    let id = match bridge.next().await {
        HubMessage::SetId { id } => id,
        other => panic!("expected setId, got {:?}", other),
    };
    assert!(id.starts_with("bridge-"));

    bridge.init(&id);
    bridge.expect_handshake_push().await;
    assert_eq!(hub.session_ids().await, vec![id]);
}

#[tokio::test(start_paused = true)]
async fn newer_session_with_same_id_wins() {
    let hub = TestHub::start();
    let mut older = hub.accept();
    older.init("b5");
    older.expect_handshake_push().await;

    let mut newer = hub.accept();
    newer.init("b5");
    newer.expect_handshake_push().await;

    older.closed().await;
    assert_eq!(hub.session_ids().await, vec!["b5"]);
    assert!(hub.handle.status()["b5"].connected);
}

#[tokio::test(start_paused = true)]
async fn epoch_change_triggers_a_device_refresh() {
    let hub = TestHub::start();
    hub.handle
        .set_bridges(vec![BridgeConfig::incoming("b6").with_device("atem0", json!({"type": "tcpProbe"}))])
        .unwrap();

    let mut bridge = hub.accept();
    bridge.init("b6");
    bridge.expect_handshake_push().await;

    let status = |ok: bool, epoch: u64| BridgeMessage::DeviceStatus {
        device_id: "atem0".into(),
        ok,
        message: String::new(),
        connection_epoch: epoch,
    };

    bridge.send(status(true, 0));
    bridge.assert_quiet(&hub.handle).await;
    bridge.send(status(false, 0));
    bridge.assert_quiet(&hub.handle).await;

    bridge.send(status(true, 1));
    assert_eq!(
        bridge.next().await,
        HubMessage::RefreshResources {
            device_id: Some("atem0".into())
        }
    );
    assert_eq!(hub.handle.status()["b6"].devices["atem0"].connection_epoch, 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_marks_devices_stale() {
    let hub = TestHub::start();
    hub.handle
        .set_bridges(vec![BridgeConfig::incoming("b7")])
        .unwrap();

    let mut bridge = hub.accept();
    bridge.init("b7");
    bridge.expect_handshake_push().await;
    bridge.send(BridgeMessage::DeviceStatus {
        device_id: "ccg0".into(),
        ok: true,
        message: "Connected".into(),
        connection_epoch: 0,
    });

    let mut status = hub.handle.watch_status();
    timeout(
        Duration::from_secs(30),
        status.wait_for(|s| s.get("b7").is_some_and(|b| b.devices.contains_key("ccg0"))),
    )
    .await
    .unwrap()
    .unwrap();

    drop(bridge);
    let snapshot = timeout(
        Duration::from_secs(30),
        status.wait_for(|s| s.get("b7").is_some_and(|b| !b.connected)),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();

    let device = &snapshot["b7"].devices["ccg0"];
    assert!(!device.ok);
    assert_eq!(device.message, BRIDGE_NOT_CONNECTED);

    // The acceptor closes for good right after the disconnect
    timeout(Duration::from_secs(30), async {
        while !hub.session_ids().await.is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(hub.handle.status().contains_key("b7"));
}

#[tokio::test(start_paused = true)]
async fn key_display_goes_to_the_reporting_bridge() {
    let hub = TestHub::start();
    let mut events = hub.handle.subscribe();

    let mut bridge = hub.accept();
    bridge.init("b8");
    bridge.expect_handshake_push().await;

    bridge.send(BridgeMessage::PeripheralStatus {
        device_id: "sd0".into(),
        info: json!({"name": "Stream Deck"}),
        status: PeripheralConnection::Connected,
    });
    assert_eq!(next_peripheral_status(&mut events).await, "sd0");

    hub.handle
        .set_key_display("sd0", "3", json!({"label": "GO"}))
        .unwrap();
    assert_eq!(
        bridge.next().await,
        HubMessage::PeripheralSetKeyDisplay {
            device_id: "sd0".into(),
            identifier: "3".into(),
            key_display: json!({"label": "GO"}),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn explicit_refresh_reaches_the_bridge() {
    let hub = TestHub::start();
    let mut bridge = hub.accept();
    bridge.init("b10");
    bridge.expect_handshake_push().await;

    hub.handle.refresh_resources("b10", None).unwrap();
    assert_eq!(bridge.next().await, HubMessage::RefreshResources { device_id: None });
}

#[tokio::test(start_paused = true)]
async fn outgoing_bridge_gets_a_full_push_after_reconnecting() {
    let mut hub = TestHub::start();
    let timeline = vec![TimelineObject::new("o1", "casparLayer1")];
    hub.handle.set_mappings(mappings()).unwrap();
    hub.handle.set_timeline("t1", Some(timeline.clone())).unwrap();
    hub.handle.set_bridges(vec![b1()]).unwrap();

    let (_, mut first) = hub.next_dialed().await;
    assert_eq!(first.next().await, HubMessage::SetId { id: "b1".into() });
    first.init_dialed("b1");
    assert!(matches!(first.next().await, HubMessage::SetSettings { .. }));
    assert!(matches!(first.next().await, HubMessage::SetMappings { .. }));
    assert!(matches!(first.next().await, HubMessage::AddTimeline { .. }));
    assert_eq!(first.next().await, HubMessage::GetTimelineIds);

    let mut status = hub.handle.watch_status();
    drop(first);
    timeout(
        Duration::from_secs(30),
        status.wait_for(|s| s.get("b1").is_some_and(|b| !b.connected)),
    )
    .await
    .unwrap()
    .unwrap();

    let (url, mut second) = hub.next_dialed().await;
    assert_eq!(url, "ws://x:1");
    assert_eq!(second.next().await, HubMessage::SetId { id: "b1".into() });
    second.init_dialed("b1");

    match second.next().await {
        HubMessage::SetSettings { devices } => assert_eq!(devices, b1().device_settings),
        other => panic!("expected setSettings, got {:?}", other),
    }
    match second.next().await {
        HubMessage::SetMappings { mappings: pushed, .. } => assert_eq!(pushed, mappings()),
        other => panic!("expected setMappings, got {:?}", other),
    }
    match second.next().await {
        HubMessage::AddTimeline { timeline_id, timeline: pushed, .. } => {
            assert_eq!(timeline_id, "t1");
            assert_eq!(pushed, timeline);
        }
        other => panic!("expected addTimeline, got {:?}", other),
    }
    assert_eq!(second.next().await, HubMessage::GetTimelineIds);
    assert!(hub.handle.status()["b1"].connected);
}

#[tokio::test(start_paused = true)]
async fn dropping_a_session_through_config_marks_the_bridge_disconnected() {
    let mut hub = TestHub::start();
    hub.handle.set_bridges(vec![b1()]).unwrap();

    let (_, mut bridge) = hub.next_dialed().await;
    assert_eq!(bridge.next().await, HubMessage::SetId { id: "b1".into() });
    bridge.init_dialed("b1");
    bridge.expect_handshake_push().await;
    bridge.send(BridgeMessage::DeviceStatus {
        device_id: "ccg0".into(),
        ok: true,
        message: "Connected".into(),
        connection_epoch: 0,
    });

    let mut status = hub.handle.watch_status();
    timeout(
        Duration::from_secs(30),
        status.wait_for(|s| s.get("b1").is_some_and(|b| b.devices.get("ccg0").is_some_and(|d| d.ok))),
    )
    .await
    .unwrap()
    .unwrap();

    // Same id, now expected to dial in: the hub's own session goes away
    hub.handle
        .set_bridges(vec![BridgeConfig::incoming("b1")])
        .unwrap();
    assert!(hub.session_ids().await.is_empty());
    bridge.closed().await;

    sleep(RECONNECT_INTERVAL * 2).await;
    let snapshot = hub.handle.status();
    assert!(!snapshot["b1"].connected);
    let device = &snapshot["b1"].devices["ccg0"];
    assert!(!device.ok);
    assert_eq!(device.message, BRIDGE_NOT_CONNECTED);
}

#[tokio::test(start_paused = true)]
async fn pending_retry_does_not_replace_a_newer_link() {
    let mut hub = TestHub::start();
    hub.handle
        .set_bridges(vec![BridgeConfig::outgoing("b1", "ws://x:1")])
        .unwrap();

    let (_, mut bridge) = hub.next_dialed().await;
    assert_eq!(bridge.next().await, HubMessage::SetId { id: "b1".into() });
    bridge.init("imposter");
    bridge.closed().await;

    // The url moves before the mismatch retry fires
    hub.handle
        .set_bridges(vec![BridgeConfig::outgoing("b1", "ws://y:1")])
        .unwrap();
    let (url, mut fresh) = hub.next_dialed().await;
    assert_eq!(url, "ws://y:1");
    assert_eq!(fresh.next().await, HubMessage::SetId { id: "b1".into() });
    fresh.init_dialed("b1");
    fresh.expect_handshake_push().await;

    let attempts = hub.connector.attempts();
    sleep(RECONNECT_INTERVAL * 3).await;
    assert_eq!(hub.connector.attempts(), attempts);
    fresh.assert_quiet(&hub.handle).await;
    assert!(hub.handle.status()["b1"].connected);
    assert_eq!(hub.session_ids().await, vec!["b1"]);
}
