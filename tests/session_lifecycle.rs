use std::sync::Arc;
use std::time::Duration;

use ams_remote_lib::commands::ControllerHandle;
use ams_remote_lib::config::AppConfig;
use ams_remote_lib::core::bluetooth::{
    ControllerEvent, GattCharacteristic, MockTransport, PeripheralHandle, PeripheralId,
    RadioState, SessionState, TransportCall, UUID_AMS_ENTITY_ATTRIBUTE, UUID_AMS_ENTITY_UPDATE,
    UUID_AMS_REMOTE_COMMAND, UUID_AMS_SERVICE,
};
use ams_remote_lib::core::codec::{ControlCommand, TrackAttribute};
use ams_remote_lib::state::AppState;
use tokio::sync::{broadcast, mpsc};

async fn next_event(
    events: &mut broadcast::Receiver<ControllerEvent>,
    matches: impl Fn(&ControllerEvent) -> bool,
) -> ControllerEvent {
    loop {
        let event = events.recv().await.expect("controller stopped");
        if matches(&event) {
            return event;
        }
    }
}

fn start() -> (Arc<MockTransport>, AppState) {
    let (events_tx, events) = mpsc::unbounded_channel();
    let transport = Arc::new(MockTransport::with_media_service(events_tx.clone()));
    let state = AppState::with_transport(AppConfig::default(), transport.clone(), events_tx, events);
    (transport, state)
}

async fn discover(
    transport: &MockTransport,
    controller: &ControllerHandle,
    events: &mut broadcast::Receiver<ControllerEvent>,
) -> PeripheralId {
    transport.set_radio_state(RadioState::PoweredOn);
    transport.advertise(PeripheralHandle::new(
        PeripheralId::new("phone"),
        Some("Ann's iPhone".into()),
        Some("AA:BB:CC:DD:EE:FF".into()),
        Some(-52),
    ));
    match next_event(events, |e| matches!(e, ControllerEvent::PeripheralDiscovered { .. })).await {
        ControllerEvent::PeripheralDiscovered { peripheral, first_seen } => {
            assert!(first_seen);
            assert_eq!(controller.peripherals().await.unwrap(), vec![peripheral.clone()]);
            peripheral.id
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn now_playing_round_trip() {
    let (transport, state) = start();
    let controller = state.controller.clone();
    let mut events = controller.subscribe();

    let phone = discover(&transport, &controller, &mut events).await;
    assert!(transport.calls().contains(&TransportCall::StartScan { allow_duplicates: true }));

    controller.connect(phone.clone()).await.unwrap();
    let mut snapshots = match next_event(&mut events, |e| {
        matches!(e, ControllerEvent::SessionReady { .. })
    })
    .await
    {
        ControllerEvent::SessionReady { peripheral, snapshots } => {
            assert_eq!(peripheral, phone);
            snapshots
        }
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(
        controller.session_state(phone.clone()).await.unwrap(),
        Some(SessionState::Active)
    );

    // heartbeat fires once per 3 second period
    tokio::time::sleep(Duration::from_millis(9_100)).await;
    let heartbeats = transport.writes_to(UUID_AMS_ENTITY_ATTRIBUTE);
    assert_eq!(heartbeats, vec![vec![0x00, 0x01]; 3]);

    transport.notify(
        &phone,
        GattCharacteristic::new(UUID_AMS_SERVICE, UUID_AMS_ENTITY_UPDATE),
        &[0x02, 0x02, b'H', b'i'],
    );
    snapshots.changed().await.unwrap();
    assert_eq!(snapshots.borrow().track(TrackAttribute::Title), Some("Hi"));
    assert_eq!(
        controller
            .snapshot(phone.clone())
            .await
            .unwrap()
            .track(TrackAttribute::Title),
        Some("Hi")
    );

    controller
        .send_command(phone.clone(), ControlCommand::NextTrack)
        .await
        .unwrap();
    controller.disconnect_and_wait(phone.clone()).await.unwrap();

    assert_eq!(transport.writes_to(UUID_AMS_REMOTE_COMMAND), vec![vec![0x03]]);
    assert_eq!(controller.session_state(phone.clone()).await.unwrap(), None);

    let heartbeats_at_disconnect = transport.writes_to(UUID_AMS_ENTITY_ATTRIBUTE).len();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        transport.writes_to(UUID_AMS_ENTITY_ATTRIBUTE).len(),
        heartbeats_at_disconnect
    );

    state.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_starts_a_fresh_session() {
    let (transport, state) = start();
    let controller = state.controller.clone();
    let mut events = controller.subscribe();
    let phone = discover(&transport, &controller, &mut events).await;

    controller.connect(phone.clone()).await.unwrap();
    next_event(&mut events, |e| matches!(e, ControllerEvent::SessionReady { .. })).await;
    transport.notify(
        &phone,
        GattCharacteristic::new(UUID_AMS_SERVICE, UUID_AMS_ENTITY_UPDATE),
        &[0x00, 0x00, b'M', b'u', b's', b'i', b'c'],
    );
    controller.disconnect_and_wait(phone.clone()).await.unwrap();

    controller.connect(phone.clone()).await.unwrap();
    next_event(&mut events, |e| matches!(e, ControllerEvent::SessionReady { .. })).await;
    let snapshot = controller.snapshot(phone.clone()).await.unwrap();
    assert!(snapshot.is_empty());

    let connects = transport
        .calls()
        .iter()
        .filter(|call| matches!(call, TransportCall::Connect(_)))
        .count();
    assert_eq!(connects, 2);

    state.shutdown().await.unwrap();
}

#[tokio::test]
async fn commands_are_refused_until_connected() {
    let (transport, state) = start();
    let controller = state.controller.clone();
    let mut events = controller.subscribe();
    let phone = discover(&transport, &controller, &mut events).await;

    let refused = controller.send_command(phone, ControlCommand::Play).await;
    assert!(refused.is_err());
    assert!(transport.writes_to(UUID_AMS_REMOTE_COMMAND).is_empty());

    state.shutdown().await.unwrap();
}
