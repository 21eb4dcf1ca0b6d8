//! Device session for one connected media source
//! This module drives GATT discovery, role binding, notification
//! subscription, the heartbeat and command writes for a single peripheral.
//! All mutation happens on the controller's run loop; requests go out through
//! the peripheral's [`GattQueue`] and their completions come back through
//! [`DeviceSession::handle_gatt_event`].

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::config::session_config::SessionConfig;
use crate::core::bluetooth::constants::UUID_AMS_SERVICE;
use crate::core::bluetooth::gatt_queue::{GattQueue, GattRequest};
use crate::core::bluetooth::heartbeat::Heartbeat;
use crate::core::bluetooth::transport::GattEvent;
use crate::core::bluetooth::types::{
    CharacteristicMap, CharacteristicRole, GattCharacteristic, GattService, PeripheralHandle,
    PeripheralId, SessionId, WriteKind,
};
use crate::core::codec::{self, AttributeUpdate, ControlCommand, DecodeError};
use crate::core::track_info::{TrackSnapshot, TrackStore};
use crate::error::{SessionError, TransportError};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SessionState {
    /// Created, discovery not yet requested
    Idle,
    /// Waiting for the three media characteristics
    Discovering,
    /// All characteristics bound, entity-update notify outstanding
    Subscribing,
    /// Notifications on, heartbeat running
    Active,
    /// Terminal
    Closed,
}

/// What a handled completion means for the session's owner
#[derive(Debug, Clone, PartialEq)]
pub enum SetupProgress {
    Unchanged,
    /// The session just became active
    Ready,
    /// Notifications were confirmed again while active; the heartbeat was restarted
    Resubscribed,
    /// A write was rejected. The session carries on.
    WriteFailed {
        characteristic: GattCharacteristic,
        error: TransportError,
    },
}

pub struct DeviceSession {
    id: SessionId,
    peripheral_id: PeripheralId,
    peripheral: Option<PeripheralHandle>,
    state: SessionState,
    characteristics: CharacteristicMap,
    queue: Option<GattQueue>,
    heartbeat: Option<Heartbeat>,
    store: TrackStore,
    config: SessionConfig,
}

impl DeviceSession {
    pub fn new(
        id: SessionId,
        peripheral: PeripheralHandle,
        queue: GattQueue,
        config: SessionConfig,
    ) -> Self {
        Self {
            id,
            peripheral_id: peripheral.id.clone(),
            peripheral: Some(peripheral),
            state: SessionState::Idle,
            characteristics: CharacteristicMap::default(),
            queue: Some(queue),
            heartbeat: None,
            store: TrackStore::new(),
            config,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peripheral_id(&self) -> &PeripheralId {
        &self.peripheral_id
    }

    /// The bound peripheral. `None` once the session is closed.
    pub fn peripheral(&self) -> Option<&PeripheralHandle> {
        self.peripheral.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn has_heartbeat(&self) -> bool {
        self.heartbeat.is_some()
    }

    pub fn characteristic(&self, role: CharacteristicRole) -> Option<&GattCharacteristic> {
        self.characteristics.get(role)
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackSnapshot> {
        self.store.subscribe()
    }

    /// Requests discovery of the media service.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            debug!("Session {} already started", self.id);
            return Ok(());
        }

        info!("Starting session {} on {}", self.id, self.peripheral_id);
        self.state = SessionState::Discovering;
        if let Err(e) = self.submit(GattRequest::DiscoverServices {
            service: UUID_AMS_SERVICE,
        }) {
            return Err(self.fail(SessionError::DiscoveryFailed(e.to_string())));
        }
        Ok(())
    }

    /// Routes a completion from the request queue to its handler.
    pub fn handle_gatt_event(&mut self, event: GattEvent) -> Result<SetupProgress, SessionError> {
        match event {
            GattEvent::ServicesDiscovered(result) => {
                self.on_services_discovered(result)?;
                Ok(SetupProgress::Unchanged)
            }
            GattEvent::CharacteristicsDiscovered { service, result } => {
                self.on_characteristics_discovered(&service, result)?;
                Ok(SetupProgress::Unchanged)
            }
            GattEvent::NotificationStateChanged {
                characteristic,
                result,
            } => self.on_notification_state_changed(&characteristic, result),
            GattEvent::WriteCompleted {
                characteristic,
                result,
            } => Ok(self.on_write_completed(characteristic, result)),
        }
    }

    pub fn on_services_discovered(
        &mut self,
        result: Result<Vec<GattService>, TransportError>,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Discovering {
            debug!("Session {} ignoring services in state {:?}", self.id, self.state);
            return Ok(());
        }

        let services = match result {
            Ok(services) => services,
            Err(e) => return Err(self.fail(SessionError::DiscoveryFailed(e.to_string()))),
        };

        let mut found = false;
        for service in services.into_iter().filter(|s| s.uuid == UUID_AMS_SERVICE) {
            found = true;
            if let Err(e) = self.submit(GattRequest::DiscoverCharacteristics { service }) {
                return Err(self.fail(SessionError::DiscoveryFailed(e.to_string())));
            }
        }
        if !found {
            warn!("Media service not found on {}, still waiting", self.peripheral_id);
        }
        Ok(())
    }

    /// Binds characteristics to roles. May be delivered more than once.
    pub fn on_characteristics_discovered(
        &mut self,
        service: &GattService,
        result: Result<Vec<GattCharacteristic>, TransportError>,
    ) -> Result<(), SessionError> {
        if matches!(self.state, SessionState::Idle | SessionState::Closed)
            || service.uuid != UUID_AMS_SERVICE
        {
            return Ok(());
        }

        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(e) if self.state == SessionState::Discovering => {
                return Err(self.fail(SessionError::DiscoveryFailed(e.to_string())));
            }
            Err(e) => {
                warn!("Late characteristic discovery failure on {}: {}", self.peripheral_id, e);
                return Ok(());
            }
        };

        for characteristic in characteristics {
            let Some(role) = CharacteristicRole::from_uuid(characteristic.uuid) else {
                continue;
            };
            let changed = self.characteristics.bind(role, characteristic.clone());
            debug!("Bound {:?} on {}", role, self.peripheral_id);

            if role == CharacteristicRole::RemoteCommand && changed {
                let request = GattRequest::SetNotify {
                    characteristic,
                    enabled: true,
                };
                if let Err(e) = self.submit(request) {
                    warn!("Could not enable remote command notifications: {}", e);
                }
            }
        }

        if !self.characteristics.all_bound() {
            debug!(
                "Session {} has {} of 3 characteristics",
                self.id,
                self.characteristics.bound_count()
            );
            return Ok(());
        }

        if self.state != SessionState::Discovering {
            debug!("Session {} already subscribing or active", self.id);
            return Ok(());
        }

        self.state = SessionState::Subscribing;
        let entity_update = self.characteristics.get(CharacteristicRole::EntityUpdate).cloned();
        let result = match entity_update {
            Some(characteristic) => self.submit(GattRequest::SetNotify {
                characteristic,
                enabled: true,
            }),
            None => Err(TransportError::CharacteristicNotFound(
                CharacteristicRole::EntityUpdate.uuid(),
            )),
        };
        if let Err(e) = result {
            return Err(self.fail(SessionError::SubscriptionFailed(e.to_string())));
        }
        Ok(())
    }

    pub fn on_notification_state_changed(
        &mut self,
        characteristic: &GattCharacteristic,
        result: Result<(), TransportError>,
    ) -> Result<SetupProgress, SessionError> {
        match self.characteristics.role_of(characteristic) {
            Some(CharacteristicRole::RemoteCommand) => {
                match result {
                    Ok(()) => debug!("Remote command notifications enabled"),
                    Err(e) => warn!("Remote command notifications not enabled: {}", e),
                }
                Ok(SetupProgress::Unchanged)
            }
            Some(CharacteristicRole::EntityUpdate)
                if matches!(self.state, SessionState::Subscribing | SessionState::Active) =>
            {
                if let Err(e) = result {
                    return Err(self.fail(SessionError::SubscriptionFailed(e.to_string())));
                }
                let resubscribed = self.state == SessionState::Active;
                self.subscribe_entities(characteristic.clone())?;
                self.restart_heartbeat()?;
                self.state = SessionState::Active;

                if resubscribed {
                    info!("Session {} resubscribed", self.id);
                    Ok(SetupProgress::Resubscribed)
                } else {
                    info!("Session {} active on {}", self.id, self.peripheral_id);
                    Ok(SetupProgress::Ready)
                }
            }
            _ => Ok(SetupProgress::Unchanged),
        }
    }

    /// Decodes a notification and applies it to the store.
    /// Returns `Ok(None)` for anything other than an entity update on a live session.
    pub fn on_notification_value(
        &mut self,
        characteristic: &GattCharacteristic,
        value: &[u8],
    ) -> Result<Option<AttributeUpdate>, DecodeError> {
        if !matches!(self.state, SessionState::Subscribing | SessionState::Active)
            || self.characteristics.role_of(characteristic) != Some(CharacteristicRole::EntityUpdate)
        {
            return Ok(None);
        }

        let update = codec::decode_frame(value, self.config.frame_layout)?;
        debug!("{} = {:?}", update.attribute(), update.value());
        self.store.apply(&update);
        Ok(Some(update))
    }

    pub fn on_write_completed(
        &mut self,
        characteristic: GattCharacteristic,
        result: Result<(), TransportError>,
    ) -> SetupProgress {
        match result {
            Ok(()) => SetupProgress::Unchanged,
            Err(error) => {
                warn!("Write to {} failed: {}", characteristic.uuid, error);
                SetupProgress::WriteFailed {
                    characteristic,
                    error,
                }
            }
        }
    }

    /// Queues a remote command write.
    pub fn send_command(&self, command: ControlCommand) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotReady);
        }
        let characteristic = self
            .characteristics
            .get(CharacteristicRole::RemoteCommand)
            .cloned()
            .ok_or(SessionError::NotReady)?;

        info!("Sending {} to {}", command, self.peripheral_id);
        self.submit(GattRequest::Write {
            characteristic,
            value: vec![codec::encode(command)],
            kind: WriteKind::WithResponse,
        })?;
        Ok(())
    }

    /// Fails a session that did not finish setting up in time.
    /// Returns `None` if it is already active or closed.
    pub fn expire(&mut self) -> Option<SessionError> {
        let error = match self.state {
            SessionState::Idle | SessionState::Discovering => {
                SessionError::DiscoveryFailed("setup timed out".into())
            }
            SessionState::Subscribing => SessionError::SubscriptionFailed("setup timed out".into()),
            SessionState::Active | SessionState::Closed => return None,
        };
        Some(self.fail(error))
    }

    /// Releases the heartbeat, characteristic bindings, request queue and
    /// peripheral, in that order. Safe to call in any state.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        self.heartbeat = None;
        self.characteristics.clear();
        if let Some(queue) = self.queue.take() {
            queue.close();
        }
        self.peripheral = None;
        self.state = SessionState::Closed;
        info!("Session {} on {} closed", self.id, self.peripheral_id);
    }

    fn subscribe_entities(&mut self, entity_update: GattCharacteristic) -> Result<(), SessionError> {
        for category in self.config.tracked_categories.clone() {
            let request = GattRequest::Write {
                characteristic: entity_update.clone(),
                value: codec::encode_subscription(category),
                kind: WriteKind::WithResponse,
            };
            if let Err(e) = self.submit(request) {
                return Err(self.fail(SessionError::SubscriptionFailed(e.to_string())));
            }
        }
        Ok(())
    }

    fn restart_heartbeat(&mut self) -> Result<(), SessionError> {
        self.heartbeat = None;

        let entity_attribute = self
            .characteristics
            .get(CharacteristicRole::EntityAttribute)
            .cloned();
        match (entity_attribute, self.queue.clone()) {
            (Some(characteristic), Some(queue)) => {
                self.heartbeat = Some(Heartbeat::start(
                    queue,
                    characteristic,
                    self.config.heartbeat_interval(),
                ));
                Ok(())
            }
            _ => Err(self.fail(SessionError::SubscriptionFailed(
                "entity attribute characteristic unavailable".into(),
            ))),
        }
    }

    fn submit(&self, request: GattRequest) -> Result<(), TransportError> {
        match &self.queue {
            Some(queue) => queue.submit(request),
            None => Err(TransportError::QueueClosed),
        }
    }

    fn fail(&mut self, error: SessionError) -> SessionError {
        error!("Session {} on {} failed: {}", self.id, self.peripheral_id, error);
        self.close();
        error
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::core::bluetooth::constants::{
        UUID_AMS_ENTITY_ATTRIBUTE, UUID_AMS_ENTITY_UPDATE, UUID_AMS_REMOTE_COMMAND,
    };
    use crate::core::bluetooth::mock::{MockTransport, TransportCall};
    use crate::core::bluetooth::transport::TransportEvent;
    use crate::core::codec::{AttributeCategory, TrackAttribute};

    struct Harness {
        transport: Arc<MockTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        session: DeviceSession,
    }

    fn harness(transport: impl FnOnce(mpsc::UnboundedSender<TransportEvent>) -> MockTransport) -> Harness {
        let (events_tx, events) = mpsc::unbounded_channel();
        let transport = Arc::new(transport(events_tx.clone()));
        let peripheral = PeripheralHandle::new(
            PeripheralId::new("dev-1"),
            Some("iPhone".into()),
            None,
            Some(-40),
        );
        let (queue, _worker) =
            GattQueue::spawn(transport.clone(), peripheral.id.clone(), SessionId(1), events_tx);
        let session = DeviceSession::new(SessionId(1), peripheral, queue, SessionConfig::default());
        Harness {
            transport,
            events,
            session,
        }
    }

    fn ch(uuid: uuid::Uuid) -> GattCharacteristic {
        GattCharacteristic::new(UUID_AMS_SERVICE, uuid)
    }

    impl Harness {
        async fn pump(&mut self) -> Result<SetupProgress, SessionError> {
            match self.events.recv().await {
                Some(TransportEvent::Gatt { event, .. }) => self.session.handle_gatt_event(event),
                other => panic!("unexpected event {:?}", other),
            }
        }

        async fn drive_to_active(&mut self) {
            self.session.start().unwrap();
            for _ in 0..8 {
                if self.pump().await.unwrap() == SetupProgress::Ready {
                    return;
                }
            }
            panic!("session never became active");
        }
    }

    #[tokio::test]
    async fn close_before_discovery_is_safe() {
        let mut h = harness(MockTransport::with_media_service);
        h.session.close();
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(!h.session.has_heartbeat());
        assert!(h.session.peripheral().is_none());

        h.session.close();
        assert_eq!(h.session.state(), SessionState::Closed);
        assert_eq!(h.session.send_command(ControlCommand::Play), Err(SessionError::NotReady));
    }

    #[tokio::test]
    async fn setup_sequence_reaches_active() {
        let mut h = harness(MockTransport::with_media_service);
        h.drive_to_active().await;

        assert_eq!(h.session.state(), SessionState::Active);
        assert!(h.session.has_heartbeat());

        // subscription writes are queued ahead of the completions pumped here
        for _ in 0..3 {
            h.pump().await.unwrap();
        }
        let notify: Vec<_> = h
            .transport
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::SetNotify { characteristic, .. } => Some(characteristic.uuid),
                _ => None,
            })
            .collect();
        assert_eq!(notify, vec![UUID_AMS_REMOTE_COMMAND, UUID_AMS_ENTITY_UPDATE]);
        assert_eq!(
            h.transport.writes_to(UUID_AMS_ENTITY_UPDATE),
            vec![
                codec::encode_subscription(AttributeCategory::Track),
                codec::encode_subscription(AttributeCategory::Queue),
                codec::encode_subscription(AttributeCategory::Player),
            ]
        );
        assert!(h.transport.writes_to(UUID_AMS_ENTITY_ATTRIBUTE).is_empty());
    }

    #[tokio::test]
    async fn notification_updates_store_and_commands_are_written() {
        let mut h = harness(MockTransport::with_media_service);
        h.drive_to_active().await;

        let update = h
            .session
            .on_notification_value(&ch(UUID_AMS_ENTITY_UPDATE), &[0x02, 0x02, b'H', b'i'])
            .unwrap()
            .unwrap();
        assert_eq!(update.value(), "Hi");
        assert_eq!(h.session.snapshot().track(TrackAttribute::Title), Some("Hi"));

        h.session.send_command(ControlCommand::NextTrack).unwrap();
        for _ in 0..4 {
            h.pump().await.unwrap();
        }
        assert_eq!(h.transport.writes_to(UUID_AMS_REMOTE_COMMAND), vec![vec![0x03]]);
    }

    #[tokio::test]
    async fn decode_failure_keeps_session_active() {
        let mut h = harness(MockTransport::with_media_service);
        h.drive_to_active().await;

        let result = h
            .session
            .on_notification_value(&ch(UUID_AMS_ENTITY_UPDATE), &[0x05, 0x00, 0x41]);
        assert_eq!(result, Err(DecodeError::UnknownCategory(0x05)));
        assert_eq!(h.session.state(), SessionState::Active);

        let ignored = h
            .session
            .on_notification_value(&ch(UUID_AMS_ENTITY_ATTRIBUTE), &[0x02, 0x00, 0x41]);
        assert_eq!(ignored, Ok(None));
    }

    #[tokio::test]
    async fn stray_notification_after_close_is_ignored() {
        let mut h = harness(MockTransport::with_media_service);
        h.drive_to_active().await;
        h.session
            .on_notification_value(&ch(UUID_AMS_ENTITY_UPDATE), &[0x02, 0x00, b'A'])
            .unwrap();
        let before = h.session.snapshot();

        h.session.close();
        assert!(!h.session.has_heartbeat());
        let result = h
            .session
            .on_notification_value(&ch(UUID_AMS_ENTITY_UPDATE), &[0x02, 0x00, b'B']);
        assert_eq!(result, Ok(None));
        assert_eq!(h.session.snapshot(), before);
    }

    #[tokio::test]
    async fn command_before_active_is_not_ready() {
        let mut h = harness(MockTransport::with_media_service);
        h.session.start().unwrap();
        assert_eq!(h.session.state(), SessionState::Discovering);
        assert_eq!(
            h.session.send_command(ControlCommand::Play),
            Err(SessionError::NotReady)
        );
    }

    #[tokio::test]
    async fn partial_discovery_stays_discovering() {
        let mut h = harness(|events| {
            let transport = MockTransport::with_media_service(events);
            transport.set_characteristics(
                UUID_AMS_SERVICE,
                vec![ch(UUID_AMS_REMOTE_COMMAND), ch(UUID_AMS_ENTITY_UPDATE)],
            );
            transport
        });
        h.session.start().unwrap();
        h.pump().await.unwrap();
        h.pump().await.unwrap();

        assert_eq!(h.session.state(), SessionState::Discovering);
        assert!(h.session.characteristic(CharacteristicRole::RemoteCommand).is_some());
        assert!(h.session.characteristic(CharacteristicRole::EntityAttribute).is_none());

        assert!(matches!(h.session.expire(), Some(SessionError::DiscoveryFailed(_))));
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn service_discovery_failure_closes_session() {
        let mut h = harness(|events| {
            let transport = MockTransport::with_media_service(events);
            transport.fail_service_discovery();
            transport
        });
        h.session.start().unwrap();
        assert!(matches!(h.pump().await, Err(SessionError::DiscoveryFailed(_))));
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn entity_update_notify_failure_fails_subscription() {
        let mut h = harness(|events| {
            let transport = MockTransport::with_media_service(events);
            transport.fail_notify(UUID_AMS_ENTITY_UPDATE);
            transport
        });
        h.session.start().unwrap();
        let mut outcome = Ok(SetupProgress::Unchanged);
        for _ in 0..4 {
            outcome = h.pump().await;
            if outcome.is_err() {
                break;
            }
        }
        assert!(matches!(outcome, Err(SessionError::SubscriptionFailed(_))));
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(!h.session.has_heartbeat());
    }

    #[tokio::test]
    async fn duplicate_discovery_and_resubscription_are_idempotent() {
        let mut h = harness(MockTransport::with_media_service);
        h.drive_to_active().await;
        let notify_calls = |h: &Harness| {
            h.transport
                .calls()
                .iter()
                .filter(|call| matches!(call, TransportCall::SetNotify { .. }))
                .count()
        };
        let before = notify_calls(&h);

        let service = GattService {
            uuid: UUID_AMS_SERVICE,
        };
        let all = CharacteristicRole::ALL.iter().map(|role| ch(role.uuid())).collect();
        h.session.on_characteristics_discovered(&service, Ok(all)).unwrap();
        assert_eq!(h.session.state(), SessionState::Active);

        let progress = h
            .session
            .on_notification_state_changed(&ch(UUID_AMS_ENTITY_UPDATE), Ok(()))
            .unwrap();
        assert_eq!(progress, SetupProgress::Resubscribed);
        assert!(h.session.has_heartbeat());
        assert_eq!(h.session.state(), SessionState::Active);

        for _ in 0..6 {
            h.pump().await.unwrap();
        }
        assert_eq!(notify_calls(&h), before);
        assert_eq!(h.transport.writes_to(UUID_AMS_ENTITY_UPDATE).len(), 6);
    }
}
