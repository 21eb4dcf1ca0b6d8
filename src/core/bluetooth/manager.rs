//! Central controller for the AMS remote
//! This module owns the scan, connect and disconnect lifecycle and one
//! [`DeviceSession`] per connected peripheral. Transport events, requests
//! from [`ControllerHandle`]s and setup deadlines are all handled on a single
//! run loop, so every session mutation happens in one place and in order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::commands::ControllerHandle;
use crate::config::central_config::CentralConfig;
use crate::config::session_config::SessionConfig;
use crate::core::bluetooth::constants::{EVENT_CHANNEL_CAPACITY, REQUEST_CHANNEL_CAPACITY};
use crate::core::bluetooth::gatt_queue::GattQueue;
use crate::core::bluetooth::session::{DeviceSession, SessionState, SetupProgress};
use crate::core::bluetooth::transport::{BleTransport, TransportEvent};
use crate::core::bluetooth::types::{PeripheralHandle, PeripheralId, RadioState, SessionId};
use crate::core::codec::{ControlCommand, DecodeError};
use crate::core::track_info::TrackSnapshot;
use crate::error::{ControllerError, SessionError, TransportError};

/// Events published to presentation-layer subscribers
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    RadioReady,
    RadioNotReady(RadioState),
    ScanStarted,
    ScanStopped,
    PeripheralDiscovered {
        peripheral: PeripheralHandle,
        /// False when this advertisement only refreshed a known device
        first_seen: bool,
    },
    Connected(PeripheralHandle),
    ConnectFailed {
        peripheral: PeripheralId,
        error: TransportError,
    },
    /// Notifications are on. `snapshots` yields the full state after every update.
    SessionReady {
        peripheral: PeripheralId,
        snapshots: watch::Receiver<TrackSnapshot>,
    },
    SessionFailed {
        peripheral: PeripheralId,
        error: SessionError,
    },
    /// Published after the peripheral's session has been closed
    Disconnected {
        peripheral: PeripheralId,
        error: Option<TransportError>,
    },
    DecodeFailed {
        peripheral: PeripheralId,
        error: DecodeError,
    },
    WriteFailed {
        peripheral: PeripheralId,
        characteristic: Uuid,
        error: TransportError,
    },
}

type Reply<T> = oneshot::Sender<Result<T, ControllerError>>;

/// Requests accepted by the run loop
#[derive(Debug)]
pub enum ControllerRequest {
    StartScan(Reply<()>),
    StopScan(Reply<()>),
    Connect(PeripheralId, Reply<()>),
    Disconnect(PeripheralId, Reply<()>),
    SendCommand(PeripheralId, ControlCommand, Reply<()>),
    Snapshot(PeripheralId, Reply<TrackSnapshot>),
    SessionState(PeripheralId, oneshot::Sender<Option<SessionState>>),
    Peripherals(oneshot::Sender<Vec<PeripheralHandle>>),
    Shutdown(oneshot::Sender<()>),
}

pub struct CentralController {
    transport: Arc<dyn BleTransport>,
    /// Sender half of the transport event stream, handed to request queues and helper tasks
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    central: CentralConfig,
    session_config: SessionConfig,
    radio: RadioState,
    scanning: bool,
    /// Devices seen while scanning, keyed by identity
    peripherals: HashMap<PeripheralId, PeripheralHandle>,
    connecting: HashSet<PeripheralId>,
    sessions: HashMap<PeripheralId, DeviceSession>,
    next_session: u64,
    notifier: broadcast::Sender<ControllerEvent>,
    deadline_tx: mpsc::UnboundedSender<(PeripheralId, SessionId)>,
    deadline_rx: mpsc::UnboundedReceiver<(PeripheralId, SessionId)>,
}

impl CentralController {
    /// `events_tx` must feed the receiver later passed to [`CentralController::spawn`].
    pub fn new(
        transport: Arc<dyn BleTransport>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
        central: CentralConfig,
        session_config: SessionConfig,
    ) -> Self {
        let (notifier, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (deadline_tx, deadline_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            events_tx,
            central,
            session_config,
            radio: RadioState::Unknown,
            scanning: false,
            peripherals: HashMap::new(),
            connecting: HashSet::new(),
            sessions: HashMap::new(),
            next_session: 0,
            notifier,
            deadline_tx,
            deadline_rx,
        }
    }

    /// Subscribe before spawning to observe the first radio events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.notifier.subscribe()
    }

    /// Moves the controller onto its run loop.
    pub fn spawn(
        self,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (request_tx, requests) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let handle = ControllerHandle::new(request_tx, self.notifier.clone());
        let task = tokio::spawn(self.run(requests, events));
        (handle, task)
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<ControllerRequest>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!("Central controller started");

        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_transport_event(event),
                Some((peripheral, session)) = self.deadline_rx.recv() => {
                    self.on_setup_deadline(peripheral, session)
                }
                request = requests.recv() => match request {
                    Some(request) => {
                        if !self.handle_request(request) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.close_all();
        info!("Central controller stopped");
    }

    /// Returns false once the run loop should stop.
    fn handle_request(&mut self, request: ControllerRequest) -> bool {
        match request {
            ControllerRequest::StartScan(reply) => {
                let _ = reply.send(self.start_scan());
            }
            ControllerRequest::StopScan(reply) => {
                self.stop_scan();
                let _ = reply.send(Ok(()));
            }
            ControllerRequest::Connect(peripheral, reply) => {
                let _ = reply.send(self.connect(peripheral));
            }
            ControllerRequest::Disconnect(peripheral, reply) => {
                let _ = reply.send(self.disconnect(peripheral));
            }
            ControllerRequest::SendCommand(peripheral, command, reply) => {
                let result = match self.live_session(&peripheral) {
                    Some(session) => session.send_command(command).map_err(ControllerError::from),
                    None => Err(ControllerError::NotConnected(peripheral)),
                };
                let _ = reply.send(result);
            }
            ControllerRequest::Snapshot(peripheral, reply) => {
                let result = self
                    .sessions
                    .get(&peripheral)
                    .map(DeviceSession::snapshot)
                    .ok_or(ControllerError::NotConnected(peripheral));
                let _ = reply.send(result);
            }
            ControllerRequest::SessionState(peripheral, reply) => {
                let _ = reply.send(self.sessions.get(&peripheral).map(DeviceSession::state));
            }
            ControllerRequest::Peripherals(reply) => {
                let mut peripherals: Vec<_> = self.peripherals.values().cloned().collect();
                peripherals.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(peripherals);
            }
            ControllerRequest::Shutdown(reply) => {
                self.close_all();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::RadioStateChanged(state) => self.on_radio_state(state),
            TransportEvent::Discovered(peripheral) => self.on_discovered(peripheral),
            TransportEvent::ScanStopped(error) => {
                if let Some(e) = &error {
                    warn!("Scan stopped by transport: {}", e);
                }
                if self.scanning {
                    self.scanning = false;
                    self.publish(ControllerEvent::ScanStopped);
                }
            }
            TransportEvent::Connected(peripheral) => self.on_connected(peripheral),
            TransportEvent::ConnectFailed { peripheral, error } => {
                self.connecting.remove(&peripheral);
                error!("Failed to connect to {}: {}", peripheral, error);
                self.publish(ControllerEvent::ConnectFailed { peripheral, error });
            }
            TransportEvent::Disconnected { peripheral, error } => {
                self.on_disconnected(peripheral, error)
            }
            TransportEvent::Gatt {
                peripheral,
                session,
                event,
            } => {
                let Some(live) = self.sessions.get_mut(&peripheral) else {
                    debug!("Dropping completion for {} with no session", peripheral);
                    return;
                };
                if live.id() != session || live.state() == SessionState::Closed {
                    debug!("Dropping stale completion for {} ({})", peripheral, session);
                    return;
                }

                match live.handle_gatt_event(event) {
                    Ok(SetupProgress::Ready) => {
                        let snapshots = live.subscribe();
                        self.publish(ControllerEvent::SessionReady {
                            peripheral,
                            snapshots,
                        });
                    }
                    Ok(SetupProgress::WriteFailed {
                        characteristic,
                        error,
                    }) => self.publish(ControllerEvent::WriteFailed {
                        peripheral,
                        characteristic: characteristic.uuid,
                        error,
                    }),
                    Ok(SetupProgress::Resubscribed | SetupProgress::Unchanged) => {}
                    Err(error) => self.on_session_failed(peripheral, error),
                }
            }
            TransportEvent::NotificationValue {
                peripheral,
                characteristic,
                value,
            } => {
                let Some(live) = self.sessions.get_mut(&peripheral) else {
                    return;
                };
                if let Err(error) = live.on_notification_value(&characteristic, &value) {
                    warn!("Dropped update from {}: {}", peripheral, error);
                    self.publish(ControllerEvent::DecodeFailed { peripheral, error });
                }
            }
        }
    }

    fn on_radio_state(&mut self, state: RadioState) {
        self.radio = state;
        if state == RadioState::PoweredOn {
            info!("Bluetooth radio ready");
            self.publish(ControllerEvent::RadioReady);
            if self.central.auto_scan {
                if let Err(e) = self.start_scan() {
                    warn!("Automatic scan not started: {}", e);
                }
            }
        } else {
            warn!("Bluetooth radio not ready: {:?}", state);
            if self.scanning {
                self.scanning = false;
                self.publish(ControllerEvent::ScanStopped);
            }
            self.publish(ControllerEvent::RadioNotReady(state));
        }
    }

    fn start_scan(&mut self) -> Result<(), ControllerError> {
        if self.radio != RadioState::PoweredOn {
            return Err(ControllerError::RadioNotReady(self.radio));
        }
        if self.scanning {
            return Ok(());
        }

        info!("Starting scan for media sources...");
        self.scanning = true;
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let allow_duplicates = self.central.allow_duplicates;
        tokio::spawn(async move {
            if let Err(e) = transport.start_scan(allow_duplicates).await {
                error!("Failed to start scan: {}", e);
                let _ = events.send(TransportEvent::ScanStopped(Some(e)));
            }
        });
        self.publish(ControllerEvent::ScanStarted);
        Ok(())
    }

    fn stop_scan(&mut self) {
        if !self.scanning {
            return;
        }

        info!("Stopping scan");
        self.scanning = false;
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
        self.publish(ControllerEvent::ScanStopped);
    }

    fn on_discovered(&mut self, peripheral: PeripheralHandle) {
        if !self.central.accepts(&peripheral) {
            return;
        }

        let first_seen = !self.peripherals.contains_key(&peripheral.id);
        let known = self
            .peripherals
            .entry(peripheral.id.clone())
            .or_insert_with(|| peripheral.clone());
        known.rssi = peripheral.rssi;
        if peripheral.name.is_some() {
            known.name = peripheral.name;
        }
        if peripheral.address.is_some() {
            known.address = peripheral.address;
        }

        if first_seen {
            info!("Found device: {} ({})", known.display_name(), known.id);
        }
        let peripheral = known.clone();
        self.publish(ControllerEvent::PeripheralDiscovered {
            peripheral,
            first_seen,
        });
    }

    fn connect(&mut self, peripheral: PeripheralId) -> Result<(), ControllerError> {
        if !self.peripherals.contains_key(&peripheral) {
            return Err(ControllerError::UnknownPeripheral(peripheral));
        }
        match self.sessions.get(&peripheral) {
            Some(session) if session.state() == SessionState::Closed => {
                // the failed session's disconnect has not been reported yet
                return Err(ControllerError::Disconnecting(peripheral));
            }
            Some(_) => {
                info!("Device {} already connected.", peripheral);
                return Ok(());
            }
            None => {}
        }
        if !self.connecting.insert(peripheral.clone()) {
            debug!("Connection to {} already in progress", peripheral);
            return Ok(());
        }

        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let max_retries = self.central.max_connect_retries;
        let retry_delay = self.central.retry_delay();
        tokio::spawn(async move {
            let event =
                match connect_with_retry(transport.as_ref(), &peripheral, max_retries, retry_delay)
                    .await
                {
                    Ok(()) => TransportEvent::Connected(peripheral),
                    Err(error) => TransportEvent::ConnectFailed { peripheral, error },
                };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn on_connected(&mut self, peripheral: PeripheralId) {
        self.connecting.remove(&peripheral);
        if self.live_session(&peripheral).is_some() {
            debug!("Ignoring duplicate connection event for {}", peripheral);
            return;
        }

        let handle = self
            .peripherals
            .get(&peripheral)
            .cloned()
            .unwrap_or_else(|| PeripheralHandle::new(peripheral.clone(), None, None, None));

        self.next_session += 1;
        let id = SessionId(self.next_session);
        let (queue, _worker) = GattQueue::spawn(
            self.transport.clone(),
            peripheral.clone(),
            id,
            self.events_tx.clone(),
        );
        let mut session = DeviceSession::new(id, handle.clone(), queue, self.session_config.clone());
        let started = session.start();
        self.sessions.insert(peripheral.clone(), session);

        info!("Connected to {}", handle.display_name());
        self.publish(ControllerEvent::Connected(handle));

        if let Err(error) = started {
            self.on_session_failed(peripheral, error);
            return;
        }
        self.schedule_deadline(peripheral, id);
    }

    fn schedule_deadline(&self, peripheral: PeripheralId, session: SessionId) {
        let Some(timeout) = self.central.setup_timeout() else {
            return;
        };
        let deadlines = self.deadline_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = deadlines.send((peripheral, session));
        });
    }

    fn on_setup_deadline(&mut self, peripheral: PeripheralId, session: SessionId) {
        let Some(live) = self.sessions.get_mut(&peripheral) else {
            return;
        };
        if live.id() != session {
            return;
        }
        if let Some(error) = live.expire() {
            self.on_session_failed(peripheral, error);
        }
    }

    fn on_session_failed(&mut self, peripheral: PeripheralId, error: SessionError) {
        error!("Session on {} failed: {}", peripheral, error);
        let fatal = error.is_fatal();
        self.publish(ControllerEvent::SessionFailed {
            peripheral: peripheral.clone(),
            error,
        });
        if !fatal {
            return;
        }
        if let Err(e) = self.disconnect(peripheral) {
            debug!("No disconnect after session failure: {}", e);
        }
    }

    fn disconnect(&mut self, peripheral: PeripheralId) -> Result<(), ControllerError> {
        if !self.sessions.contains_key(&peripheral) {
            return Err(ControllerError::NotConnected(peripheral));
        }

        info!("Disconnecting from device {}", peripheral);
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let error = match transport.disconnect(&peripheral).await {
                Ok(()) => None,
                Err(e) => {
                    warn!("Disconnect from {} reported an error: {}", peripheral, e);
                    Some(e)
                }
            };
            let _ = events.send(TransportEvent::Disconnected { peripheral, error });
        });
        Ok(())
    }

    fn on_disconnected(&mut self, peripheral: PeripheralId, error: Option<TransportError>) {
        let was_connecting = self.connecting.remove(&peripheral);
        let Some(mut session) = self.sessions.remove(&peripheral) else {
            if was_connecting {
                warn!("Link to {} dropped while connecting", peripheral);
                self.publish(ControllerEvent::Disconnected { peripheral, error });
            } else {
                debug!("Disconnect from {} with no session", peripheral);
            }
            return;
        };

        session.close();
        drop(session);

        info!("Device {} disconnected", peripheral);
        self.publish(ControllerEvent::Disconnected { peripheral, error });
    }

    fn live_session(&self, peripheral: &PeripheralId) -> Option<&DeviceSession> {
        self.sessions
            .get(peripheral)
            .filter(|session| session.state() != SessionState::Closed)
    }

    fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.close();
        }
    }

    fn publish(&self, event: ControllerEvent) {
        // no subscribers is fine
        let _ = self.notifier.send(event);
    }
}

/// Tries to connect up to `max_retries` times, sleeping `retry_delay` between attempts.
async fn connect_with_retry(
    transport: &dyn BleTransport,
    peripheral: &PeripheralId,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<(), TransportError> {
    let attempts = max_retries.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        info!("Initiating connection to {}...", peripheral);
        match transport.connect(peripheral).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("Connection attempt {} failed: {}", attempt, e);
                last_error = Some(e);
                if attempt < attempts {
                    info!("Retrying connection in {:?}...", retry_delay);
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        TransportError::Backend(format!("failed to connect after {} attempts", attempts))
    }))
}
