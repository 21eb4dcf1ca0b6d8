//! Per-peripheral GATT request queue
//! All requests for one peripheral (discovery, notification setup, command,
//! subscription and heartbeat writes) run one at a time, in submission order.
//! Each completion is posted back to the controller tagged with the session
//! that issued it.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::GATT_QUEUE_CAPACITY;
use crate::core::bluetooth::transport::{BleTransport, GattEvent, TransportEvent};
use crate::core::bluetooth::types::{
    GattCharacteristic, GattService, PeripheralId, SessionId, WriteKind,
};
use crate::error::TransportError;

/// A single queued GATT operation
#[derive(Debug, Clone, PartialEq)]
pub enum GattRequest {
    DiscoverServices {
        service: Uuid,
    },
    DiscoverCharacteristics {
        service: GattService,
    },
    SetNotify {
        characteristic: GattCharacteristic,
        enabled: bool,
    },
    Write {
        characteristic: GattCharacteristic,
        value: Vec<u8>,
        kind: WriteKind,
    },
}

/// Clonable submission handle for a peripheral's request worker
#[derive(Clone)]
pub struct GattQueue {
    tx: mpsc::Sender<GattRequest>,
    cancel_token: CancellationToken,
}

impl GattQueue {
    /// Spawns the worker for `peripheral`. Completions go to `events`.
    pub fn spawn(
        transport: Arc<dyn BleTransport>,
        peripheral: PeripheralId,
        session: SessionId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(GATT_QUEUE_CAPACITY);
        let cancel_token = CancellationToken::new();
        let worker_token = cancel_token.clone();

        let handle = tokio::spawn(async move {
            Self::run_worker(transport, peripheral, session, rx, events, worker_token).await;
        });

        (Self { tx, cancel_token }, handle)
    }

    /// Queues a request behind everything already submitted.
    /// Fails with `QueueFull` while the peripheral is not keeping up.
    pub fn submit(&self, request: GattRequest) -> Result<(), TransportError> {
        if self.cancel_token.is_cancelled() {
            return Err(TransportError::QueueClosed);
        }
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::QueueClosed,
        })
    }

    /// Drops pending requests and aborts the one in flight.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled() || self.tx.is_closed()
    }

    async fn run_worker(
        transport: Arc<dyn BleTransport>,
        peripheral: PeripheralId,
        session: SessionId,
        mut rx: mpsc::Receiver<GattRequest>,
        events: mpsc::UnboundedSender<TransportEvent>,
        cancel_token: CancellationToken,
    ) {
        debug!("GATT queue for {} ({}) started", peripheral, session);

        loop {
            let request = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let event = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                event = Self::execute(transport.as_ref(), &peripheral, request) => event,
            };

            let event = TransportEvent::Gatt {
                peripheral: peripheral.clone(),
                session,
                event,
            };
            if events.send(event).is_err() {
                warn!("Event channel closed, stopping GATT queue for {}", peripheral);
                break;
            }
        }

        info!("GATT queue for {} ({}) stopped", peripheral, session);
    }

    async fn execute(
        transport: &dyn BleTransport,
        peripheral: &PeripheralId,
        request: GattRequest,
    ) -> GattEvent {
        match request {
            GattRequest::DiscoverServices { service } => {
                GattEvent::ServicesDiscovered(transport.discover_services(peripheral, service).await)
            }
            GattRequest::DiscoverCharacteristics { service } => {
                let result = transport.discover_characteristics(peripheral, &service).await;
                GattEvent::CharacteristicsDiscovered { service, result }
            }
            GattRequest::SetNotify {
                characteristic,
                enabled,
            } => {
                let result = transport
                    .set_notify(peripheral, &characteristic, enabled)
                    .await;
                GattEvent::NotificationStateChanged {
                    characteristic,
                    result,
                }
            }
            GattRequest::Write {
                characteristic,
                value,
                kind,
            } => {
                debug!("Writing {:02x?} to {}", value, characteristic.uuid);
                let result = transport
                    .write(peripheral, &characteristic, &value, kind)
                    .await;
                GattEvent::WriteCompleted {
                    characteristic,
                    result,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{UUID_AMS_ENTITY_ATTRIBUTE, UUID_AMS_SERVICE};
    use crate::core::bluetooth::mock::{MockTransport, TransportCall};

    fn write(value: u8) -> GattRequest {
        GattRequest::Write {
            characteristic: GattCharacteristic::new(UUID_AMS_SERVICE, UUID_AMS_ENTITY_ATTRIBUTE),
            value: vec![value],
            kind: WriteKind::WithResponse,
        }
    }

    #[tokio::test]
    async fn requests_complete_in_submission_order() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport::with_media_service(events_tx.clone()));
        let peripheral = PeripheralId::new("dev-1");
        let (queue, _worker) =
            GattQueue::spawn(transport.clone(), peripheral.clone(), SessionId(7), events_tx);

        for value in 0..5u8 {
            queue.submit(write(value)).unwrap();
        }

        for _ in 0..5 {
            match events_rx.recv().await {
                Some(TransportEvent::Gatt { session, event, .. }) => {
                    assert_eq!(session, SessionId(7));
                    assert!(matches!(event, GattEvent::WriteCompleted { result: Ok(()), .. }));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        let written: Vec<u8> = transport
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Write { value, .. } => Some(value[0]),
                _ => None,
            })
            .collect();
        assert_eq!(written, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn closed_queue_rejects_submissions() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport::with_media_service(events_tx.clone()));
        let (queue, worker) =
            GattQueue::spawn(transport, PeripheralId::new("dev-1"), SessionId(1), events_tx);

        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.submit(write(1)), Err(TransportError::QueueClosed));
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn stuck_peripheral_fills_the_queue() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport::with_media_service(events_tx.clone()));
        transport.stall_writes(UUID_AMS_ENTITY_ATTRIBUTE);
        let (queue, _worker) =
            GattQueue::spawn(transport.clone(), PeripheralId::new("dev-1"), SessionId(1), events_tx);

        queue.submit(write(0)).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(transport.writes_to(UUID_AMS_ENTITY_ATTRIBUTE).len(), 1);

        for value in 1..=GATT_QUEUE_CAPACITY {
            queue.submit(write(value as u8)).unwrap();
        }
        assert_eq!(queue.submit(write(0xff)), Err(TransportError::QueueFull));
        assert!(!queue.is_closed());
    }
}
