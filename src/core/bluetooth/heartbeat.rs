//! Keep-alive timer for an active session

use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::gatt_queue::{GattQueue, GattRequest};
use crate::core::bluetooth::types::{GattCharacteristic, WriteKind};
use crate::core::codec::HEARTBEAT_FRAME;
use crate::error::TransportError;

/// Periodically queues the heartbeat frame. Stops when dropped.
pub struct Heartbeat {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Start the keepalive timer. The first frame goes out one period from now.
    pub fn start(queue: GattQueue, characteristic: GattCharacteristic, period: Duration) -> Self {
        let cancel_token = CancellationToken::new();
        let task_token = cancel_token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!("Sending heartbeat");
                        let request = GattRequest::Write {
                            characteristic: characteristic.clone(),
                            value: HEARTBEAT_FRAME.to_vec(),
                            kind: WriteKind::WithResponse,
                        };
                        match queue.submit(request) {
                            Ok(()) => {}
                            Err(TransportError::QueueFull) => {
                                warn!("Request queue full, skipping heartbeat");
                            }
                            Err(_) => {
                                debug!("Request queue closed, heartbeat exiting");
                                break;
                            }
                        }
                    }
                }
            }
        });

        info!("Heartbeat started with interval of {:?}", period);
        Self {
            cancel_token,
            handle,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel_token.is_cancelled() && !self.handle.is_finished()
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if !self.cancel_token.is_cancelled() {
            self.cancel_token.cancel();
            info!("Heartbeat stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::core::bluetooth::constants::{UUID_AMS_ENTITY_ATTRIBUTE, UUID_AMS_SERVICE};
    use crate::core::bluetooth::mock::MockTransport;
    use crate::core::bluetooth::types::{PeripheralId, SessionId};

    fn heartbeat_writes(transport: &MockTransport) -> usize {
        transport.writes_to(UUID_AMS_ENTITY_ATTRIBUTE).len()
    }

    #[tokio::test(start_paused = true)]
    async fn fires_every_period_until_stopped() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport::with_media_service(events_tx.clone()));
        let (queue, _worker) =
            GattQueue::spawn(transport.clone(), PeripheralId::new("dev-1"), SessionId(1), events_tx);

        let heartbeat = Heartbeat::start(
            queue,
            GattCharacteristic::new(UUID_AMS_SERVICE, UUID_AMS_ENTITY_ATTRIBUTE),
            Duration::from_secs(3),
        );
        assert!(heartbeat.is_running());

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(heartbeat_writes(&transport), 0);

        events_rx.recv().await.unwrap();
        assert_eq!(heartbeat_writes(&transport), 1);
        events_rx.recv().await.unwrap();
        assert_eq!(heartbeat_writes(&transport), 2);
        assert_eq!(
            transport.writes_to(UUID_AMS_ENTITY_ATTRIBUTE)[0],
            HEARTBEAT_FRAME.to_vec()
        );

        heartbeat.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(heartbeat_writes(&transport), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exits_when_queue_closes() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport::with_media_service(events_tx.clone()));
        let (queue, _worker) =
            GattQueue::spawn(transport, PeripheralId::new("dev-1"), SessionId(1), events_tx);

        let heartbeat = Heartbeat::start(
            queue.clone(),
            GattCharacteristic::new(UUID_AMS_SERVICE, UUID_AMS_ENTITY_ATTRIBUTE),
            Duration::from_secs(3),
        );
        queue.close();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!heartbeat.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn skips_ticks_while_queue_is_full() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport::with_media_service(events_tx.clone()));
        transport.stall_writes(UUID_AMS_ENTITY_ATTRIBUTE);
        let (queue, _worker) =
            GattQueue::spawn(transport.clone(), PeripheralId::new("dev-1"), SessionId(1), events_tx);

        let heartbeat = Heartbeat::start(
            queue,
            GattCharacteristic::new(UUID_AMS_SERVICE, UUID_AMS_ENTITY_ATTRIBUTE),
            Duration::from_secs(3),
        );
        tokio::time::sleep(Duration::from_secs(300)).await;

        // the first write never completes, the rest wait behind it
        assert_eq!(heartbeat_writes(&transport), 1);
        assert!(heartbeat.is_running());
    }
}
