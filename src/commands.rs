//! Controller commands
//! This module defines every request a presentation layer can make of the
//! running controller. Each call is forwarded to the controller's run loop
//! and awaits its reply.

use log::{debug, info};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::core::bluetooth::manager::{ControllerEvent, ControllerRequest};
use crate::core::bluetooth::session::SessionState;
use crate::core::bluetooth::types::{PeripheralHandle, PeripheralId};
use crate::core::codec::ControlCommand;
use crate::core::track_info::TrackSnapshot;
use crate::error::ControllerError;

/// Clonable handle to a running [`CentralController`](crate::core::bluetooth::manager::CentralController)
#[derive(Clone)]
pub struct ControllerHandle {
    requests: mpsc::Sender<ControllerRequest>,
    notifier: broadcast::Sender<ControllerEvent>,
}

impl ControllerHandle {
    pub(crate) fn new(
        requests: mpsc::Sender<ControllerRequest>,
        notifier: broadcast::Sender<ControllerEvent>,
    ) -> Self {
        Self { requests, notifier }
    }

    /// Receives every controller event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.notifier.subscribe()
    }

    /// Starts continuous scanning. Fails if the radio is not powered on.
    pub async fn start_scan(&self) -> Result<(), ControllerError> {
        self.call(ControllerRequest::StartScan).await?
    }

    pub async fn stop_scan(&self) -> Result<(), ControllerError> {
        self.call(ControllerRequest::StopScan).await?
    }

    /// Connects to a discovered peripheral
    ///
    /// Returns once the attempt is under way. Progress is reported as
    /// `Connected`, `SessionReady`, `ConnectFailed` or `SessionFailed` events.
    pub async fn connect(&self, peripheral: PeripheralId) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::Connect(peripheral, reply))
            .await?
    }

    /// Requests a disconnect. The `Disconnected` event follows once the session is closed.
    pub async fn disconnect(&self, peripheral: PeripheralId) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::Disconnect(peripheral, reply))
            .await?
    }

    /// Disconnects and waits until the controller reports the peripheral gone.
    pub async fn disconnect_and_wait(&self, peripheral: PeripheralId) -> Result<(), ControllerError> {
        let mut events = self.subscribe();
        self.disconnect(peripheral.clone()).await?;

        loop {
            match events.recv().await {
                Ok(ControllerEvent::Disconnected { peripheral: gone, .. }) if gone == peripheral => {
                    info!("Device {} disconnected", peripheral);
                    return Ok(());
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Skipped {} events while waiting for disconnect", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ControllerError::Stopped),
            }
        }
    }

    /// Sends a remote command to an active session.
    pub async fn send_command(
        &self,
        peripheral: PeripheralId,
        command: ControlCommand,
    ) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::SendCommand(peripheral, command, reply))
            .await?
    }

    /// Current now-playing state of a connected peripheral.
    pub async fn snapshot(&self, peripheral: PeripheralId) -> Result<TrackSnapshot, ControllerError> {
        self.call(|reply| ControllerRequest::Snapshot(peripheral, reply))
            .await?
    }

    /// State of the peripheral's session, or `None` if it has none.
    pub async fn session_state(
        &self,
        peripheral: PeripheralId,
    ) -> Result<Option<SessionState>, ControllerError> {
        self.call(|reply| ControllerRequest::SessionState(peripheral, reply))
            .await
    }

    /// Every device discovered so far, ordered by identifier.
    pub async fn peripherals(&self) -> Result<Vec<PeripheralHandle>, ControllerError> {
        self.call(ControllerRequest::Peripherals).await
    }

    /// Closes every session and stops the controller.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        info!("Shutting down controller");
        self.call(ControllerRequest::Shutdown).await
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> ControllerRequest,
    ) -> Result<T, ControllerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(request(reply_tx))
            .await
            .map_err(|_| ControllerError::Stopped)?;
        reply_rx.await.map_err(|_| ControllerError::Stopped)
    }
}
