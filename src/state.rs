//! Application state management
//! This module wires the configuration, a transport and the central
//! controller together for a presentation layer.

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::commands::ControllerHandle;
use crate::config::AppConfig;
use crate::core::bluetooth::manager::CentralController;
use crate::core::bluetooth::transport::{BleTransport, TransportEvent};
use crate::logging::LogMessage;

/// Running application state
pub struct AppState {
    /// Handle to the controller's run loop
    pub controller: ControllerHandle,
    pub config: AppConfig,
    /// Forwarded log records, when the event logger is installed
    pub logs: Option<broadcast::Sender<LogMessage>>,
    task: JoinHandle<()>,
}

impl AppState {
    /// Starts a controller over an already constructed transport.
    /// `events` must be the receiver paired with the sender the transport posts to.
    pub fn with_transport(
        config: AppConfig,
        transport: Arc<dyn BleTransport>,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        info!("Initializing central controller...");
        let controller = CentralController::new(
            transport,
            events_tx,
            config.central.clone(),
            config.session.clone(),
        );
        let (controller, task) = controller.spawn(events);
        Self {
            controller,
            config,
            logs: None,
            task,
        }
    }

    /// Opens the default Bluetooth adapter and starts a controller over it.
    #[cfg(feature = "bluest")]
    pub async fn new(config: AppConfig) -> Result<Self> {
        use crate::core::bluetooth::bluest_backend::BluestTransport;

        let (events_tx, events) = mpsc::unbounded_channel();
        let transport = BluestTransport::new(events_tx.clone()).await?;
        Ok(Self::with_transport(config, Arc::new(transport), events_tx, events))
    }

    pub fn subscribe_logs(&self) -> Option<broadcast::Receiver<LogMessage>> {
        self.logs.as_ref().map(broadcast::Sender::subscribe)
    }

    /// Stops the controller and waits for its run loop to exit.
    pub async fn shutdown(self) -> Result<()> {
        if let Err(e) = self.controller.shutdown().await {
            warn!("Controller already stopped: {}", e);
        }
        self.task.await?;
        info!("Application state shut down");
        Ok(())
    }
}
