use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ams_remote_lib::commands::ControllerHandle;
use ams_remote_lib::config::{AppConfig, CONFIG_FILE_NAME};
use ams_remote_lib::core::bluetooth::{ControllerEvent, PeripheralId};
use ams_remote_lib::core::codec::ControlCommand;
use ams_remote_lib::{logging, state::AppState};
use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection bookkeeping for the interactive runner
struct Runner {
    controller: ControllerHandle,
    target_name: Option<String>,
    active: Option<PeripheralId>,
    connecting: bool,
}

impl Runner {
    async fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::PeripheralDiscovered { peripheral, first_seen } => {
                if first_seen {
                    info!(
                        "Discovered {} ({}) RSSI {:?}",
                        peripheral.display_name(),
                        peripheral.id,
                        peripheral.rssi
                    );
                }
                let wanted = self
                    .target_name
                    .as_deref()
                    .is_some_and(|target| peripheral.name_contains(target));
                if wanted && self.active.is_none() && !self.connecting {
                    self.connecting = true;
                    if let Err(e) = self.controller.connect(peripheral.id).await {
                        error!("Failed to connect: {}", e);
                        self.connecting = false;
                    }
                }
            }
            ControllerEvent::Connected(peripheral) => {
                self.connecting = false;
                self.active = Some(peripheral.id);
            }
            ControllerEvent::ConnectFailed { .. } => self.connecting = false,
            ControllerEvent::SessionReady { peripheral, mut snapshots } => {
                info!("Media session ready on {}. Type a command (play, pause, next, ...)", peripheral);
                tokio::spawn(async move {
                    while snapshots.changed().await.is_ok() {
                        let snapshot = snapshots.borrow_and_update().clone();
                        info!("Now playing:\n{}", snapshot);
                    }
                });
            }
            ControllerEvent::SessionFailed { peripheral, error } => {
                warn!("Session on {} failed: {}", peripheral, error);
            }
            ControllerEvent::Disconnected { peripheral, .. } => {
                if self.active.as_ref() == Some(&peripheral) {
                    self.active = None;
                }
            }
            ControllerEvent::DecodeFailed { error, .. } => debug!("Dropped update: {}", error),
            other => debug!("{:?}", other),
        }
    }

    /// Returns false when the user asked to quit.
    async fn handle_input(&self, line: &str) -> bool {
        match line {
            "" => return true,
            "quit" | "exit" => return false,
            _ => {}
        }

        let command = match ControlCommand::from_str(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("{}", e);
                return true;
            }
        };
        match &self.active {
            Some(peripheral) => {
                if let Err(e) = self.controller.send_command(peripheral.clone(), command).await {
                    error!("Failed to send {}: {}", command, e);
                }
            }
            None => warn!("No connected media source"),
        }
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let config = AppConfig::load_config(&config_path).await?;
    let logs = logging::setup_logging(&config.log);
    info!("Using config {:?}", config_path);

    let mut state = AppState::new(config).await?;
    state.logs = logs;

    let mut events = state.controller.subscribe();
    let mut runner = Runner {
        controller: state.controller.clone(),
        target_name: state.config.central.target_name.clone(),
        active: None,
        connecting: false,
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => runner.handle_event(event).await,
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} controller events", skipped),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) => {
                    if !runner.handle_input(line.trim()).await {
                        break;
                    }
                }
                Ok(None) => input_open = false,
                Err(e) => {
                    warn!("Failed to read input: {}", e);
                    input_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if let Some(peripheral) = runner.active.take() {
        match tokio::time::timeout(
            DISCONNECT_TIMEOUT,
            state.controller.disconnect_and_wait(peripheral),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Disconnect failed: {}", e),
            Err(_) => warn!("Timed out waiting for disconnect"),
        }
    }

    state.shutdown().await
}
