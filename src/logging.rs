use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::LogConfig;

const LOG_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub target: String,
    pub message: String,
    pub timestamp: String,
}

/// Console logger that also forwards important records to subscribers
pub struct EventLogger {
    console: env_logger::Logger,
    forward_level: LevelFilter,
    sender: broadcast::Sender<LogMessage>,
}

impl EventLogger {
    pub fn new(config: &LogConfig, sender: broadcast::Sender<LogMessage>) -> Self {
        let console = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(config.level.as_str()),
        )
        .build();
        let forward_level = config.forward_level.parse().unwrap_or(LevelFilter::Warn);
        Self {
            console,
            forward_level,
            sender,
        }
    }

    /// Installs the logger globally. The returned sender hands out log subscriptions.
    pub fn init(config: &LogConfig) -> Result<broadcast::Sender<LogMessage>, SetLoggerError> {
        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        let logger = EventLogger::new(config, sender.clone());
        let max_level = logger.console.filter().max(logger.forward_level);

        log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(max_level))?;
        log::info!("Logging initialized");
        Ok(sender)
    }

    fn forward(&self, record: &Record) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        let log_message = LogMessage {
            level: record.level().to_string(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        };
        let _ = self.sender.send(log_message);
    }
}

impl Log for EventLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.console.enabled(metadata) || metadata.level() <= self.forward_level
    }

    fn log(&self, record: &Record) {
        if self.console.matches(record) {
            self.console.log(record);
        }
        if record.level() <= self.forward_level {
            self.forward(record);
        }
    }

    fn flush(&self) {
        self.console.flush();
    }
}

/// Installs [`EventLogger`], or plain `env_logger` if that fails.
/// Returns `None` when forwarding is unavailable.
pub fn setup_logging(config: &LogConfig) -> Option<broadcast::Sender<LogMessage>> {
    match EventLogger::init(config) {
        Ok(sender) => Some(sender),
        Err(_) => {
            let _ = env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or(config.level.as_str()),
            )
            .try_init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn forwards_records_at_or_above_threshold() {
        let (sender, mut receiver) = broadcast::channel(8);
        let logger = EventLogger::new(&LogConfig::default(), sender);

        logger.log(
            &Record::builder()
                .args(format_args!("subscription rejected"))
                .level(Level::Warn)
                .target("ams_remote")
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("heartbeat"))
                .level(Level::Debug)
                .target("ams_remote")
                .build(),
        );

        let message = receiver.try_recv().unwrap();
        assert_eq!(message.level, "WARN");
        assert_eq!(message.target, "ams_remote");
        assert_eq!(message.message, "subscription rejected");
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn unparsable_forward_level_defaults_to_warn() {
        let (sender, _) = broadcast::channel(1);
        let config = LogConfig {
            level: "info".into(),
            forward_level: "loud".into(),
        };
        let logger = EventLogger::new(&config, sender);
        assert_eq!(logger.forward_level, LevelFilter::Warn);
    }
}
