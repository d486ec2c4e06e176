use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flowdesk_channel::message::LogLevel;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Target of the JSON lifecycle log.
pub const EVENT_TARGET: &str = "request";

pub trait LoggerType: Send + Sync {
    fn log(&self, level: LogLevel, context: &str, msg: &str);
    fn clone_box(&self) -> Box<dyn LoggerType>;
    fn debug_box(&self) -> String;
}

pub struct Logger(pub Box<dyn LoggerType>);

impl Logger {
    pub fn log(&self, level: LogLevel, context: &str, msg: &str) {
        self.0.log(level, context, msg)
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Logger(self.0.clone_box())
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Forwards to the `tracing` macros.
#[derive(Clone, Debug, Default)]
pub struct TracingLogger;

impl LoggerType for TracingLogger {
    fn log(&self, level: LogLevel, context: &str, msg: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(%context, "{msg}"),
            LogLevel::Debug => tracing::debug!(%context, "{msg}"),
            LogLevel::Info => tracing::info!(%context, "{msg}"),
            LogLevel::Warn => tracing::warn!(%context, "{msg}"),
            LogLevel::Error => tracing::error!(%context, "{msg}"),
            LogLevel::Critical => tracing::error!(%context, "[CRITICAL] {msg}"),
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "TracingLogger".to_string()
    }
}

fn appender(path: &Path) -> Result<RollingFileAppender> {
    let dir = path
        .parent()
        .with_context(|| format!("log path {} has no directory", path.display()))?;
    let file = path
        .file_name()
        .with_context(|| format!("log path {} has no file name", path.display()))?;
    std::fs::create_dir_all(dir)?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, file))
}

// `log_level` filters the text and stdout layers only; lifecycle events are
// always written.
fn subscriber(
    log_level: &str,
    text: RollingFileAppender,
    events: RollingFileAppender,
    to_stdout: bool,
) -> impl tracing::Subscriber + Send + Sync + 'static {
    let text_layer = fmt::layer()
        .with_writer(text)
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level));

    let event_layer = fmt::layer()
        .json()
        .with_writer(events)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{}=info", EVENT_TARGET)));

    let stdout_layer = to_stdout.then(|| {
        fmt::layer()
            .with_thread_names(true)
            .with_filter(EnvFilter::new(log_level))
    });

    Registry::default()
        .with(text_layer)
        .with(event_layer)
        .with(stdout_layer)
}

/// Install the global subscriber: a daily rolling text log, a daily rolling
/// JSON log of conversation lifecycle events (target `request`), and when
/// `to_stdout` is set, human readable output on stdout.
pub fn init_tracing(
    root: PathBuf,
    log_file: &str,
    event_file: &str,
    log_level: &str,
    to_stdout: bool,
) -> Result<Logger> {
    let text = appender(&root.join(log_file))?;
    let events = appender(&root.join(event_file))?;
    subscriber(log_level, text, events, to_stdout)
        .try_init()
        .context("tracing already initialised")?;

    Ok(Logger(Box::new(TracingLogger)))
}

/// One JSON line in the lifecycle log.
pub fn lifecycle_event(conversation_id: &str, event: &str, detail: &str) {
    tracing::event!(
        target: EVENT_TARGET,
        tracing::Level::INFO,
        conversation = conversation_id,
        event = event,
        detail = detail,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_clones_and_logs_without_subscriber() {
        let logger = Logger(Box::new(TracingLogger));
        let copy = logger.clone();
        copy.log(LogLevel::Critical, "test", "still fine without a subscriber");
        assert_eq!(format!("{:?}", copy), "TracingLogger");
        lifecycle_event("c1", "created", "web");
    }

    #[test]
    fn appender_needs_a_file_name() {
        assert!(appender(Path::new("/")).is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(appender(&dir.path().join("logs").join("flowdesk.log")).is_ok());
        assert!(dir.path().join("logs").exists());
    }

    fn read_prefixed(dir: &Path, prefix: &str) -> String {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
            .map(|e| std::fs::read_to_string(e.path()).unwrap())
            .collect()
    }

    #[test]
    fn lifecycle_events_survive_a_quiet_log_level() {
        let dir = tempfile::tempdir().unwrap();
        let text = appender(&dir.path().join("text.log")).unwrap();
        let events = appender(&dir.path().join("events.log")).unwrap();

        tracing::subscriber::with_default(subscriber("warn", text, events, false), || {
            tracing::info!("chatter");
            tracing::warn!("loud");
            lifecycle_event("c1", "created", "web");
        });

        let events = read_prefixed(dir.path(), "events.log");
        assert!(events.contains("\"event\":\"created\""), "{events}");
        let text = read_prefixed(dir.path(), "text.log");
        assert!(text.contains("loud"));
        assert!(!text.contains("chatter"));
    }
}
