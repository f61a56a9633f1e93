use chrono::{DateTime, Utc};
use log::{Level, LevelFilter, Log, Metadata, Record};
use tokio::sync::mpsc::UnboundedSender;

/// One formatted log line, handed off from the global `log` dispatcher to
/// whichever worker owns the logging sink (file + stdout/stderr mirror).
#[derive(Clone, Debug, serde::Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    /// The emitting module path, used as the worker name (e.g.
    /// `ci_supervisor::fetcher`); the sink does not need a stronger notion
    /// of "worker" than "who logged this".
    pub worker: String,
    pub pid: u32,
    pub level: Level,
    pub message: String,
}

impl LogRecord {
    /// Renders the line the logging sink writes to `<epoch>.ci.log`.
    pub fn format(&self) -> String {
        format!(
            "[{}::{}::{}::{}] {}",
            self.timestamp.to_rfc3339(),
            self.worker,
            self.pid,
            self.level,
            self.message
        )
    }
}

struct CiLogger {
    pid: u32,
    max_level: Level,
    sink: UnboundedSender<LogRecord>,
}

impl Log for CiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let rec = LogRecord {
            timestamp: Utc::now(),
            worker: record.target().to_string(),
            pid: self.pid,
            level: record.level(),
            message: format!("{}", record.args()),
        };

        // The sink worker may already be shutting down; dropping the
        // record in that case is preferable to panicking the caller.
        let _ = self.sink.send(rec);
    }

    fn flush(&self) {}
}

/// Installs the process-wide `log` backend, forwarding every record to
/// `sink`. This is the one piece of genuinely global state in the
/// telemetry stack: the `log` crate itself is a global dispatcher, so
/// there is no way to route through it without a single installed logger.
/// Everything downstream of the sink (the file it writes, the UDP socket
/// metrics go out on) is constructed explicitly by the caller and passed
/// down, not reached for through statics.
pub fn install(sink: UnboundedSender<LogRecord>, max_level: Level) -> anyhow::Result<()> {
    log::set_max_level(level_filter(max_level));
    log::set_boxed_logger(Box::new(CiLogger {
        pid: std::process::id(),
        max_level,
        sink,
    }))
    .map_err(|e| anyhow::anyhow!("logger already installed: {}", e))
}

fn level_filter(level: Level) -> LevelFilter {
    match level {
        Level::Error => LevelFilter::Error,
        Level::Warn => LevelFilter::Warn,
        Level::Info => LevelFilter::Info,
        Level::Debug => LevelFilter::Debug,
        Level::Trace => LevelFilter::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_matches_sink_layout() {
        let rec = LogRecord {
            timestamp: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            worker: "ci_supervisor::fetcher".to_string(),
            pid: 42,
            level: Level::Info,
            message: "polled 3 prs".to_string(),
        };

        let line = rec.format();
        assert!(line.starts_with("[2026-01-01T00:00:00+00:00::ci_supervisor::fetcher::42::INFO] polled 3 prs"));
    }
}
