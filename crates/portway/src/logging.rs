//! Logging initialization.
//!
//! Two layers: a compact stderr layer filtered by `RUST_LOG`, and an
//! append-only manager log file whose records are
//! `[YYYY-MM-DD HH:MM:SS] LEVEL: [Port <p>] <message>`. The port prefix is
//! taken from a `port` field on the event when present.

use chrono::Local;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// The manager log record format.
struct ManagerLogFormat;

impl<S, N> FormatEvent<S, N> for ManagerLogFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut fields = EventFields::default();
        event.record(&mut fields);

        let level = match *event.metadata().level() {
            Level::ERROR => "ERROR",
            Level::WARN => "WARNING",
            Level::INFO => "INFO",
            Level::DEBUG | Level::TRACE => "DEBUG",
        };

        write!(
            writer,
            "[{}] {}: ",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level
        )?;
        if let Some(port) = fields.port {
            write!(writer, "[Port {}] ", port)?;
        }
        write!(writer, "{}", fields.message)?;
        if !fields.extra.is_empty() {
            write!(writer, " ({})", fields.extra.join(", "))?;
        }
        writeln!(writer)
    }
}

/// Collects the message, the `port` field and everything else.
#[derive(Default)]
struct EventFields {
    message: String,
    port: Option<u64>,
    extra: Vec<String>,
}

impl Visit for EventFields {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "port" {
            self.port = Some(value);
        } else {
            self.extra.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "port" && value >= 0 {
            self.port = Some(value as u64);
        } else {
            self.extra.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.extra.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.extra.push(format!("{}={:?}", field.name(), value));
        }
    }
}

/// Install the stderr and file layers.
///
/// When the log file cannot be opened (a permissions problem on the default
/// `/var/log` path, typically) logging continues on stderr alone.
pub fn init(log_file: &Path) {
    let stderr_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        );

    let file_layer = open_log_file(log_file).map(|file| {
        fmt::layer()
            .event_format(ManagerLogFormat)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(LevelFilter::INFO)
    });

    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer);
    if registry.try_init().is_err() {
        // Already initialized (tests); keep the existing subscriber.
    }
}

fn open_log_file(path: &Path) -> Option<std::fs::File> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!(
                "warning: cannot open log file {}: {} (logging to stderr only)",
                path.display(),
                err
            );
            None
        }
    }
}
