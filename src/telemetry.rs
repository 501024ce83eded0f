//! Logging bootstrap.
//!
//! A `tracing_subscriber::registry()` driven by an `EnvFilter`, with a
//! custom `FormatEvent` in place of the usual human-oriented `compact()`
//! formatter: the wire format here is an external contract,
//! `[<timestamp>] [<LEVEL>] <message> <json meta>`, so it is implemented
//! directly rather than reached for off the shelf.

use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `LOG_LEVEL` (default `info`)
/// drives the `EnvFilter`; output always goes to stdout in the wire
/// format.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().event_format(WireFormat);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// `[<ISO-8601 timestamp>] [<LEVEL>] <message> <optional JSON meta>`.
struct WireFormat;

impl<S, N> FormatEvent<S, N> for WireFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let timestamp = chrono::Utc::now().to_rfc3339();

        write!(writer, "[{timestamp}] [{}] ", level_label(*metadata.level()))?;

        let mut visitor = MessageFieldVisitor::default();
        event.record(&mut visitor);
        write!(writer, "{}", visitor.message)?;

        if !visitor.meta.is_empty() {
            write!(writer, " {}", serde_json::Value::Object(visitor.meta))?;
        }

        writeln!(writer)
    }
}

fn level_label(level: Level) -> &'static str {
    match level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

#[derive(Default)]
struct MessageFieldVisitor {
    message: String,
    meta: serde_json::Map<String, serde_json::Value>,
}

impl tracing::field::Visit for MessageFieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.meta
                .insert(field.name().to_string(), serde_json::Value::String(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.meta
                .insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.meta
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.meta
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.meta
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_label_matches_wire_format() {
        assert_eq!(level_label(Level::INFO), "INFO");
        assert_eq!(level_label(Level::ERROR), "ERROR");
    }
}
