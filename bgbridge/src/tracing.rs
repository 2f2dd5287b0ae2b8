//! Logging setup for the bridge.
//!
//! Call one of the `init_*` functions once at startup; everything else uses
//! `use crate::tracing::prelude::*` for the level macros.
//!
//! Frame traffic is logged at TRACE with the direction as the message
//! (`<=chip`, `=>chip`, `<=app`), decoded advertisements under the
//! `bgbridge::gap` target. `RUST_LOG=bgbridge::gap=trace` shows only the
//! latter.

use std::env;
use std::fmt;

use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

const CRATE_PREFIX: &str = "bgbridge::";

/// Log to journald when started by systemd, otherwise to stdout.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry()
                    .with(env_filter())
                    .with(layer)
                    .init();
            }
            Err(e) => {
                init_stdout();
                error!(error = %e, "Failed to initialize journald logging, using stdout.");
            }
        }
    } else {
        init_stdout();
    }
}

/// Log to stdout, filtered by `RUST_LOG` (default INFO).
pub fn init_stdout() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .event_format(BridgeFormatter),
        )
        .init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

/// Target as shown in the log: our own modules without the crate prefix,
/// bridged `log` records under their original target, dependencies as is.
fn short_target<'a>(target: &'a str, log_target: Option<&'a str>) -> &'a str {
    if let Some(stripped) = target.strip_prefix(CRATE_PREFIX) {
        stripped
    } else if target == "log" {
        log_target.unwrap_or(target)
    } else {
        target
    }
}

/// Debug output of a field value, without the quoting and `Some(..)`
/// wrapping that only add noise in a log line.
fn clean_value(formatted: &str) -> &str {
    let inner = formatted
        .strip_prefix("Some(")
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(formatted);
    inner.trim_matches('"')
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl FieldCollector {
    fn log_target(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| *name == "log.target")
            .map(|(_, value)| clean_value(value))
    }
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let formatted = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(formatted);
        } else {
            self.fields.push((field.name(), formatted));
        }
    }
}

/// One line per event, structured fields dimmed on a second line.
struct BridgeFormatter;

impl<S, N> FormatEvent<S, N> for BridgeFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;

        let (color, label) = match *event.metadata().level() {
            tracing::Level::ERROR => ("\x1b[31m", "ERROR"),
            tracing::Level::WARN => ("\x1b[33m", "WARN "),
            tracing::Level::INFO => ("\x1b[32m", "INFO "),
            tracing::Level::DEBUG => ("\x1b[34m", "DEBUG"),
            tracing::Level::TRACE => ("\x1b[35m", "TRACE"),
        };
        let target = short_target(event.metadata().target(), visitor.log_target());
        write!(writer, " {}{}\x1b[0m {}: ", color, label, target)?;

        if let Some(message) = &visitor.message {
            write!(writer, "{}", message.trim_matches('"'))?;
        }

        let mut fields = visitor
            .fields
            .iter()
            .filter(|(name, _)| !name.starts_with("log."))
            .peekable();
        if fields.peek().is_some() {
            // Align under the target column: "HH:MM:SS LEVEL "
            write!(writer, "\n\x1b[90m{:15}", "")?;
            for (i, (name, value)) in fields.enumerate() {
                let sep = if i > 0 { ", " } else { "" };
                write!(writer, "{}{}={}", sep, name, clean_value(value))?;
            }
            write!(writer, "\x1b[0m")?;
        }

        writeln!(writer)
    }
}

/// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", formatted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("bgbridge::gap", None, "gap"; "own module")]
    #[test_case("bgbridge::bglib::codec", None, "bglib::codec"; "nested module")]
    #[test_case("tokio_serial", None, "tokio_serial"; "dependency")]
    #[test_case("log", Some("mio::poll"), "mio::poll"; "log bridge")]
    #[test_case("log", None, "log"; "log bridge without target")]
    fn targets(target: &str, log_target: Option<&str>, expected: &str) {
        assert_eq!(short_target(target, log_target), expected);
    }

    #[test_case("\"discovery\"", "discovery"; "quoted")]
    #[test_case("Some(\"A4:C1:38:02:83:F4\")", "A4:C1:38:02:83:F4"; "some")]
    #[test_case("Some(3)", "3"; "some number")]
    #[test_case("None", "None"; "none")]
    #[test_case("a0 12 01 00", "a0 12 01 00"; "plain")]
    fn values(formatted: &str, expected: &str) {
        assert_eq!(clean_value(formatted), expected);
    }
}
