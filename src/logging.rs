//! Log line protocol shared with the daemon.
//!
//! By convention oz-init writes log messages to stderr with a single
//! character prefix indicating the logging level. These messages are read
//! one line at a time by the daemon and translated back into log events,
//! so the format here is exactly `<level-initial><space><message>\n` with
//! no timestamps, targets, or ANSI styling.

use std::fmt;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Event formatter emitting the daemon's one-line protocol.
pub struct LineProtocol;

fn level_initial(level: Level) -> char {
    match level {
        Level::TRACE | Level::DEBUG => 'D',
        Level::INFO => 'I',
        Level::WARN => 'W',
        Level::ERROR => 'E',
    }
}

impl<S, N> FormatEvent<S, N> for LineProtocol
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "{} ", level_initial(*event.metadata().level()))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` is honored when set; the default level is `debug` because the
/// daemon performs its own filtering on the decoded events.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .event_format(LineProtocol)
        .with_writer(std::io::stderr)
        .init();
}
