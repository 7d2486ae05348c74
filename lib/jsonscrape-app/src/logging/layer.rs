use std::{
    fmt::{self, Write as _},
    str::FromStr as _,
    sync::OnceLock,
};

use chrono::{
    format::{DelayedFormat, Item, StrftimeItems},
    Utc,
};
use chrono_tz::Tz;
use tracing::{field, Event, Subscriber};
use tracing_subscriber::{
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, Layer, MakeWriter},
    layer,
    registry::LookupSpan,
    Layer as _,
};

use super::LoggingConfiguration;

/// Builds the layer that turns events into log lines for `writer`.
///
/// JSON output flattens event fields into the top-level object. Otherwise, lines use the pipe-delimited text format.
pub fn build_formatting_layer<S, W>(
    config: &LoggingConfiguration, app_name: &str, writer: W,
) -> Box<dyn layer::Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    if config.log_format_json {
        Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    } else {
        Layer::new()
            .event_format(PipeDelimitedFormatter::new(app_name))
            .with_writer(writer)
            .boxed()
    }
}

/// Single-line text format: `time | APP | LEVEL | (file:line) | key:value,... | message`.
///
/// The field section is left out when an event has no fields besides its message.
struct PipeDelimitedFormatter {
    app_name: String,
}

impl PipeDelimitedFormatter {
    fn new(app_name: &str) -> Self {
        // "json-exporter" -> "JSONEXPORTER"
        let app_name = app_name.to_uppercase().replace(['-', ' '], "");

        Self { app_name }
    }
}

impl<S, N> FormatEvent<S, N> for PipeDelimitedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let metadata = event.metadata();
        let file = metadata.file().unwrap_or("unknown");
        let line = metadata.line().unwrap_or(0);

        write!(
            writer,
            "{} | {} | {} | ({}:{})",
            get_delayed_format_now(),
            self.app_name,
            metadata.level(),
            file,
            line
        )?;

        let mut fields = PipeDelimitedFields::default();
        event.record(&mut fields);

        if !fields.pairs.is_empty() {
            write!(writer, " | {}", fields.pairs)?;
        }
        if !fields.message.is_empty() {
            write!(writer, " | {}", fields.message)?;
        }

        writeln!(writer)
    }
}

/// Event fields, buffered so the message can be written after every other field.
///
/// String and debug values are quoted (`metric:"requests"`); numbers and booleans are written bare (`ignored:2`).
#[derive(Default)]
struct PipeDelimitedFields {
    pairs: String,
    message: String,
}

impl PipeDelimitedFields {
    fn push(&mut self, field: &field::Field, value: fmt::Arguments<'_>) {
        if !self.pairs.is_empty() {
            self.pairs.push(',');
        }
        // Writing into a `String` can't fail.
        let _ = write!(self.pairs, "{}:{}", field.name(), value);
    }
}

impl field::Visit for PipeDelimitedFields {
    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            self.push(field, format_args!("\"{:?}\"", value));
        }
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.push(field, format_args!("\"{}\"", value));
        }
    }

    fn record_f64(&mut self, field: &field::Field, value: f64) {
        self.push(field, format_args!("{}", value));
    }

    fn record_i64(&mut self, field: &field::Field, value: i64) {
        self.push(field, format_args!("{}", value));
    }

    fn record_u64(&mut self, field: &field::Field, value: u64) {
        self.push(field, format_args!("{}", value));
    }

    fn record_bool(&mut self, field: &field::Field, value: bool) {
        self.push(field, format_args!("{}", value));
    }
}

/// Current time in the system timezone, or UTC when that can't be determined.
fn get_delayed_format_now() -> DelayedFormat<impl Iterator<Item = &'static Item<'static>> + Clone> {
    static SYSTEM_TZ: OnceLock<Tz> = OnceLock::new();
    let system_tz = SYSTEM_TZ.get_or_init(|| {
        iana_time_zone::get_timezone()
            .map_err(|_| ())
            .and_then(|raw_tz| Tz::from_str(&raw_tz).map_err(|_| ()))
            .unwrap_or(Tz::UTC)
    });

    // 2024-12-31 23:59:59 CET
    static FORMAT_ITEMS: OnceLock<Vec<Item<'static>>> = OnceLock::new();
    let format_items = FORMAT_ITEMS.get_or_init(|| {
        StrftimeItems::new("%Y-%m-%d %H:%M:%S %Z")
            .parse()
            .unwrap_or_default()
    });

    let now = Utc::now().with_timezone(system_tz);
    now.format_with_items(format_items.iter())
}
