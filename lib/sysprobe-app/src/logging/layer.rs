use std::fmt;

use chrono::{SecondsFormat, Utc};
use tracing::{field, Event, Subscriber};
use tracing_subscriber::{
    field::VisitOutput,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, Layer, MakeWriter},
    layer,
    registry::LookupSpan,
    Layer as _,
};

use super::LoggingConfiguration;

pub fn build_formatting_layer<S, W>(config: &LoggingConfiguration, writer: W) -> Box<dyn layer::Layer<S> + Send + Sync>
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
            .event_format(PipeDelimitedFormatter::new("SYSPROBE"))
            .with_writer(writer)
            .boxed()
    }
}

/// Formats events as `<time> | <app> | <level> | (<file>:<line>) | key:value,... | message`.
struct PipeDelimitedFormatter {
    app_name: &'static str,
}

impl PipeDelimitedFormatter {
    const fn new(app_name: &'static str) -> Self {
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

        write!(
            writer,
            "{} | {} | {} | ",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            self.app_name,
            metadata.level()
        )?;

        if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
            write!(writer, "({}:{})", file, line)?;
        } else {
            write!(writer, "(unknown:0)")?;
        }

        let mut v = PipeDelimitedFieldVisitor::new(writer.by_ref());
        event.record(&mut v);
        v.finish()?;

        writeln!(writer)
    }
}

/// Field visitor that writes structured fields as `key:value` pairs, separated by commas, before the message.
///
/// Write errors are captured and returned when the visitor is finished; all operations after an error are no-ops.
struct PipeDelimitedFieldVisitor<'writer> {
    writer: Writer<'writer>,
    fields_written: usize,
    message: String,
    last_result: fmt::Result,
}

impl<'writer> PipeDelimitedFieldVisitor<'writer> {
    fn new(writer: Writer<'writer>) -> Self {
        Self {
            writer,
            fields_written: 0,
            message: String::new(),
            last_result: Ok(()),
        }
    }

    fn try_write(&mut self, field: &field::Field, f: impl FnOnce(&mut dyn fmt::Write) -> fmt::Result) {
        if self.last_result.is_err() {
            return;
        }

        if field.name() == "message" {
            // The message must come last, so hold onto it until we finish.
            self.last_result = f(&mut self.message);
        } else {
            let prefix = if self.fields_written == 0 { " | " } else { "," };

            self.last_result = write!(self.writer, "{}{}:", prefix, field.name());
            if self.last_result.is_err() {
                return;
            }

            self.last_result = f(&mut self.writer);
            if self.last_result.is_ok() {
                self.fields_written += 1;
            }
        }
    }
}

impl field::Visit for PipeDelimitedFieldVisitor<'_> {
    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        self.try_write(field, |w| {
            if field.name() == "message" {
                write!(w, "{:?}", value)
            } else {
                write!(w, "\"{:?}\"", value)
            }
        });
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.try_write(field, |w| {
            if field.name() == "message" {
                w.write_str(value)
            } else {
                write!(w, "\"{}\"", value)
            }
        });
    }

    fn record_i64(&mut self, field: &field::Field, value: i64) {
        self.try_write(field, |w| write!(w, "{}", value));
    }

    fn record_u64(&mut self, field: &field::Field, value: u64) {
        self.try_write(field, |w| write!(w, "{}", value));
    }

    fn record_bool(&mut self, field: &field::Field, value: bool) {
        self.try_write(field, |w| write!(w, "{}", value));
    }
}

impl VisitOutput<fmt::Result> for PipeDelimitedFieldVisitor<'_> {
    fn finish(mut self) -> fmt::Result {
        self.last_result?;

        if !self.message.is_empty() {
            write!(self.writer, " | {}", self.message)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use tracing_subscriber::layer::SubscriberExt as _;

    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(config: &LoggingConfiguration, emit: impl FnOnce()) -> String {
        let capture = Capture::default();
        let writer = {
            let capture = capture.clone();
            move || capture.clone()
        };
        let subscriber = tracing_subscriber::registry().with(build_formatting_layer(config, writer));
        tracing::subscriber::with_default(subscriber, emit);

        let bytes = capture.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn pipe_delimited_fields_before_message() {
        let line = capture(&LoggingConfiguration::default(), || {
            tracing::warn!(pid = 42, syscall = "kill", "Swallowed error.");
        });

        assert!(line.contains(" | SYSPROBE | WARN | ("), "{}", line);
        assert!(line.trim_end().ends_with(" | pid:42,syscall:\"kill\" | Swallowed error."), "{}", line);
    }

    #[test]
    fn message_only() {
        let line = capture(&LoggingConfiguration::default(), || tracing::error!("Query failed."));
        assert!(line.trim_end().ends_with(") | Query failed."), "{}", line);
    }

    #[test]
    fn json_events_are_flattened() {
        let config = LoggingConfiguration {
            log_format_json: true,
            ..Default::default()
        };
        let line = capture(&config, || tracing::info!(pid = 7, "Running query."));

        assert!(line.contains("\"pid\":7"), "{}", line);
        assert!(line.contains("\"message\":\"Running query.\""), "{}", line);
    }
}
