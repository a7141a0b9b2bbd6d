//! Timestamped text-line logging sinks.
//!
//! The engine only emits `tracing` events. A host that wants plain log lines
//! installs [`SinkLayer`] with a [`LogSink`]: every event becomes one line of the
//! form `2024-05-01T12:00:00.123Z INFO audio_sync::session: message k=v`.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Receiver of formatted log lines.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Appends lines to a file.
pub struct FileSink {
    writer: Mutex<LineWriter<File>>,
}

impl FileSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(LineWriter::new(file)),
        })
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str) {
        if let Ok(mut w) = self.writer.lock() {
            let _ = writeln!(w, "{line}");
        }
    }
}

/// Keeps the most recent lines in memory.
pub struct MemorySink {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .map(|buf| buf.iter().any(|l| l.contains(needle)))
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut buffer) = self.lines.lock() {
            buffer.clear();
        }
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        if let Ok(mut buffer) = self.lines.lock() {
            buffer.push_back(line.to_string());
            while buffer.len() > self.capacity {
                buffer.pop_front();
            }
        }
    }
}

/// `tracing` layer rendering events into a [`LogSink`].
pub struct SinkLayer {
    sink: Arc<dyn LogSink>,
}

impl SinkLayer {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let mut message = visitor.message.unwrap_or_default();
        if !visitor.fields.is_empty() {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(&visitor.fields.join(" "));
        }
        let meta = event.metadata();
        let line = format!(
            "{} {} {}: {}",
            timestamp(),
            meta.level(),
            meta.target(),
            message
        );
        self.sink.write_line(&line);
    }
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

#[derive(Default)]
struct LineVisitor {
    message: Option<String>,
    fields: Vec<String>,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let formatted = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(formatted.trim_matches('"').to_string());
        } else {
            self.fields.push(format!("{}={}", field.name(), formatted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn events_become_timestamped_lines() {
        let sink = Arc::new(MemorySink::new(16));
        let subscriber = tracing_subscriber::registry().with(SinkLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(channels = 2, device = "pipewire", "audio playback started");
        });

        let lines = sink.snapshot();
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert!(line.contains(" INFO "), "{line}");
        assert!(line.ends_with("audio playback started channels=2 device=pipewire"), "{line}");
        let stamp = line.split(' ').next().unwrap();
        assert!(OffsetDateTime::parse(stamp, &Rfc3339).is_ok(), "{stamp}");
    }

    #[test]
    fn memory_sink_keeps_most_recent() {
        let sink = MemorySink::new(2);
        sink.write_line("a");
        sink.write_line("b");
        sink.write_line("c");
        assert_eq!(sink.snapshot(), vec!["b".to_string(), "c".to_string()]);
        assert!(sink.contains("c"));
        sink.clear();
        assert!(sink.snapshot().is_empty());
    }

    #[test]
    fn file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.log");
        let sink = FileSink::create(&path).unwrap();
        sink.write_line("first");
        sink.write_line("second");
        drop(sink);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "first\nsecond\n");
    }
}
