//! Log sinks: where the logger's consumer task writes events.

use super::logger::{LogEvent, LogLevel};
use crate::error::SinkError;
use std::io::Write;
use std::sync::Mutex;

/// Destination for log events. Called from the logger's single consumer
/// task, never from producers.
pub trait LogSink: Send + Sync {
    fn write(&self, event: &LogEvent) -> Result<(), SinkError>;

    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// One JSON object per line on stdout.
#[derive(Debug, Default)]
pub struct StdoutJsonSink;

impl LogSink for StdoutJsonSink {
    fn write(&self, event: &LogEvent) -> Result<(), SinkError> {
        let line = serde_json::to_string(event)?;
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        std::io::stdout().lock().flush()?;
        Ok(())
    }
}

/// JSON lines into any writer. Used for files and in tests.
#[derive(Debug)]
pub struct JsonWriterSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonWriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<W: Write + Send> LogSink for JsonWriterSink<W> {
    fn write(&self, event: &LogEvent) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        serde_json::to_writer(&mut *writer, event)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .flush()?;
        Ok(())
    }
}

/// Forwards events to the installed `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, event: &LogEvent) -> Result<(), SinkError> {
        let fields = serde_json::to_string(&event.fields)?;
        let message = event.message.as_str();
        let trace_id = event.trace_id.as_str();
        let span_id = event.span_id.as_str();
        let request_id = event.request_id.as_str();
        let correlation_id = event.correlation_id.as_str();

        macro_rules! forward {
            ($macro:ident) => {
                tracing::$macro!(
                    target: "backoffice::log",
                    correlation_id,
                    trace_id,
                    span_id,
                    request_id,
                    fields = fields.as_str(),
                    "{}",
                    message
                )
            };
        }

        match event.level {
            LogLevel::Debug => forward!(debug),
            LogLevel::Info => forward!(info),
            LogLevel::Warn => forward!(warn),
            LogLevel::Error | LogLevel::Fatal => forward!(error),
        }
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl LogSink for MemorySink {
    fn write(&self, event: &LogEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use chrono::Utc;

    fn event() -> LogEvent {
        LogEvent {
            level: LogLevel::Info,
            timestamp: Utc::now(),
            message: "order placed".to_string(),
            service: "orders".to_string(),
            hostname: "host-1".to_string(),
            pid: 42,
            correlation_id: "c-1".to_string(),
            trace_id: String::new(),
            span_id: String::new(),
            request_id: String::new(),
            user_id: String::new(),
            session_id: String::new(),
            fields: attrs! {"order_id" => 7i64},
        }
    }

    #[test]
    fn test_json_writer_sink_writes_lines() {
        let sink = JsonWriterSink::new(Vec::new());
        sink.write(&event()).unwrap();
        sink.write(&event()).unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);

        let json: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(json["level"], "info");
        assert_eq!(json["message"], "order placed");
        assert_eq!(json["correlation_id"], "c-1");
        assert_eq!(json["fields"]["order_id"], 7);
        assert!(json.get("trace_id").is_none());
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.write(&event()).unwrap();
        assert_eq!(sink.len(), 1);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_tracing_sink_accepts_every_level() {
        let sink = TracingSink;
        for level in [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
            LogLevel::Fatal,
        ] {
            let mut e = event();
            e.level = level;
            assert!(sink.write(&e).is_ok());
        }
    }
}
