//! Structured product logging.
//!
//! - [`logger`]: the context-enriched, level-filtered [`Logger`]
//! - [`sink`]: pluggable destinations behind the logger's queue
//! - [`subscriber`]: installation of the `tracing` subscriber used for the
//!   crate's own diagnostics

pub mod logger;
pub mod sink;
pub mod subscriber;

pub use logger::{LogEvent, LogLevel, Logger, LoggerConfig};
pub use sink::{JsonWriterSink, LogSink, MemorySink, StdoutJsonSink, TracingSink};
pub use subscriber::{init_tracing_subscriber, LogFormat, LogSubscriberConfig};
