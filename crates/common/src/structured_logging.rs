use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// One log line in JSON form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredLogEntry {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub level: String,
    /// Module that emitted the event
    pub target: String,
    pub message: String,
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ExecutionContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceMetrics>,
}

/// Process and thread the event came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub app_version: String,
    pub hostname: String,
    pub pid: u32,
    pub thread_id: String,
}

impl ExecutionContext {
    pub fn capture() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".into());
        Self {
            app_version: env!("CARGO_PKG_VERSION").into(),
            hostname,
            pid: std::process::id(),
            thread_id: format!("{:?}", std::thread::current().id()),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::capture()
    }
}

/// Timing fields lifted out of an event emitted by [`OperationTimer`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub duration_ms: Option<u64>,
    /// Items handled by the operation (resources released, bindings checked, ...)
    pub items_processed: Option<u64>,
    pub success: Option<bool>,
}

impl PerformanceMetrics {
    fn from_fields(fields: &HashMap<String, Value>) -> Option<Self> {
        let metrics = Self {
            duration_ms: fields.get("duration_ms").and_then(Value::as_u64),
            items_processed: fields.get("items").and_then(Value::as_u64),
            success: fields.get("success").and_then(Value::as_bool),
        };
        (metrics != Self::default()).then_some(metrics)
    }
}

/// Layer writing one [`StructuredLogEntry`] per event.
pub struct JsonFormatter<W = fn() -> io::Stdout> {
    make_writer: W,
    include_context: bool,
}

impl JsonFormatter {
    pub fn new() -> Self {
        Self {
            make_writer: io::stdout,
            include_context: true,
        }
    }
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> JsonFormatter<W> {
    /// Sends entries somewhere other than stdout (a file, a test buffer).
    pub fn with_writer<W2>(self, make_writer: W2) -> JsonFormatter<W2>
    where
        W2: for<'w> MakeWriter<'w> + 'static,
    {
        JsonFormatter {
            make_writer,
            include_context: self.include_context,
        }
    }

    pub fn with_context(self, include_context: bool) -> Self {
        Self {
            include_context,
            ..self
        }
    }

    fn entry(&self, event: &Event<'_>) -> StructuredLogEntry {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        StructuredLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            performance: PerformanceMetrics::from_fields(&visitor.fields),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            context: self.include_context.then(ExecutionContext::capture),
        }
    }
}

impl<S, W> Layer<S> for JsonFormatter<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let entry = self.entry(event);
        match serde_json::to_string(&entry) {
            Ok(line) => {
                let _ = writeln!(self.make_writer.make_writer(), "{}", line);
            }
            Err(e) => eprintln!("structured log entry dropped: {}", e),
        }
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: HashMap<String, Value>,
}

impl JsonVisitor {
    fn record_value(&mut self, field: &Field, value: Value) {
        match (field.name(), value) {
            ("message", Value::String(text)) => self.message = Some(text),
            (name, value) => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_value(field, Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(number) = serde_json::Number::from_f64(value) {
            self.record_value(field, Value::Number(number));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_value(field, value.into());
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is not set
    pub level: Level,
    pub json_output: bool,
    /// Only applies to the human-readable format
    pub color_output: bool,
    pub include_context: bool,
    pub include_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_output: false,
            color_output: true,
            include_context: true,
            include_line_numbers: cfg!(debug_assertions),
        }
    }
}

impl LoggingConfig {
    /// JSON lines without colors, suitable for log shippers.
    pub fn production() -> Self {
        Self {
            json_output: true,
            color_output: false,
            include_line_numbers: false,
            ..Self::default()
        }
    }

    pub fn with_level(self, level: Level) -> Self {
        Self { level, ..self }
    }

    fn output_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        if self.json_output {
            return JsonFormatter::new()
                .with_context(self.include_context)
                .boxed();
        }
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(self.include_line_numbers)
            .with_ansi(self.color_output)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_structured_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let subscriber = Registry::default().with(config.output_layer().with_filter(filter));
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("logging already initialised: {}", e))
}

macro_rules! event_at {
    ($level:expr, $($rest:tt)*) => {
        match $level {
            Level::ERROR => tracing::error!($($rest)*),
            Level::WARN => tracing::warn!($($rest)*),
            Level::INFO => tracing::info!($($rest)*),
            Level::DEBUG => tracing::debug!($($rest)*),
            Level::TRACE => tracing::trace!($($rest)*),
        }
    };
}

/// Measures one operation and logs its duration and fields when finished.
///
/// Successful completions are logged at the timer's level (`INFO` unless changed
/// with [`OperationTimer::with_level`]); failures always at `ERROR`.
pub struct OperationTimer {
    start: Instant,
    operation: String,
    level: Level,
    fields: Map<String, Value>,
}

impl OperationTimer {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation: operation.into(),
            level: Level::INFO,
            fields: Map::new(),
        }
    }

    pub fn with_level(self, level: Level) -> Self {
        Self { level, ..self }
    }

    /// Attaches a field to the completion event. Values that fail to serialize are skipped.
    pub fn add_field(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(value) = serde_json::to_value(value) {
            self.fields.insert(key.into(), value);
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(self) -> Duration {
        self.complete(None)
    }

    pub fn finish_with_result<T, E: fmt::Display>(self, result: &Result<T, E>) -> Duration {
        match result {
            Ok(_) => self.complete(None),
            Err(e) => self.complete(Some(e.to_string())),
        }
    }

    fn complete(self, error: Option<String>) -> Duration {
        let elapsed = self.start.elapsed();
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        // Lift `items` so the JSON layer can fill in `items_processed`.
        let items = self.fields.get("items").and_then(Value::as_u64);
        let fields = Value::Object(self.fields);

        match error {
            None => event_at!(
                self.level,
                operation = %self.operation,
                duration_ms,
                items,
                success = true,
                fields = %fields,
                "Operation completed"
            ),
            Some(error) => tracing::error!(
                operation = %self.operation,
                duration_ms,
                items,
                success = false,
                error = %error,
                fields = %fields,
                "Operation failed"
            ),
        }
        elapsed
    }
}
