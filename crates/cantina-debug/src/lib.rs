//! DebugService: the async log sink (spec.md §4.10).
//!
//! Subscribes to `DEBUG_LOG` and enqueues entries into a bounded queue
//! (`queue.rs`) drained by a background writer that performs non-blocking
//! stdout writes with backoff, so a burst of log traffic never stalls the
//! emitting handler. `DEBUG_COMMAND` drives per-component log levels,
//! command tracing, and `debug performance show`. `SERVICE_STATUS_UPDATE`
//! and `SERVICE_ERROR` are mirrored in unconditionally (state-transition
//! capture is not subject to level filtering), and `CLI_COMMAND` traffic is
//! mirrored in only while tracing is toggled on.

mod perf;
mod queue;

pub use perf::{PerfSummary, PerformanceTracker};
pub use queue::LogQueue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cantina_bus::EventBus;
use cantina_events::{
    topics, CliCommandPayload, CliResponsePayload, DebugLogPayload, LogLevel, ServiceErrorPayload,
    ServiceStatusPayload, StandardCommandPayload,
};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

fn default_level() -> LogLevel {
    LogLevel::Info
}

pub struct DebugService {
    core: cantina_service::ServiceCore,
    queue: Arc<LogQueue>,
    perf: Arc<PerformanceTracker>,
    levels: Arc<Mutex<HashMap<String, LogLevel>>>,
    default_level: Arc<RwLock<LogLevel>>,
    trace_enabled: Arc<AtomicBool>,
    writer: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl DebugService {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            core: cantina_service::ServiceCore::new("debug", bus),
            queue: Arc::new(LogQueue::new(queue::DEFAULT_CAPACITY)),
            perf: Arc::new(PerformanceTracker::new()),
            levels: Arc::new(Mutex::new(HashMap::new())),
            default_level: Arc::new(RwLock::new(default_level())),
            trace_enabled: Arc::new(AtomicBool::new(false)),
            writer: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn threshold_for(&self, component: &str) -> LogLevel {
        self.levels
            .lock()
            .expect("debug levels lock poisoned")
            .get(component)
            .copied()
            .unwrap_or_else(|| *self.default_level.read().expect("default level lock poisoned"))
    }

    async fn handle_debug_log(
        queue: Arc<LogQueue>,
        perf: Arc<PerformanceTracker>,
        levels: Arc<Mutex<HashMap<String, LogLevel>>>,
        default_level: Arc<RwLock<LogLevel>>,
        payload: Value,
    ) -> Result<(), String> {
        let entry: DebugLogPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        if let Some(duration_ms) = entry.duration_ms {
            perf.record(&entry.component, duration_ms);
        }
        let threshold = levels
            .lock()
            .expect("debug levels lock poisoned")
            .get(&entry.component)
            .copied()
            .unwrap_or_else(|| *default_level.read().expect("default level lock poisoned"));
        if entry.level >= threshold {
            queue.push(entry);
        }
        Ok(())
    }

    fn mirror(queue: &LogQueue, component: &str, level: LogLevel, message: String) {
        queue.push(DebugLogPayload {
            component: component.to_string(),
            level,
            message,
            duration_ms: None,
        });
    }

    async fn handle_service_status(queue: Arc<LogQueue>, payload: Value) -> Result<(), String> {
        let status: ServiceStatusPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        let level = match status.status {
            cantina_events::ServiceStatus::Error => LogLevel::Error,
            cantina_events::ServiceStatus::Degraded => LogLevel::Warn,
            _ => LogLevel::Info,
        };
        let message = match &status.message {
            Some(m) => format!("{:?} ({m})", status.status),
            None => format!("{:?}", status.status),
        };
        Self::mirror(&queue, &format!("service:{}", status.service), level, message);
        Ok(())
    }

    async fn handle_service_error(queue: Arc<LogQueue>, payload: Value) -> Result<(), String> {
        let error: ServiceErrorPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        Self::mirror(&queue, &format!("service:{}", error.source), LogLevel::Error, error.message);
        Ok(())
    }

    async fn handle_cli_command_trace(
        queue: Arc<LogQueue>,
        trace_enabled: Arc<AtomicBool>,
        payload: Value,
    ) -> Result<(), String> {
        if !trace_enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let command: CliCommandPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        Self::mirror(&queue, "command_trace", LogLevel::Info, command.raw_input);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_debug_command(
        handle: cantina_service::ServiceHandle,
        levels: Arc<Mutex<HashMap<String, LogLevel>>>,
        default_level: Arc<RwLock<LogLevel>>,
        trace_enabled: Arc<AtomicBool>,
        perf: Arc<PerformanceTracker>,
        payload: Value,
    ) -> Result<(), String> {
        let command: StandardCommandPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        let message = match command.subcommand.as_deref() {
            Some("level") => Self::apply_level(&command.args, &levels, &default_level),
            Some("trace") => Self::apply_trace(&command.args, &trace_enabled),
            Some("performance") => Self::render_performance(&command.args, &perf),
            _ => Err(format!("unknown debug subcommand: {:?}", command.subcommand)),
        };

        let (message, is_error) = match message {
            Ok(message) => (message, false),
            Err(message) => (message, true),
        };
        let value = serde_json::to_value(CliResponsePayload { message, is_error })
            .expect("cli response payload always serializes");
        handle.emit(topics::CLI_RESPONSE, value).await;
        Ok(())
    }

    fn apply_level(
        args: &[String],
        levels: &Mutex<HashMap<String, LogLevel>>,
        default_level: &RwLock<LogLevel>,
    ) -> Result<String, String> {
        let [component, level] = args else {
            return Err("usage: debug level <component> <LEVEL>".to_string());
        };
        let parsed = parse_level(level)?;
        if component == "all" || component == "*" {
            *default_level.write().expect("default level lock poisoned") = parsed;
        } else {
            levels
                .lock()
                .expect("debug levels lock poisoned")
                .insert(component.clone(), parsed);
        }
        Ok(format!("{component} log level set to {level}"))
    }

    fn apply_trace(args: &[String], trace_enabled: &AtomicBool) -> Result<String, String> {
        match args.first().map(String::as_str) {
            Some("on") => {
                trace_enabled.store(true, Ordering::Relaxed);
                Ok("command tracing enabled".to_string())
            }
            Some("off") => {
                trace_enabled.store(false, Ordering::Relaxed);
                Ok("command tracing disabled".to_string())
            }
            _ => Err("usage: debug trace on|off".to_string()),
        }
    }

    fn render_performance(args: &[String], perf: &PerformanceTracker) -> Result<String, String> {
        if args.first().map(String::as_str) != Some("show") {
            return Err("usage: debug performance show".to_string());
        }
        let summaries = perf.all_summaries();
        if summaries.is_empty() {
            return Ok("no performance samples recorded yet".to_string());
        }
        let lines: Vec<String> = summaries
            .into_iter()
            .map(|(component, s)| {
                format!(
                    "{component}: min={:.1}ms avg={:.1}ms max={:.1}ms (n={})",
                    s.min_ms, s.avg_ms, s.max_ms, s.count
                )
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

fn parse_level(raw: &str) -> Result<LogLevel, String> {
    match raw.to_ascii_uppercase().as_str() {
        "TRACE" => Ok(LogLevel::Trace),
        "DEBUG" => Ok(LogLevel::Debug),
        "INFO" => Ok(LogLevel::Info),
        "WARN" | "WARNING" => Ok(LogLevel::Warn),
        "ERROR" => Ok(LogLevel::Error),
        other => Err(format!("unknown log level: {other}")),
    }
}

async fn write_loop(queue: Arc<LogQueue>, cancel: CancellationToken) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let entry = tokio::select! {
            _ = cancel.cancelled() => break,
            entry = queue.recv() => entry,
        };
        let line = format!("[{:?}] {}: {}\n", entry.level, entry.component, entry.message);
        let mut stdout = tokio::io::stdout();
        loop {
            match stdout.write_all(line.as_bytes()).await {
                Ok(()) => {
                    backoff = INITIAL_BACKOFF;
                    break;
                }
                Err(err) => {
                    warn!(error = %err, backoff_ms = backoff.as_millis(), "debug log write failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

#[async_trait]
impl cantina_service::Service for DebugService {
    fn core(&self) -> &cantina_service::ServiceCore {
        &self.core
    }

    async fn setup_subscriptions(&self) -> Result<(), cantina_service::ServiceError> {
        let queue = Arc::clone(&self.queue);
        let perf = Arc::clone(&self.perf);
        let levels = Arc::clone(&self.levels);
        let default_level = Arc::clone(&self.default_level);
        self.core.subscribe(topics::DEBUG_LOG, move |payload| {
            let queue = Arc::clone(&queue);
            let perf = Arc::clone(&perf);
            let levels = Arc::clone(&levels);
            let default_level = Arc::clone(&default_level);
            async move { Self::handle_debug_log(queue, perf, levels, default_level, payload).await }
        })?;

        let queue = Arc::clone(&self.queue);
        self.core.subscribe(topics::SERVICE_STATUS_UPDATE, move |payload| {
            let queue = Arc::clone(&queue);
            async move { Self::handle_service_status(queue, payload).await }
        })?;

        let queue = Arc::clone(&self.queue);
        self.core.subscribe(topics::SERVICE_ERROR, move |payload| {
            let queue = Arc::clone(&queue);
            async move { Self::handle_service_error(queue, payload).await }
        })?;

        let queue = Arc::clone(&self.queue);
        let trace_enabled = Arc::clone(&self.trace_enabled);
        self.core.subscribe(topics::CLI_COMMAND, move |payload| {
            let queue = Arc::clone(&queue);
            let trace_enabled = Arc::clone(&trace_enabled);
            async move { Self::handle_cli_command_trace(queue, trace_enabled, payload).await }
        })?;

        let handle = self.core.handle();
        let levels = Arc::clone(&self.levels);
        let default_level = Arc::clone(&self.default_level);
        let trace_enabled = Arc::clone(&self.trace_enabled);
        let perf = Arc::clone(&self.perf);
        self.core.subscribe(topics::DEBUG_COMMAND, move |payload| {
            let handle = handle.clone();
            let levels = Arc::clone(&levels);
            let default_level = Arc::clone(&default_level);
            let trace_enabled = Arc::clone(&trace_enabled);
            let perf = Arc::clone(&perf);
            async move { Self::handle_debug_command(handle, levels, default_level, trace_enabled, perf, payload).await }
        })?;

        Ok(())
    }

    async fn on_start(&self) -> Result<(), cantina_service::ServiceError> {
        let queue = Arc::clone(&self.queue);
        let cancel = self.cancel.clone();
        let join = tokio::spawn(write_loop(queue, cancel));
        *self.writer.lock().expect("writer handle lock poisoned") = Some(join);
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), cantina_service::ServiceError> {
        self.cancel.cancel();
        let join = self.writer.lock().expect("writer handle lock poisoned").take();
        if let Some(join) = join {
            let _ = join.await;
        }
        Ok(())
    }
}
