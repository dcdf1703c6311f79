//! CLI: reads lines, splits on whitespace, emits `CLI_COMMAND`; prints
//! `CLI_RESPONSE` as it arrives (spec.md §4.9). `help`/`quit`/history are
//! handled locally — the CLI never parses domain commands, it only reads
//! and prints.
//!
//! Grounded on `rustyline`, attested in the retrieved example corpus by
//! manifest only (`kimberlitedb-kimberlite`, `sblanchard-SerialAgent`) since
//! the teacher workspace is GUI-driven (Tauri) and has no line-editing CLI
//! of its own. The blocking `readline` loop runs on its own thread via
//! `tokio::task::spawn_blocking`, the same offload spec.md §5 prescribes
//! for blocking collaborator calls, bridged to the async bus through an
//! unbounded channel.

use std::sync::Arc;

use async_trait::async_trait;
use cantina_bus::EventBus;
use cantina_events::{topics, CliCommandPayload, CliResponsePayload};
use cantina_service::{Service, ServiceCore, ServiceError};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{error, warn};

const PROMPT: &str = "cantina> ";

/// Sentinel pushed onto the line channel when the reader hits an
/// unrecoverable I/O error, distinct from a graceful `quit`/Ctrl-D.
const FATAL_SENTINEL: &str = "\u{0}__cantina_cli_fatal__";

/// Exit codes per spec.md §6.
pub const EXIT_OK: i32 = 0;
pub const EXIT_STARTUP_FAILURE: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

const HELP_TEXT: &str = "\
Commands:
  engage (e) | disengage (d) | ambient (a) | reset (r) | status (s)
  list music (l) | play music <n|name> (p) | stop music
  eye pattern <name> | eye test | eye status
  debug level <component> <LEVEL> | debug trace on|off | debug performance show
  help | quit (q, exit)";

fn is_quit(line: &str) -> bool {
    matches!(line, "quit" | "exit" | "q")
}

/// Parses one raw input line into a `CLI_COMMAND` payload. Returns `None`
/// for blank input, per spec.md §4.3 ("empty input -> ignored").
fn parse_line(line: &str) -> Option<CliCommandPayload> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut tokens = trimmed.split_whitespace();
    let command = tokens.next()?.to_string();
    let args = tokens.map(str::to_string).collect();
    Some(CliCommandPayload {
        command,
        args,
        raw_input: trimmed.to_string(),
    })
}

fn read_loop(tx: UnboundedSender<String>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            error!(error = %err, "failed to initialize line editor");
            let _ = tx.send(FATAL_SENTINEL.to_string());
            return;
        }
    };

    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                let _ = tx.send("quit".to_string());
                break;
            }
            Err(err) => {
                error!(error = %err, "line editor read failed");
                let _ = tx.send(FATAL_SENTINEL.to_string());
                break;
            }
        }
    }
}

pub struct CliService {
    core: ServiceCore,
}

impl CliService {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            core: ServiceCore::new("cli", bus),
        }
    }

    /// Drives the CLI to completion: blocking line reads on their own
    /// thread, command emission, response printing. Returns the process
    /// exit code (spec.md §6).
    pub async fn run(&self) -> i32 {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let reader = tokio::task::spawn_blocking(move || read_loop(tx));
        let handle = self.core.handle();

        let mut exit_code = EXIT_OK;
        while let Some(raw) = rx.recv().await {
            if raw == FATAL_SENTINEL {
                exit_code = EXIT_FATAL;
                break;
            }
            let trimmed = raw.trim();
            if is_quit(trimmed) {
                println!("Goodbye.");
                break;
            }
            if trimmed == "help" {
                println!("{HELP_TEXT}");
                continue;
            }
            match parse_line(&raw) {
                Some(payload) => {
                    let value = serde_json::to_value(payload).expect("cli command payload always serializes");
                    handle.emit(topics::CLI_COMMAND, value).await;
                }
                None => continue,
            }
        }

        if let Err(err) = reader.await {
            warn!(error = %err, "cli reader task panicked");
        }
        exit_code
    }
}

#[async_trait]
impl Service for CliService {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    async fn setup_subscriptions(&self) -> Result<(), ServiceError> {
        self.core.subscribe(topics::CLI_RESPONSE, move |payload| async move {
            let response: CliResponsePayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
            if response.is_error {
                eprintln!("error: {}", response.message);
            } else {
                println!("{}", response.message);
            }
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantina_service::start_service;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parse_line_ignores_blank_input() {
        assert!(parse_line("   ").is_none());
    }

    #[test]
    fn parse_line_splits_command_and_args() {
        let payload = parse_line("play music Cantina Band").unwrap();
        assert_eq!(payload.command, "play");
        assert_eq!(payload.args, vec!["music", "Cantina", "Band"]);
        assert_eq!(payload.raw_input, "play music Cantina Band");
    }

    #[test]
    fn is_quit_recognizes_all_aliases() {
        assert!(is_quit("quit"));
        assert!(is_quit("exit"));
        assert!(is_quit("q"));
        assert!(!is_quit("queue"));
    }

    #[tokio::test]
    async fn cli_response_is_printed_not_re_emitted() {
        let bus = Arc::new(EventBus::new());
        let cli = CliService::new(Arc::clone(&bus));
        start_service(&cli).await.unwrap();

        let reemitted = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&reemitted);
        bus.subscribe_sync(topics::CLI_COMMAND, move |_| {
            let r = Arc::clone(&r);
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        let payload = CliResponsePayload {
            message: "Interactive mode engaged.".into(),
            is_error: false,
        };
        bus.emit(topics::CLI_RESPONSE, serde_json::to_value(payload).unwrap())
            .await
            .unwrap();

        assert_eq!(reemitted.load(Ordering::SeqCst), 0);
    }
}
