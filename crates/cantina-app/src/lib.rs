//! Composition root.
//!
//! Builds every service in dependency order (leaves first), starts them
//! in that order, and stops in reverse on shutdown. A plain async
//! function drives everything; there is no GUI chrome in this runtime.

mod cli_bridge;
mod collaborators;
mod config;

pub use config::Config;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use cantina_bus::EventBus;
use cantina_debug::DebugService;
use cantina_dispatcher::CommandDispatcher;
use cantina_memory::MemoryStore;
use cantina_mode::ModeManager;
use cantina_music::MusicCoordinator;
use cantina_service::{start_service, stop_service};
use cantina_speech::SpeechCoordinator;
use cantina_timeline::TimelineExecutor;
use cantina_web::WebBridge;
use tracing::info;

/// Every long-lived service this runtime owns, kept around so shutdown can
/// walk them in reverse. CLI is driven separately by [`run`] since its
/// `run()` method (not `Service::on_start`) is what blocks on stdin.
struct Runtime {
    debug: Arc<DebugService>,
    dispatcher: Arc<CommandDispatcher>,
    mode: Arc<ModeManager>,
    memory: Arc<MemoryStore>,
    brain: Arc<cantina_brain::BrainService>,
    timeline: Arc<TimelineExecutor>,
    music: Arc<MusicCoordinator>,
    speech: Arc<SpeechCoordinator>,
    web: Arc<WebBridge>,
    bridge: Arc<cli_bridge::CliBridge>,
    web_server: tokio::task::JoinHandle<()>,
}

impl Runtime {
    async fn build(bus: Arc<EventBus>, config: &Config) -> Result<Self> {
        let debug = Arc::new(DebugService::new(Arc::clone(&bus)));
        start_service(debug.as_ref()).await.context("starting debug service")?;

        let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&bus)));
        cli_bridge::register_verbs(&dispatcher).context("registering CLI verbs")?;
        start_service(dispatcher.as_ref()).await.context("starting command dispatcher")?;

        let mode = Arc::new(ModeManager::new(Arc::clone(&bus)));
        start_service(mode.as_ref()).await.context("starting mode manager")?;

        let memory = Arc::new(MemoryStore::new(Arc::clone(&bus)));
        start_service(memory.as_ref()).await.context("starting memory store")?;

        let brain = Arc::new(cantina_brain::BrainService::new(
            Arc::clone(&bus),
            memory.memory(),
            Arc::new(collaborators::EchoCollaborator),
        ));
        start_service(brain.as_ref()).await.context("starting brain service")?;

        let timeline = Arc::new(TimelineExecutor::new(Arc::clone(&bus)));
        start_service(timeline.as_ref()).await.context("starting timeline executor")?;

        let music = Arc::new(MusicCoordinator::new(Arc::clone(&bus), &config.local_music_directory));
        start_service(music.as_ref()).await.context("starting music coordinator")?;

        let speech = Arc::new(SpeechCoordinator::new(
            Arc::clone(&bus),
            Arc::new(collaborators::NullAsr),
            Arc::new(collaborators::NullTts),
        ));
        start_service(speech.as_ref()).await.context("starting speech coordinator")?;

        let web = Arc::new(WebBridge::new(Arc::clone(&bus)));
        start_service(web.as_ref()).await.context("starting web bridge")?;
        let web_server = spawn_web_server(Arc::clone(&web), &config.web_bridge_addr).await?;

        let bridge = Arc::new(cli_bridge::CliBridge::new(Arc::clone(&bus), Arc::clone(&mode)));
        start_service(bridge.as_ref()).await.context("starting cli bridge")?;

        Ok(Self {
            debug,
            dispatcher,
            mode,
            memory,
            brain,
            timeline,
            music,
            speech,
            web,
            bridge,
            web_server,
        })
    }

    /// Stop in the reverse of start order.
    async fn shutdown(self) {
        self.web_server.abort();
        stop_service(self.bridge.as_ref()).await;
        stop_service(self.web.as_ref()).await;
        stop_service(self.speech.as_ref()).await;
        stop_service(self.music.as_ref()).await;
        stop_service(self.timeline.as_ref()).await;
        stop_service(self.brain.as_ref()).await;
        stop_service(self.memory.as_ref()).await;
        stop_service(self.mode.as_ref()).await;
        stop_service(self.dispatcher.as_ref()).await;
        stop_service(self.debug.as_ref()).await;
    }
}

async fn spawn_web_server(web: Arc<WebBridge>, addr: &str) -> Result<tokio::task::JoinHandle<()>> {
    let addr: SocketAddr = addr.parse().with_context(|| format!("invalid WEB_BRIDGE_ADDR {addr:?}"))?;
    let router = web.router();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding web bridge to {addr}"))?;
    info!(%addr, "web bridge listening");
    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            tracing::error!(error = %err, "web bridge server exited");
        }
    }))
}

/// Runs CantinaOS to completion: builds and starts every service, drives
/// the CLI until it exits, then stops everything in reverse. Returns the
/// process exit code (0 normal, 1 startup failure, 2 fatal).
pub async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cantina=debug")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration");
            return cantina_cli::EXIT_STARTUP_FAILURE;
        }
    };

    let bus = Arc::new(EventBus::new());
    let runtime = match Runtime::build(Arc::clone(&bus), &config).await {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = ?err, "failed to start CantinaOS");
            return cantina_cli::EXIT_STARTUP_FAILURE;
        }
    };

    let cli = cantina_cli::CliService::new(bus);
    start_service(&cli).await.ok();
    info!("CantinaOS running");
    let exit_code = cli.run().await;

    stop_service(&cli).await;
    runtime.shutdown().await;
    exit_code
}
