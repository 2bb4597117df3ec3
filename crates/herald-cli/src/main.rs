mod config;
mod session;

use herald::{
    ChatConfig, ChatStreamController, ConnectionMonitor, ConversationStore, DiagnosticLog, HttpProber, HttpTransport,
    JobEventRouter, JobRouterConfig, JobStore, MonitorConfig, StaticToken, StreamTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::session::Session;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Initialize logging
    init_logging(&config);

    tracing::info!("Starting Herald client");
    tracing::info!("Backend: {}", config.server.base_url);

    let transport: Arc<dyn StreamTransport> =
        Arc::new(HttpTransport::new()?.with_base_url(config.server.base_url.clone()));
    let diagnostics = DiagnosticLog::new();
    let jobs = JobStore::new();

    // Job stream runs on its own connection for the whole session
    let router = if config.jobs.enabled {
        let mut job_config = JobRouterConfig::from(&config.jobs);
        if let Some(token) = &config.token {
            job_config = job_config.with_bearer_token(token.clone());
        }
        let router = JobEventRouter::new(Arc::clone(&transport), jobs.clone(), job_config)
            .with_diagnostics(diagnostics.clone());
        router.start();
        Some(router)
    } else {
        tracing::info!("Job stream disabled");
        None
    };

    let monitor = if config.monitor.enabled {
        let prober = HttpProber::new(config.probe_url())
            .with_timeout(Duration::from_millis(config.monitor.probe_timeout_ms));
        let monitor = ConnectionMonitor::new(Arc::new(prober), MonitorConfig::from(&config.monitor));
        monitor.start();
        Some(monitor)
    } else {
        tracing::info!("Connection monitor disabled");
        None
    };

    let conversations = ConversationStore::new();
    let conversation_id = conversations.create();
    let mut chat = ChatStreamController::new(transport, conversations, ChatConfig::from(&config.chat))
        .with_job_sink(Arc::new(jobs.clone()))
        .with_diagnostics(diagnostics);
    if let Some(token) = config.token.clone() {
        chat = chat.with_credentials(Arc::new(StaticToken::new(token)));
    }

    Session::new(chat, jobs, router, monitor, conversation_id).run().await?;

    tracing::info!("Herald client stopped");
    Ok(())
}

fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    // stdout belongs to the conversation
    match config.logging.format.as_str() {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }
}
