mod routes;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use hackademia_agents::{
    analyze::LlmAnalyzeAgent,
    build::WorkspaceBuildAgent,
    fix::LlmFixAgent,
    llm::{GeminiModel, LocalCodeModel},
    testgen::LlmTestAgent,
};
use hackademia_core::{
    bus::EventBus,
    config::Config,
    github::{GitHubClient, SourceHost},
    pipeline::{Agents, Orchestrator},
    terminal::TerminalManager,
    workspace::WorkspaceManager,
};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub bus: Arc<EventBus>,
    pub orchestrator: Arc<Orchestrator>,
    pub terminals: Arc<TerminalManager>,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "hackademia_server=info,hackademia_core=info,hackademia_agents=info,tower_http=warn".into()
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Arc::new(Config::from_env()?);
    if config.github_token.is_empty() {
        // Health endpoints still serve; pipeline operations will fail at the
        // adapter with AuthMissing.
        tracing::warn!("GITHUB_TOKEN is not set - pipeline operations will fail");
    }

    let bus = EventBus::new();
    let host: Arc<dyn SourceHost> = Arc::new(GitHubClient::new(config.github_token.clone()));

    let gemini = Arc::new(GeminiModel::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
    ));
    let code_model = Arc::new(LocalCodeModel::new(
        config.code_model_url.clone(),
        config.code_model.clone(),
    ));
    info!(
        question_model = %config.gemini_model,
        code_model = %config.code_model,
        code_model_url = %config.code_model_url,
        "LLM collaborators configured"
    );

    let agents = Agents {
        build: Arc::new(WorkspaceBuildAgent::new(
            WorkspaceManager::new(config.github_token.clone(), config.command_timeout_s),
            Arc::clone(&host),
        )),
        analyze: Arc::new(LlmAnalyzeAgent::new(gemini.clone())),
        fix: Arc::new(LlmFixAgent::new(gemini.clone(), Arc::clone(&host))),
        test: Arc::new(LlmTestAgent::new(
            gemini,
            code_model,
            Arc::clone(&host),
            config.test_timeout_s,
        )),
    };

    let orchestrator = Orchestrator::new(Arc::clone(&bus), host, agents, &config);
    let terminals = TerminalManager::new(Arc::clone(&bus));

    let state = Arc::new(AppState {
        bus,
        orchestrator,
        terminals,
    });

    let app = Router::new()
        // Liveness
        .route("/", get(routes::root))
        .route("/health", get(routes::health))
        // Ingress
        .route("/webhook/github", post(routes::github_webhook))
        .route("/agents/trigger", post(routes::trigger_agents))
        .route("/webhook/results", post(routes::webhook_results))
        // Pipeline status
        .route("/pipeline/:pipeline_id", get(routes::get_pipeline))
        .route("/pipelines/active", get(routes::active_pipelines))
        // Event subscription ("/ws/all" lands here with the sentinel id)
        .route("/ws/:pipeline_id", get(routes::ws_pipeline))
        // Terminal streaming ("/ws/terminal/all" likewise)
        .route("/ws/terminal/:session_id", get(routes::ws_terminal))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.bind, config.port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
