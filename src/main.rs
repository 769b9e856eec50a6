use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use web_search_chat::config::AppConfig;
use web_search_chat::db::conversation_repository::ConversationRepository;
use web_search_chat::db::message_repository::MessageRepository;
use web_search_chat::db::{ConversationStore, InMemoryConversationStore, PgConversationStore};
use web_search_chat::routes::{router, AppState};
use web_search_chat::service::chat_service::ChatService;
use web_search_chat::service::rate_limiter::RateLimiter;
use web_search_chat::service::turn_engine::TurnEngine;
use web_search_chat::tools::tavily::TavilySearchProvider;
use web_search_chat::tools::web_search::WebSearchTool;
use web_search_chat::tools::ToolGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "web_search_chat=debug,tower_http=debug".into()),
        )
        .init();

    let config = AppConfig::from_env()?;
    config.validate()?;

    // ── Conversation store ────────────────────────────────────────────────────
    let store: Arc<dyn ConversationStore> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("Failed to connect to PostgreSQL")?;

            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run database migrations")?;

            info!("Database connection established and migrations applied");
            Arc::new(PgConversationStore::new(
                ConversationRepository::new(pool.clone()),
                MessageRepository::new(pool),
            ))
        }
        None => {
            warn!("DATABASE_URL not set; conversations are kept in memory only");
            Arc::new(InMemoryConversationStore::new())
        }
    };

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let tavily_key = config
        .tavily_api_key
        .clone()
        .context("TAVILY_API_KEY not found in environment variables")?;
    let search = TavilySearchProvider::new(tavily_key)?;
    let tools = ToolGateway::new().register(Arc::new(WebSearchTool::new(
        Arc::new(search),
        config.search_max_results,
    )));

    let model = web_search_chat::agent::build_model(&config)?;
    info!("Using {:?} model '{}'", config.provider, config.model_name);

    let engine = Arc::new(TurnEngine::new(model, tools, store.clone(), config.max_tool_rounds));
    let rate_limiter = if config.rate_limit_per_window > 0 {
        info!(
            "Rate limiting to {} requests per {}s per client",
            config.rate_limit_per_window, config.rate_limit_window_secs
        );
        RateLimiter::new(
            config.rate_limit_per_window,
            Duration::from_secs(config.rate_limit_window_secs),
        )
    } else {
        RateLimiter::disabled()
    };

    let state = AppState {
        chat: ChatService::new(store, engine),
        rate_limiter: Arc::new(rate_limiter),
        search_key_configured: config.search_key_configured(),
        model_key_configured: config.model_key_configured(),
    };

    // ── Router ────────────────────────────────────────────────────────────────
    let origin: HeaderValue = config
        .frontend_origin
        .parse()
        .with_context(|| format!("Invalid FRONTEND_ORIGIN '{}'", config.frontend_origin))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET])
        .allow_credentials(true);

    let app = router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
