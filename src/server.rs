//! # Server Configuration
//!
//! Wires the token lifecycle engine together, mounts the HTTP surface and runs
//! the background task worker until shutdown.

use std::sync::Arc;

use anyhow::Context;
use axum::{Router, middleware, routing::get};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::crypto::{AesGcmEncryptService, CryptoKey, EncryptService};
use crate::ephemeral::{MutexFactory, build_store};
use crate::handlers;
use crate::oauth2::{
    OAuth2Flows, ProviderClient, RedirectTokenSigner, RefreshDefaults, StateStore, TokenManager,
};
use crate::repositories::{
    ConnectionRepository, ConnectorVersionRepository, OAuth2TokenRepository, UsedNonceRepository,
};
use crate::scheduler::RefreshScheduler;
use crate::tasks::{LocalTaskQueue, TaskDescriptor, TaskQueue, TaskWorker};
use crate::telemetry::trace_context_middleware;
use crate::token_refresh::{BackgroundTaskHandler, TokenRefreshWorker};

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub flows: OAuth2Flows,
    /// Whether cookies set by the proxy carry the `Secure` attribute
    pub secure_cookies: bool,
}

/// Everything the process runs: the flow entry point plus the queue, the
/// scheduler and the worker draining the queue.
pub struct Engine {
    pub flows: OAuth2Flows,
    pub queue: Arc<LocalTaskQueue>,
    pub scheduler: Arc<RefreshScheduler>,
    pub worker: TaskWorker,
}

/// Builds the engine from configuration. `shutdown` stops periodic task
/// registrations.
pub fn build_engine(
    config: &AppConfig,
    db: Arc<DatabaseConnection>,
    shutdown: CancellationToken,
) -> anyhow::Result<Engine> {
    let key_bytes = config
        .crypto_key
        .clone()
        .context("crypto key is not configured")?;
    let master = CryptoKey::new(key_bytes).context("invalid crypto key")?;
    let encryptor: Arc<dyn EncryptService> = Arc::new(AesGcmEncryptService::new(master.clone()));

    let versions = ConnectorVersionRepository::new(db.clone(), encryptor.clone());
    let connections = ConnectionRepository::new(db.clone());
    let tokens = OAuth2TokenRepository::new(db.clone());
    let nonces = UsedNonceRepository::new(db.clone());

    let store = build_store(config, db.clone());
    let mutexes = MutexFactory::new(store.clone());
    let provider = ProviderClient::new();

    let signer = RedirectTokenSigner::new(
        &master,
        config.oauth.redirect_token_ttl(),
        config.oauth.round_trip_timeout(),
        nonces.clone(),
    )
    .context("failed to derive redirect token key")?;

    let token_manager = TokenManager::new(
        tokens.clone(),
        connections.clone(),
        versions.clone(),
        encryptor,
        provider.clone(),
        mutexes,
        RefreshDefaults {
            before_expiry: config.token_refresh.before_expiry(),
            timeout: config.oauth.refresh_timeout(),
        },
    );

    let public_base_url = config.public_base_url()?;
    let flows = OAuth2Flows::new(
        public_base_url,
        config.oauth.round_trip_timeout(),
        versions.clone(),
        connections,
        StateStore::new(store.clone()),
        signer,
        token_manager.clone(),
        provider,
    );

    let (queue, receiver) = LocalTaskQueue::new(shutdown);
    let queue = Arc::new(queue);
    let scheduler = Arc::new(RefreshScheduler::new(
        versions,
        tokens,
        queue.clone(),
        config.token_refresh.before_expiry(),
    ));

    let handler = Arc::new(BackgroundTaskHandler::new(
        scheduler.clone(),
        TokenRefreshWorker::new(token_manager),
        nonces,
        store,
    ));
    let worker = TaskWorker::new(receiver, handler, config.token_refresh.workers as usize);

    Ok(Engine {
        flows,
        queue,
        scheduler,
        worker,
    })
}

/// Registers the cron-driven background tasks.
pub async fn register_periodic_tasks(config: &AppConfig, queue: &dyn TaskQueue) -> anyhow::Result<()> {
    if config.token_refresh.enabled {
        queue
            .register_periodic(
                &config.token_refresh.cron,
                TaskDescriptor::RefreshExpiringOAuth2Tokens,
            )
            .await?;
    } else {
        info!("Background token refresh disabled");
    }

    queue
        .register_periodic(
            &config.token_refresh.nonce_purge_cron,
            TaskDescriptor::PurgeExpiredNonces,
        )
        .await?;
    Ok(())
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route(
            crate::oauth2::REDIRECT_PATH,
            get(handlers::oauth2::redirect),
        )
        .route(
            crate::oauth2::CALLBACK_PATH,
            get(handlers::oauth2::callback),
        )
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Starts the server and background worker with the given configuration
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let db = Arc::new(db);
    let shutdown = CancellationToken::new();

    let engine = build_engine(&config, db.clone(), shutdown.clone())?;
    register_periodic_tasks(&config, engine.queue.as_ref()).await?;
    let worker = tokio::spawn(engine.worker.run(shutdown.clone()));

    let secure_cookies =
        handlers::oauth2::requires_secure_cookies(&config.public_base_url()?);
    let state = AppState {
        db,
        flows: engine.flows,
        secure_cookies,
    };
    let app = create_app(state);

    // Resolve the configured bind address
    let addr = config
        .bind_addr()
        .with_context(|| format!("Invalid server address: {}", config.api_bind_addr))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %config.profile, "Server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
                _ = signal.cancelled() => {}
            }
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    engine.queue.join_periodic().await;
    if let Err(err) = worker.await {
        tracing::warn!(error = ?err, "Task worker ended abnormally");
    }

    info!("Server stopped");
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::oauth2::redirect,
        crate::handlers::oauth2::callback,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthStatus,
            crate::handlers::oauth2::CallbackResponse,
            crate::error::ApiError,
        )
    ),
    info(
        title = "authproxy",
        description = "OAuth2 connection and token lifecycle API",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
