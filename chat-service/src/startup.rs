//! Application startup and lifecycle management.

use crate::config::{ChatConfig, ProviderKind};
use crate::handlers::{
    health::{health_check, readiness_check},
    receive_data::{receive_data, receive_data_stream},
};
use crate::models::ValidationPolicy;
use crate::services::providers::gemini::{GeminiConfig, GeminiTextProvider};
use crate::services::providers::mock::MockTextProvider;
use crate::services::providers::TextProvider;
use crate::services::ResponseGenerator;
use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{request_id_middleware, request_span};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ChatConfig>,
    pub generator: Arc<ResponseGenerator>,
}

impl AppState {
    pub fn new(config: ChatConfig, provider: Arc<dyn TextProvider>) -> Self {
        let generator = ResponseGenerator::from_config(provider, &config);
        Self {
            config: Arc::new(config),
            generator: Arc::new(generator),
        }
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            require_client_metadata: self.config.validation.require_client_metadata,
        }
    }
}

/// Construct the configured upstream provider.
pub fn build_provider(config: &ChatConfig) -> Result<Arc<dyn TextProvider>, AppError> {
    match config.provider {
        ProviderKind::Gemini => {
            let gemini_config = GeminiConfig::new(
                config.gemini.api_key.clone(),
                config.gemini.model.clone(),
                config.gemini.request_timeout(),
            );
            let provider = GeminiTextProvider::new(gemini_config)
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;

            tracing::info!(model = %config.gemini.model, "Initialized Gemini text provider");
            Ok(Arc::new(provider))
        }
        ProviderKind::Mock => {
            tracing::warn!("Using mock text provider");
            Ok(Arc::new(MockTextProvider::echo()))
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/receive-data", post(receive_data))
        .route("/receive-data/stream", post(receive_data_stream))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| request_span(request)),
        )
        .layer(from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: ChatConfig) -> Result<Self, AppError> {
        let provider = build_provider(&config)?;
        Self::with_provider(config, provider).await
    }

    /// Build around an already constructed provider. Port 0 binds a random port.
    pub async fn with_provider(
        config: ChatConfig,
        provider: Arc<dyn TextProvider>,
    ) -> Result<Self, AppError> {
        let address = format!("{}:{}", config.common.host, config.common.port);
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", address, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            scheme = config.common.scheme(),
            environment = ?config.common.environment,
            session_policy = ?config.sessions.policy,
            stream_mode = ?config.streaming.mode,
            "Chat service listening on {}://{}:{}",
            config.common.scheme(),
            config.common.host,
            port
        );

        Ok(Self {
            port,
            listener,
            state: AppState::new(config, provider),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the application until a shutdown signal arrives.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = build_router(self.state);

        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| {
                tracing::error!("HTTP server error: {}", e);
                e
            })
    }
}
