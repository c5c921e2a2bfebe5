use chat_service::config::ChatConfig;
use chat_service::startup::Application;
use service_core::config::{is_truthy, load_env_file};
use service_core::observability::{init_tracing, LoggingOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Runs before tracing; returning the error prints it to stderr and exits 1.
    load_env_file().map_err(|e| anyhow::anyhow!("Startup error: {}", e))?;

    let log_handle = init_tracing(LoggingOptions::from_env("chat-service"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    // Dropping the watcher stops hot reload, so it lives until main returns.
    let _log_watcher = if std::env::var("LOG_HOT_RELOAD").is_ok_and(|v| is_truthy(&v)) {
        log_handle.watch().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Logging hot reload disabled");
            None
        })
    } else {
        None
    };

    let config = ChatConfig::load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    let application = Application::build(config).await.map_err(|e| {
        tracing::error!("Failed to build application: {}", e);
        anyhow::anyhow!("Startup error: {}", e)
    })?;

    application.run_until_stopped().await?;

    tracing::info!("Chat service stopped");
    Ok(())
}
