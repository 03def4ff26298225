mod app;
mod config;
mod db;
mod error;
mod extract;
mod ingest;
mod ledger;
mod phone;
mod realtime;
mod types;

use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,crm_server=debug,tower_http=info")),
        )
        .init();

    let config = AppConfig::from_env();
    if let Err(err) = app::run(config).await {
        tracing::error!(error = %err, "crm server stopped");
        std::process::exit(1);
    }
}
