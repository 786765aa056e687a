//! Entry point for the `fcm-gateway` HTTP server.

use std::path::PathBuf;
use std::sync::Arc;

use fcm_executor::{Settings, SystemOrchestrator};
use fcm_gateway::routes::create_router;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::var("FCM_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:3457".to_owned());
    let env_file = std::env::var_os("FCM_ENV_FILE").map(PathBuf::from);

    let settings = match Settings::load(env_file.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to load settings");
            std::process::exit(1);
        }
    };
    let app = create_router(Arc::new(SystemOrchestrator::system(settings)));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "fcm-gateway listening");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}
