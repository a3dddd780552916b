use site_deploy_hook::config::{DEFAULT_CONFIG_PATH, load_config};
use site_deploy_hook::logging::{FileLogger, setup_logging};
use site_deploy_hook::{AppState, app};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let explicit_path = std::env::var("DEPLOY_CONFIG").ok();
    let config_path = PathBuf::from(explicit_path.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));

    let config = match load_config(&config_path, explicit_path.is_some(), |key| {
        std::env::var(key).ok()
    }) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let file_logger = config.log_directory.clone().map(FileLogger::new);
    let _log_guard = match setup_logging(file_logger.as_ref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging: {}", e);
            std::process::exit(1);
        }
    };

    info!("Using config at {:?}: {:?}", config_path, config);
    if config.secret().is_none() {
        warn!("GITHUB_WEBHOOK_SECRET is not set; every webhook request will be refused");
    }

    let bind_address = config.bind_address.clone();
    let state = Arc::new(AppState::new(config));

    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind {}: {}", bind_address, e);
            std::process::exit(1);
        }
    };
    info!("Listening on {}", bind_address);

    if let Err(e) = axum::serve(listener, app(state)).await {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}
