use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use log::{error, info};
use rusty_rank::auth::IdentityGate;
use rusty_rank::config::Config;
use rusty_rank::db::{PollRepository, SqliteDocumentStore};
use rusty_rank::handlers::Gateway;
use rusty_rank::rooms::RoomRegistry;
use rusty_rank::routes::router;
use rusty_rank::service::PollService;
use rusty_rank::tasks;
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };

    // Initialize document store
    let store = match SqliteDocumentStore::connect(&config.database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to initialize document store: {}", e);
            return;
        }
    };

    let repository = PollRepository::new(store, config.poll_duration);
    let gate = IdentityGate::new(&config.jwt_secret, config.token_duration);
    let service = PollService::new(repository.clone(), gate);
    let rooms = Arc::new(RoomRegistry::new());
    let gateway = Gateway::new(service, Arc::clone(&rooms));

    // --- Start Background Task for Expired Polls ---
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        tasks::expiry_sweeper::sweep_expired_polls_task(repository, rooms, sweep_interval).await;
    });

    let mut app = router(gateway);

    if let Some(origin) = &config.cors_origin {
        match origin.parse::<HeaderValue>() {
            Ok(origin) => {
                app = app.layer(
                    CorsLayer::new()
                        .allow_origin(origin)
                        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                        .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::AUTHORIZATION]),
                );
            }
            Err(_) => {
                error!("Failed to parse CORS origin: {}", origin);
                return;
            }
        }
    }

    let listener = match tokio::net::TcpListener::bind(config.server_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", config.server_addr, e);
            return;
        }
    };

    info!("Poll server listening on {}", config.server_addr);

    if let Err(why) = axum::serve(listener, app).await {
        error!("Server error: {:?}", why);
    }
}
