//! Bingo Back binary entrypoint wiring the WebSocket game protocol, round
//! timers, and the coordination store.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod dao;
mod dto;
mod error;
mod routes;
mod services;
mod state;

use config::AppConfig;
use dao::round_store::memory::MemoryCoordStore;
use services::auth::DevTokenVerifier;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let app_state = AppState::new(config, Arc::new(DevTokenVerifier));

    // The in-memory backend serves a single instance; the shared backend
    // coordinates several processes and is supervised in the background so
    // the server stays up (degraded) while the database is unreachable.
    let backend = env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".into());
    match backend.as_str() {
        "memory" => {
            app_state
                .install_store(Arc::new(MemoryCoordStore::new()))
                .await;
            services::round_engine::bootstrap(&app_state)
                .await
                .context("bootstrapping round engine")?;
            info!("using in-memory coordination store");
        }
        #[cfg(feature = "mongo-store")]
        "mongo" => {
            let uri =
                env::var("MONGO_URI").unwrap_or_else(|_| "mongodb://localhost:27017".into());
            let db_name = env::var("MONGO_DB").ok();
            let supervisor_state = app_state.clone();
            tokio::spawn(services::storage_supervisor::run(
                supervisor_state,
                move || {
                    let uri = uri.clone();
                    let db_name = db_name.clone();
                    async move { connect_mongo(&uri, db_name.as_deref()).await }
                },
            ));
            info!("using shared MongoDB coordination store");
        }
        other => anyhow::bail!("unsupported STORE_BACKEND `{other}`"),
    }

    let app = build_router(app_state.clone());

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    app_state.timer().stop_all();
    Ok(())
}

/// Connect the shared MongoDB coordination store.
#[cfg(feature = "mongo-store")]
async fn connect_mongo(
    uri: &str,
    db_name: Option<&str>,
) -> Result<Arc<dyn dao::round_store::CoordStore>, dao::storage::StorageError> {
    use dao::round_store::mongodb::{MongoCoordStore, config::MongoConfig};

    let config = MongoConfig::from_uri(uri, db_name)
        .await
        .map_err(dao::storage::StorageError::from)?;
    let store = MongoCoordStore::connect(config)
        .await
        .map_err(dao::storage::StorageError::from)?;
    Ok(Arc::new(store))
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: state::SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
