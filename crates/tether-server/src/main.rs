use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tether_core::{AppState, Broadcaster, IdentityService};
use tether_gateway::ConnectionRegistry;
use tether_store::{PresenceBackend, RedisHandle, RedisPresence, RedisRooms, RoomBackend};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("tether=info,tower_http=debug")),
        )
        .init();

    let args = cli::Args::parse();
    let mut config = config::Config::load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    if let Some(cli::Command::IssueToken { identifiers }) = args.command {
        return issue_token(&config, &identifiers);
    }

    // Backing store: shared Redis when configured, else in-process maps
    // (single-instance semantics).
    let (presence_backend, room_backend): (
        Option<Arc<dyn PresenceBackend>>,
        Option<Arc<dyn RoomBackend>>,
    ) = match &config.store.redis_url {
        Some(url) => match RedisHandle::connect(url).await {
            Ok(handle) => {
                tracing::info!("connected to backing store");
                (
                    Some(Arc::new(RedisPresence::new(handle.clone()))),
                    Some(Arc::new(RedisRooms::new(handle))),
                )
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "backing store unreachable at startup, running in-process"
                );
                (None, None)
            }
        },
        None => {
            tracing::info!("no redis_url configured, running in-process");
            (None, None)
        }
    };

    let connections = Arc::new(ConnectionRegistry::new());
    let broadcaster: Arc<dyn Broadcaster> = connections.clone();
    let state = AppState::build(
        config.app_config(),
        config.auth.token_secret.clone(),
        presence_backend,
        room_backend,
        broadcaster,
    );
    state.start();

    let app = tether_api::build_router()
        .with_state(state.clone())
        .merge(tether_gateway::gateway_router(state.clone(), connections));

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(address = %config.server.bind_address, "tether gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    state.stop();
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = state.shutdown.notified() => {}
    }
    tracing::info!("shutdown signal received");
}

fn issue_token(config: &config::Config, pairs: &[String]) -> Result<()> {
    let mut bag = serde_json::Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("identifier '{pair}' is not KEY=VALUE"))?;
        bag.insert(
            key.to_string(),
            serde_json::Value::String(value.to_string()),
        );
    }

    let identity = IdentityService::new(
        config.auth.token_secret.clone(),
        config.auth.token_expiry_seconds,
        config.auth.stable_identifier_key.clone(),
    );
    let token = identity.issue(bag)?;
    println!("{token}");
    Ok(())
}
