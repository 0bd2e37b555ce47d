mod api;
mod arbitration;
mod auth;
mod buffer;
mod config;
mod controller;
mod departure;
mod domain;
mod error;
mod learning;
mod override_mgr;
mod persistence;
mod planner;
mod sequencer;
#[cfg(feature = "sim")]
mod sim_harness;
mod state;
mod telemetry;

use anyhow::Result;
use config::Config;
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    let app_state = controller::AppState::new(cfg.clone()).await?;

    let app = api::router(app_state.clone(), &cfg);

    let addr = cfg.server.socket_addr()?;
    info!(%addr, "starting dispatch-core");

    controller::spawn_controller_tasks(app_state.clone(), cfg.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    warn!("shutdown complete");
    Ok(())
}
