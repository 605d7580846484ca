use std::{net::SocketAddr, str::FromStr};

use anyhow::Context;
use axum::Router;
use tracing::info;
use trellis_core::{
  agents, config::core_config, deploy, schedule, startup, state,
  task, ws,
};

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = core_config();
  logger::init(&config.logging)?;

  info!("Trellis Core version: v{}", env!("CARGO_PKG_VERSION"));

  if config.pretty_startup_config {
    info!("{:#?}", config.sanitized());
  } else {
    info!("{:?}", config.sanitized());
  }

  // Crashes on store init failure.
  state::init_store().await;
  // Run after store connection.
  startup::on_startup().await;

  // Spawn background tasks
  task::spawn_task_sweeper();
  task::spawn_task_cleanup();
  deploy::spawn_deploy_driver();
  schedule::spawn_schedule_executor();
  agents::spawn_agent_watchdog();
  ws::spawn_change_broadcaster();

  let app = Router::new()
    .nest("/ws", ws::router())
    .into_make_service();

  let addr = format!("{}:{}", config.bind_ip, config.port);
  let socket_addr = SocketAddr::from_str(&addr)
    .context("failed to parse listen address")?;

  info!("Trellis Core starting on http://{socket_addr}");
  axum_server::bind(socket_addr)
    .serve(app)
    .await
    .context("failed to start server")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => Ok(()),
  }
}
