//! The agent manager: an in-memory directory of per-host agent
//! runtime state. The agent processes themselves are external; the
//! control operations here mutate the directory only.

use std::time::Duration;

use anyhow::Context;
use async_timing_util::{Timelength, wait_until_timelength};
use dashmap::DashMap;
use serde::Serialize;
use trellis_client::entities::{
  agent::{AgentConfig, AgentRuntimeStatus},
  trellis_timestamp,
};

use crate::{
  config::core_config,
  docker::DockerClientFactory,
  repo::{Page, Repo},
  state,
};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
  pub status: AgentRuntimeStatus,
  /// HTTP endpoint log requests proxy to, when the agent exposes
  /// one.
  pub endpoint: Option<String>,
  pub docker_socket: Option<String>,
  /// Millis timestamp of the last heartbeat. Zero until first seen.
  pub last_seen: i64,
}

#[derive(Default)]
pub struct AgentManager {
  directory: DashMap<String, AgentEntry>,
}

impl AgentManager {
  pub fn new() -> AgentManager {
    Default::default()
  }

  /// Seed the directory from persisted agent configs.
  pub async fn load(&self, repo: &Repo) -> anyhow::Result<()> {
    for config in repo.list_agent_configs(Page::max()).await? {
      self.register(&config);
    }
    Ok(())
  }

  pub fn register(&self, config: &AgentConfig) {
    let status = if config.enabled && config.auto_start {
      AgentRuntimeStatus::Running
    } else {
      AgentRuntimeStatus::Stopped
    };
    self.directory.insert(
      config.host_id.clone(),
      AgentEntry {
        status,
        endpoint: (!config.endpoint.is_empty())
          .then(|| config.endpoint.clone()),
        docker_socket: (!config.docker_socket.is_empty())
          .then(|| config.docker_socket.clone()),
        last_seen: 0,
      },
    );
  }

  pub fn start_agent(&self, host_id: &str) -> anyhow::Result<()> {
    self.set_status(host_id, AgentRuntimeStatus::Running)
  }

  pub fn stop_agent(&self, host_id: &str) -> anyhow::Result<()> {
    self.set_status(host_id, AgentRuntimeStatus::Stopped)
  }

  pub fn restart_agent(&self, host_id: &str) -> anyhow::Result<()> {
    self.set_status(host_id, AgentRuntimeStatus::Stopped)?;
    self.set_status(host_id, AgentRuntimeStatus::Running)
  }

  fn set_status(
    &self,
    host_id: &str,
    status: AgentRuntimeStatus,
  ) -> anyhow::Result<()> {
    let mut entry = self
      .directory
      .get_mut(host_id)
      .with_context(|| {
        format!("no agent registered for host {host_id}")
      })?;
    entry.status = status;
    Ok(())
  }

  /// Record a heartbeat from an agent, registering it on first
  /// contact.
  pub fn heartbeat(&self, host_id: &str) {
    let mut entry =
      self.directory.entry(host_id.to_string()).or_default();
    entry.last_seen = trellis_timestamp();
    entry.status = AgentRuntimeStatus::Running;
  }

  pub fn entry(&self, host_id: &str) -> Option<AgentEntry> {
    self.directory.get(host_id).map(|e| e.clone())
  }

  pub fn entries(&self) -> Vec<(String, AgentEntry)> {
    self
      .directory
      .iter()
      .map(|e| (e.key().clone(), e.value().clone()))
      .collect()
  }

  /// Flip running agents with stale heartbeats to unreachable.
  /// Returns how many flipped.
  pub fn mark_stale(&self, stale_after: Duration) -> usize {
    let cutoff =
      trellis_timestamp() - stale_after.as_millis() as i64;
    let mut flipped = 0;
    for mut entry in self.directory.iter_mut() {
      if entry.status == AgentRuntimeStatus::Running
        && entry.last_seen > 0
        && entry.last_seen < cutoff
      {
        entry.status = AgentRuntimeStatus::Unreachable;
        flipped += 1;
      }
    }
    flipped
  }

  /// Fetch container logs through the agent's endpoint when one is
  /// known, falling back to a direct Docker client for the host.
  pub async fn container_logs(
    &self,
    host_id: &str,
    container: &str,
    tail: usize,
    docker: &dyn DockerClientFactory,
  ) -> anyhow::Result<String> {
    if let Some(endpoint) =
      self.entry(host_id).and_then(|entry| entry.endpoint)
    {
      let url = format!(
        "{endpoint}/containers/{container}/logs?tail={tail}"
      );
      match reqwest::get(&url).await {
        Ok(res) if res.status().is_success() => {
          return res
            .text()
            .await
            .context("failed to read agent log response");
        }
        Ok(res) => {
          debug!(
            "agent log proxy for {host_id} returned {}, falling back to docker",
            res.status()
          );
        }
        Err(e) => {
          debug!(
            "agent log proxy for {host_id} unreachable, falling back to docker | {e}"
          );
        }
      }
    }
    let client = docker
      .client_for(host_id)
      .await
      .with_context(|| {
        format!("no docker client for host {host_id}")
      })?;
    client.container_logs(container, tail).await
  }
}

/// Periodically expire agents which stopped heartbeating.
pub fn spawn_agent_watchdog() {
  tokio::spawn(async move {
    loop {
      wait_until_timelength(Timelength::OneMinute, 0).await;
      let stale_after =
        Duration::from_secs(core_config().agent_stale_after);
      let flipped = state::agents().mark_stale(stale_after);
      if flipped > 0 {
        info!("marked {flipped} agent/s unreachable");
      }
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(host_id: &str, auto_start: bool) -> AgentConfig {
    AgentConfig {
      host_id: host_id.to_string(),
      docker_socket: "unix:///var/run/docker.sock".to_string(),
      auto_start,
      enabled: true,
      ..Default::default()
    }
  }

  #[test]
  fn control_operations_touch_the_directory_only() {
    let manager = AgentManager::new();
    manager.register(&config("h1", false));

    assert_eq!(
      manager.entry("h1").unwrap().status,
      AgentRuntimeStatus::Stopped
    );
    manager.start_agent("h1").unwrap();
    assert_eq!(
      manager.entry("h1").unwrap().status,
      AgentRuntimeStatus::Running
    );
    manager.restart_agent("h1").unwrap();
    assert_eq!(
      manager.entry("h1").unwrap().status,
      AgentRuntimeStatus::Running
    );
    manager.stop_agent("h1").unwrap();
    assert_eq!(
      manager.entry("h1").unwrap().status,
      AgentRuntimeStatus::Stopped
    );

    assert!(manager.start_agent("ghost").is_err());
  }

  #[test]
  fn stale_heartbeats_flip_to_unreachable() {
    let manager = AgentManager::new();
    manager.register(&config("h1", true));
    manager.heartbeat("h1");

    // Fresh heartbeat: nothing flips.
    assert_eq!(
      manager.mark_stale(Duration::from_secs(180)),
      0
    );

    // Age the heartbeat artificially.
    {
      let mut entry = manager.directory.get_mut("h1").unwrap();
      entry.last_seen -= 600_000;
    }
    assert_eq!(
      manager.mark_stale(Duration::from_secs(180)),
      1
    );
    assert_eq!(
      manager.entry("h1").unwrap().status,
      AgentRuntimeStatus::Unreachable
    );
  }
}
