use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{Document, Entity};

/// Per-host agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
  #[serde(flatten)]
  pub doc: Document,

  /// `@id` of the host the agent runs on.
  pub host_id: String,

  /// Docker endpoint the agent (and the controller's fallback client)
  /// uses, eg `unix:///var/run/docker.sock` or `tcp://10.0.0.5:2375`.
  #[serde(default)]
  pub docker_socket: String,

  /// HTTP endpoint the controller proxies log requests to.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub endpoint: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ssh_key_path: Option<String>,

  /// Seconds between container state syncs.
  #[serde(default = "default_sync_interval")]
  pub sync_interval: u64,

  #[serde(default = "default_enabled")]
  pub enabled: bool,

  #[serde(default)]
  pub auto_start: bool,
}

fn default_sync_interval() -> u64 {
  60
}

fn default_enabled() -> bool {
  true
}

impl Default for AgentConfig {
  fn default() -> AgentConfig {
    AgentConfig {
      doc: Default::default(),
      host_id: String::new(),
      docker_socket: String::new(),
      endpoint: String::new(),
      ssh_key_path: None,
      sync_interval: default_sync_interval(),
      enabled: default_enabled(),
      auto_start: false,
    }
  }
}

impl Entity for AgentConfig {
  const KIND: &'static str = "AgentConfig";

  fn doc(&self) -> &Document {
    &self.doc
  }

  fn doc_mut(&mut self) -> &mut Document {
    &mut self.doc
  }
}

/// Runtime status of an agent, tracked in the controller's in-memory
/// directory (the agent process itself is external).
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentRuntimeStatus {
  Running,
  #[default]
  Stopped,
  Unreachable,
}
