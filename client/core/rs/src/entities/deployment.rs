use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{Document, Entity, trellis_timestamp};

/// The authoritative record of an in-progress or completed stack
/// deployment. Created when deployment begins, mutated by the deployer
/// as progress advances, never deleted while its stack exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentState {
  #[serde(flatten)]
  pub doc: Document,

  pub stack_id: String,

  #[serde(default)]
  pub status: DeploymentStatus,

  /// Human readable phase, eg `starting`, `wave 2/3`, `rollback`.
  #[serde(default)]
  pub phase: String,

  /// `0 ..= 100`, advanced per completed wave.
  #[serde(default)]
  pub progress: u8,

  /// service name -> where the service landed.
  #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
  pub placements: IndexMap<String, Placement>,

  #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
  pub network_info: serde_json::Value,

  #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
  pub volume_info: serde_json::Value,

  /// Append-only deployment log.
  #[serde(default)]
  pub events: Vec<DeploymentEvent>,

  #[serde(default)]
  pub started_at: i64,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<i64>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_message: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub rollback_state: Option<RollbackState>,
}

impl DeploymentState {
  pub fn push_event(
    &mut self,
    stage: impl Into<String>,
    service: impl Into<String>,
    message: impl Into<String>,
  ) {
    self.events.push(DeploymentEvent {
      ts: trellis_timestamp(),
      stage: stage.into(),
      service: service.into(),
      message: message.into(),
    });
  }
}

impl Entity for DeploymentState {
  const KIND: &'static str = "DeploymentState";

  fn doc(&self) -> &Document {
    &self.doc
  }

  fn doc_mut(&mut self) -> &mut Document {
    &mut self.doc
  }
}

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
pub enum DeploymentStatus {
  #[default]
  Pending,
  Deploying,
  Running,
  Failed,
  RolledBack,
}

/// Where one service of a deployed stack landed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
  pub container_id: String,
  pub container_name: String,
  pub host_id: String,
}

/// One line of the deployment log. `stage` is machine readable
/// (`created`, `healthy`, `wave_complete`, `rollback`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentEvent {
  pub ts: i64,
  pub stage: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub service: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub message: String,
}

/// Filled when a failed deployment rolls back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackState {
  /// Container names removed, in removal order.
  #[serde(default)]
  pub removed: Vec<String>,
  /// Errors hit while rolling back. These never mask the original
  /// deploy error.
  #[serde(default)]
  pub errors: Vec<String>,
}
