use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{Document, Entity, trellis_timestamp};

/// A managed container. Created by agent sync or stack deploy,
/// mutated by agent syncs and user edits.
///
/// `@type = "SoftwareApplication"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
  #[serde(flatten)]
  pub doc: Document,

  /// The container name. Auto-assignment to a stack keys off the
  /// `<stackName>-` prefix of this field.
  #[serde(default)]
  pub name: String,

  /// The image the container runs.
  #[serde(default)]
  pub executable_name: String,

  #[serde(default)]
  pub status: ContainerStatus,

  /// `@id` of the host the container runs on.
  /// Must reference an existing host, or be empty until placed.
  #[serde(default)]
  pub hosted_on: String,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub ports: Vec<PortMapping>,

  /// Environment variables injected at create time.
  #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
  pub environment: IndexMap<String, String>,

  /// `@id`s of containers which must be running before this one.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub depends_on: Vec<String>,

  #[serde(default)]
  pub created_at: i64,

  #[serde(default)]
  pub updated_at: i64,
}

impl Entity for Container {
  const KIND: &'static str = "SoftwareApplication";

  fn doc(&self) -> &Document {
    &self.doc
  }

  fn doc_mut(&mut self) -> &mut Document {
    &mut self.doc
  }

  fn kinds() -> &'static [&'static str] {
    &["SoftwareApplication", "Container"]
  }

  fn touch(&mut self, now: i64) {
    if self.created_at == 0 {
      self.created_at = now;
    }
    self.updated_at = now;
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContainerStatus {
  Running,
  Stopped,
  Paused,
  Restarting,
  Exited,
  Dead,
  #[default]
  Created,
  Removing,
}

/// A published port. Both ends are constrained to `[0, 65535]` by the
/// validator before a document reaches the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
  pub host_port: u16,
  pub container_port: u16,
  #[serde(default)]
  pub protocol: PortProtocol,
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PortProtocol {
  #[default]
  Tcp,
  Udp,
  Sctp,
}

/// Tombstone that stops agent resync from recreating a container the
/// user deleted. Written alongside the container delete, before stack
/// cleanup runs, so an agent cannot race the cleanup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreListEntry {
  #[serde(flatten)]
  pub doc: Document,
  pub container_id: String,
  #[serde(default)]
  pub created_at: i64,
}

impl IgnoreListEntry {
  /// Ignore list documents are keyed `ignore-<containerId>`.
  pub fn id_for(container_id: &str) -> String {
    format!("ignore-{container_id}")
  }

  pub fn new(container_id: impl Into<String>) -> IgnoreListEntry {
    let container_id = container_id.into();
    IgnoreListEntry {
      doc: Document::new(Self::KIND, Self::id_for(&container_id)),
      container_id,
      created_at: trellis_timestamp(),
    }
  }
}

impl Entity for IgnoreListEntry {
  const KIND: &'static str = "IgnoreListEntry";

  fn doc(&self) -> &Document {
    &self.doc
  }

  fn doc_mut(&mut self) -> &mut Document {
    &mut self.doc
  }
}
