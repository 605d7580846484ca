use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{Document, Entity};

/// A machine containers run on.
///
/// `@type` is either `ComputerServer` (bare metal) or
/// `ComputerSystem` (virtual); both deserialize into [Host].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
  #[serde(flatten)]
  pub doc: Document,

  #[serde(default)]
  pub name: String,

  /// IPv4 or IPv6 address agents and the deployer reach the host on.
  #[serde(default)]
  pub ip_address: String,

  /// Cpu cores available.
  #[serde(default)]
  pub cpu: f64,

  /// Memory available, in MB.
  #[serde(default)]
  pub memory: u64,

  /// The datacenter the host lives in.
  #[serde(default)]
  pub location: String,

  #[serde(default)]
  pub status: HostStatus,

  /// Free-form labels, matched by stack host constraints.
  #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
  pub labels: IndexMap<String, String>,

  #[serde(default)]
  pub created_at: i64,

  #[serde(default)]
  pub updated_at: i64,
}

impl Entity for Host {
  const KIND: &'static str = "ComputerServer";

  fn doc(&self) -> &Document {
    &self.doc
  }

  fn doc_mut(&mut self) -> &mut Document {
    &mut self.doc
  }

  fn kinds() -> &'static [&'static str] {
    &["ComputerServer", "ComputerSystem"]
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
pub enum HostStatus {
  #[default]
  Active,
  Inactive,
  Maintenance,
  Unreachable,
}

impl HostStatus {
  /// Whether the placement resolver may schedule onto the host.
  pub fn schedulable(self) -> bool {
    matches!(self, HostStatus::Active)
  }
}

/// A host joined with its live utilization. This is the input the
/// placement resolver scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
  pub host: Host,
  #[serde(default)]
  pub current_load: HostLoad,
  #[serde(default)]
  pub available_resources: HostResources,
  /// Free-form labels matched by stack host constraints.
  #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
  pub labels: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostLoad {
  /// Fraction of cpu in use, `0.0 ..= 1.0`.
  #[serde(default)]
  pub cpu_usage: f64,
  /// Fraction of memory in use, `0.0 ..= 1.0`.
  #[serde(default)]
  pub memory_usage: f64,
  #[serde(default)]
  pub container_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResources {
  #[serde(default)]
  pub cpu: f64,
  #[serde(default)]
  pub memory: u64,
}
