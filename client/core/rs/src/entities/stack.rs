use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{Document, Entity};

/// A named set of containers deployed as a unit, possibly across
/// hosts. `@type = "ItemList"`.
///
/// `containers` carries set semantics: no duplicates, and every listed
/// id either resolves to a container document or appears in the ignore
/// list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stack {
  #[serde(flatten)]
  pub doc: Document,

  #[serde(default)]
  pub name: String,

  #[serde(default)]
  pub description: String,

  #[serde(default)]
  pub status: StackStatus,

  /// Container `@id`s belonging to the stack.
  #[serde(default)]
  pub containers: Vec<String>,

  /// Millis timestamp of the last successful deploy.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub deployed_at: Option<i64>,

  #[serde(default)]
  pub datacenter: String,

  #[serde(default)]
  pub deployment: DeploymentConfig,

  #[serde(default)]
  pub created_at: i64,

  #[serde(default)]
  pub updated_at: i64,
}

impl Stack {
  /// Set-semantics insert. Returns whether the id was newly added.
  pub fn add_container(&mut self, id: &str) -> bool {
    if self.containers.iter().any(|c| c == id) {
      return false;
    }
    self.containers.push(id.to_string());
    true
  }

  /// Returns whether the id was present.
  pub fn remove_container(&mut self, id: &str) -> bool {
    let before = self.containers.len();
    self.containers.retain(|c| c != id);
    self.containers.len() != before
  }

  /// Drop duplicate ids, keeping first-seen order.
  pub fn normalize_containers(&mut self) {
    let set = self
      .containers
      .drain(..)
      .collect::<IndexSet<_>>();
    self.containers = set.into_iter().collect();
  }
}

impl Entity for Stack {
  const KIND: &'static str = "ItemList";

  fn doc(&self) -> &Document {
    &self.doc
  }

  fn doc_mut(&mut self) -> &mut Document {
    &mut self.doc
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
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StackStatus {
  #[default]
  Pending,
  Running,
  Stopped,
  Error,
}

/// Deployment configuration embedded in the stack document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
  /// Free-form deployment mode hint, eg `multi-host`.
  #[serde(default)]
  pub mode: String,

  #[serde(default)]
  pub placement_strategy: PlacementStrategy,

  /// Label matchers filtering the eligible host set before the
  /// strategy runs. Values support wildcard patterns.
  #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
  pub host_constraints: IndexMap<String, String>,

  /// Docker network driver for the stack network, eg `bridge`.
  #[serde(default)]
  pub network_mode: String,
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
pub enum PlacementStrategy {
  /// Score hosts by load and pick the least loaded.
  #[default]
  Auto,
  /// Every container must name its host.
  Manual,
  /// Round-robin over the eligible hosts.
  Spread,
  /// Restrict to the stack's datacenter, then spread.
  Datacenter,
}

/// A user-submitted stack definition: a JSON-LD `@graph` holding the
/// stack node, container specs, a network node and optional volumes.
/// The parser expands this into a typed deployment plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackDefinition {
  #[serde(
    rename = "@context",
    default,
    skip_serializing_if = "String::is_empty"
  )]
  pub context: String,

  #[serde(rename = "@graph", default)]
  pub graph: Vec<serde_json::Value>,
}
