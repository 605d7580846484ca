use serde::{Deserialize, Serialize};
use strum::Display;

/// One event pushed to hub subscribers:
/// `{ "type": "<class>.<verb>", "timestamp": ISO-8601, "data": ... }`.
///
/// `data` is the full entity, or `{ "@id": ... }` for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
  #[serde(rename = "type")]
  pub kind: String,
  pub timestamp: String,
  pub data: serde_json::Value,
}

impl ChangeEvent {
  pub fn new(
    class: EventClass,
    verb: EventVerb,
    data: serde_json::Value,
  ) -> ChangeEvent {
    ChangeEvent {
      kind: format!("{class}.{verb}"),
      timestamp: chrono::Utc::now().to_rfc3339(),
      data,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventClass {
  Container,
  Host,
  Stack,
  Deployment,
  Task,
}

impl EventClass {
  /// Map a stored `@type` onto its broadcast class. Entities outside
  /// this table are not broadcast.
  pub fn classify(kind: &str) -> Option<EventClass> {
    match kind {
      "SoftwareApplication" => Some(EventClass::Container),
      "ComputerServer" | "ComputerSystem" => Some(EventClass::Host),
      "ItemList" => Some(EventClass::Stack),
      "DeploymentState" => Some(EventClass::Deployment),
      "AgentTask" => Some(EventClass::Task),
      _ => None,
    }
  }

  /// The `@type` set the change feed subscribes to.
  pub fn all_kinds() -> &'static [&'static str] {
    &[
      "SoftwareApplication",
      "ComputerServer",
      "ComputerSystem",
      "ItemList",
      "DeploymentState",
      "AgentTask",
    ]
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventVerb {
  Created,
  Updated,
  Deleted,
}
