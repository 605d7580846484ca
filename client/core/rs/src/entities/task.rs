use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{Document, Entity};

/// A durable work item dispatched to an agent (or executed by the
/// controller itself for stack-level work).
///
/// Tasks walk the state machine exactly once:
///
/// ```text
/// pending  -> assigned | cancelled
/// assigned -> running  | failed | cancelled
/// running  -> completed | failed | cancelled
/// ```
///
/// Terminal tasks are immutable except for the cleanup sweeper. A
/// failed task is retried by creating a *new* task (see
/// [next_retry_id][AgentTask::next_retry_id]); the original is never
/// mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
  #[serde(flatten)]
  pub doc: Document,

  #[serde(default)]
  pub task_type: TaskType,

  #[serde(default)]
  pub status: TaskStatus,

  /// The agent the task is addressed to.
  #[serde(default)]
  pub agent_id: String,

  #[serde(default)]
  pub host_id: String,

  #[serde(default)]
  pub stack_id: String,

  #[serde(default)]
  pub container_id: String,

  /// `0 ..= 10`, higher first. Ties broken by `created_at` ascending.
  #[serde(default = "default_priority")]
  pub priority: u8,

  /// Opaque per-`task_type` parameters. The core does not inspect it
  /// except during task construction.
  #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
  pub payload: serde_json::Value,

  /// Task `@id`s which must be `completed` before this one may start.
  /// Failed or cancelled dependencies block forever.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub depends_on: Vec<String>,

  #[serde(default = "default_timeout_seconds")]
  pub timeout_seconds: u64,

  #[serde(default)]
  pub retry_count: u32,

  #[serde(default = "default_max_retries")]
  pub max_retries: u32,

  #[serde(default)]
  pub created_at: i64,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub assigned_at: Option<i64>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<i64>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<i64>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<serde_json::Value>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<TaskError>,

  /// `@id` of the scheduled action which spawned the task, if any.
  /// An action's execution history is the set of tasks carrying its id
  /// here.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub scheduled_by: String,
}

fn default_priority() -> u8 {
  5
}

fn default_timeout_seconds() -> u64 {
  300
}

fn default_max_retries() -> u32 {
  3
}

// Kept by hand so in-memory construction picks up the same defaults
// documents deserialize with.
impl Default for AgentTask {
  fn default() -> AgentTask {
    AgentTask {
      doc: Default::default(),
      task_type: Default::default(),
      status: Default::default(),
      agent_id: String::new(),
      host_id: String::new(),
      stack_id: String::new(),
      container_id: String::new(),
      priority: default_priority(),
      payload: serde_json::Value::Null,
      depends_on: Vec::new(),
      timeout_seconds: default_timeout_seconds(),
      retry_count: 0,
      max_retries: default_max_retries(),
      created_at: 0,
      assigned_at: None,
      started_at: None,
      completed_at: None,
      result: None,
      error: None,
      scheduled_by: String::new(),
    }
  }
}

impl AgentTask {
  /// The root of the retry chain: the `@id` with every `-retry-N`
  /// suffix stripped.
  pub fn original_id(&self) -> &str {
    let mut id = self.doc.id.as_str();
    while let Some(stripped) = strip_retry_suffix(id) {
      id = stripped;
    }
    id
  }

  /// The `@id` a retry of this task would take:
  /// `<originalId>-retry-<retryCount + 1>`.
  pub fn next_retry_id(&self) -> String {
    format!("{}-retry-{}", self.original_id(), self.retry_count + 1)
  }

  pub fn retry_eligible(&self) -> bool {
    self.status == TaskStatus::Failed
      && self.retry_count < self.max_retries
  }
}

fn strip_retry_suffix(id: &str) -> Option<&str> {
  let (rest, n) = id.rsplit_once("-retry-")?;
  if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) {
    Some(rest)
  } else {
    None
  }
}

impl Entity for AgentTask {
  const KIND: &'static str = "AgentTask";

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
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskType {
  Deploy,
  Delete,
  Stop,
  Start,
  Restart,
  Control,
  Check,
  Workflow,
  #[default]
  Action,
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
pub enum TaskStatus {
  #[default]
  Pending,
  Assigned,
  Running,
  Completed,
  Failed,
  Cancelled,
}

impl TaskStatus {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
    )
  }

  /// The task state machine. Anything not listed here is rejected.
  pub fn can_transition_to(self, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
      (self, to),
      (Pending, Assigned)
        | (Pending, Cancelled)
        | (Assigned, Running)
        | (Assigned, Failed)
        | (Assigned, Cancelled)
        | (Running, Completed)
        | (Running, Failed)
        | (Running, Cancelled)
    )
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
  /// Machine readable failure class, eg `TIMEOUT`.
  pub reason: String,
  #[serde(default)]
  pub message: String,
}

impl TaskError {
  pub fn new(
    reason: impl Into<String>,
    message: impl Into<String>,
  ) -> TaskError {
    TaskError {
      reason: reason.into(),
      message: message.into(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn state_machine_accepts_only_drawn_transitions() {
    use TaskStatus::*;
    let all =
      [Pending, Assigned, Running, Completed, Failed, Cancelled];
    let valid = [
      (Pending, Assigned),
      (Pending, Cancelled),
      (Assigned, Running),
      (Assigned, Failed),
      (Assigned, Cancelled),
      (Running, Completed),
      (Running, Failed),
      (Running, Cancelled),
    ];
    for from in all {
      for to in all {
        assert_eq!(
          from.can_transition_to(to),
          valid.contains(&(from, to)),
          "{from} -> {to}"
        );
      }
    }
  }

  #[test]
  fn retry_ids_chain_back_to_a_unique_original() {
    let mut task = AgentTask {
      doc: Document::new(AgentTask::KIND, "task-1"),
      ..Default::default()
    };
    assert_eq!(task.original_id(), "task-1");
    assert_eq!(task.next_retry_id(), "task-1-retry-1");

    task.doc.id = "task-1-retry-1".to_string();
    task.retry_count = 1;
    assert_eq!(task.original_id(), "task-1");
    assert_eq!(task.next_retry_id(), "task-1-retry-2");

    // A dash in the original id is not mistaken for a retry suffix.
    task.doc.id = "deploy-retry-logic".to_string();
    assert_eq!(task.original_id(), "deploy-retry-logic");
  }
}
