use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::{Document, Entity, task::TaskType};

/// A recurring action evaluated by the scheduler tick. Each firing
/// spawns an [AgentTask][super::task::AgentTask] with
/// `scheduled_by = @id`, which doubles as the action's execution
/// history.
///
/// The `@type` of the document picks the spawned task type, see
/// [task_type][ScheduledAction::task_type].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledAction {
  #[serde(flatten)]
  pub doc: Document,

  #[serde(default)]
  pub name: String,

  #[serde(default)]
  pub enabled: bool,

  #[serde(default)]
  pub action_status: ActionStatus,

  #[serde(default)]
  pub schedule: Schedule,

  /// Parameters copied into the spawned task payload.
  #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
  pub instrument: serde_json::Value,

  /// The target of the action, eg a container or stack reference.
  #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
  pub object: serde_json::Value,

  /// The agent the spawned tasks are addressed to.
  #[serde(default)]
  pub agent_id: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_run_at: Option<i64>,

  #[serde(default)]
  pub created_at: i64,

  #[serde(default)]
  pub updated_at: i64,
}

impl ScheduledAction {
  /// The task type fired by the action, derived from `@type`.
  /// Composite / generic actions spawn workflows.
  pub fn task_type(&self) -> TaskType {
    match self.doc.kind.as_str() {
      "CheckAction" => TaskType::Check,
      "ControlAction" => TaskType::Control,
      "DeployAction" => TaskType::Deploy,
      "DeleteAction" => TaskType::Delete,
      _ => TaskType::Workflow,
    }
  }
}

impl Entity for ScheduledAction {
  const KIND: &'static str = "ScheduledAction";

  fn doc(&self) -> &Document {
    &self.doc
  }

  fn doc_mut(&mut self) -> &mut Document {
    &mut self.doc
  }

  fn kinds() -> &'static [&'static str] {
    &[
      "ScheduledAction",
      "CheckAction",
      "ControlAction",
      "DeployAction",
      "DeleteAction",
    ]
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
pub enum ActionStatus {
  /// Idle, waiting for the next fire time.
  #[default]
  Potential,
  /// Currently spawning its task.
  Active,
  Completed,
  Failed,
}

/// When an action fires. Either an ISO-8601 repeat interval or a cron
/// expression; cron wins when both are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
  /// ISO-8601 duration between runs, eg `PT5M` or `P1D`.
  #[serde(default)]
  pub repeat_frequency: String,

  /// Cron expression with seconds, eg `0 0 3 * * *`.
  #[serde(default)]
  pub cron: String,

  /// IANA timezone for cron evaluation. Empty means the controller
  /// timezone.
  #[serde(default)]
  pub timezone: String,
}

impl Schedule {
  /// Parse `repeat_frequency` as an ISO-8601 duration.
  ///
  /// Supports `P[nW][nD][T[nH][nM][nS]]` with integer designators.
  pub fn repeat_duration(&self) -> anyhow::Result<chrono::Duration> {
    parse_iso8601_duration(&self.repeat_frequency)
  }
}

fn parse_iso8601_duration(
  input: &str,
) -> anyhow::Result<chrono::Duration> {
  let rest = input
    .strip_prefix('P')
    .with_context(|| format!("'{input}' is not an ISO-8601 duration"))?;
  if rest.is_empty() {
    return Err(anyhow!("'{input}' has no duration components"));
  }
  let (date_part, time_part) = match rest.split_once('T') {
    Some((d, t)) => (d, t),
    None => (rest, ""),
  };
  let mut seconds: i64 = 0;
  for (part, designators) in [
    (date_part, [('W', 604_800), ('D', 86_400)].as_slice()),
    (
      time_part,
      [('H', 3_600), ('M', 60), ('S', 1)].as_slice(),
    ),
  ] {
    let mut digits = String::new();
    for c in part.chars() {
      if c.is_ascii_digit() {
        digits.push(c);
        continue;
      }
      let Some((_, unit)) =
        designators.iter().find(|(d, _)| *d == c)
      else {
        return Err(anyhow!(
          "unexpected designator '{c}' in duration '{input}'"
        ));
      };
      let n: i64 = digits
        .parse()
        .with_context(|| format!("bad number before '{c}' in '{input}'"))?;
      seconds += n * unit;
      digits.clear();
    }
    if !digits.is_empty() {
      return Err(anyhow!("trailing digits in duration '{input}'"));
    }
  }
  if seconds == 0 {
    return Err(anyhow!("duration '{input}' is zero"));
  }
  Ok(chrono::Duration::seconds(seconds))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_common_durations() {
    for (input, secs) in [
      ("PT30S", 30),
      ("PT5M", 300),
      ("PT1H30M", 5_400),
      ("P1D", 86_400),
      ("P1W", 604_800),
      ("P1DT12H", 129_600),
    ] {
      assert_eq!(
        parse_iso8601_duration(input).unwrap(),
        chrono::Duration::seconds(secs),
        "{input}"
      );
    }
  }

  #[test]
  fn rejects_malformed_durations() {
    for input in ["", "5M", "P", "PT", "PTM", "P5X", "PT0S"] {
      assert!(
        parse_iso8601_duration(input).is_err(),
        "{input} should not parse"
      );
    }
  }
}
