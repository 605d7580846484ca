//! The scheduled-action engine. An executor tick fires every enabled
//! action whose next-fire time has passed, spawning an
//! [AgentTask] carrying the action's parameters; an updater loop
//! refreshes the in-memory fire times from the store.

use std::{
  collections::HashMap,
  sync::{OnceLock, RwLock},
};

use anyhow::{Context, anyhow};
use async_timing_util::{Timelength, wait_until_timelength};
use chrono::Local;
use trellis_client::entities::{
  action::{ActionStatus, ScheduledAction},
  task::AgentTask,
  trellis_timestamp,
};

use crate::{config::core_config, repo::Repo, state};

pub fn spawn_schedule_executor() {
  // Executor thread
  tokio::spawn(async move {
    loop {
      let current_time = wait_until_timelength(
        Timelength::OneSecond,
        0,
      )
      .await as i64;
      let mut lock = schedules().write().unwrap();
      let drained = lock.drain().collect::<Vec<_>>();
      for (action_id, next_run) in drained {
        match next_run {
          Ok(next_run_time) if current_time >= next_run_time => {
            tokio::spawn(async move {
              run_scheduled_action(action_id).await;
            });
          }
          other => {
            lock.insert(action_id, other);
            continue;
          }
        };
      }
    }
  });
  // Updater thread
  tokio::spawn(async move {
    update_schedules().await;
    loop {
      wait_until_timelength(Timelength::FiveMinutes, 500).await;
      update_schedules().await
    }
  });
}

type UnixTimestampMs = i64;
type Schedules = HashMap<String, Result<UnixTimestampMs, String>>;

fn schedules() -> &'static RwLock<Schedules> {
  static SCHEDULES: OnceLock<RwLock<Schedules>> = OnceLock::new();
  SCHEDULES.get_or_init(Default::default)
}

pub fn cancel_schedule(action_id: &str) {
  schedules().write().unwrap().remove(action_id);
}

async fn run_scheduled_action(action_id: String) {
  let repo = state::repo();
  let mut action =
    match repo.try_get::<ScheduledAction>(&action_id).await {
      Ok(Some(action)) => action,
      Ok(None) => return,
      Err(e) => {
        warn!(
          "scheduled run of {action_id} failed | failed to get action | {e:#}"
        );
        return;
      }
    };
  if !action.enabled {
    return;
  }
  match fire_action(repo, &mut action).await {
    Ok(task) => {
      debug!(
        "scheduled action {action_id} spawned task {}",
        task.doc.id
      );
    }
    Err(e) => {
      warn!("scheduled run of {action_id} failed | {e:#}");
    }
  }
  update_schedule(&action);
}

/// Fire one action: flip it `active`, spawn the task, flip it back
/// `potential` with `last_run_at` stamped.
pub async fn fire_action(
  repo: &Repo,
  action: &mut ScheduledAction,
) -> anyhow::Result<AgentTask> {
  action.action_status = ActionStatus::Active;
  repo
    .save_action(action)
    .await
    .map_err(|e| e.error)
    .context("failed to mark action active")?;

  let mut task = AgentTask {
    task_type: action.task_type(),
    agent_id: action.agent_id.clone(),
    payload: serde_json::json!({
      "instrument": action.instrument,
      "object": action.object,
    }),
    scheduled_by: action.doc.id.clone(),
    ..Default::default()
  };
  let spawned = repo.create_task(&mut task).await;

  action.action_status = ActionStatus::Potential;
  action.last_run_at = Some(trellis_timestamp());
  repo
    .save_action(action)
    .await
    .map_err(|e| e.error)
    .context("failed to mark action potential")?;

  spawned
    .map_err(|e| e.error)
    .context("failed to create task for action")?;
  Ok(task)
}

pub async fn update_schedules() {
  let actions = match state::repo().enabled_actions().await {
    Ok(actions) => actions,
    Err(e) => {
      error!("failed to get actions for schedule update | {e:#}");
      return;
    }
  };
  // clear out schedules which don't match to existing actions
  {
    let mut lock = schedules().write().unwrap();
    lock.retain(|id, _| {
      actions.iter().any(|action| &action.doc.id == id)
    });
  }
  for action in &actions {
    update_schedule(action);
  }
}

/// Re/computes the next fire time for the given action.
pub fn update_schedule(action: &ScheduledAction) {
  cancel_schedule(&action.doc.id);

  if !action.enabled
    || (action.schedule.cron.is_empty()
      && action.schedule.repeat_frequency.is_empty())
  {
    return;
  }

  schedules().write().unwrap().insert(
    action.doc.id.clone(),
    find_next_occurrence(action).map_err(|e| format!("{e:#}")),
  );
}

/// Finds the next run occurrence in UTC ms. Cron expressions win
/// over repeat intervals when both are set.
fn find_next_occurrence(
  action: &ScheduledAction,
) -> anyhow::Result<i64> {
  if !action.schedule.cron.is_empty() {
    let cron = croner::Cron::new(&action.schedule.cron)
      .with_seconds_required()
      .with_dom_and_dow()
      .parse()
      .context("failed to parse schedule cron")?;
    let next = match (
      action.schedule.timezone.as_str(),
      core_config().timezone.as_str(),
    ) {
      ("", "") => {
        let tz_time = chrono::Local::now().with_timezone(&Local);
        cron
          .find_next_occurrence(&tz_time, false)
          .context("failed to find next run time")?
          .timestamp_millis()
      }
      ("", timezone) | (timezone, _) => {
        let tz: chrono_tz::Tz = timezone
          .parse()
          .map_err(|e| anyhow!("failed to parse timezone | {e}"))?;
        let tz_time = chrono::Local::now().with_timezone(&tz);
        cron
          .find_next_occurrence(&tz_time, false)
          .context("failed to find next run time")?
          .timestamp_millis()
      }
    };
    return Ok(next);
  }
  let interval = action
    .schedule
    .repeat_duration()
    .context("failed to parse repeat frequency")?;
  let base = action.last_run_at.unwrap_or_else(trellis_timestamp);
  Ok(base + interval.num_milliseconds())
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use store::MemStore;
  use trellis_client::entities::{
    Document, Entity,
    action::Schedule,
    task::{TaskStatus, TaskType},
  };

  use super::*;

  fn action(kind: &str, frequency: &str) -> ScheduledAction {
    ScheduledAction {
      doc: Document::new(kind, format!("action-{kind}")),
      name: "resync".to_string(),
      enabled: true,
      schedule: Schedule {
        repeat_frequency: frequency.to_string(),
        ..Default::default()
      },
      instrument: serde_json::json!({ "interval": "fast" }),
      object: serde_json::json!({ "@id": "container-web" }),
      agent_id: "agent-1".to_string(),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn firing_spawns_a_task_and_records_history() {
    let repo = Repo::new(Arc::new(MemStore::new()));
    let mut check = action("CheckAction", "PT5M");
    repo.save_action(&mut check).await.unwrap();

    let task = fire_action(&repo, &mut check).await.unwrap();
    assert_eq!(task.task_type, TaskType::Check);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.scheduled_by, check.doc.id);
    assert_eq!(task.agent_id, "agent-1");
    assert_eq!(
      task.payload["object"]["@id"],
      serde_json::json!("container-web")
    );

    // The action settled back to potential with the run stamped.
    let stored: ScheduledAction =
      repo.get(&check.doc.id).await.unwrap();
    assert_eq!(stored.action_status, ActionStatus::Potential);
    assert!(stored.last_run_at.is_some());

    // Execution history is the set of tasks the action spawned.
    let history =
      repo.tasks_scheduled_by(&check.doc.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].doc.id, task.doc.id);
  }

  #[tokio::test]
  async fn composite_actions_spawn_workflows() {
    let repo = Repo::new(Arc::new(MemStore::new()));
    let mut composite = action("ScheduledAction", "PT1H");
    repo.save_action(&mut composite).await.unwrap();
    let task =
      fire_action(&repo, &mut composite).await.unwrap();
    assert_eq!(task.task_type, TaskType::Workflow);
  }

  #[test]
  fn next_occurrence_follows_the_repeat_interval() {
    let mut a = action("CheckAction", "PT5M");
    a.last_run_at = Some(1_000_000);
    let next = find_next_occurrence(&a).unwrap();
    assert_eq!(next, 1_000_000 + 300_000);
  }

  #[test]
  fn bad_frequency_is_an_error() {
    let a = action("CheckAction", "every five minutes");
    assert!(find_next_occurrence(&a).is_err());
  }
}
