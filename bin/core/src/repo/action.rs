use anyhow::Context;
use serde_json::{Value, json};
use trellis_client::entities::{
  Entity, action::ScheduledAction,
};

use super::{MAX_PAGE_LIMIT, Page, Repo, not_found, parse};

impl Repo {
  pub async fn list_actions(
    &self,
    page: Page,
  ) -> anyhow::Result<Vec<ScheduledAction>> {
    self.list(page).await
  }

  /// Every enabled action, for the scheduler refresh.
  pub async fn enabled_actions(
    &self,
  ) -> anyhow::Result<Vec<ScheduledAction>> {
    let docs = self
      .store()
      .find(
        json!({
          "@type": { "$in": ScheduledAction::kinds() },
          "enabled": true,
        }),
        Some(MAX_PAGE_LIMIT),
        None,
      )
      .await
      .context("failed to query enabled actions")?;
    docs.into_iter().map(parse).collect()
  }

  pub async fn save_action(
    &self,
    action: &mut ScheduledAction,
  ) -> serror::Result<String> {
    self.save(action).await
  }

  pub async fn delete_action(
    &self,
    id: &str,
  ) -> serror::Result<ScheduledAction> {
    let Some(action) =
      self.try_get::<ScheduledAction>(id).await?
    else {
      return Err(not_found("scheduled action", id));
    };
    self
      .delete::<ScheduledAction>(id, &action.doc.rev)
      .await?;
    crate::schedule::cancel_schedule(id);
    self.audit("", "action.delete", id, Value::Null).await;
    Ok(action)
  }
}
