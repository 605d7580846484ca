use anyhow::Context;
use serde_json::json;
use trellis_client::entities::{
  Entity,
  deployment::DeploymentState,
  new_document_id, trellis_timestamp,
};

use super::{MAX_PAGE_LIMIT, Repo, parse};

impl Repo {
  /// Persist a fresh deployment state record for a stack.
  pub async fn create_deployment_state(
    &self,
    state: &mut DeploymentState,
  ) -> serror::Result<String> {
    if state.doc.id.is_empty() {
      state.doc.id = new_document_id("deployment");
    }
    if state.started_at == 0 {
      state.started_at = trellis_timestamp();
    }
    self.save(state).await
  }

  pub async fn deployment_states_for_stack(
    &self,
    stack_id: &str,
  ) -> anyhow::Result<Vec<DeploymentState>> {
    let docs = self
      .store()
      .find(
        json!({
          "@type": DeploymentState::KIND,
          "stackId": stack_id,
        }),
        Some(MAX_PAGE_LIMIT),
        None,
      )
      .await
      .context("failed to query deployment states")?;
    let mut states = docs
      .into_iter()
      .map(parse::<DeploymentState>)
      .collect::<anyhow::Result<Vec<_>>>()?;
    states.sort_by_key(|s| s.started_at);
    Ok(states)
  }
}
