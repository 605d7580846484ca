use anyhow::Context;
use serde_json::json;
use trellis_client::entities::{Entity, agent::AgentConfig};

use super::{Page, Repo, parse};

impl Repo {
  pub async fn list_agent_configs(
    &self,
    page: Page,
  ) -> anyhow::Result<Vec<AgentConfig>> {
    self.list(page).await
  }

  pub async fn agent_config_for_host(
    &self,
    host_id: &str,
  ) -> anyhow::Result<Option<AgentConfig>> {
    let docs = self
      .store()
      .find(
        json!({ "@type": AgentConfig::KIND, "hostId": host_id }),
        Some(1),
        None,
      )
      .await
      .context("failed to query agent configs")?;
    docs
      .into_iter()
      .next()
      .map(parse::<AgentConfig>)
      .transpose()
  }

  pub async fn save_agent_config(
    &self,
    config: &mut AgentConfig,
  ) -> serror::Result<String> {
    self.save(config).await
  }
}
