use std::collections::HashMap;

use serde_json::Value;
use store::ViewQuery;
use trellis_client::entities::host::{
  Host, HostInfo, HostLoad, HostResources,
};

use super::{Page, Repo, not_found};

impl Repo {
  pub async fn list_hosts(
    &self,
    page: Page,
  ) -> anyhow::Result<Vec<Host>> {
    self.list(page).await
  }

  pub async fn save_host(
    &self,
    host: &mut Host,
  ) -> serror::Result<String> {
    self.save(host).await
  }

  pub async fn delete_host(
    &self,
    id: &str,
  ) -> serror::Result<Host> {
    let Some(host) = self.try_get::<Host>(id).await? else {
      return Err(not_found("host", id));
    };
    self.delete::<Host>(id, &host.doc.rev).await?;
    self.audit("", "host.delete", id, Value::Null).await;
    Ok(host)
  }

  /// Placement resolver input: every host joined with its container
  /// count from the `container_count_by_host` view. Load figures
  /// come from agent sync when available; hosts which never reported
  /// sit at zero.
  pub async fn host_infos(&self) -> anyhow::Result<Vec<HostInfo>> {
    let hosts = self.list::<Host>(Page::max()).await?;
    let rows = self
      .store()
      .view(
        "containers",
        "container_count_by_host",
        ViewQuery {
          group: true,
          reduce: true,
          ..Default::default()
        },
      )
      .await?;
    let counts = rows
      .into_iter()
      .filter_map(|row| {
        Some((
          row.key.as_str()?.to_string(),
          row.value.as_u64().unwrap_or(0),
        ))
      })
      .collect::<HashMap<_, _>>();
    Ok(
      hosts
        .into_iter()
        .map(|host| {
          let container_count =
            counts.get(&host.doc.id).copied().unwrap_or(0);
          let mut labels = host.labels.clone();
          if !host.location.is_empty() {
            labels
              .entry("location".to_string())
              .or_insert_with(|| host.location.clone());
          }
          labels
            .entry("name".to_string())
            .or_insert_with(|| host.name.clone());
          HostInfo {
            available_resources: HostResources {
              cpu: host.cpu,
              memory: host.memory,
            },
            current_load: HostLoad {
              container_count,
              ..Default::default()
            },
            labels,
            host,
          }
        })
        .collect(),
    )
  }

  /// host status -> count, from the `host_status_summary` view.
  pub async fn host_status_summary(
    &self,
  ) -> anyhow::Result<HashMap<String, u64>> {
    let rows = self
      .store()
      .view(
        "hosts",
        "host_status_summary",
        ViewQuery {
          group: true,
          reduce: true,
          ..Default::default()
        },
      )
      .await?;
    Ok(
      rows
        .into_iter()
        .filter_map(|row| {
          Some((
            row.key.as_str()?.to_string(),
            row.value.as_u64().unwrap_or(0),
          ))
        })
        .collect(),
    )
  }
}
