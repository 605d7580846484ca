use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;
use trellis_client::entities::config::StoreConfig;

use crate::{
  BulkResult, CHANGE_FEED_HEARTBEAT, ChangeRecord, ChangesPage,
  DocStore, FeedOptions, Reduce, Result, RevRef, SavedRev,
  StoreError, ViewDef, ViewQuery, ViewRow, doc_id,
};

/// [DocStore] over the document store's HTTP API.
///
/// Documents are stored under their `@id`. The adapter mirrors the
/// id into `_id` on bulk writes, where there is no path to carry it.
#[derive(Debug)]
pub struct HttpStore {
  client: reqwest::Client,
  base: String,
  db: String,
  username: String,
  password: String,
}

impl HttpStore {
  /// Connect and create the database when missing.
  pub async fn init(config: &StoreConfig) -> Result<HttpStore> {
    let store = HttpStore {
      // No global client timeout: the continuous change feed holds
      // its connection open indefinitely.
      client: reqwest::Client::new(),
      base: config.uri.trim_end_matches('/').to_string(),
      db: config.db_name.clone(),
      username: config.username.clone(),
      password: config.password.clone(),
    };
    let res = store
      .request(Method::PUT, store.db_url(""))
      .send()
      .await?;
    match res.status() {
      StatusCode::CREATED | StatusCode::PRECONDITION_FAILED => {
        Ok(store)
      }
      _ => Err(error_for(res, &store.db).await),
    }
  }

  fn db_url(&self, path: &str) -> String {
    format!("{}/{}{path}", self.base, self.db)
  }

  fn request(&self, method: Method, url: String) -> RequestBuilder {
    let req = self.client.request(method, url);
    if self.username.is_empty() {
      req
    } else {
      req.basic_auth(&self.username, Some(&self.password))
    }
  }
}

async fn error_for(res: Response, id: &str) -> StoreError {
  let status = res.status();
  let reason = res.text().await.unwrap_or_default();
  match status {
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
      StoreError::Unauthorized
    }
    StatusCode::NOT_FOUND => StoreError::not_found(id),
    StatusCode::CONFLICT => StoreError::conflict(id),
    StatusCode::BAD_REQUEST => StoreError::InvalidDoc(reason),
    _ => StoreError::Transport(format!("{status}: {reason}")),
  }
}

async fn json_or_error(res: Response, id: &str) -> Result<Value> {
  if res.status().is_success() {
    Ok(res.json().await?)
  } else {
    Err(error_for(res, id).await)
  }
}

/// Seqs are strings on current servers but numbers on older ones.
fn seq_to_string(seq: Option<&Value>) -> String {
  match seq {
    Some(Value::String(s)) => s.clone(),
    Some(Value::Number(n)) => n.to_string(),
    _ => String::new(),
  }
}

fn change_record(value: &Value) -> Option<ChangeRecord> {
  let id = value.get("id")?.as_str()?.to_string();
  let changes = value
    .get("changes")
    .and_then(Value::as_array)
    .map(|arr| {
      arr
        .iter()
        .filter_map(|c| {
          Some(RevRef {
            rev: c.get("rev")?.as_str()?.to_string(),
          })
        })
        .collect()
    })
    .unwrap_or_default();
  Some(ChangeRecord {
    id,
    seq: seq_to_string(value.get("seq")),
    changes,
    deleted: value
      .get("deleted")
      .and_then(Value::as_bool)
      .unwrap_or(false),
    doc: value.get("doc").cloned(),
  })
}

fn compile_map(def: &ViewDef) -> String {
  let cond = def
    .doc_kinds
    .iter()
    .map(|k| format!("doc['@type'] === '{k}'"))
    .collect::<Vec<_>>()
    .join(" || ");
  format!(
    "function (doc) {{ if ({cond}) {{ emit(doc['{}'], 1); }} }}",
    def.key_field
  )
}

#[async_trait]
impl DocStore for HttpStore {
  async fn save(&self, doc: Value) -> Result<SavedRev> {
    let id = doc_id(&doc)?;
    let res = self
      .request(Method::PUT, self.db_url(&format!("/{id}")))
      .json(&doc)
      .send()
      .await?;
    let body = json_or_error(res, &id).await?;
    Ok(SavedRev {
      id,
      rev: body
        .get("rev")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string(),
    })
  }

  async fn get(&self, id: &str) -> Result<Value> {
    let res = self
      .request(Method::GET, self.db_url(&format!("/{id}")))
      .send()
      .await?;
    json_or_error(res, id).await
  }

  async fn delete(&self, id: &str, rev: &str) -> Result<()> {
    let res = self
      .request(Method::DELETE, self.db_url(&format!("/{id}")))
      .query(&[("rev", rev)])
      .send()
      .await?;
    json_or_error(res, id).await?;
    Ok(())
  }

  async fn bulk_save(
    &self,
    mut docs: Vec<Value>,
  ) -> Result<Vec<BulkResult>> {
    for doc in &mut docs {
      let id = doc_id(doc)?;
      doc["_id"] = Value::String(id);
    }
    let res = self
      .request(Method::POST, self.db_url("/_bulk_docs"))
      .json(&json!({ "docs": docs }))
      .send()
      .await?;
    let rows: Vec<Value> = serde_json::from_value(
      json_or_error(res, "_bulk_docs").await?,
    )?;
    let results = rows
      .into_iter()
      .map(|row| {
        let id = row
          .get("id")
          .and_then(Value::as_str)
          .unwrap_or_default()
          .to_string();
        if row.get("ok").and_then(Value::as_bool).unwrap_or(false) {
          let rev = row
            .get("rev")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
          BulkResult::ok(id, rev)
        } else {
          BulkResult::err(
            id,
            row
              .get("error")
              .and_then(Value::as_str)
              .unwrap_or("unknown"),
            row
              .get("reason")
              .and_then(Value::as_str)
              .unwrap_or_default(),
          )
        }
      })
      .collect();
    Ok(results)
  }

  async fn find(
    &self,
    selector: Value,
    limit: Option<usize>,
    skip: Option<usize>,
  ) -> Result<Vec<Value>> {
    let mut body = json!({ "selector": selector });
    if let Some(limit) = limit {
      body["limit"] = Value::from(limit);
    }
    if let Some(skip) = skip {
      body["skip"] = Value::from(skip);
    }
    let res = self
      .request(Method::POST, self.db_url("/_find"))
      .json(&body)
      .send()
      .await?;
    let body = json_or_error(res, "_find").await?;
    Ok(
      body
        .get("docs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default(),
    )
  }

  async fn view(
    &self,
    design: &str,
    view: &str,
    query: ViewQuery,
  ) -> Result<Vec<ViewRow>> {
    let mut params: Vec<(&str, String)> = Vec::new();
    if let Some(key) = &query.key {
      params.push(("key", serde_json::to_string(key)?));
    }
    if query.reduce {
      params.push(("group", query.group.to_string()));
    } else {
      params.push(("reduce", "false".to_string()));
      if query.include_docs {
        params.push(("include_docs", "true".to_string()));
      }
    }
    if let Some(limit) = query.limit {
      params.push(("limit", limit.to_string()));
    }
    if let Some(skip) = query.skip {
      params.push(("skip", skip.to_string()));
    }
    let res = self
      .request(
        Method::GET,
        self.db_url(&format!("/_design/{design}/_view/{view}")),
      )
      .query(&params)
      .send()
      .await?;
    let body =
      json_or_error(res, &format!("_design/{design}/{view}")).await?;
    let rows = body
      .get("rows")
      .cloned()
      .unwrap_or_else(|| Value::Array(Vec::new()));
    Ok(serde_json::from_value(rows)?)
  }

  async fn get_changes(
    &self,
    since: Option<&str>,
    limit: Option<usize>,
  ) -> Result<ChangesPage> {
    let mut params: Vec<(&str, String)> =
      vec![("include_docs", "true".to_string())];
    if let Some(since) = since {
      params.push(("since", since.to_string()));
    }
    if let Some(limit) = limit {
      params.push(("limit", limit.to_string()));
    }
    let res = self
      .request(Method::GET, self.db_url("/_changes"))
      .query(&params)
      .send()
      .await?;
    let body = json_or_error(res, "_changes").await?;
    let results = body
      .get("results")
      .and_then(Value::as_array)
      .map(|arr| arr.iter().filter_map(change_record).collect())
      .unwrap_or_default();
    Ok(ChangesPage {
      results,
      last_seq: seq_to_string(body.get("last_seq")),
    })
  }

  async fn listen_changes(
    &self,
    opts: FeedOptions,
    tx: mpsc::Sender<ChangeRecord>,
  ) -> Result<()> {
    let heartbeat = CHANGE_FEED_HEARTBEAT;
    let silence_limit = heartbeat * 2;
    let mut since = opts.since.clone();

    loop {
      if tx.is_closed() {
        return Ok(());
      }
      let mut params: Vec<(&str, String)> = vec![
        ("feed", "continuous".to_string()),
        ("heartbeat", heartbeat.as_millis().to_string()),
      ];
      if opts.include_docs {
        params.push(("include_docs", "true".to_string()));
      }
      if let Some(since) = &since {
        params.push(("since", since.clone()));
      }
      let req = if opts.kinds.is_empty() {
        self
          .request(Method::GET, self.db_url("/_changes"))
          .query(&params)
      } else {
        // Deletions pass the selector: tombstones carry no `@type`.
        params.push(("filter", "_selector".to_string()));
        self
          .request(Method::POST, self.db_url("/_changes"))
          .query(&params)
          .json(&json!({
            "selector": {
              "$or": [
                { "@type": { "$in": opts.kinds } },
                { "_deleted": true },
              ]
            }
          }))
      };

      let res = match req.send().await {
        Ok(res) if res.status().is_success() => res,
        Ok(res) => {
          let e = error_for(res, "_changes").await;
          if matches!(e, StoreError::Unauthorized) {
            return Err(e);
          }
          tracing::warn!("change feed request failed: {e}");
          tokio::time::sleep(Duration::from_secs(5)).await;
          continue;
        }
        Err(e) => {
          tracing::warn!("change feed unreachable: {e}");
          tokio::time::sleep(Duration::from_secs(5)).await;
          continue;
        }
      };

      let mut stream = res.bytes_stream();
      let mut buf: Vec<u8> = Vec::new();
      loop {
        let chunk = match timeout(silence_limit, stream.next()).await
        {
          // No heartbeat for 2x the interval: reconnect from the
          // last seq.
          Err(_) => {
            tracing::warn!(
              "change feed silent for {silence_limit:?}, reconnecting"
            );
            break;
          }
          Ok(None) => break,
          Ok(Some(Err(e))) => {
            tracing::warn!("change feed read failed: {e}");
            break;
          }
          Ok(Some(Ok(chunk))) => chunk,
        };
        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
          let line: Vec<u8> = buf.drain(..=pos).collect();
          let line = String::from_utf8_lossy(&line);
          let line = line.trim();
          if line.is_empty() {
            // Heartbeat.
            continue;
          }
          let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
          };
          if let Some(last_seq) = value.get("last_seq") {
            since = Some(seq_to_string(Some(last_seq)));
            continue;
          }
          let Some(record) = change_record(&value) else {
            continue;
          };
          if !record.seq.is_empty() {
            since = Some(record.seq.clone());
          }
          if tx.send(record).await.is_err() {
            return Ok(());
          }
        }
      }
      tokio::time::sleep(Duration::from_secs(1)).await;
    }
  }

  async fn ensure_index(
    &self,
    name: &str,
    fields: &[&str],
  ) -> Result<()> {
    let res = self
      .request(Method::POST, self.db_url("/_index"))
      .json(&json!({
        "index": { "fields": fields },
        "name": name,
        "type": "json",
      }))
      .send()
      .await?;
    json_or_error(res, name).await?;
    Ok(())
  }

  async fn ensure_view(
    &self,
    design: &str,
    views: &[(&str, ViewDef)],
  ) -> Result<()> {
    let ddoc_id = format!("_design/{design}");
    let mut compiled = serde_json::Map::new();
    for (name, def) in views {
      let mut view = json!({ "map": compile_map(def) });
      if def.reduce == Some(Reduce::Sum) {
        view["reduce"] = Value::String("_sum".to_string());
      }
      compiled.insert(name.to_string(), view);
    }
    let views = Value::Object(compiled);

    // Two attempts: a concurrent controller start may race the
    // design doc update.
    for attempt in 0..2 {
      let existing = match self.get(&ddoc_id).await {
        Ok(existing) => Some(existing),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
      };
      if let Some(existing) = &existing
        && existing.get("views") == Some(&views)
      {
        return Ok(());
      }
      let mut ddoc = json!({
        "_id": ddoc_id,
        "language": "javascript",
        "views": views,
      });
      if let Some(rev) =
        existing.as_ref().and_then(|d| d.get("_rev"))
      {
        ddoc["_rev"] = rev.clone();
      }
      let res = self
        .request(Method::PUT, self.db_url(&format!("/{ddoc_id}")))
        .json(&ddoc)
        .send()
        .await?;
      match json_or_error(res, &ddoc_id).await {
        Ok(_) => return Ok(()),
        Err(e) if e.is_conflict() && attempt == 0 => continue,
        Err(e) => return Err(e),
      }
    }
    unreachable!("ensure_view retries exhausted")
  }
}
