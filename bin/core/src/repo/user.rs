use anyhow::Context;
use serde_json::{Value, json};
use trellis_client::entities::{
  Document, Entity, new_document_id, trellis_timestamp,
  user::{AuditLog, RefreshToken, User},
};

use super::{Repo, parse};

impl Repo {
  /// Look up a user by id or username.
  pub async fn get_user(
    &self,
    id_or_username: &str,
  ) -> anyhow::Result<Option<User>> {
    if let Some(user) =
      self.try_get::<User>(id_or_username).await?
    {
      return Ok(Some(user));
    }
    let docs = self
      .store()
      .find(
        json!({
          "@type": User::KIND,
          "username": id_or_username,
        }),
        Some(1),
        None,
      )
      .await
      .context("failed to query users by username")?;
    docs.into_iter().next().map(parse::<User>).transpose()
  }

  pub async fn save_user(
    &self,
    user: &mut User,
  ) -> serror::Result<String> {
    self.save(user).await
  }

  pub async fn save_refresh_token(
    &self,
    token: &mut RefreshToken,
  ) -> serror::Result<String> {
    if token.created_at == 0 {
      token.created_at = trellis_timestamp();
    }
    self.save(token).await
  }

  pub async fn revoke_refresh_token(
    &self,
    id: &str,
  ) -> anyhow::Result<()> {
    let Some(mut token) =
      self.try_get::<RefreshToken>(id).await?
    else {
      return Ok(());
    };
    token.revoked = true;
    self.save(&mut token).await.map_err(|e| e.error)?;
    Ok(())
  }

  /// Best-effort audit trail. Failures log and move on: audit must
  /// never fail the primary operation.
  pub async fn audit(
    &self,
    actor: &str,
    operation: &str,
    target_id: &str,
    details: Value,
  ) {
    let mut entry = AuditLog {
      doc: Document::new(AuditLog::KIND, new_document_id("audit")),
      actor: actor.to_string(),
      operation: operation.to_string(),
      target_id: target_id.to_string(),
      ts: trellis_timestamp(),
      details,
    };
    if let Err(e) = self.save(&mut entry).await {
      warn!("failed to write audit log for {operation} | {:#}", e.error);
    }
  }
}
