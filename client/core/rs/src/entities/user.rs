use serde::{Deserialize, Serialize};

use super::{Document, Entity};

/// A user identity. The core only consumes resolved identities;
/// password hashing, token signing and session handling live in the
/// auth boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
  #[serde(flatten)]
  pub doc: Document,

  pub username: String,

  #[serde(default)]
  pub enabled: bool,

  #[serde(default)]
  pub admin: bool,

  #[serde(default)]
  pub created_at: i64,

  #[serde(default)]
  pub updated_at: i64,
}

impl Entity for User {
  const KIND: &'static str = "User";

  fn doc(&self) -> &Document {
    &self.doc
  }

  fn doc_mut(&mut self) -> &mut Document {
    &mut self.doc
  }

  fn touch(&mut self, now: i64) {
    if self.created_at == 0 {
      self.created_at = now;
    }
    self.updated_at = now;
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshToken {
  #[serde(flatten)]
  pub doc: Document,

  pub user_id: String,

  #[serde(default)]
  pub expires_at: i64,

  #[serde(default)]
  pub revoked: bool,

  #[serde(default)]
  pub created_at: i64,
}

impl Entity for RefreshToken {
  const KIND: &'static str = "RefreshToken";

  fn doc(&self) -> &Document {
    &self.doc
  }

  fn doc_mut(&mut self) -> &mut Document {
    &mut self.doc
  }
}

/// Best-effort audit trail for user-facing mutations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
  #[serde(flatten)]
  pub doc: Document,

  /// Who performed the operation. Empty for system actors.
  #[serde(default)]
  pub actor: String,

  /// What happened, eg `container.delete`.
  pub operation: String,

  #[serde(default)]
  pub target_id: String,

  #[serde(default)]
  pub ts: i64,

  #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
  pub details: serde_json::Value,
}

impl Entity for AuditLog {
  const KIND: &'static str = "AuditLog";

  fn doc(&self) -> &Document {
    &self.doc
  }

  fn doc_mut(&mut self) -> &mut Document {
    &mut self.doc
  }
}
