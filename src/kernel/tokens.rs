//! Token Store + Validator (component A).
//!
//! Bearer credentials are never stored in plaintext: the store holds only a
//! one-way fingerprint (SHA-256, hex-encoded) of the issued token.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool};

const MAX_TTL_DAYS: i64 = 30;

/// Fingerprint a plaintext token with SHA-256, hex-encoded.
pub fn fingerprint(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub token_fingerprint: String,
    pub user_id: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of `issue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOutcome {
    Ok,
    Exists,
}

/// Outcome of `revoke`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Ok,
    Missing,
}

/// A validated identity: the bound user id and whether the token is an
/// admin token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub is_admin: bool,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn issue(
        &self,
        user_id: &str,
        plaintext: &str,
        ttl_days: i64,
        is_admin: bool,
    ) -> Result<IssueOutcome>;

    async fn revoke(&self, plaintext: &str) -> Result<RevokeOutcome>;

    async fn validate(&self, plaintext: &str) -> Result<Option<Identity>>;

    async fn list(&self) -> Result<Vec<TokenRow>>;
}

/// PostgreSQL-backed token store.
pub struct PostgresTokenStore {
    pool: PgPool,
}

impl PostgresTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenStore for PostgresTokenStore {
    async fn issue(
        &self,
        user_id: &str,
        plaintext: &str,
        ttl_days: i64,
        is_admin: bool,
    ) -> Result<IssueOutcome> {
        let capped_days = ttl_days.clamp(1, MAX_TTL_DAYS);
        let fp = fingerprint(plaintext);
        let expires_at = Utc::now() + ChronoDuration::days(capped_days);

        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> =
            sqlx::query_as("SELECT token_fingerprint FROM tokens WHERE token_fingerprint = $1")
                .bind(&fp)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Ok(IssueOutcome::Exists);
        }

        sqlx::query("UPDATE tokens SET is_active = false WHERE user_id = $1 AND is_active = true")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO tokens (token_fingerprint, user_id, is_admin, is_active, expires_at)
            VALUES ($1, $2, $3, true, $4)
            "#,
        )
        .bind(&fp)
        .bind(user_id)
        .bind(is_admin)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(IssueOutcome::Ok)
    }

    async fn revoke(&self, plaintext: &str) -> Result<RevokeOutcome> {
        let fp = fingerprint(plaintext);
        let result = sqlx::query(
            "UPDATE tokens SET is_active = false WHERE token_fingerprint = $1 AND is_active = true",
        )
        .bind(&fp)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(RevokeOutcome::Missing)
        } else {
            Ok(RevokeOutcome::Ok)
        }
    }

    async fn validate(&self, plaintext: &str) -> Result<Option<Identity>> {
        let fp = fingerprint(plaintext);
        let row: Option<TokenRow> = sqlx::query_as(
            "SELECT token_fingerprint, user_id, is_admin, is_active, expires_at FROM tokens WHERE token_fingerprint = $1",
        )
        .bind(&fp)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|row| {
            if row.is_active && row.expires_at > Utc::now() {
                Some(Identity {
                    user_id: row.user_id,
                    is_admin: row.is_admin,
                })
            } else {
                None
            }
        }))
    }

    async fn list(&self) -> Result<Vec<TokenRow>> {
        let rows = sqlx::query_as(
            "SELECT token_fingerprint, user_id, is_admin, is_active, expires_at FROM tokens ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// In-memory token store used by unit and integration tests so the HTTP
/// surface can be exercised without a database.
#[derive(Default)]
pub struct InMemoryTokenStore {
    rows: std::sync::Mutex<Vec<TokenRow>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn issue(
        &self,
        user_id: &str,
        plaintext: &str,
        ttl_days: i64,
        is_admin: bool,
    ) -> Result<IssueOutcome> {
        let capped_days = ttl_days.clamp(1, MAX_TTL_DAYS);
        let fp = fingerprint(plaintext);
        let mut rows = self.rows.lock().expect("poisoned");

        if rows.iter().any(|r| r.token_fingerprint == fp) {
            return Ok(IssueOutcome::Exists);
        }

        for row in rows.iter_mut().filter(|r| r.user_id == user_id) {
            row.is_active = false;
        }

        rows.push(TokenRow {
            token_fingerprint: fp,
            user_id: user_id.to_string(),
            is_admin,
            is_active: true,
            expires_at: Utc::now() + ChronoDuration::days(capped_days),
        });
        Ok(IssueOutcome::Ok)
    }

    async fn revoke(&self, plaintext: &str) -> Result<RevokeOutcome> {
        let fp = fingerprint(plaintext);
        let mut rows = self.rows.lock().expect("poisoned");
        match rows.iter_mut().find(|r| r.token_fingerprint == fp && r.is_active) {
            Some(row) => {
                row.is_active = false;
                Ok(RevokeOutcome::Ok)
            }
            None => Ok(RevokeOutcome::Missing),
        }
    }

    async fn validate(&self, plaintext: &str) -> Result<Option<Identity>> {
        let fp = fingerprint(plaintext);
        let rows = self.rows.lock().expect("poisoned");
        Ok(rows
            .iter()
            .find(|r| r.token_fingerprint == fp)
            .filter(|r| r.is_active && r.expires_at > Utc::now())
            .map(|r| Identity {
                user_id: r.user_id.clone(),
                is_admin: r.is_admin,
            }))
    }

    async fn list(&self) -> Result<Vec<TokenRow>> {
        Ok(self.rows.lock().expect("poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_one_way() {
        let fp1 = fingerprint("super-secret-token");
        let fp2 = fingerprint("super-secret-token");
        assert_eq!(fp1, fp2);
        assert_ne!(fp1, "super-secret-token");
        assert_eq!(fp1.len(), 64); // hex-encoded SHA-256
    }

    #[test]
    fn distinct_plaintexts_fingerprint_differently() {
        assert_ne!(fingerprint("alice-token"), fingerprint("bob-token"));
    }

    #[tokio::test]
    async fn issue_then_validate_round_trips() {
        let store = InMemoryTokenStore::new();
        store.issue("alice", "tok-1", 30, false).await.unwrap();
        let identity = store.validate("tok-1").await.unwrap().unwrap();
        assert_eq!(identity.user_id, "alice");
        assert!(!identity.is_admin);
    }

    #[tokio::test]
    async fn reissue_deactivates_prior_token() {
        let store = InMemoryTokenStore::new();
        store.issue("alice", "tok-1", 30, false).await.unwrap();
        store.issue("alice", "tok-2", 30, false).await.unwrap();
        assert!(store.validate("tok-1").await.unwrap().is_none());
        assert!(store.validate("tok-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let store = InMemoryTokenStore::new();
        store.issue("alice", "tok-1", 30, false).await.unwrap();
        assert_eq!(store.revoke("tok-1").await.unwrap(), RevokeOutcome::Ok);
        assert_eq!(store.revoke("tok-1").await.unwrap(), RevokeOutcome::Missing);
    }
}
