//! tokens.rs
//!
//! Шлюз токенов: проверка отзыва за O(1) на каждой привилегированной границе.
//!
//! KV-ключи с TTL по сроку жизни токена, авторитетное зеркало в Postgres.
//! Чтение: сначала KV, на промахе - БД с обратным наполнением ключа на
//! оставшийся TTL. Недоступность KV для blacklist-проверок трактуется как
//! "не отозван" (fail open): токены доступа короткоживущие, доступность
//! важнее остаточного окна отзыва.

use crate::cache::CacheService;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshEntry {
    pub user_id: i64,
    pub revoked: bool,
    pub expires_at: DateTime<Utc>,
}

fn blacklist_key(token: &str) -> String {
    format!("blacklist:{}", token)
}

fn refresh_key(token: &str) -> String {
    format!("refresh_token:{}", token)
}

fn remaining_ttl(expires_at: DateTime<Utc>) -> Option<u64> {
    let secs = (expires_at - Utc::now()).num_seconds();
    (secs > 0).then_some(secs as u64)
}

impl CacheService {
    pub async fn is_blacklisted(&self, token: &str) -> bool {
        let mut conn = self.redis.conn.clone();

        match conn.exists::<_, bool>(blacklist_key(token)).await {
            Ok(true) => return true,
            Ok(false) | Err(_) => {}
        }

        // Промах или отказ KV: спрашиваем БД и восстанавливаем ключ.
        let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT expires_at FROM blacklisted_tokens WHERE token = $1 AND expires_at > NOW()",
        )
        .bind(token)
        .fetch_optional(&self.db.pool)
        .await
        .unwrap_or_else(|e| {
            warn!("blacklist DB lookup failed, failing open: {}", e);
            None
        });

        match expires_at {
            Some(exp) => {
                if let Some(ttl) = remaining_ttl(exp) {
                    let _: Result<(), _> = conn.set_ex(blacklist_key(token), 1i32, ttl).await;
                }
                true
            }
            None => false,
        }
    }

    pub async fn blacklist_token(
        &self,
        token: &str,
        user_id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO blacklisted_tokens (token, user_id, expires_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (token) DO NOTHING",
        )
        .bind(token)
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.db.pool)
        .await?;

        if let Some(ttl) = remaining_ttl(expires_at) {
            let mut conn = self.redis.conn.clone();
            let _: Result<(), _> = conn.set_ex(blacklist_key(token), 1i32, ttl).await;
        }
        Ok(())
    }

    pub async fn cache_refresh_token(
        &self,
        token: &str,
        user_id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO refresh_tokens (token, user_id, revoked, expires_at)
             VALUES ($1, $2, false, $3)
             ON CONFLICT (token) DO UPDATE SET expires_at = EXCLUDED.expires_at",
        )
        .bind(token)
        .bind(user_id)
        .bind(expires_at)
        .execute(&self.db.pool)
        .await?;

        let entry = RefreshEntry {
            user_id,
            revoked: false,
            expires_at,
        };
        if let (Some(ttl), Ok(raw)) = (remaining_ttl(expires_at), serde_json::to_string(&entry)) {
            let mut conn = self.redis.conn.clone();
            let _: Result<(), _> = conn.set_ex(refresh_key(token), raw, ttl).await;
        }
        Ok(())
    }

    pub async fn get_refresh_token(&self, token: &str) -> Option<RefreshEntry> {
        let mut conn = self.redis.conn.clone();

        if let Ok(Some(raw)) = conn.get::<_, Option<String>>(refresh_key(token)).await {
            if let Ok(entry) = serde_json::from_str::<RefreshEntry>(&raw) {
                return Some(entry);
            }
        }

        let entry: Option<RefreshEntry> = sqlx::query_as::<_, (i64, bool, DateTime<Utc>)>(
            "SELECT user_id, revoked, expires_at FROM refresh_tokens
             WHERE token = $1 AND expires_at > NOW()",
        )
        .bind(token)
        .fetch_optional(&self.db.pool)
        .await
        .ok()
        .flatten()
        .map(|(user_id, revoked, expires_at)| RefreshEntry {
            user_id,
            revoked,
            expires_at,
        });

        if let Some(ref e) = entry {
            if let (Some(ttl), Ok(raw)) = (remaining_ttl(e.expires_at), serde_json::to_string(e)) {
                let _: Result<(), _> = conn.set_ex(refresh_key(token), raw, ttl).await;
            }
        }
        entry
    }

    /// Отзывает все refresh-токены пользователя в обоих хранилищах.
    pub async fn revoke_all_for_user(&self, user_id: i64) -> Result<(), sqlx::Error> {
        let tokens: Vec<String> = sqlx::query_scalar(
            "UPDATE refresh_tokens SET revoked = true
             WHERE user_id = $1 AND revoked = false
             RETURNING token",
        )
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await?;

        if tokens.is_empty() {
            return Ok(());
        }

        let mut conn = self.redis.conn.clone();
        let keys: Vec<String> = tokens.iter().map(|t| refresh_key(t)).collect();
        let _: Result<i64, _> = conn.del(keys).await;
        Ok(())
    }
}
