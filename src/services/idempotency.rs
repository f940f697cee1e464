//! idempotency.rs
//!
//! Дедупликация мутирующих запросов по клиентскому ключу.
//!
//! Претензия на ключ делается через `INSERT ... ON CONFLICT DO NOTHING`:
//! вставилось - операция наша; конфликт - либо параллельный запрос ещё
//! в полёте (`pending`), либо операция уже завершена и у нас лежит
//! сериализованный ответ. Провалившийся ключ можно переиспользовать.

use serde_json::Value;
use tracing::warn;

use crate::{
    database::Database,
    error::{ApiError, Result},
};

/// Исход претензии на ключ идемпотентности.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyClaim {
    /// Ключ захвачен этим запросом; операция выполняется впервые.
    Started,
    /// Конкурирующий запрос с тем же ключом ещё не завершился.
    InFlight,
    /// Операция уже выполнена; возвращается сохранённый ответ.
    Completed(Value),
}

pub mod idempotency_status {
    pub const PENDING: &str = "pending";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

#[derive(Clone)]
pub struct IdempotencyStore {
    db: Database,
}

impl IdempotencyStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn begin(
        &self,
        key: &str,
        operation_type: &str,
        resource_id: Option<i64>,
        user_id: i64,
    ) -> Result<IdempotencyClaim> {
        let inserted = sqlx::query(
            "INSERT INTO idempotency_keys (key, operation_type, resource_id, user_id, status, expires_at)
             VALUES ($1, $2, $3, $4, 'pending', NOW() + INTERVAL '24 hours')
             ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(operation_type)
        .bind(resource_id)
        .bind(user_id)
        .execute(&self.db.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            return Ok(IdempotencyClaim::Started);
        }

        let existing: Option<(String, Option<Value>, i64, String)> = sqlx::query_as(
            "SELECT status, response_snapshot, user_id, operation_type
             FROM idempotency_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.db.pool)
        .await?;

        let (status, snapshot, owner, op) = match existing {
            Some(row) => row,
            // Строка истекла и была выметена между INSERT и SELECT: редкая
            // гонка, просим клиента повторить.
            None => return Ok(IdempotencyClaim::InFlight),
        };

        // Чужой ключ или другая операция - это не ретрай, а ошибка клиента.
        if owner != user_id || op != operation_type {
            return Err(ApiError::Validation(
                "Idempotency key is already used by another operation".to_string(),
            ));
        }

        match status.as_str() {
            idempotency_status::COMPLETED => {
                Ok(IdempotencyClaim::Completed(snapshot.unwrap_or(Value::Null)))
            }
            idempotency_status::PENDING => Ok(IdempotencyClaim::InFlight),
            // Провалившийся запуск: забираем ключ себе и пробуем заново.
            _ => {
                let retaken = sqlx::query(
                    "UPDATE idempotency_keys SET status = 'pending'
                     WHERE key = $1 AND status = 'failed'",
                )
                .bind(key)
                .execute(&self.db.pool)
                .await?
                .rows_affected();

                if retaken > 0 {
                    Ok(IdempotencyClaim::Started)
                } else {
                    Ok(IdempotencyClaim::InFlight)
                }
            }
        }
    }

    /// Фиксирует успешный ответ; последующие ретраи получат его байт в байт.
    pub async fn complete(&self, key: &str, response: &Value) {
        let result = sqlx::query(
            "UPDATE idempotency_keys
             SET status = 'completed', response_snapshot = $2
             WHERE key = $1",
        )
        .bind(key)
        .bind(response)
        .execute(&self.db.pool)
        .await;

        if let Err(e) = result {
            warn!("failed to store idempotency response for {}: {}", key, e);
        }
    }

    pub async fn fail(&self, key: &str) {
        let result = sqlx::query(
            "UPDATE idempotency_keys SET status = 'failed' WHERE key = $1 AND status = 'pending'",
        )
        .bind(key)
        .execute(&self.db.pool)
        .await;

        if let Err(e) = result {
            warn!("failed to mark idempotency key {} failed: {}", key, e);
        }
    }
}
