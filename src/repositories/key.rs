use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::key::{EncryptionKey, KeyType},
    repositories::KeyRepository,
};

const KEY_COLUMNS: &str = "id, owner_id, key_type, parent_key_id, wrapped_key_bytes, iv, \
                           salt, kdf_iterations, created_at, expires_at, active";

/// A helper function to map a `tokio_postgres::Row` to an `EncryptionKey`.
fn row_to_key(row: &Row) -> Result<EncryptionKey> {
    let key_type: String = row.try_get("key_type").map_err(|_| AppError::MissingData("key_type".to_string()))?;
    Ok(EncryptionKey {
        id: row.try_get("id").map_err(|_| AppError::MissingData("id".to_string()))?,
        owner_id: row.try_get("owner_id").map_err(|_| AppError::MissingData("owner_id".to_string()))?,
        key_type: key_type.parse::<KeyType>()?,
        parent_key_id: row.try_get("parent_key_id").map_err(|_| AppError::MissingData("parent_key_id".to_string()))?,
        wrapped_key_bytes: row.try_get("wrapped_key_bytes").map_err(|_| AppError::MissingData("wrapped_key_bytes".to_string()))?,
        iv: row.try_get("iv").map_err(|_| AppError::MissingData("iv".to_string()))?,
        salt: row.try_get("salt").map_err(|_| AppError::MissingData("salt".to_string()))?,
        kdf_iterations: row.try_get("kdf_iterations").map_err(|_| AppError::MissingData("kdf_iterations".to_string()))?,
        created_at: row.try_get("created_at").map_err(|_| AppError::MissingData("created_at".to_string()))?,
        expires_at: row.try_get("expires_at").map_err(|_| AppError::MissingData("expires_at".to_string()))?,
        active: row.try_get("active").map_err(|_| AppError::MissingData("active".to_string()))?,
    })
}

fn ids(rows: &[Row]) -> Result<Vec<Uuid>> {
    rows.iter()
        .map(|r| r.try_get("id").map_err(|_| AppError::MissingData("id".to_string())))
        .collect()
}

/// `encryption_keys` over PostgreSQL.
#[derive(Clone)]
pub struct PgKeyRepository {
    pool: Pool,
}

impl PgKeyRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyRepository for PgKeyRepository {
    async fn insert(&self, key: &EncryptionKey) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO encryption_keys
                    (id, owner_id, key_type, parent_key_id, wrapped_key_bytes, iv,
                     salt, kdf_iterations, created_at, expires_at, active)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
                &[
                    &key.id,
                    &key.owner_id,
                    &key.key_type.as_str(),
                    &key.parent_key_id,
                    &key.wrapped_key_bytes,
                    &key.iv,
                    &key.salt,
                    &key.kdf_iterations,
                    &key.created_at,
                    &key.expires_at,
                    &key.active,
                ],
            )
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EncryptionKey>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!("SELECT {} FROM encryption_keys WHERE id = $1", KEY_COLUMNS).as_str(),
                &[&id],
            )
            .await?;
        row.map(|r| row_to_key(&r)).transpose()
    }

    async fn list_by_owner(&self, owner_id: Uuid) -> Result<Vec<EncryptionKey>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                format!(
                    "SELECT {} FROM encryption_keys WHERE owner_id = $1 ORDER BY created_at ASC",
                    KEY_COLUMNS
                ).as_str(),
                &[&owner_id],
            )
            .await?;
        rows.iter().map(row_to_key).collect()
    }

    async fn count_active_by_owner(&self, owner_id: Uuid) -> Result<usize> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS total FROM encryption_keys WHERE owner_id = $1 AND active = true",
                &[&owner_id],
            )
            .await?;
        let total: i64 = row.try_get("total").map_err(|_| AppError::MissingData("total".to_string()))?;
        Ok(total.max(0) as usize)
    }

    async fn deactivate(&self, id: Uuid) -> Result<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE encryption_keys SET active = false WHERE id = $1 AND active = true",
                &[&id],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn deactivate_by_owner(&self, owner_id: Uuid) -> Result<Vec<Uuid>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                UPDATE encryption_keys
                SET active = false
                WHERE owner_id = $1 AND active = true
                RETURNING id
                "#,
                &[&owner_id],
            )
            .await?;
        ids(&rows)
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                UPDATE encryption_keys
                SET active = false
                WHERE active = true AND expires_at IS NOT NULL AND expires_at < $1
                RETURNING id
                "#,
                &[&now],
            )
            .await?;
        ids(&rows)
    }
}
