use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::session::{SecurityLevel, Session},
    repositories::SessionRepository,
};

const SESSION_COLUMNS: &str = "id, user_id, session_token, refresh_token, previous_refresh_token, \
                               ip, user_agent, created_at, last_activity, expires_at, active, \
                               remembered, security_level, mfa_verified, concurrent_count, \
                               max_concurrent";

/// A helper function to map a `tokio_postgres::Row` to a `Session`.
fn row_to_session(row: &Row) -> Result<Session> {
    let level: String = row.try_get("security_level").map_err(|_| AppError::MissingData("security_level".to_string()))?;
    Ok(Session {
        id: row.try_get("id").map_err(|_| AppError::MissingData("id".to_string()))?,
        user_id: row.try_get("user_id").map_err(|_| AppError::MissingData("user_id".to_string()))?,
        session_token: row.try_get("session_token").map_err(|_| AppError::MissingData("session_token".to_string()))?,
        refresh_token: row.try_get("refresh_token").map_err(|_| AppError::MissingData("refresh_token".to_string()))?,
        previous_refresh_token: row.try_get("previous_refresh_token").map_err(|_| AppError::MissingData("previous_refresh_token".to_string()))?,
        ip: row.try_get("ip").map_err(|_| AppError::MissingData("ip".to_string()))?,
        user_agent: row.try_get("user_agent").map_err(|_| AppError::MissingData("user_agent".to_string()))?,
        created_at: row.try_get("created_at").map_err(|_| AppError::MissingData("created_at".to_string()))?,
        last_activity: row.try_get("last_activity").map_err(|_| AppError::MissingData("last_activity".to_string()))?,
        expires_at: row.try_get("expires_at").map_err(|_| AppError::MissingData("expires_at".to_string()))?,
        active: row.try_get("active").map_err(|_| AppError::MissingData("active".to_string()))?,
        remembered: row.try_get("remembered").map_err(|_| AppError::MissingData("remembered".to_string()))?,
        security_level: level.parse::<SecurityLevel>()?,
        mfa_verified: row.try_get("mfa_verified").map_err(|_| AppError::MissingData("mfa_verified".to_string()))?,
        concurrent_count: row.try_get("concurrent_count").map_err(|_| AppError::MissingData("concurrent_count".to_string()))?,
        max_concurrent: row.try_get("max_concurrent").map_err(|_| AppError::MissingData("max_concurrent".to_string()))?,
    })
}

/// `user_sessions` over PostgreSQL.
#[derive(Clone)]
pub struct PgSessionRepository {
    pool: Pool,
}

impl PgSessionRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn insert(&self, session: &Session) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO user_sessions
                    (id, user_id, session_token, refresh_token, previous_refresh_token,
                     ip, user_agent, created_at, last_activity, expires_at, active,
                     remembered, security_level, mfa_verified, concurrent_count, max_concurrent)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
                &[
                    &session.id,
                    &session.user_id,
                    &session.session_token,
                    &session.refresh_token,
                    &session.previous_refresh_token,
                    &session.ip,
                    &session.user_agent,
                    &session.created_at,
                    &session.last_activity,
                    &session.expires_at,
                    &session.active,
                    &session.remembered,
                    &session.security_level.as_str(),
                    &session.mfa_verified,
                    &session.concurrent_count,
                    &session.max_concurrent,
                ],
            )
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Session>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                format!("SELECT {} FROM user_sessions WHERE id = $1", SESSION_COLUMNS).as_str(),
                &[&id],
            )
            .await?;
        row.map(|r| row_to_session(&r)).transpose()
    }

    async fn update(&self, session: &Session) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE user_sessions
                SET
                    session_token = $1,
                    refresh_token = $2,
                    previous_refresh_token = $3,
                    last_activity = $4,
                    active = $5
                WHERE id = $6
                "#,
                &[
                    &session.session_token,
                    &session.refresh_token,
                    &session.previous_refresh_token,
                    &session.last_activity,
                    &session.active,
                    &session.id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn touch(&self, id: Uuid, last_activity: DateTime<Utc>) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE user_sessions SET last_activity = GREATEST(last_activity, $1) WHERE id = $2",
                &[&last_activity, &id],
            )
            .await?;
        Ok(())
    }

    async fn list_active_by_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                format!(
                    "SELECT {} FROM user_sessions WHERE user_id = $1 AND active = true ORDER BY created_at ASC",
                    SESSION_COLUMNS
                ).as_str(),
                &[&user_id],
            )
            .await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn deactivate(&self, id: Uuid) -> Result<bool> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE user_sessions SET active = false WHERE id = $1 AND active = true",
                &[&id],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn deactivate_stale(
        &self,
        now: DateTime<Utc>,
        idle_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                format!(
                    r#"
                    UPDATE user_sessions
                    SET active = false
                    WHERE active = true AND (expires_at < $1 OR last_activity < $2)
                    RETURNING {}
                    "#,
                    SESSION_COLUMNS
                ).as_str(),
                &[&now, &idle_cutoff],
            )
            .await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn count_active(&self) -> Result<usize> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS total FROM user_sessions WHERE active = true",
                &[],
            )
            .await?;
        let total: i64 = row.try_get("total").map_err(|_| AppError::MissingData("total".to_string()))?;
        Ok(total.max(0) as usize)
    }
}
