//! Postgres durable store (`db/sql/schema.sql`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{Instrument, Span};
use uuid::Uuid;

use super::{
    Application, ApplicationStore, RefreshToken, RefreshTokenStore, RevocationEntry,
    RevocationRepository, Session, SessionStore, StoreError, StoreResult, User, UserStore,
};

const REFRESH_TOKEN_COLUMNS: &str = "id, user_id, app_id, token_hash, device_type, os, browser, \
     ip_address, session_name, created_at, expires_at, revoked_at";

const SESSION_COLUMNS: &str = "id, user_id, app_id, token_hash, access_token_hash, device_type, \
     os, browser, ip_address, user_agent, session_name, last_active_at, created_at, expires_at, \
     revoked_at";

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_span(operation: &'static str, statement: &str) -> Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn refresh_token_from_row(row: &PgRow) -> RefreshToken {
    RefreshToken {
        id: row.get("id"),
        user_id: row.get("user_id"),
        app_id: row.get("app_id"),
        token_hash: row.get("token_hash"),
        device_type: row.get("device_type"),
        os: row.get("os"),
        browser: row.get("browser"),
        ip_address: row.get("ip_address"),
        session_name: row.get("session_name"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        revoked_at: row.get("revoked_at"),
    }
}

fn session_from_row(row: &PgRow) -> Session {
    Session {
        id: row.get("id"),
        user_id: row.get("user_id"),
        app_id: row.get("app_id"),
        token_hash: row.get("token_hash"),
        access_token_hash: row.get("access_token_hash"),
        device_type: row.get("device_type"),
        os: row.get("os"),
        browser: row.get("browser"),
        ip_address: row.get("ip_address"),
        user_agent: row.get("user_agent"),
        session_name: row.get("session_name"),
        last_active_at: row.get("last_active_at"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        revoked_at: row.get("revoked_at"),
    }
}

async fn insert_refresh_token<'e, E>(executor: E, token: &RefreshToken) -> StoreResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    let query = r"
        INSERT INTO refresh_tokens
            (id, user_id, app_id, token_hash, device_type, os, browser,
             ip_address, session_name, created_at, expires_at, revoked_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ";
    let result = sqlx::query(query)
        .bind(token.id)
        .bind(token.user_id)
        .bind(token.app_id)
        .bind(&token.token_hash)
        .bind(&token.device_type)
        .bind(&token.os)
        .bind(&token.browser)
        .bind(&token.ip_address)
        .bind(&token.session_name)
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(token.revoked_at)
        .execute(executor)
        .instrument(db_span("INSERT", query))
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict("refresh token hash")),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl RefreshTokenStore for PgStore {
    async fn create_refresh_token(&self, token: &RefreshToken) -> StoreResult<()> {
        insert_refresh_token(&self.pool, token).await
    }

    async fn refresh_token_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshToken>> {
        let query = format!("SELECT {REFRESH_TOKEN_COLUMNS} FROM refresh_tokens WHERE token_hash = $1");
        let row = sqlx::query(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await?;
        Ok(row.as_ref().map(refresh_token_from_row))
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> StoreResult<bool> {
        let query = r"
            UPDATE refresh_tokens
            SET revoked_at = NOW()
            WHERE token_hash = $1 AND revoked_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rotate_refresh_token(
        &self,
        old_hash: &str,
        successor: &RefreshToken,
    ) -> StoreResult<bool> {
        // Revocation of the predecessor and insertion of the successor commit together,
        // and the conditional UPDATE lets only one concurrent rotation win.
        let mut tx = self.pool.begin().await?;

        let query = r"
            UPDATE refresh_tokens
            SET revoked_at = NOW()
            WHERE token_hash = $1 AND revoked_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(old_hash)
            .execute(&mut *tx)
            .instrument(db_span("UPDATE", query))
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_refresh_token(&mut *tx, successor).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn revoke_all_user_tokens(&self, user_id: Uuid) -> StoreResult<u64> {
        let query = r"
            UPDATE refresh_tokens
            SET revoked_at = NOW()
            WHERE user_id = $1 AND revoked_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RevocationRepository for PgStore {
    async fn add_to_blacklist(&self, entry: &RevocationEntry) -> StoreResult<()> {
        let query = r"
            INSERT INTO token_blacklist (token_hash, user_id, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (token_hash) DO UPDATE
            SET expires_at = GREATEST(token_blacklist.expires_at, EXCLUDED.expires_at)
        ";
        sqlx::query(query)
            .bind(&entry.token_hash)
            .bind(entry.user_id)
            .bind(entry.expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn is_blacklisted(&self, token_hash: &str) -> StoreResult<bool> {
        let query = r"
            SELECT EXISTS (
                SELECT 1 FROM token_blacklist
                WHERE token_hash = $1 AND expires_at > NOW()
            ) AS blacklisted
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_one(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(row.get("blacklisted"))
    }

    async fn active_blacklist_entries(&self) -> StoreResult<Vec<RevocationEntry>> {
        let query = r"
            SELECT token_hash, user_id, expires_at
            FROM token_blacklist
            WHERE expires_at > NOW()
        ";
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(rows
            .iter()
            .map(|row| RevocationEntry {
                token_hash: row.get("token_hash"),
                user_id: row.get("user_id"),
                expires_at: row.get("expires_at"),
            })
            .collect())
    }

    async fn purge_expired_blacklist(&self) -> StoreResult<u64> {
        let query = "DELETE FROM token_blacklist WHERE expires_at <= NOW()";
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn create_session(&self, session: &Session) -> StoreResult<()> {
        let query = r"
            INSERT INTO sessions
                (id, user_id, app_id, token_hash, access_token_hash, device_type, os, browser,
                 ip_address, user_agent, session_name, last_active_at, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ";
        sqlx::query(query)
            .bind(session.id)
            .bind(session.user_id)
            .bind(session.app_id)
            .bind(&session.token_hash)
            .bind(&session.access_token_hash)
            .bind(&session.device_type)
            .bind(&session.os)
            .bind(&session.browser)
            .bind(&session.ip_address)
            .bind(&session.user_agent)
            .bind(&session.session_name)
            .bind(session.last_active_at)
            .bind(session.created_at)
            .bind(session.expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn session_by_token_hash(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE token_hash = $1 AND revoked_at IS NULL LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn session_by_id(&self, session_id: Uuid) -> StoreResult<Option<Session>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn revoke_session(&self, session_id: Uuid) -> StoreResult<()> {
        let query = "UPDATE sessions SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL";
        sqlx::query(query)
            .bind(session_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(())
    }

    async fn revoke_user_sessions(&self, user_id: Uuid) -> StoreResult<u64> {
        let query =
            "UPDATE sessions SET revoked_at = NOW() WHERE user_id = $1 AND revoked_at IS NULL";
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected())
    }

    async fn refresh_session_tokens(
        &self,
        old_token_hash: &str,
        new_token_hash: &str,
        new_access_token_hash: &str,
        new_expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let query = r"
            UPDATE sessions
            SET token_hash = $2,
                access_token_hash = $3,
                expires_at = $4,
                last_active_at = NOW()
            WHERE token_hash = $1 AND revoked_at IS NULL
        ";
        let result = sqlx::query(query)
            .bind(old_token_hash)
            .bind(new_token_hash)
            .bind(new_access_token_hash)
            .bind(new_expires_at)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn user_sessions(&self, user_id: Uuid) -> StoreResult<Vec<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE user_id = $1 AND revoked_at IS NULL AND expires_at > NOW() \
             ORDER BY last_active_at DESC"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    async fn delete_expired_sessions(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let query = "DELETE FROM sessions WHERE expires_at < $1 OR revoked_at < $1";
        let result = sqlx::query(query)
            .bind(cutoff)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn user_by_id(&self, user_id: Uuid) -> StoreResult<Option<User>> {
        let query = r"
            SELECT users.id, users.email, users.username,
                   COALESCE(
                       ARRAY_AGG(roles.name ORDER BY roles.name)
                           FILTER (WHERE roles.name IS NOT NULL),
                       '{}'
                   ) AS roles
            FROM users
            LEFT JOIN user_roles ON user_roles.user_id = users.id
            LEFT JOIN roles ON roles.id = user_roles.role_id
            WHERE users.id = $1
            GROUP BY users.id
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(row.map(|row| User {
            id: row.get("id"),
            email: row.get("email"),
            username: row.get("username"),
            roles: row.get("roles"),
        }))
    }

    async fn update_password_hash(
        &self,
        user_id: Uuid,
        password_hash: &str,
    ) -> StoreResult<bool> {
        let query = "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(password_hash)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ApplicationStore for PgStore {
    async fn application_by_id(&self, app_id: Uuid) -> StoreResult<Option<Application>> {
        let query = "SELECT id, name, homepage_url, is_active FROM applications WHERE id = $1";
        let row = sqlx::query(query)
            .bind(app_id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await?;
        Ok(row.map(|row| Application {
            id: row.get("id"),
            name: row.get("name"),
            homepage_url: row.get("homepage_url"),
            is_active: row.get("is_active"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn is_unique_violation_matches_sqlstate() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(is_unique_violation(&err));

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("40001"),
        }));
        assert!(!is_unique_violation(&err));

        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn column_lists_cover_every_model_field() {
        assert_eq!(REFRESH_TOKEN_COLUMNS.split(',').count(), 12);
        assert_eq!(SESSION_COLUMNS.split(',').count(), 15);
    }
}
