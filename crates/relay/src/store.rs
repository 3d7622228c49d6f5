//! User persistence as seen by the relay: an existence check and the
//! `connected` flag.
//!
//! User IDs are compared as text, so the `users.id` column may be `TEXT` or
//! `UUID` without the relay caring.

use std::future::Future;

use sqlx::PgPool;

use herald_common::error::AppError;
use herald_common::types::{User, UserId};

/// Read-mostly access to user records.
pub trait UserStore: Clone + Send + Sync + 'static {
    fn find_user(&self, id: &UserId)
    -> impl Future<Output = Result<Option<User>, AppError>> + Send;

    fn set_connected(
        &self,
        id: &UserId,
        connected: bool,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// PostgreSQL-backed [`UserStore`].
#[derive(Debug, Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl UserStore for PgUserStore {
    fn find_user(
        &self,
        id: &UserId,
    ) -> impl Future<Output = Result<Option<User>, AppError>> + Send {
        let pool = self.pool.clone();
        let id = id.clone();
        async move {
            let user: Option<User> = sqlx::query_as(
                "SELECT id::text AS id, username, connected FROM users WHERE id::text = $1",
            )
            .bind(id.as_str())
            .fetch_optional(&pool)
            .await?;
            Ok(user)
        }
    }

    fn set_connected(
        &self,
        id: &UserId,
        connected: bool,
    ) -> impl Future<Output = Result<(), AppError>> + Send {
        let pool = self.pool.clone();
        let id = id.clone();
        async move {
            let result = sqlx::query(
                "UPDATE users SET connected = $1, updated_at = NOW() WHERE id::text = $2",
            )
            .bind(connected)
            .bind(id.as_str())
            .execute(&pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(AppError::NotFound(format!("User {} not found", id)));
            }
            Ok(())
        }
    }
}
