use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::Serialize;
use tracing::instrument;

use hichat_core::UserId;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize)]
pub struct UserRow {
    pub id: UserId,
    pub name: String,
    pub created_at: String,
}

/// Minimal user directory: the chat core only needs to know whether an id
/// belongs to a registered user.
#[derive(Clone)]
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn create(&self, name: &str) -> Result<UserRow, StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO users (name, created_at) VALUES (?1, ?2)",
                rusqlite::params![name, now],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!("user name {name} is taken"))
                }
                other => StoreError::from(other),
            })?;
            Ok(UserRow {
                id: UserId::new(conn.last_insert_rowid() as u64),
                name: name.to_string(),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(user_id = %id))]
    pub fn exists(&self, id: UserId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row("SELECT id FROM users WHERE id = ?1", [id.get() as i64], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(found.is_some())
        })
    }
}
