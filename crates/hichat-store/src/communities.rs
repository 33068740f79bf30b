use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::Serialize;
use tracing::instrument;

use hichat_core::{GroupId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::schema::RELATION_GROUP;

#[derive(Clone, Debug, Serialize)]
pub struct CommunityRow {
    pub id: GroupId,
    pub name: String,
    pub owner_id: UserId,
    pub description: String,
    pub created_at: String,
}

/// Groups and group membership edges.
#[derive(Clone)]
pub struct CommunityRepo {
    db: Database,
}

impl CommunityRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a group owned by `owner`, who becomes its first member.
    /// An owner cannot hold two groups with the same name.
    #[instrument(skip(self, description), fields(owner_id = %owner))]
    pub fn create(
        &self,
        owner: UserId,
        name: &str,
        description: &str,
    ) -> Result<CommunityRow, StoreError> {
        self.db.with_tx(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM communities WHERE name = ?1 AND owner_id = ?2",
                    rusqlite::params![name, owner.get() as i64],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Err(StoreError::Conflict(format!(
                    "user {owner} already owns a group named {name}"
                )));
            }

            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO communities (name, owner_id, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![name, owner.get() as i64, description, now],
            )?;
            let id = GroupId::new(tx.last_insert_rowid() as u64);

            tx.execute(
                "INSERT INTO relations (owner_id, target_id, kind, description, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![owner.get() as i64, id.get() as i64, RELATION_GROUP, description, now],
            )?;

            Ok(CommunityRow {
                id,
                name: name.to_string(),
                owner_id: owner,
                description: description.to_string(),
                created_at: now,
            })
        })
    }

    /// Add `user` to an existing group.
    #[instrument(skip(self), fields(user_id = %user, group_id = %group))]
    pub fn join(&self, user: UserId, group: GroupId) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM communities WHERE id = ?1",
                    [group.get() as i64],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("group {group}")));
            }

            let member: Option<i64> = tx
                .query_row(
                    "SELECT id FROM relations WHERE owner_id = ?1 AND target_id = ?2 AND kind = ?3",
                    rusqlite::params![user.get() as i64, group.get() as i64, RELATION_GROUP],
                    |row| row.get(0),
                )
                .optional()?;
            if member.is_some() {
                return Err(StoreError::Conflict(format!(
                    "user {user} already joined group {group}"
                )));
            }

            tx.execute(
                "INSERT INTO relations (owner_id, target_id, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    user.get() as i64,
                    group.get() as i64,
                    RELATION_GROUP,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    /// Every user holding a group relation to `group`, in join order.
    #[instrument(skip(self), fields(group_id = %group))]
    pub fn members_of(&self, group: GroupId) -> Result<Vec<UserId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT owner_id FROM relations WHERE target_id = ?1 AND kind = ?2 ORDER BY id",
            )?;
            let ids = stmt
                .query_map(rusqlite::params![group.get() as i64, RELATION_GROUP], |row| {
                    row.get::<_, i64>(0)
                })?
                .map(|r| r.map(|id| UserId::new(id as u64)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Groups `user` belongs to.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn groups_of(&self, user: UserId) -> Result<Vec<GroupId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT target_id FROM relations WHERE owner_id = ?1 AND kind = ?2 ORDER BY id",
            )?;
            let ids = stmt
                .query_map(rusqlite::params![user.get() as i64, RELATION_GROUP], |row| {
                    row.get::<_, i64>(0)
                })?
                .map(|r| r.map(|id| GroupId::new(id as u64)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }
}
