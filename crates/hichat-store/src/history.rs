//! Ordered per-conversation message log.
//!
//! Each conversation (see [`hichat_core::history_key`]) is an append-only
//! sequence of raw envelopes ordered by an explicit per-conversation counter.
//! Range reads use sorted-set index semantics: indices are zero based,
//! negative indices count from the end, and both bounds are inclusive.

use chrono::Utc;
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

/// Read direction for [`HistoryRepo::range`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeOrder {
    /// Oldest entry first.
    Ascending,
    /// Newest entry first; indices address this reversed order.
    Descending,
}

impl RangeOrder {
    /// Maps the `isRev` flag of the history endpoint.
    pub fn from_reverse(reverse: bool) -> Self {
        if reverse {
            Self::Descending
        } else {
            Self::Ascending
        }
    }

    fn sql(self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

#[derive(Clone)]
pub struct HistoryRepo {
    db: Database,
}

impl HistoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a raw envelope to a conversation. Returns the score assigned to
    /// it, always one more than the highest score already in the conversation.
    #[instrument(skip(self, payload), fields(conversation = %key, len = payload.len()))]
    pub fn append(&self, key: &str, payload: &str) -> Result<i64, StoreError> {
        self.db.with_tx(|tx| {
            let score: i64 = tx.query_row(
                "SELECT COALESCE(MAX(score), 0) + 1 FROM history WHERE conversation = ?1",
                [key],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO history (conversation, score, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![key, score, payload, Utc::now().to_rfc3339()],
            )?;
            Ok(score)
        })
    }

    /// Entries between `start` and `end` (inclusive) in the given order.
    #[instrument(skip(self), fields(conversation = %key))]
    pub fn range(
        &self,
        key: &str,
        start: i64,
        end: i64,
        order: RangeOrder,
    ) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let len: i64 = conn.query_row(
                "SELECT COUNT(*) FROM history WHERE conversation = ?1",
                [key],
                |row| row.get(0),
            )?;
            let Some((offset, limit)) = resolve_range(start, end, len) else {
                return Ok(Vec::new());
            };

            let sql = format!(
                "SELECT payload FROM history WHERE conversation = ?1 ORDER BY score {} LIMIT ?2 OFFSET ?3",
                order.sql()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![key, limit, offset], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(rows)
        })
    }

    /// Number of entries in a conversation.
    pub fn count(&self, key: &str) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM history WHERE conversation = ?1",
                [key],
                |row| row.get(0),
            )?)
        })
    }
}

/// Translate inclusive, possibly negative indices into `(offset, limit)` over
/// a sequence of `len` entries. `None` means the range is empty.
fn resolve_range(start: i64, end: i64, len: i64) -> Option<(i64, i64)> {
    if len <= 0 {
        return None;
    }
    let start = if start < 0 { (start + len).max(0) } else { start };
    let end = if end < 0 { end + len } else { end.min(len - 1) };
    if end < 0 || start > end || start >= len {
        return None;
    }
    Some((start, end - start + 1))
}
