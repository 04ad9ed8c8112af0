//! Item ledger backed by SQLite
//!
//! Records each item's custodian and lifecycle state, plus the set of asset
//! handles already committed to an outgoing offer. Every multi-row mutation
//! runs in a single transaction and is rolled back as a whole on error.

use crate::error::{LedgerError, LedgerResult};
use crate::types::{Item, ItemState, NewItem};
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Transaction;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info};

/// One row's destination in [`ItemLedger::apply_moves`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMove {
    pub id: i64,
    pub custodian_id: String,
    /// Refreshed handle; `None` keeps the recorded one
    pub asset_handle: Option<String>,
}

/// Columns `find_by` may filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerColumn {
    Custodian,
    AssetHandle,
    TypeId,
}

impl LedgerColumn {
    fn as_sql(&self) -> &'static str {
        match self {
            LedgerColumn::Custodian => "custodian_id",
            LedgerColumn::AssetHandle => "asset_handle",
            LedgerColumn::TypeId => "type_id",
        }
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: i64,
    custodian_id: String,
    asset_handle: String,
    type_id: String,
    state: String,
}

impl TryFrom<ItemRow> for Item {
    type Error = LedgerError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        let state = ItemState::parse(&row.state)
            .ok_or_else(|| LedgerError::Decode(format!("row {} has state '{}'", row.id, row.state)))?;
        Ok(Item {
            id: row.id,
            custodian_id: row.custodian_id,
            asset_handle: row.asset_handle,
            type_id: row.type_id,
            state,
        })
    }
}

/// Durable item ledger
#[derive(Clone)]
pub struct ItemLedger {
    pool: SqlitePool,
}

impl ItemLedger {
    /// Open (or create) the ledger at `url` and apply migrations
    pub async fn connect(url: &str) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory ledger; one pinned connection keeps the database alive
    pub async fn in_memory() -> LedgerResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> LedgerResult<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Item ledger ready");
        Ok(Self { pool })
    }

    /// Underlying pool, for maintenance queries outside the ledger API
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert new rows as Active and return them with their assigned ids
    pub async fn insert_rows(&self, items: &[NewItem]) -> LedgerResult<Vec<Item>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(items.len());

        for item in items {
            let id = sqlx::query(
                "INSERT INTO items (custodian_id, asset_handle, type_id, state) VALUES (?, ?, ?, ?)",
            )
            .bind(&item.custodian_id)
            .bind(&item.asset_handle)
            .bind(&item.type_id)
            .bind(ItemState::Active.as_str())
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            inserted.push(Item {
                id,
                custodian_id: item.custodian_id.clone(),
                asset_handle: item.asset_handle.clone(),
                type_id: item.type_id.clone(),
                state: ItemState::Active,
            });
        }

        tx.commit().await?;
        debug!("Inserted {} ledger rows", inserted.len());
        Ok(inserted)
    }

    /// Rows whose `column` equals `value`, optionally restricted to one state, in id order
    pub async fn find_by(
        &self,
        column: LedgerColumn,
        value: &str,
        state: Option<ItemState>,
    ) -> LedgerResult<Vec<Item>> {
        let rows: Vec<ItemRow> = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT id, custodian_id, asset_handle, type_id, state FROM items \
                     WHERE {} = ? AND state = ? ORDER BY id",
                    column.as_sql()
                );
                sqlx::query_as(&sql)
                    .bind(value)
                    .bind(state.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT id, custodian_id, asset_handle, type_id, state FROM items \
                     WHERE {} = ? ORDER BY id",
                    column.as_sql()
                );
                sqlx::query_as(&sql).bind(value).fetch_all(&self.pool).await?
            }
        };

        rows.into_iter().map(Item::try_from).collect()
    }

    /// Move every row in `ids` to `new_state`.
    ///
    /// Fails without applying anything if a row is missing or a move is illegal.
    pub async fn update_state(&self, ids: &[i64], new_state: ItemState) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;

        for &id in ids {
            let current: Option<String> = sqlx::query_scalar("SELECT state FROM items WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            let current = current.ok_or(LedgerError::RowMissing { id })?;
            let from = ItemState::parse(&current)
                .ok_or_else(|| LedgerError::Decode(format!("row {} has state '{}'", id, current)))?;

            if !from.can_transition_to(new_state) {
                return Err(LedgerError::InvalidTransition {
                    id,
                    from,
                    to: new_state,
                });
            }
            if from == new_state {
                continue;
            }

            sqlx::query("UPDATE items SET state = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
                .bind(new_state.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!("Moved {} ledger rows to {}", ids.len(), new_state);
        Ok(())
    }

    /// Reassign every row in `ids` to `custodian_id`
    pub async fn update_custodian(&self, ids: &[i64], custodian_id: &str) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;

        for &id in ids {
            let affected = sqlx::query(
                "UPDATE items SET custodian_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            )
            .bind(custodian_id)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if affected == 0 {
                return Err(LedgerError::RowMissing { id });
            }
        }

        tx.commit().await?;
        debug!("Reassigned {} ledger rows to {}", ids.len(), custodian_id);
        Ok(())
    }

    /// Move rows to a custodian and state in one transaction.
    ///
    /// Each move may also record the handle the row now carries in the new
    /// custodian's inventory. Illegal transitions abort the whole batch.
    pub async fn apply_moves(&self, moves: &[RowMove], new_state: ItemState) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        move_rows(&mut tx, moves, new_state).await?;
        tx.commit().await?;
        debug!("Moved {} ledger rows ({})", moves.len(), new_state);
        Ok(())
    }

    /// Record an offer that left a custodian: mark its handles used and move
    /// its rows, both in one transaction. On error neither change is kept.
    pub async fn commit_offer(
        &self,
        handles: &[String],
        moves: &[RowMove],
        new_state: ItemState,
    ) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_used(&mut tx, handles).await?;
        move_rows(&mut tx, moves, new_state).await?;
        tx.commit().await?;
        debug!(
            "Committed offer: {} handles used, {} rows ({})",
            handles.len(),
            moves.len(),
            new_state
        );
        Ok(())
    }

    /// Rows with the given ids, in id order; unknown ids are skipped
    pub async fn find_ids(&self, ids: &[i64]) -> LedgerResult<Vec<Item>> {
        let mut items = Vec::with_capacity(ids.len());
        for &id in ids {
            let row: Option<ItemRow> = sqlx::query_as(
                "SELECT id, custodian_id, asset_handle, type_id, state FROM items WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                items.push(Item::try_from(row)?);
            }
        }
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    /// Record handles as committed to an outgoing offer. Already-used handles are ignored.
    pub async fn mark_used(&self, handles: &[String]) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_used(&mut tx, handles).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn is_used(&self, handle: &str) -> LedgerResult<bool> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT asset_handle FROM used_handles WHERE asset_handle = ?")
                .bind(handle)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// The subset of `handles` already used, read on one connection
    pub async fn used_among(&self, handles: &[String]) -> LedgerResult<HashSet<String>> {
        let mut conn = self.pool.acquire().await?;
        let mut used = HashSet::new();
        for handle in handles {
            let found: Option<String> =
                sqlx::query_scalar("SELECT asset_handle FROM used_handles WHERE asset_handle = ?")
                    .bind(handle)
                    .fetch_optional(&mut *conn)
                    .await?;
            if found.is_some() {
                used.insert(handle.clone());
            }
        }
        Ok(used)
    }

    /// Total number of rows
    pub async fn count(&self) -> LedgerResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

async fn insert_used(tx: &mut Transaction<'_, Sqlite>, handles: &[String]) -> LedgerResult<()> {
    for handle in handles {
        sqlx::query("INSERT OR IGNORE INTO used_handles (asset_handle) VALUES (?)")
            .bind(handle)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn move_rows(
    tx: &mut Transaction<'_, Sqlite>,
    moves: &[RowMove],
    new_state: ItemState,
) -> LedgerResult<()> {
    for mv in moves {
        let current: Option<String> = sqlx::query_scalar("SELECT state FROM items WHERE id = ?")
            .bind(mv.id)
            .fetch_optional(&mut **tx)
            .await?;
        let current = current.ok_or(LedgerError::RowMissing { id: mv.id })?;
        let from = ItemState::parse(&current)
            .ok_or_else(|| LedgerError::Decode(format!("row {} has state '{}'", mv.id, current)))?;
        if !from.can_transition_to(new_state) {
            return Err(LedgerError::InvalidTransition {
                id: mv.id,
                from,
                to: new_state,
            });
        }

        sqlx::query(
            "UPDATE items SET custodian_id = ?, asset_handle = COALESCE(?, asset_handle), \
             state = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(&mv.custodian_id)
        .bind(mv.asset_handle.as_deref())
        .bind(new_state.as_str())
        .bind(mv.id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_item(custodian: &str, handle: &str, type_id: &str) -> NewItem {
        NewItem {
            custodian_id: custodian.to_string(),
            asset_handle: handle.to_string(),
            type_id: type_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let ledger = ItemLedger::in_memory().await.unwrap();
        let rows = ledger
            .insert_rows(&[new_item("coord", "h1", "X"), new_item("s1", "h2", "Y")])
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.state == ItemState::Active));
        assert_eq!(ledger.count().await.unwrap(), 2);

        let by_type = ledger.find_by(LedgerColumn::TypeId, "X", None).await.unwrap();
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].asset_handle, "h1");

        let sent = ledger
            .find_by(LedgerColumn::Custodian, "s1", Some(ItemState::Sent))
            .await
            .unwrap();
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn test_illegal_transition_rolls_back_batch() {
        let ledger = ItemLedger::in_memory().await.unwrap();
        let rows = ledger
            .insert_rows(&[new_item("coord", "h1", "X"), new_item("coord", "h2", "X")])
            .await
            .unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();

        ledger.update_state(&ids[..1], ItemState::Sent).await.unwrap();
        ledger.update_state(&ids[..1], ItemState::Accepted).await.unwrap();

        // Row 2 could move, row 1 cannot leave Accepted: nothing is applied
        let err = ledger.update_state(&ids, ItemState::Sent).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        let untouched = ledger.find_by(LedgerColumn::AssetHandle, "h2", None).await.unwrap();
        assert_eq!(untouched[0].state, ItemState::Active);
    }

    #[tokio::test]
    async fn test_missing_row_aborts_update() {
        let ledger = ItemLedger::in_memory().await.unwrap();
        let rows = ledger.insert_rows(&[new_item("coord", "h1", "X")]).await.unwrap();

        let err = ledger
            .update_custodian(&[rows[0].id, 999], "s1")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::RowMissing { id: 999 }));

        let row = ledger.find_by(LedgerColumn::AssetHandle, "h1", None).await.unwrap();
        assert_eq!(row[0].custodian_id, "coord");
    }

    #[tokio::test]
    async fn test_same_state_is_noop() {
        let ledger = ItemLedger::in_memory().await.unwrap();
        let rows = ledger.insert_rows(&[new_item("coord", "h1", "X")]).await.unwrap();

        ledger.update_state(&[rows[0].id], ItemState::Active).await.unwrap();
        ledger.update_state(&[rows[0].id], ItemState::OnHold).await.unwrap();
        ledger.update_state(&[rows[0].id], ItemState::OnHold).await.unwrap();

        let row = ledger.find_by(LedgerColumn::AssetHandle, "h1", None).await.unwrap();
        assert_eq!(row[0].state, ItemState::OnHold);
    }

    #[tokio::test]
    async fn test_used_handles() {
        let ledger = ItemLedger::in_memory().await.unwrap();
        ledger
            .mark_used(&["h1".to_string(), "h2".to_string()])
            .await
            .unwrap();
        ledger.mark_used(&["h1".to_string()]).await.unwrap();

        assert!(ledger.is_used("h1").await.unwrap());
        assert!(!ledger.is_used("h3").await.unwrap());

        let used = ledger
            .used_among(&["h2".to_string(), "h3".to_string()])
            .await
            .unwrap();
        assert_eq!(used.len(), 1);
        assert!(used.contains("h2"));
    }

    #[tokio::test]
    async fn test_commit_offer_marks_and_moves_together() {
        let ledger = ItemLedger::in_memory().await.unwrap();
        let rows = ledger
            .insert_rows(&[new_item("coord", "h1", "X"), new_item("coord", "h2", "Y")])
            .await
            .unwrap();
        let moves: Vec<RowMove> = rows
            .iter()
            .map(|r| RowMove {
                id: r.id,
                custodian_id: "coord".to_string(),
                asset_handle: Some(format!("{}-live", r.asset_handle)),
            })
            .collect();
        let handles = vec!["h1-live".to_string(), "h2-live".to_string()];

        ledger.commit_offer(&handles, &moves, ItemState::Sent).await.unwrap();

        assert_eq!(ledger.used_among(&handles).await.unwrap().len(), 2);
        let sent = ledger
            .find_by(LedgerColumn::Custodian, "coord", Some(ItemState::Sent))
            .await
            .unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].asset_handle, "h1-live");
    }

    #[tokio::test]
    async fn test_commit_offer_rolls_back_handles_on_illegal_move() {
        let ledger = ItemLedger::in_memory().await.unwrap();
        let rows = ledger
            .insert_rows(&[new_item("coord", "h1", "X"), new_item("coord", "h2", "Y")])
            .await
            .unwrap();
        ledger.update_state(&[rows[1].id], ItemState::Sent).await.unwrap();
        ledger.update_state(&[rows[1].id], ItemState::Accepted).await.unwrap();

        let moves: Vec<RowMove> = rows
            .iter()
            .map(|r| RowMove {
                id: r.id,
                custodian_id: "coord".to_string(),
                asset_handle: None,
            })
            .collect();
        let handles = vec!["h1".to_string(), "h2".to_string()];
        let err = ledger
            .commit_offer(&handles, &moves, ItemState::Sent)
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        assert!(!ledger.is_used("h1").await.unwrap());
        let row = ledger.find_ids(&[rows[0].id]).await.unwrap();
        assert_eq!(row[0].state, ItemState::Active);
    }

    #[tokio::test]
    async fn test_apply_moves_updates_custodian_handle_and_state() {
        let ledger = ItemLedger::in_memory().await.unwrap();
        let rows = ledger
            .insert_rows(&[new_item("coord", "h1", "X"), new_item("coord", "h2", "Y")])
            .await
            .unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        ledger.update_state(&ids, ItemState::OnHold).await.unwrap();

        let moves = vec![
            RowMove {
                id: ids[0],
                custodian_id: "s1".to_string(),
                asset_handle: Some("h9".to_string()),
            },
            RowMove {
                id: ids[1],
                custodian_id: "s1".to_string(),
                asset_handle: None,
            },
        ];
        ledger.apply_moves(&moves, ItemState::Active).await.unwrap();

        let moved = ledger.find_ids(&ids).await.unwrap();
        assert!(moved.iter().all(|r| r.custodian_id == "s1" && r.state == ItemState::Active));
        assert_eq!(moved[0].asset_handle, "h9");
        assert_eq!(moved[1].asset_handle, "h2");
    }

    #[tokio::test]
    async fn test_apply_moves_rejects_accepted_rows() {
        let ledger = ItemLedger::in_memory().await.unwrap();
        let rows = ledger.insert_rows(&[new_item("coord", "h1", "X")]).await.unwrap();
        ledger.update_state(&[rows[0].id], ItemState::Sent).await.unwrap();
        ledger.update_state(&[rows[0].id], ItemState::Accepted).await.unwrap();

        let moves = vec![RowMove {
            id: rows[0].id,
            custodian_id: "s1".to_string(),
            asset_handle: None,
        }];
        assert!(ledger.apply_moves(&moves, ItemState::Active).await.is_err());

        let row = ledger.find_ids(&[rows[0].id]).await.unwrap();
        assert_eq!(row[0].custodian_id, "coord");
    }
}
