use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{BranchId, Xid};
use sqlx::{PgPool, Postgres, Row as _, Transaction, postgres::PgRow};

use crate::error::MutateError;
use crate::journal::{AppendOptions, JournalEntry, Sequence, TransactionLog, validate_entries_for_append};
use crate::{BranchKey, BranchStore, CompensationRecord, Result, RollbackOutcome, Row, StoreError};

const PENDING: &str = "pending";
const FENCED: &str = "fenced";

/// Runs the database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

fn parse_xid(raw: &str) -> Result<Xid> {
    Xid::parse(raw).map_err(|e| StoreError::InvalidData(format!("{e}: '{raw}'")))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// PostgreSQL-backed branch store.
///
/// Rows of every kind share `resource_rows`; the kind column keeps them apart.
/// Row locks (`SELECT ... FOR UPDATE`) serialize mutations of one row.
pub struct PostgresBranchStore<R> {
    pool: PgPool,
    _row: PhantomData<fn() -> R>,
}

impl<R> Clone for PostgresBranchStore<R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _row: PhantomData,
        }
    }
}

impl<R: Row> PostgresBranchStore<R> {
    /// Creates a new PostgreSQL branch store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _row: PhantomData,
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_record(row: PgRow) -> Result<CompensationRecord> {
        let xid: String = row.try_get("xid")?;
        let resource_key: Option<String> = row.try_get("resource_key")?;
        let before_image: Option<serde_json::Value> = row.try_get("before_image")?;

        Ok(CompensationRecord {
            xid: parse_xid(&xid)?,
            branch_id: BranchId::new(row.try_get("branch_id")?),
            resource_kind: row.try_get("resource_kind")?,
            resource_key: resource_key.unwrap_or_default(),
            before_image: before_image.unwrap_or(serde_json::Value::Null),
            captured_at: row.try_get("logged_at")?,
        })
    }

    /// Returns the log state of a branch, locking the log row if present.
    async fn branch_state(
        tx: &mut Transaction<'_, Postgres>,
        branch: &BranchKey,
    ) -> Result<Option<String>> {
        let state = sqlx::query_scalar(
            r#"
            SELECT state FROM undo_log
            WHERE xid = $1 AND branch_id = $2 AND resource_kind = $3
            FOR UPDATE
            "#,
        )
        .bind(branch.xid.as_str())
        .bind(branch.branch_id.as_i64())
        .bind(R::kind())
        .fetch_optional(&mut **tx)
        .await?;
        Ok(state)
    }

    /// Runs one mutation inside a database transaction.
    ///
    /// The outer `Result` carries store failures, the inner one the caller's rejection.
    async fn mutate_in_tx<F, E>(
        &self,
        key: &str,
        branch: Option<&BranchKey>,
        change: F,
    ) -> Result<std::result::Result<R, E>>
    where
        F: FnOnce(&R) -> std::result::Result<R, E> + Send,
        E: Send,
    {
        let mut tx = self.pool.begin().await?;

        if let Some(branch) = branch {
            match Self::branch_state(&mut tx, branch).await?.as_deref() {
                Some(FENCED) => return Err(StoreError::Fenced(branch.clone())),
                Some(_) => return Err(StoreError::DuplicateBranch(branch.clone())),
                None => {}
            }
        }

        let data: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT data FROM resource_rows WHERE kind = $1 AND key = $2 FOR UPDATE",
        )
        .bind(R::kind())
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(data) = data else {
            return Err(StoreError::RowNotFound {
                kind: R::kind(),
                key: key.to_string(),
            });
        };

        let holder: Option<String> = sqlx::query_scalar(
            r#"
            SELECT xid FROM undo_log
            WHERE resource_kind = $1 AND resource_key = $2 AND state = 'pending'
              AND ($3::TEXT IS NULL OR xid <> $3)
            LIMIT 1
            "#,
        )
        .bind(R::kind())
        .bind(key)
        .bind(branch.map(|b| b.xid.as_str()))
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(holder) = holder {
            return Err(StoreError::ResourceBusy {
                kind: R::kind(),
                key: key.to_string(),
                holder: parse_xid(&holder)?,
            });
        }

        let current: R = serde_json::from_value(data.clone())?;
        let updated = match change(&current) {
            Ok(updated) => updated,
            Err(rejection) => return Ok(Err(rejection)),
        };

        sqlx::query(
            "UPDATE resource_rows SET data = $3, updated_at = NOW() WHERE kind = $1 AND key = $2",
        )
        .bind(R::kind())
        .bind(key)
        .bind(serde_json::to_value(&updated)?)
        .execute(&mut *tx)
        .await?;

        if let Some(branch) = branch {
            sqlx::query(
                r#"
                INSERT INTO undo_log (xid, branch_id, resource_kind, resource_key, before_image, state)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(branch.xid.as_str())
            .bind(branch.branch_id.as_i64())
            .bind(R::kind())
            .bind(key)
            .bind(data)
            .bind(PENDING)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // A rollback fenced the branch while we held the row
                if is_unique_violation(&e) {
                    return StoreError::Fenced(branch.clone());
                }
                StoreError::Database(e)
            })?;
        }

        tx.commit().await?;
        Ok(Ok(updated))
    }
}

#[async_trait]
impl<R: Row> BranchStore<R> for PostgresBranchStore<R> {
    #[tracing::instrument(skip(self, row), fields(kind = R::kind()))]
    async fn insert(&self, row: R) -> Result<()> {
        let key = row.key();
        sqlx::query("INSERT INTO resource_rows (kind, key, data) VALUES ($1, $2, $3)")
            .bind(R::kind())
            .bind(&key)
            .bind(serde_json::to_value(&row)?)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    return StoreError::DuplicateRow {
                        kind: R::kind(),
                        key: key.clone(),
                    };
                }
                StoreError::Database(e)
            })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<R>> {
        let data: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT data FROM resource_rows WHERE kind = $1 AND key = $2")
                .bind(R::kind())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        data.map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn find_by(&self, field: &str, value: &str) -> Result<Vec<R>> {
        let rows: Vec<serde_json::Value> = sqlx::query_scalar(
            "SELECT data FROM resource_rows WHERE kind = $1 AND data->>$2 = $3 ORDER BY key",
        )
        .bind(R::kind())
        .bind(field)
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|data| serde_json::from_value(data).map_err(StoreError::from))
            .collect()
    }

    async fn mutate<F, E>(
        &self,
        key: &str,
        branch: Option<&BranchKey>,
        change: F,
    ) -> std::result::Result<R, MutateError<E>>
    where
        F: FnOnce(&R) -> std::result::Result<R, E> + Send,
        E: Send,
    {
        self.mutate_in_tx(key, branch, change)
            .await?
            .map_err(MutateError::Rejected)
    }

    #[tracing::instrument(skip(self), fields(kind = R::kind()))]
    async fn commit(&self, branch: &BranchKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM undo_log
            WHERE xid = $1 AND branch_id = $2 AND resource_kind = $3 AND state = 'pending'
            "#,
        )
        .bind(branch.xid.as_str())
        .bind(branch.branch_id.as_i64())
        .bind(R::kind())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), fields(kind = R::kind()))]
    async fn rollback(&self, branch: &BranchKey) -> Result<RollbackOutcome> {
        loop {
            let mut tx = self.pool.begin().await?;

            let record = sqlx::query(
                r#"
                SELECT resource_key, before_image, state FROM undo_log
                WHERE xid = $1 AND branch_id = $2 AND resource_kind = $3
                FOR UPDATE
                "#,
            )
            .bind(branch.xid.as_str())
            .bind(branch.branch_id.as_i64())
            .bind(R::kind())
            .fetch_optional(&mut *tx)
            .await?;

            match record {
                Some(record) => {
                    let state: String = record.try_get("state")?;
                    if state == FENCED {
                        return Ok(RollbackOutcome::NothingToUndo);
                    }

                    let key: String = record.try_get("resource_key")?;
                    let before_image: serde_json::Value = record.try_get("before_image")?;

                    sqlx::query(
                        r#"
                        INSERT INTO resource_rows (kind, key, data) VALUES ($1, $2, $3)
                        ON CONFLICT (kind, key) DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()
                        "#,
                    )
                    .bind(R::kind())
                    .bind(&key)
                    .bind(before_image)
                    .execute(&mut *tx)
                    .await?;

                    sqlx::query(
                        r#"
                        UPDATE undo_log SET state = $4, before_image = NULL, logged_at = NOW()
                        WHERE xid = $1 AND branch_id = $2 AND resource_kind = $3
                        "#,
                    )
                    .bind(branch.xid.as_str())
                    .bind(branch.branch_id.as_i64())
                    .bind(R::kind())
                    .bind(FENCED)
                    .execute(&mut *tx)
                    .await?;

                    tx.commit().await?;
                    metrics::counter!("before_images_restored_total", "kind" => R::kind())
                        .increment(1);
                    return Ok(RollbackOutcome::Restored);
                }
                None => {
                    let inserted = sqlx::query(
                        r#"
                        INSERT INTO undo_log (xid, branch_id, resource_kind, state)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT DO NOTHING
                        "#,
                    )
                    .bind(branch.xid.as_str())
                    .bind(branch.branch_id.as_i64())
                    .bind(R::kind())
                    .bind(FENCED)
                    .execute(&mut *tx)
                    .await?;

                    tx.commit().await?;
                    if inserted.rows_affected() > 0 {
                        return Ok(RollbackOutcome::NothingToUndo);
                    }
                    // An apply committed its record concurrently; read it again.
                    tracing::debug!(%branch, "rollback raced an apply, retrying");
                }
            }
        }
    }

    async fn compensation_record(&self, branch: &BranchKey) -> Result<Option<CompensationRecord>> {
        let row = sqlx::query(
            r#"
            SELECT xid, branch_id, resource_kind, resource_key, before_image, logged_at
            FROM undo_log
            WHERE xid = $1 AND branch_id = $2 AND resource_kind = $3 AND state = 'pending'
            "#,
        )
        .bind(branch.xid.as_str())
        .bind(branch.branch_id.as_i64())
        .bind(R::kind())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn pending_records(&self) -> Result<Vec<CompensationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT xid, branch_id, resource_kind, resource_key, before_image, logged_at
            FROM undo_log
            WHERE resource_kind = $1 AND state = 'pending'
            ORDER BY logged_at ASC, branch_id ASC
            "#,
        )
        .bind(R::kind())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn is_fenced(&self, branch: &BranchKey) -> Result<bool> {
        let fenced: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM undo_log
                WHERE xid = $1 AND branch_id = $2 AND resource_kind = $3 AND state = 'fenced'
            )
            "#,
        )
        .bind(branch.xid.as_str())
        .bind(branch.branch_id.as_i64())
        .bind(R::kind())
        .fetch_one(&self.pool)
        .await?;
        Ok(fenced)
    }

    async fn purge_fences(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM undo_log WHERE resource_kind = $1 AND state = 'fenced' AND logged_at < $2",
        )
        .bind(R::kind())
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

/// PostgreSQL-backed transaction journal.
#[derive(Clone)]
pub struct PostgresTransactionLog {
    pool: PgPool,
}

impl PostgresTransactionLog {
    /// Creates a new PostgreSQL transaction journal.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: PgRow) -> Result<JournalEntry> {
        let xid: String = row.try_get("xid")?;
        Ok(JournalEntry {
            xid: parse_xid(&xid)?,
            sequence: Sequence::new(row.try_get("sequence")?),
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

#[async_trait]
impl TransactionLog for PostgresTransactionLog {
    async fn append(&self, entries: Vec<JournalEntry>, options: AppendOptions) -> Result<Sequence> {
        validate_entries_for_append(&entries)?;

        let xid = entries[0].xid.clone();
        let mut tx = self.pool.begin().await?;

        // The head row serializes writers of one transaction.
        sqlx::query("INSERT INTO transaction_heads (xid) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(xid.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT xid FROM transaction_heads WHERE xid = $1 FOR UPDATE")
            .bind(xid.as_str())
            .execute(&mut *tx)
            .await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM transaction_journal WHERE xid = $1")
                .bind(xid.as_str())
                .fetch_one(&mut *tx)
                .await?;
        let current = Sequence::new(current.unwrap_or(0));

        if let Some(expected) = options.expected_sequence
            && current != expected
        {
            return Err(StoreError::ConcurrencyConflict {
                xid,
                expected,
                actual: current,
            });
        }

        if entries[0].sequence != current.next() {
            return Err(StoreError::ConcurrencyConflict {
                xid,
                expected: options.expected_sequence.unwrap_or(current),
                actual: current,
            });
        }

        let mut last = current;
        for entry in &entries {
            sqlx::query(
                r#"
                INSERT INTO transaction_journal (xid, sequence, event_type, payload, recorded_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(entry.xid.as_str())
            .bind(entry.sequence.as_i64())
            .bind(&entry.event_type)
            .bind(&entry.payload)
            .bind(entry.recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    return StoreError::ConcurrencyConflict {
                        xid: xid.clone(),
                        expected: options.expected_sequence.unwrap_or(current),
                        actual: entry.sequence,
                    };
                }
                StoreError::Database(e)
            })?;
            last = entry.sequence;
        }

        if options.close {
            sqlx::query("UPDATE transaction_heads SET closed = TRUE WHERE xid = $1")
                .bind(xid.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(last)
    }

    async fn load(&self, xid: &Xid) -> Result<Vec<JournalEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT xid, sequence, event_type, payload, recorded_at
            FROM transaction_journal
            WHERE xid = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(xid.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn open_transactions(&self) -> Result<Vec<Xid>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT xid FROM transaction_heads WHERE NOT closed ORDER BY created_at ASC, xid ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|xid| parse_xid(xid)).collect()
    }
}
