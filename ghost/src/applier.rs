//! All writes against the target server: shadow/changelog table creation,
//! chunked row-copy, idempotent DML replay, and cut-over DDL. Built on
//! `mysql_async` (see DESIGN.md for why this replaces the teacher's own
//! unreachable hand-rolled driver crates): a long-lived control
//! connection for DDL and cut-over, plus a small pool for per-chunk/
//! per-batch transactions (§9 "connection pooling").

use std::time::Duration;

use mysql_async::prelude::*;
use mysql_async::{Conn, IsolationLevel, Opts, OptsBuilder, Pool, TxOpts, Value};
use tracing::{info, instrument};

use crate::context::ConnectionConfig;
use crate::error::GhostError;
use crate::model::{shadow_table_name, BinlogDmlEvent, ColumnList, DmlEventKind};

pub enum CutOverStyle {
    Atomic,
    TwoStep,
}

/// What the caller's drain callback wants `cut_over_atomic` to do next,
/// polled in a loop while the table lock is held (§4.3's step (b): "wait
/// until the streamer confirms it has consumed all events up to the
/// sentinel"). `Apply` is handled on the same locked session, since only
/// the session holding `LOCK TABLES` may write to the locked tables.
pub enum CutOverDrainStep {
    Apply(Box<BinlogDmlEvent>),
    Waiting,
    Done,
}

pub struct Applier {
    pool: Pool,
    control: Conn,
}

fn opts_for(conn: &ConnectionConfig, database: &str) -> Opts {
    OptsBuilder::default()
        .ip_or_hostname(conn.host.clone())
        .tcp_port(conn.port)
        .user(Some(conn.user.clone()))
        .pass(Some(conn.password.clone()))
        .db_name(Some(database.to_string()))
        .into()
}

impl Applier {
    pub async fn connect(conn: &ConnectionConfig, database: &str) -> Result<Self, GhostError> {
        let opts = opts_for(conn, database);
        let pool = Pool::new(opts.clone());
        let control = Conn::new(opts).await?;
        Ok(Applier { pool, control })
    }

    /// `CREATE TABLE _<orig>_gho LIKE original`, then the user's `ALTER`
    /// applied against the shadow copy.
    #[instrument(skip(self))]
    pub async fn create_shadow_table(&mut self, database: &str, table: &str, alter: &str, drop_existing: bool) -> Result<String, GhostError> {
        let shadow = shadow_table_name(table);
        if drop_existing {
            self.control
                .query_drop(format!("DROP TABLE IF EXISTS `{database}`.`{shadow}`"))
                .await?;
        } else {
            let exists: Option<String> = self
                .control
                .exec_first(
                    "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                    (database, &shadow),
                )
                .await?;
            if exists.is_some() {
                return Err(GhostError::FatalTopology(format!(
                    "shadow table {shadow} already exists; pass --initially-drop-ghost-table to replace it"
                )));
            }
        }
        self.control
            .query_drop(format!("CREATE TABLE `{database}`.`{shadow}` LIKE `{database}`.`{table}`"))
            .await?;
        self.control
            .query_drop(format!("ALTER TABLE `{database}`.`{shadow}` {alter}"))
            .await?;
        info!(shadow, "created shadow table");
        Ok(shadow)
    }

    /// `_<orig>_ghc (id bigint auto_increment, hint varchar, value varchar)`.
    #[instrument(skip(self))]
    pub async fn create_changelog_table(&mut self, database: &str, table: &str, drop_existing: bool) -> Result<String, GhostError> {
        let changelog = crate::model::changelog_table_name(table);
        if drop_existing {
            self.control
                .query_drop(format!("DROP TABLE IF EXISTS `{database}`.`{changelog}`"))
                .await?;
        }
        self.control
            .query_drop(format!(
                "CREATE TABLE `{database}`.`{changelog}` (\
                    id BIGINT AUTO_INCREMENT, \
                    hint VARCHAR(64) NOT NULL, \
                    value VARCHAR(255) NOT NULL, \
                    PRIMARY KEY(id), \
                    UNIQUE KEY uidx_hint (hint))"
            ))
            .await?;
        Ok(changelog)
    }

    /// Inserts (or updates, keyed by `hint`) a changelog row — used for
    /// heartbeats and for the cut-over sentinel.
    pub async fn write_changelog(&mut self, database: &str, table: &str, hint: &str, value: &str) -> Result<(), GhostError> {
        let changelog = crate::model::changelog_table_name(table);
        self.control
            .exec_drop(
                format!(
                    "INSERT INTO `{database}`.`{changelog}` (hint, value) VALUES (:hint, :value) \
                     ON DUPLICATE KEY UPDATE value = VALUES(value)"
                ),
                mysql_async::params! { "hint" => hint, "value" => value },
            )
            .await?;
        Ok(())
    }

    /// One chunk = one transaction. Resolves `new_max` with a bounded
    /// lookahead SELECT, then copies `(last_max, new_max]` with
    /// `INSERT IGNORE`, which makes the statement safe against a
    /// DML-replay that has already written the same row. Returns the new
    /// high-water mark, or `None` when row-copy is done (empty result).
    ///
    /// `original_columns` and `shadow_columns` are the same length, paired
    /// positionally: `original_columns[i]` is the name to read from the
    /// source table, `shadow_columns[i]` the name to write on the shadow
    /// table. They differ only where the `ALTER` renames a column, in which
    /// case the generated `SELECT` aliases the source name to the shadow
    /// name (§4.3 "Column mapping") rather than reusing one column list for
    /// both sides of the `INSERT ... SELECT`.
    #[instrument(skip(self, original_columns, shadow_columns))]
    pub async fn copy_chunk(
        &mut self,
        database: &str,
        table: &str,
        shadow_table: &str,
        key_columns: &[String],
        original_columns: &[String],
        shadow_columns: &[String],
        last_max: Option<&[Value]>,
        chunk_size: u32,
    ) -> Result<Option<Vec<Value>>, GhostError> {
        let mut tx = self
            .pool
            .start_transaction(TxOpts::default().with_isolation_level(IsolationLevel::RepeatableRead))
            .await?;

        let key_tuple = key_columns.iter().map(|c| format!("`{c}`")).collect::<Vec<_>>().join(", ");
        let where_clause = match last_max {
            Some(_) => format!("WHERE ({key_tuple}) > ({})", placeholders(key_columns.len())),
            None => String::new(),
        };

        let lookahead = format!(
            "SELECT {key_tuple} FROM `{database}`.`{table}` {where_clause} ORDER BY {key_tuple} LIMIT {chunk_size}, 1"
        );
        let new_max: Option<Vec<Value>> = match last_max {
            Some(vals) => tx.exec_first(lookahead, vals.to_vec()).await?,
            None => tx.query_first(lookahead).await?,
        };

        let Some(new_max) = new_max else {
            tx.commit().await?;
            return Ok(None);
        };

        let insert_cols = shadow_columns.iter().map(|c| format!("`{c}`")).collect::<Vec<_>>().join(", ");
        let select_cols = original_columns
            .iter()
            .zip(shadow_columns.iter())
            .map(|(orig, shadow)| if orig == shadow { format!("`{orig}`") } else { format!("`{orig}` AS `{shadow}`") })
            .collect::<Vec<_>>()
            .join(", ");
        let upper_clause = format!("AND ({key_tuple}) <= ({})", placeholders(key_columns.len()));
        let insert = format!(
            "INSERT IGNORE INTO `{database}`.`{shadow_table}` ({insert_cols}) \
             SELECT {select_cols} FROM `{database}`.`{table}` {where_clause} {upper_clause} \
             ORDER BY {key_tuple} LIMIT {chunk_size} LOCK IN SHARE MODE"
        );
        let mut params = last_max.map(|v| v.to_vec()).unwrap_or_default();
        params.extend(new_max.iter().cloned());
        tx.exec_drop(insert, params).await?;

        tx.commit().await?;
        Ok(Some(new_max))
    }

    /// Applies a batch of up to `dml_batch_size` events, ordered by
    /// source binlog position, in one transaction. `REPLACE` for insert,
    /// idempotent keyed `UPDATE`/`DELETE` otherwise.
    #[instrument(skip(self, events))]
    pub async fn apply_dml_batch(
        &mut self,
        database: &str,
        shadow_table: &str,
        key_columns: &[String],
        shared_columns: &ColumnList,
        events: &[BinlogDmlEvent],
    ) -> Result<(), GhostError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.start_transaction(TxOpts::default()).await?;
        for event in events {
            apply_dml_event(&mut tx, database, shadow_table, key_columns, shared_columns, event).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Atomic cut-over. `LOCK TABLES original WRITE, shadow WRITE`; then,
    /// still holding the lock, repeatedly calls `next_step` to drain the
    /// DML events that were already in flight when the lock was taken —
    /// applying each directly on the locked session, since only the
    /// session holding the lock may write to locked tables — until it
    /// reports `Done` (the streamer has confirmed the cut-over sentinel
    /// consumed) or `lock_timeout_seconds` elapses. Session B then issues
    /// the rename, which blocks behind the lock; session A unlocks,
    /// completing the swap atomically. If session A dies before
    /// unlocking, session B's pending rename still proceeds once the
    /// connection drops, keeping the swap consistent.
    #[instrument(skip(self, next_step))]
    pub async fn cut_over_atomic<S>(
        &mut self,
        database: &str,
        table: &str,
        shadow_table: &str,
        old_table: &str,
        key_columns: &[String],
        shared_columns: &ColumnList,
        lock_timeout_seconds: u32,
        mut next_step: S,
    ) -> Result<Vec<BinlogDmlEvent>, GhostError>
    where
        S: FnMut() -> CutOverDrainStep,
    {
        self.control
            .query_drop(format!("SET SESSION lock_wait_timeout = {lock_timeout_seconds}"))
            .await?;
        self.control
            .query_drop(format!(
                "LOCK TABLES `{database}`.`{table}` WRITE, `{database}`.`{shadow_table}` WRITE"
            ))
            .await?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(lock_timeout_seconds.max(1) as u64);
        let mut applied = Vec::new();
        loop {
            match next_step() {
                CutOverDrainStep::Apply(event) => {
                    if let Err(e) = apply_dml_event(&mut self.control, database, shadow_table, key_columns, shared_columns, &event).await {
                        let _ = self.control.query_drop("UNLOCK TABLES").await;
                        return Err(e);
                    }
                    applied.push(*event);
                }
                CutOverDrainStep::Done => break,
                CutOverDrainStep::Waiting => {
                    if tokio::time::Instant::now() >= deadline {
                        let _ = self.control.query_drop("UNLOCK TABLES").await;
                        return Err(GhostError::Transient(
                            "timed out under cut-over lock waiting for replay to reach the sentinel".to_string(),
                        ));
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }

        let mut rename_conn = match self.pool.get_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = self.control.query_drop("UNLOCK TABLES").await;
                return Err(e.into());
            }
        };
        if let Err(e) = rename_conn
            .query_drop(format!(
                "RENAME TABLE `{database}`.`{table}` TO `{database}`.`{old_table}`, \
                 `{database}`.`{shadow_table}` TO `{database}`.`{table}`"
            ))
            .await
        {
            let _ = self.control.query_drop("UNLOCK TABLES").await;
            return Err(e.into());
        }

        self.control.query_drop("UNLOCK TABLES").await?;
        Ok(applied)
    }

    #[instrument(skip(self))]
    pub async fn cut_over_two_step(&mut self, database: &str, table: &str, shadow_table: &str, old_table: &str) -> Result<(), GhostError> {
        self.control
            .query_drop(format!("RENAME TABLE `{database}`.`{table}` TO `{database}`.`{old_table}`"))
            .await?;
        self.control
            .query_drop(format!("RENAME TABLE `{database}`.`{shadow_table}` TO `{database}`.`{table}`"))
            .await?;
        Ok(())
    }

    pub async fn drop_table(&mut self, database: &str, table: &str) -> Result<(), GhostError> {
        self.control.query_drop(format!("DROP TABLE IF EXISTS `{database}`.`{table}`")).await?;
        Ok(())
    }

    /// The second half of a `--test-on-replica` cut-over: having just
    /// proven the rename works, swap the original straight back into
    /// place so a read replica under test keeps serving the unaltered
    /// table rather than staying cut over (§4.6). Assumes replication
    /// into this host is already stopped, per the `--test-on-replica`
    /// precondition documented in SPEC_FULL.md §9.
    #[instrument(skip(self))]
    pub async fn swap_back(&mut self, database: &str, table: &str, shadow_table: &str, old_table: &str) -> Result<(), GhostError> {
        self.control
            .query_drop(format!("RENAME TABLE `{database}`.`{table}` TO `{database}`.`{shadow_table}`"))
            .await?;
        self.control
            .query_drop(format!("RENAME TABLE `{database}`.`{old_table}` TO `{database}`.`{table}`"))
            .await?;
        info!("swapped original table back into place (--test-on-replica)");
        Ok(())
    }
}

/// Applies one DML event's idempotent-form statement (§4.3's transform
/// table) against any `Queryable` — a pooled transaction for the regular
/// row-copy/replay path, or the locked control connection during
/// cut-over's final drain. Kept generic so both paths share one
/// definition of the replay contract instead of drifting apart.
async fn apply_dml_event<Q: Queryable>(
    q: &mut Q,
    database: &str,
    shadow_table: &str,
    key_columns: &[String],
    shared_columns: &ColumnList,
    event: &BinlogDmlEvent,
) -> Result<(), GhostError> {
    match event.kind {
        DmlEventKind::Insert => {
            let after = event.after_image.as_ref().expect("insert carries an after image");
            let cols = shared_columns.names().iter().map(|c| format!("`{c}`")).collect::<Vec<_>>().join(", ");
            let stmt = format!(
                "REPLACE INTO `{database}`.`{shadow_table}` ({cols}) VALUES ({})",
                placeholders(after.len())
            );
            let result = q.exec_drop(stmt, after.clone()).await;
            propagate_unless_expected(result, true)
        }
        DmlEventKind::Update => {
            let before = event.before_image.as_ref().expect("update carries a before image");
            let after = event.after_image.as_ref().expect("update carries an after image");
            let set_clause = shared_columns
                .names()
                .iter()
                .map(|c| format!("`{c}` = ?"))
                .collect::<Vec<_>>()
                .join(", ");
            let key_values = key_values_from(key_columns, shared_columns, before);
            let where_clause = key_columns.iter().map(|c| format!("`{c}` = ?")).collect::<Vec<_>>().join(" AND ");
            let stmt = format!("UPDATE `{database}`.`{shadow_table}` SET {set_clause} WHERE {where_clause}");
            let mut params = after.clone();
            params.extend(key_values);
            let result = q.exec_drop(stmt, params).await;
            propagate_unless_expected(result, false)
        }
        DmlEventKind::Delete => {
            let before = event.before_image.as_ref().expect("delete carries a before image");
            let key_values = key_values_from(key_columns, shared_columns, before);
            let where_clause = key_columns.iter().map(|c| format!("`{c}` = ?")).collect::<Vec<_>>().join(" AND ");
            let stmt = format!("DELETE FROM `{database}`.`{shadow_table}` WHERE {where_clause}");
            let result = q.exec_drop(stmt, key_values).await;
            propagate_unless_expected(result, false)
        }
    }
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(", ")
}

fn key_values_from(key_columns: &[String], shared_columns: &ColumnList, image: &[Value]) -> Vec<Value> {
    key_columns
        .iter()
        .map(|k| {
            let idx = shared_columns.position_of(k).expect("key column is part of shared columns");
            image[idx].clone()
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{ColumnDescriptor, ColumnList};

    #[test]
    fn placeholders_builds_one_per_column() {
        assert_eq!(placeholders(0), "");
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn key_values_extracts_key_columns_from_image_in_order() {
        let shared = ColumnList::new(vec![
            ColumnDescriptor { name: "a".into(), sql_type: "int".into(), charset: None, is_nullable: false, is_unsigned: false },
            ColumnDescriptor { name: "id".into(), sql_type: "int".into(), charset: None, is_nullable: false, is_unsigned: false },
            ColumnDescriptor { name: "b".into(), sql_type: "int".into(), charset: None, is_nullable: true, is_unsigned: false },
        ]);
        let image = vec![Value::Int(1), Value::Int(42), Value::NULL];
        let keys = key_values_from(&["id".to_string()], &shared, &image);
        assert_eq!(keys, vec![Value::Int(42)]);
    }

    #[test]
    fn key_values_preserves_multi_column_key_order() {
        let shared = ColumnList::new(vec![
            ColumnDescriptor { name: "tenant".into(), sql_type: "int".into(), charset: None, is_nullable: false, is_unsigned: false },
            ColumnDescriptor { name: "seq".into(), sql_type: "int".into(), charset: None, is_nullable: false, is_unsigned: false },
        ]);
        let image = vec![Value::Int(7), Value::Int(100)];
        let keys = key_values_from(&["seq".to_string(), "tenant".to_string()], &shared, &image);
        assert_eq!(keys, vec![Value::Int(100), Value::Int(7)]);
    }
}

/// Classifies a statement error the way the applier is required to:
/// lock-wait timeout/deadlock are transient, duplicate key during an
/// `INSERT IGNORE`-equivalent path is expected, anything else is fatal.
fn propagate_unless_expected(result: mysql_async::Result<()>, during_insert_ignore_equivalent: bool) -> Result<(), GhostError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => match GhostError::classify_statement_error(e, during_insert_ignore_equivalent) {
            Some(classified) => Err(classified),
            None => Ok(()),
        },
    }
}
