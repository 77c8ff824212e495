//! Validates topology and discovers the original table's columns, keys,
//! engine, and row count. Connects to the inspection host (ideally a
//! replica) over `mysql_async`.

use mysql_async::prelude::*;
use mysql_async::{Conn, Row};
use tracing::{info, instrument, warn};

use crate::context::ConnectionConfig;
use crate::coordinates::BinlogCoordinates;
use crate::error::GhostError;
use crate::model::{select_shared_unique_key, ColumnDescriptor, ColumnList, UniqueKey};

pub struct InspectionOptions {
    pub assume_master_host: Option<String>,
    pub allow_on_master: bool,
    pub allow_master_master: bool,
    pub assume_rbr: bool,
    /// `--switch-to-rbr`: actively flip `binlog_format` to `ROW` on the
    /// inspected host rather than merely assuming it already is.
    pub switch_to_rbr: bool,
    pub allow_nullable_unique_key: bool,
    pub exact_rowcount: bool,
    /// `--discard-foreign-keys`: migrate a table that has foreign keys
    /// anyway, without recreating them on the shadow table.
    pub discard_foreign_keys: bool,
    /// `--skip-foreign-key-checks`: trust the operator that there are none
    /// and skip the `INFORMATION_SCHEMA` round-trip that would prove it.
    pub skip_foreign_key_checks: bool,
}

pub struct Inspector {
    conn: Conn,
}

pub struct InspectionResult {
    pub columns: ColumnList,
    pub candidate_keys: Vec<UniqueKey>,
    pub shared_key: UniqueKey,
    pub estimated_row_count: u64,
    pub start_coordinates: BinlogCoordinates,
}

impl Inspector {
    pub async fn connect(conn: &ConnectionConfig) -> Result<Self, GhostError> {
        let opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(conn.host.clone())
            .tcp_port(conn.port)
            .user(Some(conn.user.clone()))
            .pass(Some(conn.password.clone()));
        Ok(Inspector { conn: Conn::new(opts).await? })
    }

    #[instrument(skip(self))]
    pub async fn validate_topology(&mut self, host: &str, opts: &InspectionOptions) -> Result<(), GhostError> {
        let is_master = self.is_master_host().await?;
        let host_effectively_checked = opts.assume_master_host.as_deref().unwrap_or(host);
        if is_master && !opts.allow_on_master && opts.assume_master_host.as_deref() != Some(host_effectively_checked) {
            return Err(GhostError::FatalTopology(format!(
                "{host} is a master; pass --allow-on-master or --assume-master-host to proceed"
            )));
        }

        // A host that is simultaneously a replica (has slave status) and has
        // its own replicas reading from it (SHOW MASTER STATUS returns a
        // binlog position, meaning binary logging of replicated writes is
        // enabled) is part of a master-master pair; unguarded, the engine's
        // own writes to the shadow/changelog tables could loop back through
        // the peer and be replayed a second time.
        if !is_master && !opts.allow_master_master && self.has_downstream_replicas().await? {
            return Err(GhostError::FatalTopology(
                "host appears to be part of a master-master topology; pass --allow-master-master to proceed".to_string(),
            ));
        }

        let row_image: Option<String> = self
            .conn
            .query_first("SELECT @@global.binlog_row_image")
            .await
            .unwrap_or(None);
        match row_image.as_deref() {
            Some(v) if v.eq_ignore_ascii_case("FULL") => {}
            Some(v) => warn!(value = v, "binlog_row_image is not FULL; before_image may be missing columns"),
            None => warn!("could not read @@global.binlog_row_image"),
        }

        let binlog_format: Option<String> = self.conn.query_first("SELECT @@global.binlog_format").await?;
        match binlog_format.as_deref() {
            Some(v) if v.eq_ignore_ascii_case("ROW") => {}
            Some(_) if opts.switch_to_rbr => {
                self.conn.query_drop("SET GLOBAL binlog_format = 'ROW'").await?;
                self.conn.query_drop("SET SESSION binlog_format = 'ROW'").await?;
                info!("switched binlog_format to ROW on the inspected host");
            }
            Some(_) if opts.assume_rbr => {}
            other => {
                return Err(GhostError::FatalTopology(format!(
                    "binlog_format must be ROW, got {other:?} (pass --switch-to-rbr to set it or --assume-rbr to override)"
                )))
            }
        }

        Ok(())
    }

    async fn is_master_host(&mut self) -> Result<bool, GhostError> {
        let slave_status: Option<Row> = self.conn.query_first("SHOW SLAVE STATUS").await.unwrap_or(None);
        Ok(slave_status.is_none())
    }

    /// True if this replica also has its own binary log position (i.e. it
    /// is itself acting as a master to some other host), the signature of
    /// a master-master pair rather than a plain linear replica.
    async fn has_downstream_replicas(&mut self) -> Result<bool, GhostError> {
        let master_status: Option<Row> = self.conn.query_first("SHOW MASTER STATUS").await.unwrap_or(None);
        Ok(master_status.is_some())
    }

    /// Foreign keys must be either absent or explicitly discarded via
    /// `--discard-foreign-keys`; triggers on the original table are never
    /// supported (§4.2, Non-goals: "maintaining triggers on the target
    /// table"). `--skip-foreign-key-checks` trusts the operator and skips
    /// the `INFORMATION_SCHEMA` query entirely.
    #[instrument(skip(self))]
    pub async fn validate_foreign_keys_and_triggers(
        &mut self,
        database: &str,
        table: &str,
        opts: &InspectionOptions,
    ) -> Result<(), GhostError> {
        if !opts.skip_foreign_key_checks {
            let foreign_keys: Vec<String> = self
                .conn
                .exec(
                    "SELECT CONSTRAINT_NAME FROM INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS \
                     WHERE CONSTRAINT_SCHEMA = ? AND TABLE_NAME = ?",
                    (database, table),
                )
                .await?;
            if !foreign_keys.is_empty() && !opts.discard_foreign_keys {
                return Err(GhostError::FatalTopology(format!(
                    "table {database}.{table} has foreign key(s) {foreign_keys:?}; pass --discard-foreign-keys to proceed without them on the shadow table"
                )));
            }
        }

        let triggers: Vec<String> = self
            .conn
            .exec(
                "SELECT TRIGGER_NAME FROM INFORMATION_SCHEMA.TRIGGERS \
                 WHERE (EVENT_OBJECT_SCHEMA = ? AND EVENT_OBJECT_TABLE = ?) \
                    OR (TRIGGER_SCHEMA = ? AND EVENT_OBJECT_TABLE = ?)",
                (database, table, database, table),
            )
            .await?;
        if !triggers.is_empty() {
            return Err(GhostError::FatalTopology(format!(
                "table {database}.{table} has trigger(s) {triggers:?}; triggers on the target table are not supported"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn discover_columns(&mut self, database: &str, table: &str) -> Result<ColumnList, GhostError> {
        let rows: Vec<(String, String, Option<String>, String, String)> = self
            .conn
            .exec(
                "SELECT COLUMN_NAME, DATA_TYPE, CHARACTER_SET_NAME, IS_NULLABLE, COLUMN_TYPE \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
                (database, table),
            )
            .await?;

        if rows.is_empty() {
            return Err(GhostError::FatalTopology(format!("table {database}.{table} has no columns (does it exist?)")));
        }

        let columns = rows
            .into_iter()
            .map(|(name, sql_type, charset, is_nullable, column_type)| ColumnDescriptor {
                name,
                sql_type,
                charset,
                is_nullable: is_nullable.eq_ignore_ascii_case("YES"),
                is_unsigned: column_type.to_lowercase().contains("unsigned"),
            })
            .collect();
        Ok(ColumnList::new(columns))
    }

    #[instrument(skip(self))]
    pub async fn discover_unique_keys(&mut self, database: &str, table: &str) -> Result<Vec<UniqueKey>, GhostError> {
        let rows: Vec<(String, String, i32)> = self
            .conn
            .exec(
                "SELECT s.INDEX_NAME, s.COLUMN_NAME, s.SEQ_IN_INDEX \
                 FROM INFORMATION_SCHEMA.STATISTICS s \
                 WHERE s.TABLE_SCHEMA = ? AND s.TABLE_NAME = ? AND s.NON_UNIQUE = 0 \
                 ORDER BY s.INDEX_NAME, s.SEQ_IN_INDEX",
                (database, table),
            )
            .await?;

        let nullable_columns: Vec<String> = self
            .conn
            .exec(
                "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND IS_NULLABLE = 'YES'",
                (database, table),
            )
            .await?;

        let mut keys: Vec<UniqueKey> = Vec::new();
        for (index_name, column_name, _seq) in rows {
            if let Some(key) = keys.iter_mut().find(|k: &&mut UniqueKey| k.name == index_name) {
                key.columns.push(column_name.clone());
                key.has_nullable |= nullable_columns.contains(&column_name);
            } else {
                keys.push(UniqueKey {
                    name: index_name.clone(),
                    columns: vec![column_name.clone()],
                    is_primary: index_name == "PRIMARY",
                    has_nullable: nullable_columns.contains(&column_name),
                });
            }
        }

        if keys.is_empty() {
            return Err(GhostError::FatalTopology(format!("table {database}.{table} has no usable unique key")));
        }
        Ok(keys)
    }

    pub async fn select_key(&self, candidates: &[UniqueKey], allow_nullable_unique_key: bool) -> Result<UniqueKey, GhostError> {
        select_shared_unique_key(candidates, allow_nullable_unique_key)
            .ok_or_else(|| GhostError::FatalTopology("no usable unique key found".to_string()))
    }

    #[instrument(skip(self))]
    pub async fn estimate_row_count(&mut self, database: &str, table: &str, exact: bool) -> Result<u64, GhostError> {
        if exact {
            let count: u64 = self
                .conn
                .query_first(format!("SELECT COUNT(*) FROM `{database}`.`{table}`"))
                .await?
                .unwrap_or(0);
            Ok(count)
        } else {
            let row: Option<(String, String, Option<u64>)> = self
                .conn
                .exec_first(
                    "SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_ROWS FROM INFORMATION_SCHEMA.TABLES \
                     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                    (database, table),
                )
                .await?;
            Ok(row.and_then(|(_, _, rows)| rows).unwrap_or(0))
        }
    }

    #[instrument(skip(self))]
    pub async fn current_binlog_coordinates(&mut self) -> Result<BinlogCoordinates, GhostError> {
        let row: Option<(String, u64)> = self.conn.query_first("SHOW MASTER STATUS").await?;
        match row {
            Some((file, pos)) => Ok(BinlogCoordinates::file(file, pos)),
            None => Err(GhostError::FatalTopology(
                "SHOW MASTER STATUS returned no rows; is binary logging enabled?".to_string(),
            )),
        }
    }
}
