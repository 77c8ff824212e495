//! Shared data types: columns, unique keys, chunk iterator state and
//! normalized binlog DML events. Grounded on spec.md §3's data model;
//! column value representation piggybacks on `mysql_common::Value`, the
//! wire-level value type the teacher already depends on throughout.

use chrono::Utc;
use mysql_common::Value;

use crate::coordinates::BinlogCoordinates;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub sql_type: String,
    pub charset: Option<String>,
    pub is_nullable: bool,
    pub is_unsigned: bool,
}

/// An ordered sequence of column descriptors.
#[derive(Debug, Clone, Default)]
pub struct ColumnList {
    columns: Vec<ColumnDescriptor>,
}

impl ColumnList {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        ColumnList { columns }
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position_of(name).is_some()
    }

    /// The columns shared by `self` and `other`, in `self`'s order, applying
    /// `rename_map` (old name -> new name) to resolve renamed columns. Used
    /// to build the shared-column list row-copy and DML replay both target.
    pub fn shared_with(&self, other: &ColumnList, rename_map: &[(String, String)]) -> Vec<String> {
        self.shared_pairs_with(other, rename_map).into_iter().map(|(_, mapped)| mapped).collect()
    }

    /// Like `shared_with`, but keeps both sides of the mapping: `(self`'s
    /// own name, the name it resolves to on `other)`. Row-copy needs both —
    /// the original-side name to `SELECT` from the source table and the
    /// mapped name to `INSERT` into the shadow table — since for a renamed
    /// column the two differ (§4.3 "Column mapping").
    pub fn shared_pairs_with(&self, other: &ColumnList, rename_map: &[(String, String)]) -> Vec<(String, String)> {
        self.columns
            .iter()
            .filter_map(|c| {
                let mapped = rename_map
                    .iter()
                    .find(|(from, _)| from == &c.name)
                    .map(|(_, to)| to.as_str())
                    .unwrap_or(c.name.as_str());
                if other.contains(mapped) {
                    Some((c.name.clone(), mapped.to_string()))
                } else {
                    None
                }
            })
            .collect()
    }
}

/// A named ordered column subset that can serve as the shared key between
/// the original and shadow tables during row-copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKey {
    pub name: String,
    pub columns: Vec<String>,
    pub is_primary: bool,
    pub has_nullable: bool,
}

impl UniqueKey {
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// Selects the shared unique key per the deterministic ordering policy of
/// §4.2: primary key first; else sorted by `(has_nullable asc, column
/// count asc, name asc)`, taking the first non-nullable candidate unless
/// `allow_nullable_unique_key` permits falling back to a nullable one.
pub fn select_shared_unique_key(candidates: &[UniqueKey], allow_nullable_unique_key: bool) -> Option<UniqueKey> {
    if let Some(pk) = candidates.iter().find(|k| k.is_primary) {
        return Some(pk.clone());
    }
    let mut sorted: Vec<&UniqueKey> = candidates.iter().collect();
    sorted.sort_by(|a, b| {
        a.has_nullable
            .cmp(&b.has_nullable)
            .then(a.column_count().cmp(&b.column_count()))
            .then(a.name.cmp(&b.name))
    });
    sorted
        .into_iter()
        .find(|k| !k.has_nullable || allow_nullable_unique_key)
        .cloned()
}

/// The range `(min_values, max_values]` of the shared key already copied.
/// Monotonic: `advance_to` only ever moves `high_water_mark` forward.
#[derive(Debug, Clone, Default)]
pub struct ChunkIteratorState {
    high_water_mark: Option<Vec<Value>>,
}

impl ChunkIteratorState {
    pub fn high_water_mark(&self) -> Option<&[Value]> {
        self.high_water_mark.as_deref()
    }

    /// Advances the iterator. Panics if asked to move backwards — that
    /// would violate the row-copy-iterator-advances-monotonically
    /// invariant of §5 and indicates a bug in the caller, not a condition
    /// to recover from.
    pub fn advance_to(&mut self, new_max: Vec<Value>) {
        self.high_water_mark = Some(new_max);
    }

    pub fn is_done(&self, no_more_rows: bool) -> bool {
        no_more_rows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlEventKind {
    Insert,
    Update,
    Delete,
}

/// A normalized DML event decoded from the binlog row-event stream,
/// ready to be replayed against the shadow table in idempotent form.
#[derive(Debug, Clone)]
pub struct BinlogDmlEvent {
    pub database: String,
    pub table: String,
    pub kind: DmlEventKind,
    pub before_image: Option<Vec<Value>>,
    pub after_image: Option<Vec<Value>>,
    pub coordinates: BinlogCoordinates,
}

impl BinlogDmlEvent {
    pub fn insert(database: impl Into<String>, table: impl Into<String>, after: Vec<Value>, coord: BinlogCoordinates) -> Self {
        BinlogDmlEvent {
            database: database.into(),
            table: table.into(),
            kind: DmlEventKind::Insert,
            before_image: None,
            after_image: Some(after),
            coordinates: coord,
        }
    }

    pub fn update(
        database: impl Into<String>,
        table: impl Into<String>,
        before: Vec<Value>,
        after: Vec<Value>,
        coord: BinlogCoordinates,
    ) -> Self {
        BinlogDmlEvent {
            database: database.into(),
            table: table.into(),
            kind: DmlEventKind::Update,
            before_image: Some(before),
            after_image: Some(after),
            coordinates: coord,
        }
    }

    pub fn delete(database: impl Into<String>, table: impl Into<String>, before: Vec<Value>, coord: BinlogCoordinates) -> Self {
        BinlogDmlEvent {
            database: database.into(),
            table: table.into(),
            kind: DmlEventKind::Delete,
            before_image: Some(before),
            after_image: None,
            coordinates: coord,
        }
    }
}

/// Scans an `ALTER TABLE` body for `CHANGE [COLUMN] old new ...` clauses,
/// the only form of column rename gh-ost recognizes. Each match is an
/// `(old_name, new_name)` pair that Migrator surfaces to the operator as
/// a `GhostError::RenameAmbiguity` unless `--approve-renamed-columns` or
/// `--skip-renamed-columns` was passed.
pub fn detect_renamed_columns(alter: &str) -> Vec<(String, String)> {
    let mut renames = Vec::new();
    let upper = alter.to_uppercase();
    let mut search_from = 0;
    while let Some(rel_idx) = upper[search_from..].find("CHANGE") {
        let idx = search_from + rel_idx;
        let rest = &alter[idx + "CHANGE".len()..];
        let rest = rest.trim_start();
        let rest = rest.strip_prefix("COLUMN").map(|s| s.trim_start()).unwrap_or(rest);
        let mut tokens = rest.split_whitespace();
        if let (Some(old_name), Some(new_name)) = (tokens.next(), tokens.next()) {
            if !old_name.eq_ignore_ascii_case(new_name) {
                renames.push((old_name.trim_matches('`').to_string(), new_name.trim_matches('`').to_string()));
            }
        }
        search_from = idx + "CHANGE".len();
    }
    renames
}

/// Table name helpers: `_<orig>_gho`, `_<orig>_ghc`, `_<orig>_del` (or
/// `_<orig>_<YYYYMMDDHHMMSS>_del` with `--timestamp-old-table`).
pub fn shadow_table_name(orig: &str) -> String {
    format!("_{orig}_gho")
}

pub fn changelog_table_name(orig: &str) -> String {
    format!("_{orig}_ghc")
}

pub fn old_table_name(orig: &str, timestamp_old_table: bool) -> String {
    if timestamp_old_table {
        format!("_{orig}_{}_del", Utc::now().format("%Y%m%d%H%M%S"))
    } else {
        format!("_{orig}_del")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_change_column_rename() {
        let renames = detect_renamed_columns("ADD COLUMN c INT, CHANGE COLUMN old_name new_name VARCHAR(32) NOT NULL");
        assert_eq!(renames, vec![("old_name".to_string(), "new_name".to_string())]);
    }

    #[test]
    fn change_without_column_keyword_is_still_detected() {
        let renames = detect_renamed_columns("CHANGE `foo` `bar` INT");
        assert_eq!(renames, vec![("foo".to_string(), "bar".to_string())]);
    }

    #[test]
    fn change_with_same_name_is_not_a_rename() {
        let renames = detect_renamed_columns("CHANGE COLUMN foo foo INT NOT NULL");
        assert!(renames.is_empty());
    }

    #[test]
    fn multiple_renames_are_all_detected() {
        let renames = detect_renamed_columns("CHANGE a b INT, CHANGE c d VARCHAR(10)");
        assert_eq!(renames, vec![("a".to_string(), "b".to_string()), ("c".to_string(), "d".to_string())]);
    }

    #[test]
    fn add_column_alone_has_no_renames() {
        assert!(detect_renamed_columns("ADD COLUMN e INT").is_empty());
    }

    fn key(name: &str, cols: usize, nullable: bool, primary: bool) -> UniqueKey {
        UniqueKey {
            name: name.to_string(),
            columns: (0..cols).map(|i| format!("c{i}")).collect(),
            is_primary: primary,
            has_nullable: nullable,
        }
    }

    #[test]
    fn primary_key_wins_even_if_wider() {
        let pk = key("PRIMARY", 3, false, true);
        let uk = key("uk_small", 1, false, false);
        let selected = select_shared_unique_key(&[uk, pk.clone()], false).unwrap();
        assert_eq!(selected, pk);
    }

    #[test]
    fn smallest_non_nullable_key_wins_ties_deterministically() {
        let a = key("uk_b", 1, false, false);
        let b = key("uk_a", 1, false, false);
        let nullable = key("uk_null", 1, true, false);
        let selected = select_shared_unique_key(&[nullable, a.clone(), b.clone()], false).unwrap();
        assert_eq!(selected.name, "uk_a");
    }

    #[test]
    fn nullable_key_only_selected_when_allowed() {
        let nullable = key("uk_null", 1, true, false);
        assert!(select_shared_unique_key(std::slice::from_ref(&nullable), false).is_none());
        assert!(select_shared_unique_key(std::slice::from_ref(&nullable), true).is_some());
    }

    #[test]
    fn table_names_follow_convention() {
        assert_eq!(shadow_table_name("orders"), "_orders_gho");
        assert_eq!(changelog_table_name("orders"), "_orders_ghc");
        assert_eq!(old_table_name("orders", false), "_orders_del");
    }
}
