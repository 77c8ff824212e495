//! A position in the source server's replication stream, in either of the
//! two forms MySQL hands out: `(log_file, log_pos)` or a GTID set.
//!
//! The GTID types here (`Interval`, `UuidSet`, `GtidSet`) are grounded on
//! the teacher's `binlog::alias::mysql::gtid::{interval, uuid_set}` shape
//! (interval merge via `collapse_intervals`, the `uuid:start-end:start-end`
//! wire format) but written fresh, since the teacher's own module is
//! unreachable (it imports sibling files that were never committed). See
//! `DESIGN.md`.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::GhostError;

/// A half-open run of transaction numbers `[start, end]` (inclusive, as
/// gh-ost's own `GnoInterval` represents it) belonging to one source UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    start: u64,
    end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Interval { start, end }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn contains(&self, txn: u64) -> bool {
        self.start <= txn && txn <= self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Merge adjacent/overlapping intervals in place. Intervals must already be
/// sorted by `start`.
fn collapse_intervals(intervals: &mut Vec<Interval>) {
    if intervals.is_empty() {
        return;
    }
    let mut index = 0;
    while index < intervals.len() - 1 {
        let right_start = intervals[index + 1].start;
        let right_end = intervals[index + 1].end;
        let left = &mut intervals[index];
        if left.end + 1 >= right_start {
            left.end = left.end.max(right_end);
            intervals.remove(index + 1);
        } else {
            index += 1;
        }
    }
}

/// All the transaction intervals contributed by a single source UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidSet {
    source_id: String,
    intervals: Vec<Interval>,
}

impl UuidSet {
    pub fn new(source_id: String, mut intervals: Vec<Interval>) -> Self {
        intervals.sort_by_key(|i| i.start);
        collapse_intervals(&mut intervals);
        UuidSet { source_id, intervals }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    fn contains(&self, txn: u64) -> bool {
        self.intervals.iter().any(|i| i.contains(txn))
    }

    /// True if every interval of `other` lies within one of ours.
    fn contains_set(&self, other: &UuidSet) -> bool {
        other.intervals.iter().all(|oi| {
            self.intervals
                .iter()
                .any(|si| si.start <= oi.start && oi.end <= si.end)
        })
    }
}

impl fmt::Display for UuidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let intervals = self
            .intervals
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(":");
        write!(f, "{}:{}", self.source_id, intervals)
    }
}

impl FromStr for UuidSet {
    type Err = GhostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (uuid, ranges) = s
            .split_once(':')
            .ok_or_else(|| GhostError::FatalCritical(format!("invalid gtid uuid-set: {s}")))?;

        let intervals = ranges
            .split(':')
            .map(|token| parse_interval(token, s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UuidSet::new(uuid.to_string(), intervals))
    }
}

fn parse_interval(token: &str, full: &str) -> Result<Interval, GhostError> {
    let parts: Vec<&str> = token.split('-').collect();
    match parts.as_slice() {
        [single] => {
            let n: u64 = single
                .parse()
                .map_err(|_| GhostError::FatalCritical(format!("invalid gtid interval in: {full}")))?;
            Ok(Interval::new(n, n))
        }
        [start, end] => {
            let start: u64 = start
                .parse()
                .map_err(|_| GhostError::FatalCritical(format!("invalid gtid interval in: {full}")))?;
            let end: u64 = end
                .parse()
                .map_err(|_| GhostError::FatalCritical(format!("invalid gtid interval in: {full}")))?;
            Ok(Interval::new(start, end))
        }
        _ => Err(GhostError::FatalCritical(format!("invalid gtid interval in: {full}"))),
    }
}

/// A set of `(server_uuid, interval_set)` pairs, MySQL's `gtid_executed`
/// format: `uuid1:1-5:8,uuid2:1-20`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    sets: HashMap<String, UuidSet>,
}

impl GtidSet {
    pub fn new(sets: Vec<UuidSet>) -> Self {
        GtidSet {
            sets: sets.into_iter().map(|s| (s.source_id().to_string(), s)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|s| s.is_empty())
    }

    /// `self.contains(other)`: every interval of every uuid-set in `other`
    /// is covered by the matching uuid-set in `self`. A uuid present in
    /// `other` but absent from `self` means `self` does not contain it.
    pub fn contains(&self, other: &GtidSet) -> bool {
        other.sets.values().all(|other_set| {
            if other_set.is_empty() {
                return true;
            }
            match self.sets.get(other_set.source_id()) {
                Some(self_set) => self_set.contains_set(other_set),
                None => false,
            }
        })
    }

    /// Set equality used by `BinlogCoordinates::equals`.
    pub fn set_equals(&self, other: &GtidSet) -> bool {
        self.contains(other) && other.contains(self)
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = self.sets.values().map(|s| s.to_string()).collect();
        parts.sort();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for GtidSet {
    type Err = GhostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(GtidSet::default());
        }
        let sets = s
            .split(',')
            .map(|part| part.trim().parse::<UuidSet>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GtidSet::new(sets))
    }
}

/// A position in the source's replication stream. Coordinates of differing
/// variants are never compared; doing so is a programming error.
#[derive(Debug, Clone)]
pub enum BinlogCoordinates {
    File { log_file: String, log_pos: u64 },
    Gtid { set: GtidSet },
}

impl BinlogCoordinates {
    pub fn file(log_file: impl Into<String>, log_pos: u64) -> Self {
        BinlogCoordinates::File {
            log_file: log_file.into(),
            log_pos,
        }
    }

    pub fn gtid(set: GtidSet) -> Self {
        BinlogCoordinates::Gtid { set }
    }

    /// Equality. For the GTID variant, both-empty compares as *not equal*
    /// (gh-ost's sentinel: `Equals` returns false if either side is empty).
    pub fn equals(&self, other: &BinlogCoordinates) -> Result<bool, GhostError> {
        match (self, other) {
            (
                BinlogCoordinates::File { log_file: f1, log_pos: p1 },
                BinlogCoordinates::File { log_file: f2, log_pos: p2 },
            ) => Ok(f1 == f2 && p1 == p2),
            (BinlogCoordinates::Gtid { set: a }, BinlogCoordinates::Gtid { set: b }) => {
                if a.is_empty() || b.is_empty() {
                    return Ok(false);
                }
                Ok(a.set_equals(b))
            }
            _ => Err(GhostError::FatalCritical(
                "cannot compare coordinates of differing variants".to_string(),
            )),
        }
    }

    /// Strict less-than. File-based: lexicographic on `(log_file, log_pos)`.
    /// GTID-based: "not contained" (`a < b <=> !a.contains(b) && a != b`).
    pub fn less_than(&self, other: &BinlogCoordinates) -> Result<bool, GhostError> {
        match (self, other) {
            (
                BinlogCoordinates::File { log_file: f1, log_pos: p1 },
                BinlogCoordinates::File { log_file: f2, log_pos: p2 },
            ) => Ok((f1, p1) < (f2, p2)),
            (BinlogCoordinates::Gtid { set: a }, BinlogCoordinates::Gtid { set: b }) => {
                if a.is_empty() && b.is_empty() {
                    return Ok(false);
                }
                Ok(!a.contains(b) && !a.set_equals(b))
            }
            _ => Err(GhostError::FatalCritical(
                "cannot compare coordinates of differing variants".to_string(),
            )),
        }
    }

    pub fn less_or_equal(&self, other: &BinlogCoordinates) -> Result<bool, GhostError> {
        Ok(self.less_than(other)? || self.equals(other)?)
    }

    /// Parses the trailing zero-padded decimal suffix of a file-based
    /// coordinate's file name, e.g. `mysql-bin.000017` -> `(mysql-bin.,
    /// 17, width=6)`.
    fn suffix(log_file: &str) -> Result<(&str, u64, usize), GhostError> {
        let dot = log_file
            .rfind('.')
            .ok_or_else(|| GhostError::FatalCritical(format!("no decimal suffix in file name: {log_file}")))?;
        let (prefix, suffix) = log_file.split_at(dot + 1);
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
            return Err(GhostError::FatalCritical(format!(
                "no decimal suffix in file name: {log_file}"
            )));
        }
        let width = suffix.len();
        let n: u64 = suffix
            .parse()
            .map_err(|_| GhostError::FatalCritical(format!("invalid decimal suffix: {log_file}")))?;
        Ok((prefix, n, width))
    }

    /// The next file name: suffix + 1, width preserved.
    pub fn next_file(log_file: &str) -> Result<String, GhostError> {
        let (prefix, n, width) = Self::suffix(log_file)?;
        Ok(format!("{prefix}{:0width$}", n + 1, width = width))
    }

    /// The previous file name: suffix - 1, width preserved. Fails on a
    /// zero suffix (there is no file before `…00000`).
    pub fn previous_file(log_file: &str) -> Result<String, GhostError> {
        let (prefix, n, width) = Self::suffix(log_file)?;
        if n == 0 {
            return Err(GhostError::FatalCritical(format!(
                "no file precedes a zero suffix: {log_file}"
            )));
        }
        Ok(format!("{prefix}{:0width$}", n - 1, width = width))
    }

    /// `suffix(a) - suffix(b)`, as a signed distance.
    pub fn file_number_distance(a: &str, b: &str) -> Result<i64, GhostError> {
        let (_, na, _) = Self::suffix(a)?;
        let (_, nb, _) = Self::suffix(b)?;
        Ok(na as i64 - nb as i64)
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinlogCoordinates::File { log_file, log_pos } => write!(f, "{log_file}:{log_pos}"),
            BinlogCoordinates::Gtid { set } => write!(f, "{set}"),
        }
    }
}

impl PartialEq for BinlogCoordinates {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other).unwrap_or(false)
    }
}

/// Only the file-based variant is hashable: a GTID set has no stable,
/// total-order-free hash that would honor set equality, and the data
/// model never needs to use a GTID coordinate as a map key.
impl Hash for BinlogCoordinates {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            BinlogCoordinates::File { log_file, log_pos } => {
                log_file.hash(state);
                log_pos.hash(state);
            }
            BinlogCoordinates::Gtid { .. } => {
                panic!("BinlogCoordinates::Gtid is not hashable");
            }
        }
    }
}

impl Eq for BinlogCoordinates {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn next_file_increments_preserving_width() {
        assert_eq!(BinlogCoordinates::next_file("mysql-bin.000017").unwrap(), "mysql-bin.000018");
        assert_eq!(
            BinlogCoordinates::next_file("mysql.00.prod.com.00099").unwrap(),
            "mysql.00.prod.com.00100"
        );
    }

    #[test]
    fn previous_file_fails_on_zero_suffix() {
        assert!(BinlogCoordinates::previous_file("mysql-bin.000000").is_err());
        assert_eq!(BinlogCoordinates::previous_file("mysql-bin.000018").unwrap(), "mysql-bin.000017");
    }

    #[test]
    fn next_then_previous_round_trips() {
        let f = "mysql-bin.000017";
        let next = BinlogCoordinates::next_file(f).unwrap();
        assert_eq!(BinlogCoordinates::previous_file(&next).unwrap(), f);
    }

    #[test]
    fn file_number_distance_is_antisymmetric() {
        let a = "mysql-bin.000017";
        let b = "mysql-bin.000022";
        assert_eq!(BinlogCoordinates::file_number_distance(a, a).unwrap(), 0);
        let d_ab = BinlogCoordinates::file_number_distance(a, b).unwrap();
        let d_ba = BinlogCoordinates::file_number_distance(b, a).unwrap();
        assert_eq!(d_ab, -d_ba);
        assert_eq!(d_ba, 5);
    }

    #[test]
    fn file_coordinate_total_order_within_variant() {
        let a = BinlogCoordinates::file("mysql-bin.000017", 104);
        let b = BinlogCoordinates::file("mysql-bin.000017", 222);
        let c = BinlogCoordinates::file("mysql-bin.000018", 4);

        assert!(a.less_than(&b).unwrap());
        assert!(!b.less_than(&a).unwrap());
        assert!(!a.equals(&b).unwrap());
        assert!(b.less_than(&c).unwrap());
    }

    #[test]
    fn coordinates_as_map_keys() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(BinlogCoordinates::file("mysql-bin.000017", 104));
        set.insert(BinlogCoordinates::file("mysql-bin.000017", 104));
        set.insert(BinlogCoordinates::file("mysql-bin.000017", 222));
        set.insert(BinlogCoordinates::file("mysql-bin.000018", 104));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn gtid_equality_and_ordering() {
        let a: GtidSet = "uuid-1:1-5".parse().unwrap();
        let b: GtidSet = "uuid-1:1-10".parse().unwrap();
        let empty = GtidSet::default();

        let ca = BinlogCoordinates::gtid(a.clone());
        let cb = BinlogCoordinates::gtid(b.clone());
        let ce = BinlogCoordinates::gtid(empty.clone());

        assert!(ca.less_than(&cb).unwrap());
        assert!(!cb.less_than(&ca).unwrap());
        assert!(ca.less_or_equal(&ca).unwrap());
        // both-empty sentinel: empty never equals empty for ordering purposes
        assert!(!ce.equals(&ce).unwrap());
    }

    #[test]
    fn gtid_superset_on_one_uuid_is_strictly_greater() {
        let small: GtidSet = "uuid-1:1-5".parse().unwrap();
        let big: GtidSet = "uuid-1:1-5:6-10".parse().unwrap();
        assert!(big.contains(&small));
        assert!(!small.contains(&big));
    }

    #[test]
    fn cross_variant_comparison_is_an_error() {
        let f = BinlogCoordinates::file("mysql-bin.000017", 104);
        let g = BinlogCoordinates::gtid(GtidSet::default());
        assert!(f.equals(&g).is_err());
        assert!(f.less_than(&g).is_err());
    }
}
