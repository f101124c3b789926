use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::DataType;

/// A single scalar value. The fundamental unit of data in HarrierDB.
/// Small enum, no heap allocation for fixed-size types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    Bytea(Vec<u8>),
}

impl Datum {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(DataType::Boolean),
            Datum::Int32(_) => Some(DataType::Int32),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::Text(_) => Some(DataType::Text),
            Datum::Timestamp(_) => Some(DataType::Timestamp),
            Datum::Bytea(_) => Some(DataType::Bytea),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Datum::Int32(v) => Some(*v as i64),
            Datum::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Int32(v) => Some(*v as f64),
            Datum::Int64(v) => Some(*v as f64),
            Datum::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Estimated heap + inline size in bytes, used for ram accounting.
    pub fn size_bytes(&self) -> u64 {
        let payload = match self {
            Datum::Null => 0,
            Datum::Boolean(_) => 1,
            Datum::Int32(_) => 4,
            Datum::Int64(_) | Datum::Float64(_) | Datum::Timestamp(_) => 8,
            Datum::Text(s) => s.len(),
            Datum::Bytea(b) => b.len(),
        };
        payload as u64 + std::mem::size_of::<Datum>() as u64
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(b) => write!(f, "{b}"),
            Datum::Int32(v) => write!(f, "{v}"),
            Datum::Int64(v) => write!(f, "{v}"),
            Datum::Float64(v) => write!(f, "{v}"),
            Datum::Text(s) => write!(f, "{s}"),
            Datum::Timestamp(us) => write!(f, "{us}"),
            Datum::Bytea(b) => write!(f, "\\x{}", b.iter().map(|x| format!("{x:02x}")).collect::<String>()),
        }
    }
}

/// Compare two datums with NULL sorting first, numeric types compared
/// across widths.
pub fn compare_datums(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Null, Datum::Null) => Ordering::Equal,
        (Datum::Null, _) => Ordering::Less,
        (_, Datum::Null) => Ordering::Greater,
        (Datum::Boolean(x), Datum::Boolean(y)) => x.cmp(y),
        (Datum::Int32(x), Datum::Int32(y)) => x.cmp(y),
        (Datum::Int64(x), Datum::Int64(y)) => x.cmp(y),
        (Datum::Int32(x), Datum::Int64(y)) => (*x as i64).cmp(y),
        (Datum::Int64(x), Datum::Int32(y)) => x.cmp(&(*y as i64)),
        (Datum::Float64(x), Datum::Float64(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Datum::Float64(x), Datum::Int64(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (Datum::Int64(x), Datum::Float64(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (Datum::Float64(x), Datum::Int32(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (Datum::Int32(x), Datum::Float64(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (Datum::Text(x), Datum::Text(y)) => x.cmp(y),
        (Datum::Timestamp(x), Datum::Timestamp(y)) => x.cmp(y),
        (Datum::Bytea(x), Datum::Bytea(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// An owned row: an ordered tuple of datums.
///
/// Rows handed out by iterators are only valid until the iterator advances;
/// consumers that retain rows must clone them into `OwnedRow`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedRow {
    pub values: Vec<Datum>,
}

impl OwnedRow {
    pub fn new(values: Vec<Datum>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&Datum> {
        self.values.get(idx)
    }

    pub fn width(&self) -> usize {
        self.values.len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.values.iter().map(Datum::size_bytes).sum()
    }
}

/// Compare two rows by the given `(column_index, ascending)` pairs.
pub fn compare_rows_by_columns(a: &OwnedRow, b: &OwnedRow, columns: &[(usize, bool)]) -> Ordering {
    for &(idx, ascending) in columns {
        let ord = compare_datums(
            a.get(idx).unwrap_or(&Datum::Null),
            b.get(idx).unwrap_or(&Datum::Null),
        );
        let ord = if ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// One upstream's contribution to one page: a finite ordered row sequence.
///
/// Buckets are consumed at most once; the page receiver replaces consumed
/// buckets of exhausted upstreams with `Bucket::empty()` so that the
/// page-completion predicate keeps firing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bucket {
    rows: Vec<OwnedRow>,
}

impl Bucket {
    pub fn new(rows: Vec<OwnedRow>) -> Self {
        Self { rows }
    }

    pub fn empty() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[OwnedRow] {
        &self.rows
    }

    pub fn size_bytes(&self) -> u64 {
        self.rows.iter().map(OwnedRow::size_bytes).sum()
    }
}

impl IntoIterator for Bucket {
    type Item = OwnedRow;
    type IntoIter = std::vec::IntoIter<OwnedRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl FromIterator<OwnedRow> for Bucket {
    fn from_iter<I: IntoIterator<Item = OwnedRow>>(iter: I) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(vals: Vec<Datum>) -> OwnedRow {
        OwnedRow::new(vals)
    }

    #[test]
    fn test_null_sorts_first() {
        assert_eq!(compare_datums(&Datum::Null, &Datum::Int64(1)), Ordering::Less);
        assert_eq!(compare_datums(&Datum::Int64(1), &Datum::Null), Ordering::Greater);
        assert_eq!(compare_datums(&Datum::Null, &Datum::Null), Ordering::Equal);
    }

    #[test]
    fn test_mixed_width_integer_compare() {
        assert_eq!(compare_datums(&Datum::Int32(3), &Datum::Int64(4)), Ordering::Less);
        assert_eq!(compare_datums(&Datum::Int64(5), &Datum::Int32(5)), Ordering::Equal);
    }

    #[test]
    fn test_compare_rows_by_columns_desc() {
        let a = row(vec![Datum::Int64(1), Datum::Text("a".into())]);
        let b = row(vec![Datum::Int64(2), Datum::Text("a".into())]);
        assert_eq!(compare_rows_by_columns(&a, &b, &[(0, true)]), Ordering::Less);
        assert_eq!(compare_rows_by_columns(&a, &b, &[(0, false)]), Ordering::Greater);
        assert_eq!(compare_rows_by_columns(&a, &b, &[(1, true)]), Ordering::Equal);
    }

    #[test]
    fn test_bucket_round_trip() {
        let bucket: Bucket = (0..3).map(|i| row(vec![Datum::Int64(i)])).collect();
        assert_eq!(bucket.len(), 3);
        assert!(!bucket.is_empty());
        let collected: Vec<OwnedRow> = bucket.into_iter().collect();
        assert_eq!(collected[2], row(vec![Datum::Int64(2)]));
    }

    #[test]
    fn test_empty_bucket() {
        let bucket = Bucket::empty();
        assert!(bucket.is_empty());
        assert_eq!(bucket.len(), 0);
    }

    #[test]
    fn test_datum_size_bytes_grows_with_payload() {
        let small = Datum::Text("a".into());
        let large = Datum::Text("a".repeat(100));
        assert!(large.size_bytes() > small.size_bytes());
    }
}
