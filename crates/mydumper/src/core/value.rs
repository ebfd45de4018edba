//! Row values and column metadata as seen by the dump writers.
//!
//! Values stay in the server's text encoding; writers only need to know
//! whether a column is numeric (emitted bare) or not (quoted and escaped).

use std::fmt;

/// Broad type class of a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Signed integer types.
    Signed,
    /// Unsigned integer types.
    Unsigned,
    /// Floating point types.
    Float,
    /// Exact decimal types.
    Decimal,
    /// Everything else: strings, blobs, temporal, JSON, bit.
    Other,
}

impl FieldKind {
    /// Numeric values are written verbatim, everything else is quoted.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, FieldKind::Other)
    }
}

/// Name and type class of a result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// One cell of a result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// The server's text representation of a non-NULL value.
    Raw(Vec<u8>),
}

impl SqlValue {
    /// Build a value from text.
    pub fn text(s: impl AsRef<str>) -> Self {
        SqlValue::Raw(s.as_ref().as_bytes().to_vec())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Raw bytes, or `None` for NULL.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SqlValue::Null => None,
            SqlValue::Raw(b) => Some(b),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// A table inside a database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_kinds() {
        assert!(FieldKind::Signed.is_numeric());
        assert!(FieldKind::Unsigned.is_numeric());
        assert!(FieldKind::Float.is_numeric());
        assert!(FieldKind::Decimal.is_numeric());
        assert!(!FieldKind::Other.is_numeric());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(SqlValue::from(42i64), SqlValue::Raw(b"42".to_vec()));
        assert_eq!(SqlValue::from(None::<&str>), SqlValue::Null);
        assert_eq!(SqlValue::from("x").as_bytes(), Some(&b"x"[..]));
        assert!(SqlValue::Null.as_bytes().is_none());
    }

    #[test]
    fn test_table_ref_display() {
        assert_eq!(TableRef::new("shop", "orders").to_string(), "shop.orders");
    }
}
