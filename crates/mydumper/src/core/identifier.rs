//! Identifier validation and quoting.
//!
//! Database, table, and column names are interpolated into SQL text, so every
//! name passes through [`quote_mysql`] first.

use crate::error::{DumpError, Result};

/// MySQL caps identifiers at 64 characters; leave headroom for multibyte names.
const MAX_IDENTIFIER_LENGTH: usize = 256;

/// Reject empty identifiers, NUL bytes, and absurd lengths.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DumpError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(DumpError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(DumpError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a MySQL identifier using backticks, doubling embedded backticks.
///
/// ```
/// use mydumper::core::identifier::quote_mysql;
/// assert_eq!(quote_mysql("users").unwrap(), "`users`");
/// assert_eq!(quote_mysql("odd`name").unwrap(), "`odd``name`");
/// ```
pub fn quote_mysql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// `` `database`.`table` ``
pub fn qualify_mysql(database: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mysql(database)?, quote_mysql(table)?))
}

/// Make a name safe to embed in an output file name.
///
/// Path separators and NUL are replaced; everything else is kept so the
/// file names stay recognizable.
pub fn file_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("orders").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a\0b").is_err());
        assert!(validate_identifier(&"x".repeat(300)).is_err());
    }

    #[test]
    fn test_quote_mysql() {
        assert_eq!(quote_mysql("t").unwrap(), "`t`");
        assert_eq!(quote_mysql("a`b").unwrap(), "`a``b`");
        assert_eq!(quote_mysql("with space").unwrap(), "`with space`");
    }

    #[test]
    fn test_qualify_mysql() {
        assert_eq!(qualify_mysql("db", "t").unwrap(), "`db`.`t`");
    }

    #[test]
    fn test_file_component() {
        assert_eq!(file_component("plain"), "plain");
        assert_eq!(file_component("a/b\\c"), "a_b_c");
    }
}
