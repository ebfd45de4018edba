//! Metadata and schema files.
//!
//! - `<outdir>/metadata`: empty start marker
//! - `<outdir>/<db>-schema-create.sql`: `CREATE DATABASE IF NOT EXISTS`
//! - `<outdir>/<db>.<table>-schema.sql`: `SHOW CREATE TABLE` output

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::catalog::{fetch_with_retry, RetryPolicy};
use crate::core::identifier::{file_component, qualify_mysql, quote_mysql};
use crate::core::Session;
use crate::error::{DumpError, Result};

/// Create `outdir` if needed and write the empty `metadata` marker.
pub async fn write_metadata(outdir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(outdir).await?;
    let path = outdir.join("metadata");
    tokio::fs::write(&path, b"").await?;
    debug!("Wrote {}", path.display());
    Ok(path)
}

/// Write the database creation statement.
pub async fn dump_database_schema(outdir: &Path, database: &str) -> Result<PathBuf> {
    let sql = format!("CREATE DATABASE IF NOT EXISTS {};", quote_mysql(database)?);
    let path = outdir.join(format!("{}-schema-create.sql", file_component(database)));
    tokio::fs::write(&path, sql).await?;
    debug!("Wrote {}", path.display());
    Ok(path)
}

/// Write a table's `CREATE TABLE` statement as reported by the server.
pub async fn dump_table_schema<S: Session + ?Sized>(
    session: &mut S,
    outdir: &Path,
    database: &str,
    table: &str,
    retry: RetryPolicy,
) -> Result<PathBuf> {
    let sql = format!("SHOW CREATE TABLE {}", qualify_mysql(database, table)?);
    let rows = fetch_with_retry(session, &sql, retry).await?;
    let create = rows
        .first()
        .and_then(|row| row.get(1))
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| DumpError::query(&sql, "no CREATE TABLE statement returned"))?;

    let mut content = Vec::with_capacity(create.len() + 2);
    content.extend_from_slice(create);
    content.extend_from_slice(b";\n");

    let path = outdir.join(format!(
        "{}.{}-schema.sql",
        file_component(database),
        file_component(table)
    ));
    tokio::fs::write(&path, content).await?;
    debug!("Wrote {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Connector, Field, FieldKind};
    use crate::drivers::memory::{MemoryConnector, MemoryServer, MemoryTable};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_metadata_marker() {
        let dir = TempDir::new().unwrap();
        let outdir = dir.path().join("nested/out");
        let path = write_metadata(&outdir).await.unwrap();
        assert_eq!(path, outdir.join("metadata"));
        assert_eq!(std::fs::read(&path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_database_schema() {
        let dir = TempDir::new().unwrap();
        let path = dump_database_schema(dir.path(), "shop").await.unwrap();
        assert_eq!(path, dir.path().join("shop-schema-create.sql"));
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "CREATE DATABASE IF NOT EXISTS `shop`;"
        );
    }

    #[tokio::test]
    async fn test_table_schema() {
        let server = MemoryServer::new();
        server.add_table(
            "shop",
            "t",
            MemoryTable::new(vec![Field::new("id", FieldKind::Signed)])
                .with_create_sql("CREATE TABLE `t` (`id` int)"),
        );
        let connector = MemoryConnector::new(server);
        let mut session = connector.connect(None).await.unwrap();
        let dir = TempDir::new().unwrap();

        let path = dump_table_schema(&mut session, dir.path(), "shop", "t", RetryPolicy::none())
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("shop.t-schema.sql"));
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "CREATE TABLE `t` (`id` int);\n"
        );
    }

    #[tokio::test]
    async fn test_missing_table_schema_fails() {
        let connector = MemoryConnector::new(MemoryServer::new());
        let mut session = connector.connect(None).await.unwrap();
        let dir = TempDir::new().unwrap();
        let result =
            dump_table_schema(&mut session, dir.path(), "shop", "nope", RetryPolicy::none()).await;
        assert!(result.is_err());
    }
}
