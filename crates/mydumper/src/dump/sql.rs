//! INSERT statement chunk writer.
//!
//! Rows become `(v1,v2,...)` tuples. Tuples join with `",\n"` into one
//! ``INSERT INTO `t`(`c1`,`c2`) VALUES\n`` statement until the statement's
//! tuple bytes reach `stmt_size`; each statement ends with `";\n"`.
//! A chunk file is closed once its byte count reaches the chunk threshold,
//! always after closing the pending statement.

use crate::core::identifier::quote_mysql;
use crate::core::{FieldKind, SqlValue};
use crate::error::{DumpError, Result};

use super::escape::escape_into;
use super::{ChunkFile, ChunkFiles, ChunkSummary};

pub struct SqlChunkWriter {
    files: ChunkFiles,
    insert_head: Vec<u8>,
    kinds: Vec<FieldKind>,
    stmt_size: usize,
    chunk_bytes: u64,
    current: Option<ChunkFile>,
    in_statement: bool,
    stmt_bytes: usize,
    tuple: Vec<u8>,
    out: Vec<u8>,
    rows: u64,
    bytes: u64,
}

impl SqlChunkWriter {
    pub fn new(
        files: ChunkFiles,
        table: &str,
        columns: &[String],
        kinds: Vec<FieldKind>,
        stmt_size: usize,
        chunk_bytes: u64,
    ) -> Result<Self> {
        let quoted = columns
            .iter()
            .map(|c| quote_mysql(c))
            .collect::<Result<Vec<_>>>()?;
        let insert_head = format!(
            "INSERT INTO {}({}) VALUES\n",
            quote_mysql(table)?,
            quoted.join(",")
        )
        .into_bytes();

        Ok(Self {
            files,
            insert_head,
            kinds,
            stmt_size,
            chunk_bytes,
            current: None,
            in_statement: false,
            stmt_bytes: 0,
            tuple: Vec::new(),
            out: Vec::new(),
            rows: 0,
            bytes: 0,
        })
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Append one row. Returns the bytes written to disk for it.
    pub async fn write_row(&mut self, row: &[SqlValue]) -> Result<u64> {
        self.encode_tuple(row)?;

        self.out.clear();
        if self.in_statement {
            self.out.extend_from_slice(b",\n");
        } else {
            self.out.extend_from_slice(&self.insert_head);
            self.in_statement = true;
        }
        self.out.extend_from_slice(&self.tuple);
        self.stmt_bytes += self.tuple.len();
        if self.stmt_bytes >= self.stmt_size {
            self.out.extend_from_slice(b";\n");
            self.in_statement = false;
            self.stmt_bytes = 0;
        }

        if self.current.is_none() {
            self.current = Some(self.files.open_next().await?);
        }
        let mut written = self.out.len() as u64;
        let full = match self.current.as_mut() {
            Some(file) => {
                file.write(&self.out).await?;
                file.bytes() >= self.chunk_bytes
            }
            None => false,
        };
        if full {
            written += self.close_file().await?;
        }

        self.rows += 1;
        self.bytes += written;
        Ok(written)
    }

    /// Close the pending statement and the open file.
    ///
    /// Returns the bytes written by this call. No file is created for a
    /// table without rows.
    pub async fn finish(mut self) -> Result<(ChunkSummary, u64)> {
        let tail = self.close_file().await?;
        self.bytes += tail;
        Ok((
            ChunkSummary {
                files: self.files.into_paths(),
                rows: self.rows,
                bytes: self.bytes,
            },
            tail,
        ))
    }

    async fn close_file(&mut self) -> Result<u64> {
        let mut written = 0;
        if let Some(mut file) = self.current.take() {
            if self.in_statement {
                file.write(b";\n").await?;
                written = 2;
                self.in_statement = false;
                self.stmt_bytes = 0;
            }
            file.close().await?;
        }
        Ok(written)
    }

    fn encode_tuple(&mut self, row: &[SqlValue]) -> Result<()> {
        if row.len() != self.kinds.len() {
            return Err(DumpError::Cursor(format!(
                "row has {} values, expected {}",
                row.len(),
                self.kinds.len()
            )));
        }
        self.tuple.clear();
        self.tuple.push(b'(');
        for (i, (value, kind)) in row.iter().zip(&self.kinds).enumerate() {
            if i > 0 {
                self.tuple.push(b',');
            }
            match value {
                SqlValue::Null => self.tuple.extend_from_slice(b"NULL"),
                SqlValue::Raw(raw) if kind.is_numeric() => self.tuple.extend_from_slice(raw),
                SqlValue::Raw(raw) => {
                    self.tuple.push(b'"');
                    escape_into(raw, &mut self.tuple);
                    self.tuple.push(b'"');
                }
            }
        }
        self.tuple.push(b')');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TableRef;
    use tempfile::TempDir;

    fn writer(dir: &TempDir, stmt_size: usize, chunk_bytes: u64) -> SqlChunkWriter {
        let files = ChunkFiles::new(dir.path(), &TableRef::new("db", "t"), "sql");
        SqlChunkWriter::new(
            files,
            "t",
            &["id".to_string(), "name".to_string()],
            vec![FieldKind::Signed, FieldKind::Other],
            stmt_size,
            chunk_bytes,
        )
        .unwrap()
    }

    fn row(id: i64, name: Option<&str>) -> Vec<SqlValue> {
        vec![SqlValue::from(id), SqlValue::from(name)]
    }

    #[tokio::test]
    async fn test_single_statement() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(&dir, 1_000_000, 1 << 20);
        w.write_row(&row(1, Some("Ann"))).await.unwrap();
        w.write_row(&row(2, None)).await.unwrap();
        let (summary, tail) = w.finish().await.unwrap();

        assert_eq!(tail, 2);
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.files, vec![dir.path().join("db.t.00001.sql")]);
        let content = std::fs::read_to_string(&summary.files[0]).unwrap();
        assert_eq!(
            content,
            "INSERT INTO `t`(`id`,`name`) VALUES\n(1,\"Ann\"),\n(2,NULL);\n"
        );
        assert_eq!(summary.bytes, content.len() as u64);
    }

    #[tokio::test]
    async fn test_values_are_escaped() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(&dir, 1_000_000, 1 << 20);
        w.write_row(&row(7, Some("it's \"x\"\n"))).await.unwrap();
        let (summary, _) = w.finish().await.unwrap();
        let content = std::fs::read_to_string(&summary.files[0]).unwrap();
        assert!(content.contains("(7,\"it\\'s \\\"x\\\"\\n\")"));
    }

    #[tokio::test]
    async fn test_chunk_rollover_closes_statement() {
        let dir = TempDir::new().unwrap();
        // Threshold of 1 byte: every row closes its file.
        let mut w = writer(&dir, 1_000_000, 1);
        for id in 1..=3 {
            w.write_row(&row(id, Some("x"))).await.unwrap();
        }
        let (summary, tail) = w.finish().await.unwrap();

        assert_eq!(tail, 0);
        assert_eq!(summary.files.len(), 3);
        for (i, path) in summary.files.iter().enumerate() {
            assert_eq!(
                path.file_name().unwrap().to_str().unwrap(),
                format!("db.t.{:05}.sql", i + 1)
            );
            let content = std::fs::read_to_string(path).unwrap();
            assert!(content.starts_with("INSERT INTO `t`"));
            assert!(content.ends_with(";\n"));
        }
    }

    #[tokio::test]
    async fn test_empty_table_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let w = writer(&dir, 1_000_000, 1 << 20);
        let (summary, _) = w.finish().await.unwrap();
        assert!(summary.files.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_row_width_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(&dir, 1_000_000, 1 << 20);
        let err = w.write_row(&[SqlValue::from(1i64)]).await.unwrap_err();
        assert!(matches!(err, DumpError::Cursor(_)));
    }
}
