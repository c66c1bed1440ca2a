//! SQLite backend: file from the name pattern, table from a second
//! pattern sanitized down to identifier characters.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rusqlite::{params_from_iter, Connection};

use super::{
    data_records, ensure_parent_dirs, header_record, resolve_name_pattern, sanitize_identifier,
    Output,
};
use crate::config::OutputConfig;
use crate::models::Data;

pub const NAME: &str = "sqlite";

const DEFAULT_NAME_PATTERN: &str = "{{ .UnixTime }}-{{ .Data.Tester }}.sqlite3";
const DEFAULT_TABLE_NAME_PATTERN: &str =
    "{{ .Data.Tester }}_{{ .Data.ServerHost }}_{{ .Data.ClientHost }}";

pub struct SqliteOutput {
    file_path: PathBuf,
    name_pattern: String,
    table_name_pattern: String,
    /// Open database handles keyed by file path, reused across frames
    connections: Mutex<HashMap<PathBuf, Connection>>,
}

impl SqliteOutput {
    pub fn new(out_cfg: &OutputConfig) -> Result<Box<dyn Output>> {
        let cfg = out_cfg.sqlite.clone().unwrap_or_default();
        Ok(Box::new(SqliteOutput {
            file_path: PathBuf::from(if cfg.file.file_path.is_empty() {
                ".".to_string()
            } else {
                cfg.file.file_path
            }),
            name_pattern: cfg.file.name_pattern,
            table_name_pattern: cfg.table_name_pattern,
            connections: Mutex::new(HashMap::new()),
        }))
    }
}

#[async_trait]
impl Output for SqliteOutput {
    async fn write(&self, data: &Data) -> Result<()> {
        let filename = resolve_name_pattern(&self.name_pattern, DEFAULT_NAME_PATTERN, data)?;
        let table = sanitize_identifier(&resolve_name_pattern(
            &self.table_name_pattern,
            DEFAULT_TABLE_NAME_PATTERN,
            data,
        )?);
        if table.is_empty() {
            bail!("table name pattern rendered to an empty identifier");
        }

        let path = self.file_path.join(filename);
        ensure_parent_dirs(&path)?;

        let columns: Vec<String> = header_record(&data.table)
            .iter()
            .map(|label| sanitize_identifier(label))
            .collect();
        if columns.is_empty() {
            bail!("refusing to create table {table:?} without columns");
        }
        let records = data_records(&data.table);

        let mut connections = self.connections.lock().unwrap();
        let conn = match connections.entry(path.clone()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let conn = Connection::open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                entry.insert(conn)
            }
        };

        let create = format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" ({})",
            columns
                .iter()
                .map(|c| format!("\"{c}\" TEXT"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        conn.execute(&create, [])
            .with_context(|| format!("failed to create table {table}"))?;

        let insert = format!(
            "INSERT INTO \"{table}\" ({}) VALUES ({})",
            columns
                .iter()
                .map(|c| format!("\"{c}\""))
                .collect::<Vec<_>>()
                .join(", "),
            columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ")
        );

        let tx = conn.transaction().context("failed to begin transaction")?;
        {
            let mut stmt = tx
                .prepare(&insert)
                .with_context(|| format!("failed to prepare insert into {table}"))?;
            for record in &records {
                stmt.execute(params_from_iter(record.iter()))
                    .with_context(|| format!("failed to insert into {table}"))?;
            }
        }
        tx.commit().context("failed to commit")?;

        tracing::debug!(path = %path.display(), table, rows = records.len(), "wrote sqlite data");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut connections = self.connections.lock().unwrap();
        for (path, conn) in connections.drain() {
            conn.close().map_err(|(_, err)| {
                anyhow!(err).context(format!("failed to close {}", path.display()))
            })?;
        }
        Ok(())
    }
}
