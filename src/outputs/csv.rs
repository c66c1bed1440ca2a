//! CSV backend: one file per rendered name pattern, header written once.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{data_records, ensure_parent_dirs, header_record, resolve_name_pattern, Output};
use crate::config::OutputConfig;
use crate::models::Data;

pub const NAME: &str = "csv";

const DEFAULT_NAME_PATTERN: &str =
    "{{ .UnixTime }}-{{ .Data.Tester }}-{{ .Data.ServerHost }}_{{ .Data.ClientHost }}.csv";

pub struct CsvOutput {
    file_path: PathBuf,
    name_pattern: String,
}

impl CsvOutput {
    pub fn new(out_cfg: &OutputConfig) -> Result<Box<dyn Output>> {
        let file = out_cfg.csv.clone().unwrap_or_default();
        Ok(Box::new(CsvOutput {
            file_path: PathBuf::from(if file.file_path.is_empty() {
                ".".to_string()
            } else {
                file.file_path
            }),
            name_pattern: file.name_pattern,
        }))
    }
}

#[async_trait]
impl Output for CsvOutput {
    async fn write(&self, data: &Data) -> Result<()> {
        let filename = resolve_name_pattern(&self.name_pattern, DEFAULT_NAME_PATTERN, data)?;
        let path = self.file_path.join(filename);
        ensure_parent_dirs(&path)?;

        let write_header = match std::fs::metadata(&path) {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut writer = csv::Writer::from_writer(file);

        if write_header {
            writer
                .write_record(header_record(&data.table))
                .context("failed to write CSV header")?;
        }
        for record in data_records(&data.table) {
            writer.write_record(&record).context("failed to write CSV record")?;
        }
        writer.flush().context("failed to flush CSV writer")?;

        tracing::debug!(path = %path.display(), "wrote csv data");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
