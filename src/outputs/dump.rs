//! Dump backend: plain tab-separated text, mainly for eyeballing results.

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{data_records, ensure_parent_dirs, header_record, resolve_name_pattern, Output};
use crate::config::OutputConfig;
use crate::models::Data;

pub const NAME: &str = "dump";

const DEFAULT_NAME_PATTERN: &str =
    "{{ .UnixTime }}-{{ .Data.Tester }}-{{ .Data.ServerHost }}_{{ .Data.ClientHost }}.dump";

pub struct DumpOutput {
    file_path: PathBuf,
    name_pattern: String,
}

impl DumpOutput {
    pub fn new(out_cfg: &OutputConfig) -> Result<Box<dyn Output>> {
        let file = out_cfg.dump.clone().unwrap_or_default();
        Ok(Box::new(DumpOutput {
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
impl Output for DumpOutput {
    async fn write(&self, data: &Data) -> Result<()> {
        let filename = resolve_name_pattern(&self.name_pattern, DEFAULT_NAME_PATTERN, data)?;
        let path = self.file_path.join(filename);
        ensure_parent_dirs(&path)?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        writeln!(file, "{}", header_record(&data.table).join("\t"))?;
        for record in data_records(&data.table) {
            writeln!(file, "{}", record.join("\t"))?;
        }

        tracing::debug!(path = %path.display(), "wrote dump data");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputs::testutil::sample_data;

    #[tokio::test]
    async fn dumps_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let output = DumpOutput {
            file_path: dir.path().to_path_buf(),
            name_pattern: String::new(),
        };

        output.write(&sample_data()).await.unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("1700000000-iperf3-s1_c1.dump")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "round\tbits_per_second");
        assert_eq!(lines[1], "0\t100.0");
    }
}
