//! Persistence backends consuming parsed [`Data`] frames.

pub mod csv;
pub mod dump;
pub mod sqlite;

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::models::{value_to_string, Data, Table};
use crate::template::render_name_pattern;

/// A backend subscribed to the Data stream. `write` runs per frame,
/// `close` after the stream drained. One failed frame must not tear the
/// backend down; the orchestrator logs the error and keeps feeding it.
#[async_trait]
pub trait Output: Send + Sync {
    async fn write(&self, data: &Data) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Render the user's name pattern, substituting the backend default when
/// the configured pattern is empty.
pub(crate) fn resolve_name_pattern(pattern: &str, default: &str, data: &Data) -> Result<String> {
    let effective = if pattern.is_empty() { default } else { pattern };
    render_name_pattern(effective, data)
        .with_context(|| format!("failed to render name pattern {effective:?}"))
}

/// Replace everything a SQL identifier cannot carry with `_`
pub(crate) fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Create the directories a file is about to be written into
pub(crate) fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Flatten the header columns into one record
pub(crate) fn header_record(table: &Table) -> Vec<String> {
    table
        .headers
        .iter()
        .map(|column| match column.rows.first() {
            Some(cell) => value_to_string(cell),
            None => column.label.clone(),
        })
        .collect()
}

/// Flatten the data columns into row-major records. Ragged columns are
/// padded with empty cells.
pub(crate) fn data_records(table: &Table) -> Vec<Vec<String>> {
    let rows = table
        .columns
        .iter()
        .map(|column| column.rows.len())
        .max()
        .unwrap_or(0);

    (0..rows)
        .map(|row| {
            table
                .columns
                .iter()
                .map(|column| {
                    column
                        .rows
                        .get(row)
                        .map(value_to_string)
                        .unwrap_or_default()
                })
                .collect()
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::testutil::sample_data;
    use super::*;

    #[test]
    fn empty_pattern_uses_the_default() {
        let data = sample_data();
        let name = resolve_name_pattern("", "{{ .Data.Tester }}.csv", &data).unwrap();
        assert_eq!(name, "iperf3.csv");
    }

    #[test]
    fn user_pattern_is_kept() {
        let data = sample_data();
        let name =
            resolve_name_pattern("{{ .UnixTime }}.csv", "{{ .Data.Tester }}.csv", &data).unwrap();
        assert_eq!(name, "1700000000.csv");
    }

    #[test]
    fn unknown_pattern_variables_fail() {
        let data = sample_data();
        assert!(resolve_name_pattern("{{ .Nope }}", "x", &data).is_err());
    }

    #[test]
    fn identifier_sanitizing() {
        assert_eq!(sanitize_identifier("iperf3-s1_c1.csv"), "iperf3_s1_c1_csv");
        assert_eq!(sanitize_identifier("plain_name"), "plain_name");
    }

    #[test]
    fn records_are_row_major() {
        let data = sample_data();
        assert_eq!(header_record(&data.table), vec!["round", "bits_per_second"]);
        let records = data_records(&data.table);
        assert_eq!(records, vec![vec!["0", "100.0"], vec!["0", "200.0"]]);
    }
}
