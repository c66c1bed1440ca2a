//! Parser for `pingparsing` JSON output (one statistics object per run).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{consume_frames, data_for_input, Parser};
use crate::cancel::CancelToken;
use crate::config::Test;
use crate::models::{Column, Data, Input, Table};

pub const NAME: &str = "pingparsing";

pub struct PingParsingParser;

impl PingParsingParser {
    pub fn new(_test: &Test) -> Result<Box<dyn Parser>> {
        Ok(Box::new(PingParsingParser))
    }

    fn frame_to_data(&self, input: &Input, bytes: &[u8]) -> Result<Data> {
        let parsed: Value =
            serde_json::from_slice(bytes).context("output is not pingparsing JSON")?;

        // The CLI nests the statistics under the destination key; accept a
        // bare statistics object as well.
        let stats = match parsed.as_object() {
            Some(object) if object.contains_key("packet_transmit") => &parsed,
            Some(object) => match object.values().find(|v| v.get("packet_transmit").is_some()) {
                Some(inner) => inner,
                None => bail!("no ping statistics object in output"),
            },
            None => bail!("no ping statistics object in output"),
        };

        let labels = [
            "destination",
            "packet_transmit",
            "packet_receive",
            "packet_loss_rate",
            "rtt_min",
            "rtt_avg",
            "rtt_max",
            "rtt_mdev",
        ];

        let mut columns = Vec::with_capacity(labels.len());
        for label in labels {
            let value = match label {
                "destination" => stats
                    .get("destination")
                    .cloned()
                    .unwrap_or_else(|| json!(input.server_host.clone())),
                _ => stats.get(label).cloned().unwrap_or(Value::Null),
            };
            columns.push(Column::new(label, vec![value]));
        }

        let mut data = data_for_input(input);
        data.table = Table {
            headers: labels
                .iter()
                .map(|label| Column::new(*label, vec![json!(label)]))
                .collect(),
            columns,
        };
        Ok(data)
    }
}

#[async_trait]
impl Parser for PingParsingParser {
    async fn parse(
        &self,
        done: CancelToken,
        in_rx: mpsc::Receiver<Input>,
        data_tx: mpsc::Sender<Data>,
    ) -> Result<()> {
        consume_frames(done, in_rx, data_tx, &|input, bytes| {
            self.frame_to_data(input, bytes)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Payload;
    use chrono::Utc;

    const OUTPUT: &str = r#"{
  "192.0.2.10": {
    "destination": "192.0.2.10",
    "packet_transmit": 10,
    "packet_receive": 9,
    "packet_loss_rate": 10.0,
    "rtt_min": 0.41,
    "rtt_avg": 1.71,
    "rtt_max": 9.64,
    "rtt_mdev": 2.89
  }
}"#;

    fn frame() -> Input {
        Input {
            test_start_time: Utc::now(),
            test_time: Utc::now(),
            round: 0,
            payload: Payload::Bytes(Vec::new()),
            tester: "pingparsing".into(),
            server_host: "s1".into(),
            client_host: "c1".into(),
            additional_info: String::new(),
        }
    }

    #[test]
    fn parses_nested_statistics() {
        let parser = PingParsingParser;
        let data = parser.frame_to_data(&frame(), OUTPUT.as_bytes()).unwrap();

        assert_eq!(data.table.columns.len(), data.table.headers.len());
        let loss = data
            .table
            .columns
            .iter()
            .find(|c| c.label == "packet_loss_rate")
            .unwrap();
        assert_eq!(loss.rows, vec![json!(10.0)]);
        let dest = data
            .table
            .columns
            .iter()
            .find(|c| c.label == "destination")
            .unwrap();
        assert_eq!(dest.rows, vec![json!("192.0.2.10")]);
    }

    #[test]
    fn parses_bare_statistics_object() {
        let parser = PingParsingParser;
        let bare = r#"{"packet_transmit": 4, "packet_receive": 4, "packet_loss_rate": 0.0}"#;
        let data = parser.frame_to_data(&frame(), bare.as_bytes()).unwrap();
        let transmit = data
            .table
            .columns
            .iter()
            .find(|c| c.label == "packet_transmit")
            .unwrap();
        assert_eq!(transmit.rows, vec![json!(4)]);
    }

    #[test]
    fn garbage_is_an_error() {
        let parser = PingParsingParser;
        assert!(parser.frame_to_data(&frame(), b"host unreachable").is_err());
        assert!(parser.frame_to_data(&frame(), b"[1, 2]").is_err());
    }
}
