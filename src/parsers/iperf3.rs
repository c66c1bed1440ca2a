//! Parser for `iperf3 --json` client output.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use super::{consume_frames, data_for_input, Parser};
use crate::cancel::CancelToken;
use crate::config::Test;
use crate::models::{Column, Data, Input, Table};

pub const NAME: &str = "iperf3";

#[derive(Debug, Deserialize)]
struct Iperf3Output {
    #[serde(default)]
    intervals: Vec<Interval>,
    #[serde(default)]
    end: Option<End>,
}

#[derive(Debug, Deserialize)]
struct Interval {
    sum: Option<IntervalSum>,
}

#[derive(Debug, Deserialize)]
struct IntervalSum {
    start: f64,
    end: f64,
    bytes: u64,
    bits_per_second: f64,
    #[serde(default)]
    retransmits: Option<u64>,
    #[serde(default)]
    omitted: bool,
}

#[derive(Debug, Deserialize)]
struct End {
    sum_sent: Option<EndSum>,
    sum_received: Option<EndSum>,
}

#[derive(Debug, Deserialize)]
struct EndSum {
    bits_per_second: f64,
}

/// Per (server, client) throughput samples accumulated for the summary
#[derive(Default)]
struct SummaryState {
    meta: Option<(DateTime<Utc>, String)>,
    samples: BTreeMap<(String, String), (u64, f64)>,
}

pub struct IPerf3Parser {
    summary: Mutex<SummaryState>,
}

impl IPerf3Parser {
    pub fn new(_test: &Test) -> Result<Box<dyn Parser>> {
        Ok(Box::new(IPerf3Parser {
            summary: Mutex::new(SummaryState::default()),
        }))
    }

    fn frame_to_data(&self, input: &Input, bytes: &[u8]) -> Result<Data> {
        let output: Iperf3Output =
            serde_json::from_slice(bytes).context("output is not iperf3 JSON")?;
        if output.intervals.is_empty() {
            bail!("iperf3 output carries no intervals");
        }

        let mut round = Vec::new();
        let mut test_time = Vec::new();
        let mut start = Vec::new();
        let mut end = Vec::new();
        let mut transferred = Vec::new();
        let mut bps = Vec::new();
        let mut retransmits = Vec::new();

        for interval in output.intervals.iter().filter_map(|i| i.sum.as_ref()) {
            if interval.omitted {
                continue;
            }
            round.push(json!(input.round));
            test_time.push(json!(input.test_time.timestamp()));
            start.push(json!(interval.start));
            end.push(json!(interval.end));
            transferred.push(json!(interval.bytes));
            bps.push(json!(interval.bits_per_second));
            retransmits.push(match interval.retransmits {
                Some(n) => json!(n),
                None => serde_json::Value::Null,
            });
        }
        if round.is_empty() {
            bail!("iperf3 output carries no usable intervals");
        }

        // Throughput sample for the end-of-test summary; received side is
        // the authoritative number, sender side the fallback.
        if let Some(end) = &output.end {
            let sample = end
                .sum_received
                .as_ref()
                .or(end.sum_sent.as_ref())
                .map(|sum| sum.bits_per_second);
            if let Some(bits_per_second) = sample {
                let mut state = self.summary.lock().unwrap();
                state
                    .meta
                    .get_or_insert((input.test_start_time, input.tester.clone()));
                let entry = state
                    .samples
                    .entry((input.server_host.clone(), input.client_host.clone()))
                    .or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += bits_per_second;
            }
        }

        let labels = [
            "round",
            "test_time",
            "interval_start",
            "interval_end",
            "bytes",
            "bits_per_second",
            "retransmits",
        ];
        let mut data = data_for_input(input);
        data.table = Table {
            headers: labels
                .iter()
                .map(|label| Column::new(*label, vec![json!(label)]))
                .collect(),
            columns: vec![
                Column::new("round", round),
                Column::new("test_time", test_time),
                Column::new("interval_start", start),
                Column::new("interval_end", end),
                Column::new("bytes", transferred),
                Column::new("bits_per_second", bps),
                Column::new("retransmits", retransmits),
            ],
        };
        Ok(data)
    }
}

#[async_trait]
impl Parser for IPerf3Parser {
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

    async fn summary(&self, data_tx: mpsc::Sender<Data>) -> Result<()> {
        let (test_start_time, tester, servers, clients, samples, mean_bps) = {
            let state = self.summary.lock().unwrap();
            let Some((test_start_time, tester)) = state.meta.clone() else {
                return Ok(());
            };

            let mut servers = Vec::new();
            let mut clients = Vec::new();
            let mut samples = Vec::new();
            let mut mean_bps = Vec::new();
            for ((server, client), (count, total)) in &state.samples {
                servers.push(json!(server));
                clients.push(json!(client));
                samples.push(json!(count));
                mean_bps.push(json!(total / *count as f64));
            }

            (test_start_time, tester, servers, clients, samples, mean_bps)
        };

        let labels = ["server_host", "client_host", "samples", "mean_bits_per_second"];
        let data = Data {
            tester,
            server_host: "all".to_string(),
            client_host: "all".to_string(),
            test_start_time,
            table: Table {
                headers: labels
                    .iter()
                    .map(|label| Column::new(*label, vec![json!(label)]))
                    .collect(),
                columns: vec![
                    Column::new("server_host", servers),
                    Column::new("client_host", clients),
                    Column::new("samples", samples),
                    Column::new("mean_bits_per_second", mean_bps),
                ],
            },
        };

        if data_tx.send(data).await.is_err() {
            tracing::warn!("output channel closed, dropping summary frame");
        }
        Ok(())
    }
}
