//! Frame parsing: turn raw probe output into tabular [`Data`].

pub mod iperf3;
pub mod pingparsing;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::models::{Data, Input, Payload};

/// A parser is a long-running consumer specialized to one tester's output
/// format. `parse` reads frames until the input channel closes; dropping
/// `data_tx` on return is what closes the downstream channel.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse(
        &self,
        done: CancelToken,
        in_rx: mpsc::Receiver<Input>,
        data_tx: mpsc::Sender<Data>,
    ) -> Result<()>;

    /// Emit aggregate frames after the individual ones. Optional; the
    /// default does nothing.
    async fn summary(&self, data_tx: mpsc::Sender<Data>) -> Result<()> {
        let _ = data_tx;
        Ok(())
    }
}

/// Buffer a frame's payload. Consuming the stream variant drops it, which
/// closes it, on success and error alike.
pub(crate) async fn read_payload(payload: Payload) -> Result<Vec<u8>> {
    match payload {
        Payload::Bytes(bytes) => Ok(bytes),
        Payload::Stream(mut stream) => {
            let mut buf = Vec::new();
            stream
                .read_to_end(&mut buf)
                .await
                .context("failed to read data stream")?;
            Ok(buf)
        }
    }
}

/// Shared consumer skeleton: read frames until the channel closes, drain
/// best-effort when `done` fires, never let one bad frame stop the loop.
pub(crate) async fn consume_frames(
    done: CancelToken,
    mut in_rx: mpsc::Receiver<Input>,
    data_tx: mpsc::Sender<Data>,
    handler: &(dyn Fn(&Input, &[u8]) -> Result<Data> + Send + Sync),
) -> Result<()> {
    loop {
        let input = tokio::select! {
            maybe = in_rx.recv() => match maybe {
                Some(input) => input,
                None => break,
            },
            _ = done.cancelled() => {
                while let Ok(input) = in_rx.try_recv() {
                    handle_frame(input, handler, &data_tx).await;
                }
                break;
            }
        };
        handle_frame(input, handler, &data_tx).await;
    }
    Ok(())
}

async fn handle_frame(
    mut input: Input,
    handler: &(dyn Fn(&Input, &[u8]) -> Result<Data> + Send + Sync),
    data_tx: &mpsc::Sender<Data>,
) {
    let payload = std::mem::replace(&mut input.payload, Payload::Bytes(Vec::new()));
    let bytes = match read_payload(payload).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(
                client = %input.client_host,
                round = input.round,
                error = format!("{err:#}"),
                "dropping frame with unreadable payload"
            );
            return;
        }
    };

    match handler(&input, &bytes) {
        Ok(data) => {
            if data_tx.send(data).await.is_err() {
                tracing::warn!("output channel closed, dropping parsed frame");
            }
        }
        Err(err) => {
            tracing::warn!(
                client = %input.client_host,
                round = input.round,
                error = format!("{err:#}"),
                "dropping unparsable frame"
            );
        }
    }
}

/// Copy the name-pattern metadata of a frame into a [`Data`]
pub(crate) fn data_for_input(input: &Input) -> Data {
    Data {
        tester: input.tester.clone(),
        server_host: input.server_host.clone(),
        client_host: input.client_host.clone(),
        test_start_time: input.test_start_time,
        table: Default::default(),
    }
}
