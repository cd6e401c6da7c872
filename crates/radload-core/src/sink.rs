use crate::record::OutcomeRecord;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Records that can queue before producers wait on the writer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;
const WRITE_BUFFER_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkReport {
    /// Records written to the stream
    pub written: u64,
    /// Records dropped because they could not be serialized or written
    pub skipped: u64,
    /// Written records that carry a failure outcome
    pub failures: u64,
}

/// Single writer task turning records into JSON lines.
pub struct MetricsSink<W> {
    handle: JoinHandle<std::io::Result<(W, SinkReport)>>,
}

impl<W> MetricsSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Start the writer; the stream closes once every sender is dropped.
    pub fn spawn(writer: W, capacity: usize) -> (mpsc::Sender<OutcomeRecord>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(drain(rx, writer));
        (tx, Self { handle })
    }

    /// Wait for the channel to close, flush, and hand back the writer.
    pub async fn finish(self) -> std::io::Result<(W, SinkReport)> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("metrics sink task failed: {e}"),
            )),
        }
    }
}

async fn drain<W>(
    mut rx: mpsc::Receiver<OutcomeRecord>,
    writer: W,
) -> std::io::Result<(W, SinkReport)>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BufWriter::with_capacity(WRITE_BUFFER_BYTES, writer);
    let mut report = SinkReport::default();
    let mut line = Vec::with_capacity(256);
    let mut write_failed = false;

    while let Some(record) = rx.recv().await {
        line.clear();
        if let Err(e) = serde_json::to_writer(&mut line, &record) {
            report.skipped += 1;
            warn!("Skipping record that failed to serialize: {}", e);
            continue;
        }
        line.push(b'\n');

        match out.write_all(&line).await {
            Ok(()) => {
                report.written += 1;
                if record.is_failure() {
                    report.failures += 1;
                }
            }
            Err(e) => {
                // Keep consuming so producers never block on a dead stream.
                if !write_failed {
                    warn!("Failed to write record to output stream: {}", e);
                    write_failed = true;
                }
                report.skipped += 1;
            }
        }
    }

    out.flush().await?;
    Ok((out.into_inner(), report))
}
