//! Job output upload
//!
//! A [`LogStreamer`] owns the receiving end of a job's output channel. It
//! batches bytes into chunks and uploads them in order, so the runner's
//! reader tasks never wait on the network.

use std::sync::Arc;
use std::time::Duration;

use raibid_common::{AgentIdentity, Coordinator, LogChunk};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::retry::{break_if_terminal, Retrier, RetryPolicy};

/// Largest chunk sent in one upload
pub const MAX_CHUNK_SIZE: usize = 100 * 1024;

/// Buffered output is uploaded at least this often
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the output channel handed to runners
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Totals for one job's output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub chunks_uploaded: u64,
    pub chunks_failed: u64,
    pub bytes: u64,
}

/// Background uploader for one job
pub struct LogStreamer {
    closing: CancellationToken,
    task: JoinHandle<StreamSummary>,
}

impl LogStreamer {
    /// Start uploading whatever arrives on `output`
    pub fn start(
        coordinator: Arc<dyn Coordinator>,
        agent: AgentIdentity,
        job_id: String,
        output: mpsc::Receiver<Vec<u8>>,
        policy: RetryPolicy,
    ) -> Self {
        let closing = CancellationToken::new();
        let upload = ChunkUploader {
            coordinator,
            agent,
            job_id,
            policy,
            sequence: 0,
            offset: 0,
            summary: StreamSummary::default(),
        };
        let task = tokio::spawn(upload.run(output, closing.clone()));
        Self { closing, task }
    }

    /// Upload what is still buffered and stop
    ///
    /// Output written after this call is dropped.
    pub async fn finish(self) -> StreamSummary {
        self.closing.cancel();
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("log streamer task failed: {}", e);
                StreamSummary::default()
            }
        }
    }
}

struct ChunkUploader {
    coordinator: Arc<dyn Coordinator>,
    agent: AgentIdentity,
    job_id: String,
    policy: RetryPolicy,
    sequence: u64,
    offset: u64,
    summary: StreamSummary,
}

impl ChunkUploader {
    async fn run(
        mut self,
        mut output: mpsc::Receiver<Vec<u8>>,
        closing: CancellationToken,
    ) -> StreamSummary {
        let mut buffer: Vec<u8> = Vec::new();
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                data = output.recv() => match data {
                    Some(data) => {
                        buffer.extend_from_slice(&data);
                        if buffer.len() >= MAX_CHUNK_SIZE {
                            self.flush(&mut buffer, false).await;
                        }
                    }
                    None => break,
                },
                _ = closing.cancelled() => {
                    while let Ok(data) = output.try_recv() {
                        buffer.extend_from_slice(&data);
                    }
                    break;
                }
                _ = ticker.tick() => self.flush(&mut buffer, true).await,
            }
        }

        self.flush(&mut buffer, true).await;
        debug!(
            job_id = %self.job_id,
            chunks = self.summary.chunks_uploaded,
            failed = self.summary.chunks_failed,
            bytes = self.summary.bytes,
            "Job output stream closed"
        );
        self.summary
    }

    /// Upload full chunks, plus the remainder when `all` is set
    async fn flush(&mut self, buffer: &mut Vec<u8>, all: bool) {
        while buffer.len() >= MAX_CHUNK_SIZE || (all && !buffer.is_empty()) {
            let take = buffer.len().min(MAX_CHUNK_SIZE);
            let data: Vec<u8> = buffer.drain(..take).collect();
            self.upload(data).await;
        }
    }

    async fn upload(&mut self, data: Vec<u8>) {
        self.sequence += 1;
        let chunk = LogChunk {
            sequence: self.sequence,
            offset: self.offset,
            data,
        };
        self.offset += chunk.size() as u64;
        self.summary.bytes += chunk.size() as u64;

        let coordinator = &self.coordinator;
        let agent = &self.agent;
        let job_id = self.job_id.as_str();
        let result = Retrier::new("upload log chunk", self.policy.clone())
            .run(|attempt| {
                let chunk = &chunk;
                async move {
                    coordinator
                        .upload_chunk(agent, job_id, chunk)
                        .await
                        .map_err(|e| break_if_terminal(&attempt, e))
                }
            })
            .await;

        match result {
            Ok(()) => self.summary.chunks_uploaded += 1,
            Err(e) => {
                warn!(
                    job_id = %self.job_id,
                    sequence = chunk.sequence,
                    size = chunk.size(),
                    error = %e,
                    "Dropping log chunk"
                );
                self.summary.chunks_failed += 1;
            }
        }
    }
}
