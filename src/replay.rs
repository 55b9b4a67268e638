use anyhow::Context as _;
use hyper::{Method, Request, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    config::ReplayAck,
    queue::{Queue, QueuedRequest},
    relay::{HttpClient, boxed_full},
};

/// Outcome of one replay pass, as reported on the admin endpoint and the CLI.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub attempted: usize,
    pub failed: usize,
}

/// Drains the durable queue on a replay trigger and re-issues each stored
/// request with its original method, URL, and reassembled body.
pub struct Replayer {
    queue: Queue,
    client: HttpClient,
    ack: ReplayAck,
    pass_lock: AsyncMutex<()>,
}

impl Replayer {
    pub fn new(queue: Queue, client: HttpClient, ack: ReplayAck) -> Self {
        Self {
            queue,
            client,
            ack,
            pass_lock: AsyncMutex::new(()),
        }
    }

    /// Runs one replay pass. Passes are serialized: a trigger arriving while a
    /// pass is in flight waits for it to finish instead of interleaving.
    ///
    /// Individual replay failures are logged and do not block the remaining
    /// records. Acknowledgment removes only the records that were drained by
    /// this pass, so a record enqueued concurrently survives to the next
    /// trigger.
    pub async fn on_replay_trigger(&self) -> anyhow::Result<ReplaySummary> {
        let _pass = self.pass_lock.lock().await;

        let records = self
            .queue
            .drain_all()
            .await
            .context("drain queued requests")?;
        if records.is_empty() {
            tracing::debug!("replay trigger with empty queue");
            return Ok(ReplaySummary::default());
        }

        tracing::info!("replaying {} queued request(s)", records.len());
        let mut summary = ReplaySummary {
            attempted: records.len(),
            failed: 0,
        };
        let mut acked = Vec::with_capacity(records.len());

        for record in &records {
            match self.replay_one(record).await {
                Ok(status) if status.is_success() => {
                    tracing::debug!(
                        id = record.id,
                        url = %record.url,
                        %status,
                        "replayed queued request"
                    );
                    acked.push(record.id);
                }
                Ok(status) => {
                    summary.failed += 1;
                    tracing::warn!(
                        id = record.id,
                        url = %record.url,
                        %status,
                        "replayed request was rejected upstream"
                    );
                    if self.ack == ReplayAck::Drained {
                        acked.push(record.id);
                    }
                }
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(
                        id = record.id,
                        url = %record.url,
                        "replay attempt failed: {err:#}"
                    );
                    if self.ack == ReplayAck::Drained {
                        acked.push(record.id);
                    }
                }
            }
        }

        self.queue
            .remove(&acked)
            .await
            .context("acknowledge replayed requests")?;
        Ok(summary)
    }

    async fn replay_one(&self, record: &QueuedRequest) -> anyhow::Result<StatusCode> {
        let uri: Uri = record
            .url
            .parse()
            .with_context(|| format!("parse stored url `{}`", record.url))?;
        let method: Method = record
            .method
            .parse()
            .with_context(|| format!("parse stored method `{}`", record.method))?;
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(boxed_full(record.concatenated_body()))
            .context("build replay request")?;

        let response = self
            .client
            .request(request)
            .await
            .context("issue replay request")?;
        Ok(response.status())
    }
}
