//! Segment-based dense id allocation.
//!
//! A per-business row in the metadata store holds (max_id, step).  A
//! background refill task keeps a bounded in-memory window of pre-issued
//! ids; when the window drains it claims a fresh range with one
//! transactional read-and-advance.  Row serialization in the store is
//! what keeps two allocator instances from ever handing out the same id.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

use crate::metadata::MetadataStore;

/// How long a consumer waits on an empty window before failing.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Dense id allocator fed by transactionally-claimed segments.
pub struct SegmentAllocator {
    rx: Mutex<mpsc::Receiver<i64>>,
}

impl SegmentAllocator {
    /// Seed the segment row if needed and start the refill task.
    pub async fn start(
        store: Arc<dyn MetadataStore>,
        business_id: &str,
        step: i64,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(step > 0, "segment step must be positive, got {step}");
        store.seed_segment(business_id, step).await?;

        // The channel is the pre-issued window; a full channel back-pressures
        // the refill task instead of claiming ranges it cannot hand out.
        let (tx, rx) = mpsc::channel(step.min(1024) as usize);
        let business_id = business_id.to_string();
        tokio::spawn(async move {
            loop {
                match store.claim_segment(&business_id).await {
                    Ok(range) => {
                        for id in range.start..=range.end {
                            if tx.send(id).await.is_err() {
                                // Allocator dropped; stop refilling.
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(business_id = %business_id, error = %e, "segment claim failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self { rx: Mutex::new(rx) })
    }

    /// Take the next id, failing after a bounded wait rather than
    /// hanging if the refill task cannot reach the store.
    pub async fn next_id(&self) -> anyhow::Result<i64> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .context("timed out waiting for an id segment refill")?
            .ok_or_else(|| anyhow!("id segment refill task stopped"))
    }
}
