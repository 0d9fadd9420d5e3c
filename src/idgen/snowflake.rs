//! Snowflake id generation.
//!
//! Ids pack a millisecond timestamp, a datacenter id, a worker id and a
//! per-millisecond sequence into 63 bits, so they sort by creation time
//! and never collide across nodes as long as (datacenter, worker) pairs
//! are unique.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail};

use crate::cache::Cache;

/// Custom epoch (milliseconds): 2014-12-07T07:35:00Z.
const EPOCH_MS: i64 = 1_417_937_700_000;

const WORKER_BITS: u8 = 5;
const DATACENTER_BITS: u8 = 5;
const SEQUENCE_BITS: u8 = 12;

const MAX_WORKER_ID: i64 = (1 << WORKER_BITS) - 1;
const MAX_DATACENTER_ID: i64 = (1 << DATACENTER_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

const WORKER_SHIFT: u8 = SEQUENCE_BITS;
const DATACENTER_SHIFT: u8 = SEQUENCE_BITS + WORKER_BITS;
const TIMESTAMP_SHIFT: u8 = SEQUENCE_BITS + WORKER_BITS + DATACENTER_BITS;

/// Cache key prefix mapping a node address to its assigned worker id.
const WORKER_KEY_PREFIX: &str = "snowflake:worker:";
/// Cache counter handing out fresh worker ids.
const WORKER_COUNTER_KEY: &str = "snowflake:worker:counter";

struct State {
    last_ts: i64,
    sequence: i64,
}

/// Thread-safe snowflake generator.
pub struct Snowflake {
    datacenter_id: i64,
    worker_id: i64,
    state: Mutex<State>,
}

impl Snowflake {
    pub fn new(datacenter_id: i64, worker_id: i64) -> anyhow::Result<Self> {
        if !(0..=MAX_DATACENTER_ID).contains(&datacenter_id) {
            bail!("datacenter id {datacenter_id} out of range 0..={MAX_DATACENTER_ID}");
        }
        if !(0..=MAX_WORKER_ID).contains(&worker_id) {
            bail!("worker id {worker_id} out of range 0..={MAX_WORKER_ID}");
        }
        Ok(Self {
            datacenter_id,
            worker_id,
            state: Mutex::new(State {
                last_ts: -1,
                sequence: 0,
            }),
        })
    }

    /// Build a generator whose worker id is leased through the shared
    /// cache, keyed by this node's address.  A node keeps the same worker
    /// id across restarts; new nodes get the next counter value modulo
    /// the worker-id space.
    pub async fn from_cache(
        cache: &Arc<dyn Cache>,
        datacenter_id: i64,
        node_addr: &str,
    ) -> anyhow::Result<Self> {
        let key = format!("{WORKER_KEY_PREFIX}{node_addr}");
        let worker_id = match cache.get(&key).await? {
            Some(existing) => existing
                .parse::<i64>()
                .map_err(|e| anyhow!("corrupt worker id for {node_addr}: {e}"))?,
            None => {
                let assigned = cache.incr(WORKER_COUNTER_KEY).await? & MAX_WORKER_ID;
                cache.set(&key, &assigned.to_string()).await?;
                assigned
            }
        };
        Self::new(datacenter_id, worker_id)
    }

    /// Mint the next id.  Fails if the wall clock moved backwards past the
    /// last issued timestamp.
    pub fn next_id(&self) -> anyhow::Result<i64> {
        let mut state = self.state.lock().expect("mutex poisoned");
        let mut now = current_millis();
        if now < state.last_ts {
            bail!(
                "clock moved backwards: refusing to mint ids for {} ms",
                state.last_ts - now
            );
        }

        if now == state.last_ts {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond; wait it out.
                while now <= state.last_ts {
                    now = current_millis();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ts = now;

        Ok(((now - EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.datacenter_id << DATACENTER_SHIFT)
            | (self.worker_id << WORKER_SHIFT)
            | state.sequence)
    }
}

fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use std::collections::HashSet;

    #[test]
    fn test_ids_unique_and_increasing() {
        let gen = Snowflake::new(1, 1).unwrap();
        let mut seen = HashSet::new();
        let mut prev = 0;
        for _ in 0..10_000 {
            let id = gen.next_id().unwrap();
            assert!(id > prev, "ids must be strictly increasing");
            assert!(seen.insert(id));
            prev = id;
        }
    }

    #[test]
    fn test_id_layout() {
        let gen = Snowflake::new(3, 7).unwrap();
        let id = gen.next_id().unwrap();
        assert_eq!((id >> DATACENTER_SHIFT) & MAX_DATACENTER_ID, 3);
        assert_eq!((id >> WORKER_SHIFT) & MAX_WORKER_ID, 7);
        let ts = (id >> TIMESTAMP_SHIFT) + EPOCH_MS;
        let now = current_millis();
        assert!((now - ts).abs() < 1_000);
    }

    #[test]
    fn test_out_of_range_ids_rejected() {
        assert!(Snowflake::new(32, 0).is_err());
        assert!(Snowflake::new(0, 32).is_err());
        assert!(Snowflake::new(-1, 0).is_err());
    }

    #[tokio::test]
    async fn test_worker_id_stable_per_node() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let a = Snowflake::from_cache(&cache, 0, "10.0.0.1:8888").await.unwrap();
        let b = Snowflake::from_cache(&cache, 0, "10.0.0.2:8888").await.unwrap();
        // Re-registering the same node reuses its lease.
        let a2 = Snowflake::from_cache(&cache, 0, "10.0.0.1:8888").await.unwrap();
        assert_eq!(a.worker_id, a2.worker_id);
        assert_ne!(a.worker_id, b.worker_id);
    }
}
