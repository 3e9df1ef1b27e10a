//! Per-caller sliding-window admission control.
//!
//! Each caller moves through `Unseen -> Active -> Blocked -> Active`. Records
//! live in a sharded map; a caller's read-modify-write always happens under
//! its shard's lock, so the periodic sweep can never interleave with an
//! admission for the same key.

use crate::{
    clock::{to_chrono, Clock},
    config::RateLimitConfig,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub count: u32,
    pub window_reset_at: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
}

impl RateLimitRecord {
    fn fresh(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 1,
            window_reset_at: now + to_chrono(window),
            blocked_until: None,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.window_reset_at <= now && self.blocked_until.map_or(true, |until| until <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

type Shard = Mutex<HashMap<String, RateLimitRecord>>;

pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    shards: Vec<Shard>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decides whether `caller_id` may issue one more request right now.
    pub fn admit(&self, caller_id: &str) -> Admission {
        let now = self.clock.now();
        let mut shard = self.shard(caller_id);

        match shard.get_mut(caller_id) {
            Some(record) => self.step(caller_id, record, now),
            None => {
                shard.insert(
                    caller_id.to_string(),
                    RateLimitRecord::fresh(now, self.config.window),
                );
                self.allowed_fresh()
            }
        }
    }

    fn step(&self, caller_id: &str, record: &mut RateLimitRecord, now: DateTime<Utc>) -> Admission {
        if let Some(until) = record.blocked_until {
            if now < until {
                return Admission::Denied {
                    retry_after: remaining(until, now),
                };
            }
            log::info!("Rate limit block lifted for caller {}", caller_id);
            *record = RateLimitRecord::fresh(now, self.config.window);
            return self.allowed_fresh();
        }

        if record.window_reset_at <= now {
            *record = RateLimitRecord::fresh(now, self.config.window);
            return self.allowed_fresh();
        }

        if record.count < self.config.max_requests {
            record.count += 1;
            return Admission::Allowed {
                remaining: self.config.max_requests - record.count,
            };
        }

        record.blocked_until = Some(now + to_chrono(self.config.block_duration));
        log::warn!(
            "Caller {} exceeded {} requests per {}s, blocked for {}s",
            caller_id,
            self.config.max_requests,
            self.config.window.as_secs(),
            self.config.block_duration.as_secs()
        );
        Admission::Denied {
            retry_after: self.config.block_duration,
        }
    }

    fn allowed_fresh(&self) -> Admission {
        Admission::Allowed {
            remaining: self.config.max_requests.saturating_sub(1),
        }
    }

    /// Removes records whose window and block have both elapsed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut records = lock(shard);
            let before = records.len();
            records.retain(|_, record| !record.is_expired(now));
            removed += before - records.len();
        }
        if removed > 0 {
            log::debug!("Rate limit sweep removed {} expired records", removed);
        }
        removed
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        log::debug!("Rate limit sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        limiter.sweep();
                    }
                }
            }
        })
    }

    pub fn tracked_callers(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    pub fn record(&self, caller_id: &str) -> Option<RateLimitRecord> {
        self.shard(caller_id).get(caller_id).cloned()
    }

    /// Copies the whole table, e.g. to persist it across restarts.
    pub fn snapshot(&self) -> HashMap<String, RateLimitRecord> {
        let mut all = HashMap::new();
        for shard in &self.shards {
            all.extend(lock(shard).iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        all
    }

    /// Loads records saved by [`snapshot`](Self::snapshot), replacing any live record for the same caller.
    pub fn restore(&self, records: HashMap<String, RateLimitRecord>) {
        for (caller_id, record) in records {
            self.shard(&caller_id).insert(caller_id, record);
        }
    }

    fn shard(&self, caller_id: &str) -> MutexGuard<'_, HashMap<String, RateLimitRecord>> {
        let mut hasher = DefaultHasher::new();
        caller_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        lock(&self.shards[index])
    }
}

fn lock(shard: &Shard) -> MutexGuard<'_, HashMap<String, RateLimitRecord>> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remaining(until: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}
