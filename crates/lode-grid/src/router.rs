//! Request routing.
//!
//! Resolves a key to the member that should serve it using the locally
//! cached directory, and retries operations that hit a stale route. Only
//! routing errors (`NotOwner`, `StaleEpoch`) are retried, each time after
//! a jittered exponential backoff and a directory refresh. Everything else
//! goes straight back to the caller, and retries are bounded.

use std::future::Future;
use std::time::Duration;

use lode_cluster::{
    bucket_for_key, GridError, MemberId, ReadPolicy, RegionEntry, RegionId, View,
};
use metrics::counter;
use rand::Rng;
use tracing::debug;

use crate::config::RouterConfig;

/// Where an operation on one key should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub region: RegionId,
    pub bucket: u32,
    /// Ownership epoch of the bucket in the snapshot the route came from.
    pub epoch: u64,
    pub member: MemberId,
}

#[derive(Debug, Clone)]
pub struct Router {
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// The primary for `key`: where writes go.
    pub fn primary_route(entry: &RegionEntry, key: &[u8], view: &View) -> Result<Route, GridError> {
        let (bucket, epoch) = Self::locate(entry, key)?;
        let owners = entry
            .table
            .bucket(bucket)
            .ok_or_else(|| GridError::degraded(entry.name(), bucket))?;
        let primary = owners
            .primary
            .ok_or_else(|| GridError::degraded(entry.name(), bucket))?;
        if !view.contains(primary) {
            // the table predates the view that removed the primary
            return Err(GridError::not_owner(entry.name(), bucket, primary));
        }
        Ok(Route {
            region: entry.id.clone(),
            bucket,
            epoch,
            member: primary,
        })
    }

    /// The owner that should serve a read of `key` from `local`.
    ///
    /// With `AnyOwner` reads a local copy is preferred, then the primary,
    /// then any secondary still in the view.
    pub fn read_route(
        entry: &RegionEntry,
        key: &[u8],
        view: &View,
        local: MemberId,
    ) -> Result<Route, GridError> {
        if entry.config.read_policy == ReadPolicy::Primary {
            return Self::primary_route(entry, key, view);
        }
        let (bucket, epoch) = Self::locate(entry, key)?;
        let owners = entry
            .table
            .bucket(bucket)
            .ok_or_else(|| GridError::degraded(entry.name(), bucket))?;
        let member = if owners.is_owner(local) {
            Some(local)
        } else {
            owners.owners().find(|m| view.contains(*m))
        };
        let member = member.ok_or_else(|| GridError::degraded(entry.name(), bucket))?;
        Ok(Route {
            region: entry.id.clone(),
            bucket,
            epoch,
            member,
        })
    }

    fn locate(entry: &RegionEntry, key: &[u8]) -> Result<(u32, u64), GridError> {
        if !entry.is_active() {
            return Err(GridError::RegionNotActive {
                name: entry.name().to_string(),
                state: entry.state,
            });
        }
        let bucket = bucket_for_key(key, entry.config.bucket_count);
        let epoch = entry
            .table
            .epoch_of(bucket)
            .ok_or_else(|| GridError::degraded(entry.name(), bucket))?;
        Ok((bucket, epoch))
    }

    /// Delay before retry number `attempt` (0-based): exponential from
    /// `backoff_base_ms`, capped at `backoff_max_ms`, plus up to 25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base_ms.max(1);
        let exp = base.saturating_mul(1u64 << attempt.min(20));
        let capped = exp.min(self.config.backoff_max_ms.max(base));
        let jitter = rand::rng().random_range(0..=capped / 4);
        Duration::from_millis(capped + jitter)
    }

    /// Runs `op`, retrying routing errors.
    ///
    /// Before each retry it sleeps for the backoff and calls `refresh` so
    /// the next attempt sees a newer directory. Gives up with
    /// `RoutingExhausted` after `max_retries` retries.
    pub async fn retry<T, Op, OpFut, Refresh, RefreshFut>(
        &self,
        mut op: Op,
        mut refresh: Refresh,
    ) -> Result<T, GridError>
    where
        Op: FnMut() -> OpFut,
        OpFut: Future<Output = Result<T, GridError>>,
        Refresh: FnMut() -> RefreshFut,
        RefreshFut: Future<Output = ()>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_routing_error() => {
                    if attempt >= self.config.max_retries {
                        return Err(GridError::RoutingExhausted {
                            attempts: attempt + 1,
                            last: e.to_string(),
                        });
                    }
                    let delay = self.backoff(attempt);
                    debug!(attempt = attempt + 1, ?delay, error = %e, "stale route, retrying");
                    counter!("lode_routing_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                    refresh().await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
