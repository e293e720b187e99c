//! Maintenance: slow-cadence metrics refresh and retention pruning. Runs on
//! its own scheduler queue; never blocks the indexing cycle.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::derived::metrics;
use crate::store::Store;

const DEFAULT_ACTIVE_MARKET_LIMIT: usize = 1_000;

pub struct Maintenance {
    store: Arc<dyn Store>,
    price_history_retention_days: i64,
    event_log_retention_days: i64,
}

impl Maintenance {
    pub fn new(store: Arc<dyn Store>, price_history_retention_days: i64, event_log_retention_days: i64) -> Self {
        Self {
            store,
            price_history_retention_days,
            event_log_retention_days,
        }
    }

    pub async fn run_once(&self) {
        let refreshed = self.refresh_active_market_metrics().await;
        let pruned_price_history = self.prune_price_history().await;
        let pruned_event_log = self.prune_event_log().await;

        info!(
            refreshed,
            pruned_price_history, pruned_event_log, "maintenance pass complete"
        );
    }

    async fn refresh_active_market_metrics(&self) -> usize {
        let condition_ids = match self.store.list_active_condition_ids(DEFAULT_ACTIVE_MARKET_LIMIT).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "failed to list active conditions for metrics refresh");
                return 0;
            }
        };

        let mut refreshed = 0;
        for condition_id in condition_ids {
            match metrics::recompute(&self.store, &condition_id).await {
                Ok(fresh) => {
                    if let Err(e) = self.store.upsert_market_metrics(&fresh).await {
                        warn!(error = %e, condition_id, "failed to persist recomputed metrics");
                    } else {
                        refreshed += 1;
                    }
                }
                Err(e) => warn!(error = %e, condition_id, "failed to recompute metrics"),
            }
        }
        refreshed
    }

    async fn prune_price_history(&self) -> usize {
        let cutoff = Utc::now().timestamp() - self.price_history_retention_days * 86_400;
        match self.store.prune_price_history_older_than(cutoff).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "price history pruning failed");
                0
            }
        }
    }

    async fn prune_event_log(&self) -> usize {
        let cutoff = Utc::now().timestamp() - self.event_log_retention_days * 86_400;
        match self.store.prune_event_log_older_than(cutoff).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "event log pruning failed");
                0
            }
        }
    }
}
