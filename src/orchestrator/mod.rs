//! Pipeline Orchestrator: drives one sub-indexer's checkpoint forward one
//! batch at a time.

use std::sync::Arc;

use alloy::primitives::Address;
use tracing::{debug, info, warn};

use crate::applier::EventApplier;
use crate::chain::ChainReader;
use crate::derived::metrics;
use crate::error::PipelineError;
use crate::models::EventLogRow;
use crate::store::Store;

/// One entry per sub-indexer: its Store checkpoint name, the contract it
/// reads logs from, and the event names it recognizes on that contract.
pub struct SubIndexer {
    pub name: &'static str,
    pub contract: Address,
    pub event_names: &'static [&'static str],
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainReader>,
    applier: EventApplier,
    start_block: u64,
    batch_size: u64,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainReader>,
        applier: EventApplier,
        start_block: u64,
        batch_size: u64,
    ) -> Self {
        Self {
            store,
            chain,
            applier,
            start_block,
            batch_size,
        }
    }

    /// Advances `sub.name` by at most one batch. Returns the number of
    /// events applied, or `Ok(0)` with no-op when already caught up (B2).
    pub async fn run_cycle(&self, sub: &SubIndexer) -> Result<u64, PipelineError> {
        let last_processed = match self.store.get_indexer_state(sub.name).await? {
            Some(state) => state.last_processed_block,
            None => self.start_block.saturating_sub(1),
        };

        let current = self.chain.current_height().await?;
        if last_processed >= current {
            self.store.mark_indexer_idle(sub.name).await?;
            return Ok(0);
        }

        let from_block = last_processed + 1;
        let end_block = (last_processed + self.batch_size).min(current);

        debug!(indexer = sub.name, from_block, end_block, current, "pulling batch");

        let (events, undecoded) = self
            .chain
            .get_logs(sub.contract, sub.event_names, from_block, end_block)
            .await?;

        for log in &undecoded {
            let row = EventLogRow {
                block_number: log.block_number,
                tx_hash: log.tx_hash.to_string(),
                log_index: log.log_index,
                contract_address: log.contract_address.to_string(),
                event_name: "unknown".to_string(),
                event_args_json: log.reason.clone(),
                processed: false,
            };
            if let Err(e) = self.store.append_event_log(&row).await {
                warn!(tx_hash = %log.tx_hash, error = %e, "failed to archive undecodable log");
            }
        }

        let mut sorted = events;
        sorted.sort_by_key(|e| (e.block_number, e.log_index));

        let touched_blocks: Vec<u64> = {
            let mut numbers: Vec<u64> = sorted.iter().map(|e| e.block_number).collect();
            numbers.sort_unstable();
            numbers.dedup();
            numbers
        };
        if !touched_blocks.is_empty() {
            match self.chain.get_blocks(&touched_blocks).await {
                Ok(blocks) => {
                    for block in &blocks {
                        if let Err(e) = self.store.upsert_block(block).await {
                            warn!(block_number = block.number, error = %e, "failed to upsert block row");
                        }
                    }
                }
                Err(e) => warn!(indexer = sub.name, error = %e, "failed to fetch block records, continuing without them"),
            }
        }

        let mut applied = 0u64;
        for event in &sorted {
            match self.applier.apply(event).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    // Applier-level errors are scoped to one event's own
                    // transaction, which has already rolled back; the batch
                    // keeps going so one bad event can't stall the checkpoint.
                    warn!(
                        indexer = sub.name,
                        tx_hash = %event.tx_hash, log_index = event.log_index, error = %e,
                        "event application failed, skipping without aborting batch"
                    );
                }
            }
        }

        self.store.update_indexer_state(sub.name, end_block, applied).await?;

        let touched_conditions = self
            .store
            .conditions_traded_since((chrono::Utc::now().timestamp()) - 3_600)
            .await?;
        for condition_id in touched_conditions {
            if let Ok(fresh) = metrics::recompute(&self.store, &condition_id).await {
                let _ = self.store.upsert_market_metrics(&fresh).await;
            }
        }

        info!(indexer = sub.name, from_block, end_block, applied, "batch applied");
        Ok(applied)
    }

    /// Runs `run_cycle`, marking the sub-indexer ERROR and rethrowing on
    /// failure so the Scheduler can retry on its next tick.
    pub async fn run_cycle_guarded(&self, sub: &SubIndexer) -> Result<u64, PipelineError> {
        match self.run_cycle(sub).await {
            Ok(n) => Ok(n),
            Err(e) => {
                let _ = self.store.mark_indexer_error(sub.name, &e.to_string()).await;
                Err(e)
            }
        }
    }
}
