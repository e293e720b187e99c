//! Chain Reader: block-height queries and typed event decoding over a
//! block range, with bounded-retry transient-error handling and
//! transparent sub-batching when the RPC rejects a range.

use std::collections::HashMap;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::chain::events::{
    ConditionPreparation, ConditionResolution, DecodedEvent, EventArgs, OrderFilled,
    TransferSingle, UndecodedLog,
};
use crate::error::ChainError;
use crate::models::Block;

/// Recognized event names per contract, used to build the `eth_getLogs` topic filter.
pub const CONDITIONAL_TOKENS_EVENTS: &[&str] =
    &["ConditionPreparation", "ConditionResolution", "TransferSingle"];
pub const CTF_EXCHANGE_EVENTS: &[&str] = &["OrderFilled"];

#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn current_height(&self) -> Result<u64, ChainError>;

    /// Returns every log in `[from_block, to_block]` that decoded cleanly,
    /// plus every log that didn't (unrecognized `topic0` or malformed ABI
    /// payload) so the caller can archive it rather than let it vanish.
    async fn get_logs(
        &self,
        contract: Address,
        event_names: &[&str],
        from_block: u64,
        to_block: u64,
    ) -> Result<(Vec<DecodedEvent>, Vec<UndecodedLog>), ChainError>;

    /// Fetches full block records (hash, parent hash, gas figures, timestamp)
    /// for the given block numbers, so the caller can upsert `Block` rows
    /// for every block it has observed events in.
    async fn get_blocks(&self, block_numbers: &[u64]) -> Result<Vec<Block>, ChainError>;
}

pub struct AlloyChainReader<P> {
    provider: P,
    max_retry_attempts: u32,
}

impl<P: Provider + Clone + Send + Sync + 'static> AlloyChainReader<P> {
    pub fn new(provider: P, max_retry_attempts: u32) -> Self {
        Self {
            provider,
            max_retry_attempts,
        }
    }

    /// Runs `f` with bounded exponential backoff; the last error is returned
    /// wrapped as `ChainError::Transient`.
    async fn with_retry<T, F, Fut>(&self, label: &str, mut f: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retry_attempts => {
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt.min(5)));
                    warn!(
                        label,
                        attempt, error = %e, backoff_ms = backoff.as_millis() as u64,
                        "transient RPC error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(ChainError::Transient(format!(
                        "{label} failed after {attempt} attempts: {e}"
                    )))
                }
            }
        }
    }

    /// Fetches logs for `[from, to]`, splitting the range in half and
    /// retrying if the RPC complains the range or result set is too large.
    async fn get_logs_subbatching(
        &self,
        filter: &Filter,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, ChainError> {
        if from > to {
            return Ok(Vec::new());
        }

        let ranged = filter.clone().from_block(from).to_block(to);
        match self.provider.get_logs(&ranged).await {
            Ok(logs) => Ok(logs),
            Err(e) if from < to && looks_like_range_error(&e) => {
                let mid = from + (to - from) / 2;
                debug!(from, to, mid, "splitting log range after provider rejection");
                let mut left = Box::pin(self.get_logs_subbatching(filter, from, mid)).await?;
                let right = Box::pin(self.get_logs_subbatching(filter, mid + 1, to)).await?;
                left.extend(right);
                Ok(left)
            }
            Err(e) => Err(ChainError::Transient(format!("eth_getLogs failed: {e}"))),
        }
    }

    async fn block_timestamps(
        &self,
        block_numbers: impl Iterator<Item = u64>,
    ) -> Result<HashMap<u64, i64>, ChainError> {
        let mut distinct: Vec<u64> = block_numbers.collect();
        distinct.sort_unstable();
        distinct.dedup();

        let mut out = HashMap::with_capacity(distinct.len());
        for number in distinct {
            let timestamp = self
                .with_retry("eth_getBlockByNumber", || async {
                    let block = self
                        .provider
                        .get_block_by_number(number.into())
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("block {number} not found"))?;
                    Ok(block.header.timestamp as i64)
                })
                .await?;
            out.insert(number, timestamp);
        }
        Ok(out)
    }
}

fn looks_like_range_error(err: &impl std::fmt::Display) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("query returned more than")
        || msg.contains("block range")
        || msg.contains("limit exceeded")
        || msg.contains("too many")
}

#[async_trait]
impl<P: Provider + Clone + Send + Sync + 'static> ChainReader for AlloyChainReader<P> {
    async fn current_height(&self) -> Result<u64, ChainError> {
        self.with_retry("eth_blockNumber", || async {
            Ok(self.provider.get_block_number().await?)
        })
        .await
    }

    async fn get_logs(
        &self,
        contract: Address,
        event_names: &[&str],
        from_block: u64,
        to_block: u64,
    ) -> Result<(Vec<DecodedEvent>, Vec<UndecodedLog>), ChainError> {
        if from_block > to_block {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut signatures: Vec<&str> = Vec::new();
        for name in event_names {
            match *name {
                "ConditionPreparation" => signatures.push(ConditionPreparation::SIGNATURE),
                "ConditionResolution" => signatures.push(ConditionResolution::SIGNATURE),
                "TransferSingle" => signatures.push(TransferSingle::SIGNATURE),
                "OrderFilled" => signatures.push(OrderFilled::SIGNATURE),
                other => warn!(event = other, "unrecognized event name requested, skipping"),
            }
        }

        let filter = Filter::new().address(contract).events(signatures);
        let logs = self.get_logs_subbatching(&filter, from_block, to_block).await?;

        let timestamps = self
            .block_timestamps(logs.iter().filter_map(|l| l.block_number))
            .await?;

        let mut decoded = Vec::with_capacity(logs.len());
        let mut undecoded = Vec::new();
        for log in logs {
            let Some(block_number) = log.block_number else {
                continue;
            };
            let Some(tx_hash) = log.transaction_hash else {
                continue;
            };
            let log_index = log.log_index.unwrap_or_default();
            let block_timestamp = timestamps.get(&block_number).copied().unwrap_or(0);

            match decode_one(&log) {
                Ok(args) => decoded.push(DecodedEvent {
                    block_number,
                    block_timestamp,
                    tx_hash,
                    log_index,
                    contract_address: contract,
                    args,
                }),
                Err(e) => {
                    warn!(
                        tx_hash = %tx_hash, log_index, error = %e,
                        "undecodable event payload, archiving and skipping"
                    );
                    undecoded.push(UndecodedLog {
                        block_number,
                        tx_hash,
                        log_index,
                        contract_address: contract,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok((decoded, undecoded))
    }

    async fn get_blocks(&self, block_numbers: &[u64]) -> Result<Vec<Block>, ChainError> {
        let mut distinct: Vec<u64> = block_numbers.to_vec();
        distinct.sort_unstable();
        distinct.dedup();

        let mut blocks = Vec::with_capacity(distinct.len());
        for number in distinct {
            let block = self
                .with_retry("eth_getBlockByNumber", || async {
                    self.provider
                        .get_block_by_number(number.into())
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("block {number} not found"))
                })
                .await?;
            blocks.push(Block {
                number,
                hash: block.header.hash.to_string(),
                parent_hash: block.header.parent_hash.to_string(),
                timestamp: block.header.timestamp as i64,
                gas_used: block.header.gas_used,
                gas_limit: block.header.gas_limit,
            });
        }
        Ok(blocks)
    }
}

fn decode_one(log: &Log) -> Result<EventArgs, ChainError> {
    let Some(topic0) = log.topic0() else {
        return Err(ChainError::DataShape("log has no topics".into()));
    };

    if *topic0 == ConditionPreparation::SIGNATURE_HASH {
        let ev = ConditionPreparation::decode_log(&log.inner, true)
            .map_err(|e| ChainError::DataShape(e.to_string()))?;
        Ok(EventArgs::ConditionPreparation {
            condition_id: ev.conditionId,
            oracle: ev.oracle,
            question_id: ev.questionId,
            outcome_slot_count: ev.outcomeSlotCount,
        })
    } else if *topic0 == ConditionResolution::SIGNATURE_HASH {
        let ev = ConditionResolution::decode_log(&log.inner, true)
            .map_err(|e| ChainError::DataShape(e.to_string()))?;
        Ok(EventArgs::ConditionResolution {
            condition_id: ev.conditionId,
            oracle: ev.oracle,
            question_id: ev.questionId,
            payout_numerators: ev.payoutNumerators,
        })
    } else if *topic0 == TransferSingle::SIGNATURE_HASH {
        let ev = TransferSingle::decode_log(&log.inner, true)
            .map_err(|e| ChainError::DataShape(e.to_string()))?;
        Ok(EventArgs::TransferSingle {
            operator: ev.operator,
            from: ev.from,
            to: ev.to,
            id: ev.id,
            value: ev.value,
        })
    } else if *topic0 == OrderFilled::SIGNATURE_HASH {
        let ev = OrderFilled::decode_log(&log.inner, true)
            .map_err(|e| ChainError::DataShape(e.to_string()))?;
        Ok(EventArgs::OrderFilled {
            maker: ev.maker,
            taker: ev.taker,
            token_id: ev.tokenId,
            maker_amount: ev.makerAmount,
            taker_amount: ev.takerAmount,
            side: ev.side,
        })
    } else {
        Err(ChainError::DataShape(format!("unrecognized topic0: {topic0}")))
    }
}

/// Connects a chain reader to a Polygon-style RPC endpoint over HTTP.
pub async fn connect(rpc_url: &str, max_retry_attempts: u32) -> anyhow::Result<impl ChainReader> {
    let url = rpc_url
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid POLYGON_RPC_URL: {e}"))?;
    let provider = ProviderBuilder::new().connect_http(url);
    Ok(AlloyChainReader::new(provider, max_retry_attempts))
}
