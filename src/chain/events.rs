//! On-chain event ABIs and the typed argument bag they decode into.
//!
//! The `sol!` macro generates the event structs (topic hashes, ABI decoding)
//! straight from their Solidity signatures, the same way the sdk crate in
//! the reference pack defines its exchange events.

use alloy::primitives::{Address, B256, U256};
use alloy::sol;

sol! {
    event ConditionPreparation(bytes32 indexed conditionId, address indexed oracle, bytes32 indexed questionId, uint256 outcomeSlotCount);
    event ConditionResolution(bytes32 indexed conditionId, address indexed oracle, bytes32 indexed questionId, uint256[] payoutNumerators);
    event TransferSingle(address indexed operator, address indexed from, address indexed to, uint256 id, uint256 value);
}

sol! {
    event OrderFilled(address indexed maker, address indexed taker, uint256 tokenId, uint256 makerAmount, uint256 takerAmount, uint8 side);
}

/// Typed argument bag, one variant per recognized event. Nothing past this
/// point in the pipeline touches an untyped dict.
#[derive(Debug, Clone)]
pub enum EventArgs {
    ConditionPreparation {
        condition_id: B256,
        oracle: Address,
        question_id: B256,
        outcome_slot_count: U256,
    },
    ConditionResolution {
        condition_id: B256,
        oracle: Address,
        question_id: B256,
        payout_numerators: Vec<U256>,
    },
    TransferSingle {
        operator: Address,
        from: Address,
        to: Address,
        id: U256,
        value: U256,
    },
    OrderFilled {
        maker: Address,
        taker: Address,
        token_id: U256,
        maker_amount: U256,
        taker_amount: U256,
        side: u8,
    },
}

impl EventArgs {
    pub fn event_name(&self) -> &'static str {
        match self {
            EventArgs::ConditionPreparation { .. } => "ConditionPreparation",
            EventArgs::ConditionResolution { .. } => "ConditionResolution",
            EventArgs::TransferSingle { .. } => "TransferSingle",
            EventArgs::OrderFilled { .. } => "OrderFilled",
        }
    }
}

/// A fully decoded log, enriched with the block timestamp resolved by the
/// Chain Reader's batch timestamp cache.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub block_number: u64,
    pub block_timestamp: i64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub contract_address: Address,
    pub args: EventArgs,
}

/// A log whose `topic0` didn't match a recognized event, or whose payload
/// failed ABI decoding. Carries just enough to archive an `EventLog` row
/// with `processed = false` instead of vanishing silently.
#[derive(Debug, Clone)]
pub struct UndecodedLog {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub contract_address: Address,
    pub reason: String,
}
