// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Turns one block range of a chain into decoded Compound timelock events.
//!
//! A single `eth_getLogs` call covers the whole range, restricted to the three
//! timelock event topics. Every returned log is then enriched with its
//! transaction sender, receipt status and block timestamp.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ethers::abi::RawLog;
use ethers::contract::{abigen, EthEvent, EthLogDecode};
use ethers::types::{Address, Bytes, Filter, Log, ValueOrArray, H256, U256};
use futures::{stream, StreamExt};
use serde_json::json;
use tap::TapFallible;
use timelock_schema::models::{CompoundEventType, NewCompoundTimelockTransaction, TxStatus};
use tracing::{debug, warn};

use crate::error::{RpcError, ScannerError, ScannerResult, StoreError, StoreResult};
use crate::metrics::ScannerMetrics;
use crate::rpc::ChainRpc;
use crate::store::ChainInfo;

abigen!(
    CompoundTimelock,
    r#"[
        event QueueTransaction(bytes32 indexed txHash, address indexed target, uint256 value, string signature, bytes data, uint256 eta)
        event ExecuteTransaction(bytes32 indexed txHash, address indexed target, uint256 value, string signature, bytes data, uint256 eta)
        event CancelTransaction(bytes32 indexed txHash, address indexed target, uint256 value, string signature, bytes data, uint256 eta)
    ]"#,
);

pub fn event_topic(event_type: CompoundEventType) -> H256 {
    match event_type {
        CompoundEventType::QueueTransaction => QueueTransactionFilter::signature(),
        CompoundEventType::ExecuteTransaction => ExecuteTransactionFilter::signature(),
        CompoundEventType::CancelTransaction => CancelTransactionFilter::signature(),
    }
}

pub fn event_topics() -> Vec<H256> {
    [
        CompoundEventType::QueueTransaction,
        CompoundEventType::ExecuteTransaction,
        CompoundEventType::CancelTransaction,
    ]
    .into_iter()
    .map(event_topic)
    .collect()
}

/// Log filter over `[from_block, to_block]` matching any timelock event, on
/// any contract.
pub fn build_filter(from_block: u64, to_block: u64) -> Filter {
    Filter::new()
        .from_block(from_block)
        .to_block(to_block)
        .topic0(ValueOrArray::Array(event_topics()))
}

pub fn hex_hash(hash: &H256) -> String {
    format!("{:#x}", hash)
}

pub fn hex_address(address: &Address) -> String {
    format!("{:#x}", address)
}

/// Fields carried by every Compound timelock event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLog {
    pub event_type: CompoundEventType,
    pub flow_id: H256,
    pub target: Address,
    pub value: U256,
    pub signature: String,
    pub data: Bytes,
    pub eta: u64,
}

impl DecodedLog {
    fn new(
        event_type: CompoundEventType,
        tx_hash: [u8; 32],
        target: Address,
        value: U256,
        signature: String,
        data: Bytes,
        eta: U256,
    ) -> ScannerResult<Self> {
        // eta is stored as a signed 64-bit unix timestamp.
        if eta > U256::from(i64::MAX as u64) {
            return Err(ScannerError::Decode(format!(
                "{} eta {} out of range",
                event_type, eta
            )));
        }
        Ok(Self {
            event_type,
            flow_id: H256::from(tx_hash),
            target,
            value,
            signature,
            data,
            eta: eta.as_u64(),
        })
    }

    fn to_json(&self, contract_address: &str) -> serde_json::Value {
        json!({
            "indexed": {
                "txHash": hex_hash(&self.flow_id),
                "target": hex_address(&self.target),
            },
            "non_indexed": {
                "value": self.value.to_string(),
                "signature": self.signature,
                "data": format!("0x{}", hex::encode(&self.data)),
                "eta": self.eta,
            },
            "event_type": self.event_type.to_string(),
            "contract_address": contract_address,
        })
    }
}

/// Decodes a log against the timelock ABI. Logs with an unknown first topic
/// yield `None`.
pub fn decode_log(log: &Log) -> ScannerResult<Option<DecodedLog>> {
    let Some(topic0) = log.topics.first() else {
        return Ok(None);
    };
    if !event_topics().contains(topic0) {
        return Ok(None);
    }

    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    let event = CompoundTimelockEvents::decode_log(&raw)
        .map_err(|e| ScannerError::Decode(format!("log of {:?}: {}", log.address, e)))?;

    let decoded = match event {
        CompoundTimelockEvents::QueueTransactionFilter(e) => DecodedLog::new(
            CompoundEventType::QueueTransaction,
            e.tx_hash,
            e.target,
            e.value,
            e.signature,
            e.data,
            e.eta,
        ),
        CompoundTimelockEvents::ExecuteTransactionFilter(e) => DecodedLog::new(
            CompoundEventType::ExecuteTransaction,
            e.tx_hash,
            e.target,
            e.value,
            e.signature,
            e.data,
            e.eta,
        ),
        CompoundTimelockEvents::CancelTransactionFilter(e) => DecodedLog::new(
            CompoundEventType::CancelTransaction,
            e.tx_hash,
            e.target,
            e.value,
            e.signature,
            e.data,
            e.eta,
        ),
    }?;
    Ok(Some(decoded))
}

/// A fully resolved timelock event, one per emitted log.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelockEvent {
    pub event_type: CompoundEventType,
    /// Hash of the transaction that emitted the log.
    pub tx_hash: String,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    pub chain_id: u64,
    pub chain_name: String,
    pub contract_address: String,
    pub from_address: String,
    // The timelock itself; the indexed target is kept in `event_target`.
    pub to_address: String,
    pub tx_status: TxStatus,
    pub event_data: serde_json::Value,
    /// The `txHash` the timelock emitted, i.e. the flow id.
    pub event_tx_hash: String,
    pub event_target: String,
    /// Wei, decimal.
    pub event_value: String,
    pub function_signature: String,
    pub call_data: Vec<u8>,
    pub eta: u64,
}

impl TimelockEvent {
    pub fn is_success(&self) -> bool {
        self.tx_status == TxStatus::Success
    }

    pub fn eta_time(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.eta)
            .ok()
            .and_then(|eta| DateTime::<Utc>::from_timestamp(eta, 0))
    }

    pub fn to_record(&self) -> StoreResult<NewCompoundTimelockTransaction> {
        let invalid = |what: &str| StoreError::Invalid(format!("{} of {}", what, self.tx_hash));
        Ok(NewCompoundTimelockTransaction {
            tx_hash: self.tx_hash.clone(),
            block_number: i64::try_from(self.block_number).map_err(|_| invalid("block number"))?,
            block_timestamp: self.block_timestamp,
            chain_id: i32::try_from(self.chain_id).map_err(|_| invalid("chain id"))?,
            chain_name: self.chain_name.clone(),
            contract_address: self.contract_address.clone(),
            from_address: self.from_address.clone(),
            to_address: self.to_address.clone(),
            tx_status: self.tx_status.to_string(),
            event_type: self.event_type.to_string(),
            event_data: self.event_data.clone(),
            event_tx_hash: Some(self.event_tx_hash.clone()),
            event_target: Some(self.event_target.clone()),
            event_value: self.event_value.clone(),
            event_function_signature: Some(self.function_signature.clone()),
            event_call_data: Some(self.call_data.clone()),
            event_eta: Some(i64::try_from(self.eta).map_err(|_| invalid("eta"))?),
        })
    }
}

pub struct BlockRangeProcessor {
    chain: ChainInfo,
    log_concurrency: usize,
    strict: bool,
    metrics: Arc<ScannerMetrics>,
}

impl BlockRangeProcessor {
    pub fn new(
        chain: ChainInfo,
        log_concurrency: usize,
        strict: bool,
        metrics: Arc<ScannerMetrics>,
    ) -> Self {
        Self {
            chain,
            log_concurrency: log_concurrency.max(1),
            strict,
            metrics,
        }
    }

    /// Fetches and resolves every timelock event in `[from_block, to_block]`,
    /// in log order.
    ///
    /// A log that cannot be resolved is skipped with a warning, unless strict
    /// processing is on, in which case the whole range fails.
    pub async fn scan_block_range(
        &self,
        client: &dyn ChainRpc,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TimelockEvent>, RpcError> {
        let logs = client.get_logs(&build_filter(from_block, to_block)).await?;
        debug!(
            "[{}] {} logs in blocks {}..={}",
            self.chain.name,
            logs.len(),
            from_block,
            to_block
        );

        let results: Vec<_> = stream::iter(logs)
            .map(|log| async move {
                let tx_hash = log.transaction_hash;
                let block = log.block_number;
                (self.process_log(client, log).await, tx_hash, block)
            })
            .buffered(self.log_concurrency)
            .collect()
            .await;

        let chain_label = self.chain.chain_id.to_string();
        let mut events = Vec::with_capacity(results.len());
        for (result, tx_hash, block) in results {
            match result {
                Ok(Some(event)) => {
                    self.metrics
                        .decoded_events
                        .with_label_values(&[event.event_type.as_ref()])
                        .inc();
                    events.push(event);
                }
                Ok(None) => {}
                Err(e) if self.strict => return Err(e),
                Err(e) => {
                    warn!(
                        "[{}] Skipping log of tx {:?} in block {:?}: {}",
                        self.chain.name, tx_hash, block, e
                    );
                    self.metrics
                        .skipped_logs
                        .with_label_values(&[&chain_label])
                        .inc();
                }
            }
        }
        Ok(events)
    }

    async fn process_log(
        &self,
        client: &dyn ChainRpc,
        log: Log,
    ) -> Result<Option<TimelockEvent>, RpcError> {
        let decoded = match decode_log(&log) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Ok(None),
            Err(e) => return Err(RpcError::InvalidResponse(e.to_string())),
        };
        let tx_hash = log
            .transaction_hash
            .ok_or_else(|| RpcError::InvalidResponse("log without transaction hash".into()))?;
        let block_number = log
            .block_number
            .ok_or_else(|| RpcError::InvalidResponse("log without block number".into()))?
            .as_u64();

        let (sender, succeeded, timestamp) = tokio::try_join!(
            client.transaction_sender(tx_hash),
            client.receipt_succeeded(tx_hash),
            client.block_timestamp(block_number),
        )
        .tap_err(|e| debug!("[{}] Failed to resolve tx {:?}: {}", self.chain.name, tx_hash, e))?;

        let block_timestamp = i64::try_from(timestamp)
            .ok()
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .ok_or_else(|| {
                RpcError::InvalidResponse(format!(
                    "block {} timestamp {} out of range",
                    block_number, timestamp
                ))
            })?;

        let contract_address = hex_address(&log.address);
        Ok(Some(TimelockEvent {
            event_type: decoded.event_type,
            tx_hash: hex_hash(&tx_hash),
            block_number,
            block_timestamp,
            chain_id: self.chain.chain_id,
            chain_name: self.chain.name.clone(),
            from_address: hex_address(&sender),
            to_address: contract_address.clone(),
            tx_status: if succeeded {
                TxStatus::Success
            } else {
                TxStatus::Failed
            },
            event_data: decoded.to_json(&contract_address),
            event_tx_hash: hex_hash(&decoded.flow_id),
            event_target: hex_address(&decoded.target),
            event_value: decoded.value.to_string(),
            function_signature: decoded.signature,
            call_data: decoded.data.to_vec(),
            eta: decoded.eta,
            contract_address,
        }))
    }
}
