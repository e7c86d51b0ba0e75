// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::abi::{encode, Token};
use ethers::types::{Address, Filter, Log, H256, U256};
use timelock_schema::models::{CompoundEventType, TxStatus};

use crate::block_processor::{event_topic, hex_address, hex_hash, TimelockEvent};
use crate::error::RpcError;
use crate::notification::{FlowNotification, NotificationSink};
use crate::rpc::{ChainRpc, RpcConnector};
use crate::store::ChainInfo;

pub const DEFAULT_SENDER: Address = Address::repeat_byte(0xaa);
const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

pub fn test_chain(chain_id: u64) -> ChainInfo {
    ChainInfo {
        chain_id,
        name: format!("chain-{chain_id}"),
        rpc_url_template: "http://localhost:8545/{API_KEY}".to_string(),
        is_testnet: false,
    }
}

#[derive(Default)]
struct MockState {
    head: u64,
    logs: Vec<Log>,
    senders: HashMap<H256, Address>,
    failed_receipts: HashSet<H256>,
    broken_receipts: HashSet<H256>,
    fail_block_numbers: usize,
    fail_get_logs: usize,
    get_logs_ranges: Vec<(u64, u64)>,
}

/// Scripted chain: a head, a log set and per-transaction lookups, with
/// failure injection.
pub struct MockChainRpc {
    chain_id: u64,
    state: Mutex<MockState>,
}

impl MockChainRpc {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn default_timestamp(block_number: u64) -> u64 {
        GENESIS_TIMESTAMP + block_number * 12
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn push_log(&self, log: Log) {
        self.state.lock().unwrap().logs.push(log);
    }

    pub fn set_sender(&self, tx_hash: H256, sender: Address) {
        self.state.lock().unwrap().senders.insert(tx_hash, sender);
    }

    /// The receipt of `tx_hash` reports a reverted transaction.
    pub fn set_receipt_failed(&self, tx_hash: H256) {
        self.state.lock().unwrap().failed_receipts.insert(tx_hash);
    }

    /// Receipt lookups of `tx_hash` fail at the transport level.
    pub fn fail_receipt(&self, tx_hash: H256) {
        self.state.lock().unwrap().broken_receipts.insert(tx_hash);
    }

    pub fn fail_next_block_numbers(&self, n: usize) {
        self.state.lock().unwrap().fail_block_numbers = n;
    }

    pub fn fail_next_get_logs(&self, n: usize) {
        self.state.lock().unwrap().fail_get_logs = n;
    }

    pub fn get_logs_ranges(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().get_logs_ranges.clone()
    }
}

#[async_trait]
impl ChainRpc for MockChainRpc {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_block_numbers > 0 {
            state.fail_block_numbers -= 1;
            return Err(RpcError::Transport("connection reset".into()));
        }
        Ok(state.head)
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_get_logs > 0 {
            state.fail_get_logs -= 1;
            return Err(RpcError::Transport("connection reset".into()));
        }
        let from = filter.get_from_block().map(|b| b.as_u64()).unwrap_or(0);
        let to = filter
            .get_to_block()
            .map(|b| b.as_u64())
            .unwrap_or(u64::MAX);
        state.get_logs_ranges.push((from, to));
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.block_number
                    .map(|b| (from..=to).contains(&b.as_u64()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn transaction_sender(&self, tx_hash: H256) -> Result<Address, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(state.senders.get(&tx_hash).copied().unwrap_or(DEFAULT_SENDER))
    }

    async fn receipt_succeeded(&self, tx_hash: H256) -> Result<bool, RpcError> {
        let state = self.state.lock().unwrap();
        if state.broken_receipts.contains(&tx_hash) {
            return Err(RpcError::Transport("receipt lookup failed".into()));
        }
        Ok(!state.failed_receipts.contains(&tx_hash))
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, RpcError> {
        Ok(Self::default_timestamp(block_number))
    }
}

/// Hands out pre-built mock clients by chain id and counts dials.
pub struct MockConnector {
    clients: Mutex<HashMap<u64, Arc<MockChainRpc>>>,
    dials: AtomicUsize,
    fail_dials: AtomicBool,
}

impl MockConnector {
    pub fn new(rpc: Arc<MockChainRpc>) -> Self {
        let connector = Self {
            clients: Mutex::new(HashMap::new()),
            dials: AtomicUsize::new(0),
            fail_dials: AtomicBool::new(false),
        };
        connector.add(rpc);
        connector
    }

    pub fn add(&self, rpc: Arc<MockChainRpc>) {
        self.clients.lock().unwrap().insert(rpc.chain_id, rpc);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn set_fail_dials(&self, fail: bool) {
        self.fail_dials.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RpcConnector for MockConnector {
    async fn connect(&self, chain: &ChainInfo) -> Result<Arc<dyn ChainRpc>, RpcError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.fail_dials.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("connection refused".into()));
        }
        let client: Arc<dyn ChainRpc> = self
            .clients
            .lock()
            .unwrap()
            .get(&chain.chain_id)
            .cloned()
            .ok_or_else(|| RpcError::Transport(format!("no node for {}", chain.chain_id)))?;
        Ok(client)
    }
}

/// Description of one Compound timelock log. `seed` identifies the flow.
#[derive(Debug, Clone)]
pub struct LogFixture {
    pub event_type: CompoundEventType,
    pub contract: Address,
    pub flow_id: H256,
    pub target: Address,
    pub value: u64,
    pub signature: String,
    pub data: Vec<u8>,
    pub eta: u64,
    pub block: u64,
    pub tx_hash: H256,
    pub tx_status: TxStatus,
}

impl LogFixture {
    fn new(event_type: CompoundEventType, seed: u64, eta: u64) -> Self {
        let kind = match event_type {
            CompoundEventType::QueueTransaction => 1u64,
            CompoundEventType::ExecuteTransaction => 2,
            CompoundEventType::CancelTransaction => 3,
        };
        Self {
            event_type,
            contract: Address::repeat_byte(0x11),
            flow_id: H256::from_low_u64_be(seed),
            target: Address::repeat_byte(0x22),
            value: 0,
            signature: "setPendingAdmin(address)".to_string(),
            data: vec![0u8; 32],
            eta,
            block: 1,
            tx_hash: H256::from_low_u64_be((kind << 32) | seed),
            tx_status: TxStatus::Success,
        }
    }

    pub fn queue(seed: u64, eta: u64) -> Self {
        Self::new(CompoundEventType::QueueTransaction, seed, eta)
    }

    pub fn execute(seed: u64, eta: u64) -> Self {
        Self::new(CompoundEventType::ExecuteTransaction, seed, eta)
    }

    pub fn cancel(seed: u64, eta: u64) -> Self {
        Self::new(CompoundEventType::CancelTransaction, seed, eta)
    }

    pub fn block(mut self, block: u64) -> Self {
        self.block = block;
        self
    }

    pub fn value(mut self, value: u64) -> Self {
        self.value = value;
        self
    }

    pub fn contract(mut self, contract: Address) -> Self {
        self.contract = contract;
        self
    }

    pub fn failed(mut self) -> Self {
        self.tx_status = TxStatus::Failed;
        self
    }
}

/// ABI-encoded log exactly as a Compound timelock emits it.
pub fn compound_log(fixture: &LogFixture) -> Log {
    let data = encode(&[
        Token::Uint(U256::from(fixture.value)),
        Token::String(fixture.signature.clone()),
        Token::Bytes(fixture.data.clone()),
        Token::Uint(U256::from(fixture.eta)),
    ]);
    Log {
        address: fixture.contract,
        topics: vec![
            event_topic(fixture.event_type),
            fixture.flow_id,
            H256::from(fixture.target),
        ],
        data: data.into(),
        block_number: Some(fixture.block.into()),
        transaction_hash: Some(fixture.tx_hash),
        log_index: Some(U256::zero()),
        ..Default::default()
    }
}

/// The event the block processor would produce for `fixture` on chain 1.
pub fn timelock_event(fixture: &LogFixture) -> TimelockEvent {
    let contract_address = hex_address(&fixture.contract);
    let block_timestamp =
        DateTime::<Utc>::from_timestamp(MockChainRpc::default_timestamp(fixture.block) as i64, 0)
            .unwrap();
    TimelockEvent {
        event_type: fixture.event_type,
        tx_hash: hex_hash(&fixture.tx_hash),
        block_number: fixture.block,
        block_timestamp,
        chain_id: 1,
        chain_name: "chain-1".to_string(),
        from_address: hex_address(&DEFAULT_SENDER),
        to_address: contract_address.clone(),
        tx_status: fixture.tx_status,
        event_data: serde_json::json!({
            "event_type": fixture.event_type.to_string(),
            "contract_address": contract_address,
        }),
        event_tx_hash: hex_hash(&fixture.flow_id),
        event_target: hex_address(&fixture.target),
        event_value: fixture.value.to_string(),
        function_signature: fixture.signature.clone(),
        call_data: fixture.data.clone(),
        eta: fixture.eta,
        contract_address,
    }
}

/// Notification sink that keeps every notification it receives.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<FlowNotification>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<FlowNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send_flow_notification(&self, notification: &FlowNotification) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("sink unavailable");
        }
        Ok(())
    }
}
