// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Persistence contracts shared by the scanners, the reconciler and the refresher.
//!
//! Every flow mutation is qualified by the status the caller observed, so the
//! reconciler and the refresher can race on the same row without a lock: the
//! loser's update matches zero rows and is reported as `false` / omitted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use timelock_schema::models::{FlowStatus, ScanStatus, TimelockStandard};

use crate::block_processor::TimelockEvent;
use crate::error::StoreResult;

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::{PgChainDirectory, PgFlowStore, PgProgressStore, PgTimelockMetadata, PgTransactionStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub chain_id: u64,
    pub name: String,
    // May contain an `{API_KEY}` placeholder.
    pub rpc_url_template: String,
    #[serde(default)]
    pub is_testnet: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanProgress {
    pub chain_id: u64,
    pub chain_name: String,
    pub last_scanned_block: u64,
    pub latest_network_block: u64,
    pub status: ScanStatus,
    pub error_message: Option<String>,
    pub last_update_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub flow_id: String,
    pub standard: TimelockStandard,
    pub chain_id: u64,
    pub contract_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub id: i64,
    pub key: FlowKey,
    pub status: FlowStatus,
    pub queue_tx_hash: Option<String>,
    pub execute_tx_hash: Option<String>,
    pub cancel_tx_hash: Option<String>,
    pub initiator_address: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub eta: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub target_address: Option<String>,
    pub call_data: Option<Vec<u8>>,
    pub value: String,
}

/// Fields carried by a `QueueTransaction` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueFields {
    pub queue_tx_hash: String,
    pub initiator_address: String,
    pub queued_at: DateTime<Utc>,
    pub eta: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
    pub target_address: String,
    pub call_data: Vec<u8>,
    pub value: String,
}

impl QueueFields {
    /// Subset of these fields that is still missing on `flow`.
    pub fn missing_on(&self, flow: &Flow) -> QueueBackfill {
        QueueBackfill {
            queue_tx_hash: flow
                .queue_tx_hash
                .is_none()
                .then(|| self.queue_tx_hash.clone()),
            initiator_address: flow
                .initiator_address
                .is_none()
                .then(|| self.initiator_address.clone()),
            queued_at: flow.queued_at.is_none().then_some(self.queued_at),
            eta: flow.eta.is_none().then_some(self.eta),
            expired_at: flow.expired_at.is_none().then_some(self.expired_at),
            target_address: flow
                .target_address
                .is_none()
                .then(|| self.target_address.clone()),
            call_data: flow.call_data.is_none().then(|| self.call_data.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBackfill {
    pub queue_tx_hash: Option<String>,
    pub initiator_address: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub eta: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub target_address: Option<String>,
    pub call_data: Option<Vec<u8>>,
}

impl QueueBackfill {
    pub fn is_empty(&self) -> bool {
        self == &QueueBackfill::default()
    }
}

/// Event-driven status change. `tx_hash` and `at` land in the execute or
/// cancel columns depending on `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub to: FlowStatus,
    pub tx_hash: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelockInfo {
    pub grace_period_secs: u64,
    // Earliest time the contract was imported into the system.
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn get_progress(&self, chain_id: u64) -> StoreResult<Option<ScanProgress>>;

    /// Returns the stored progress, creating it at `initial_block` if absent.
    async fn get_or_create_progress(
        &self,
        chain: &ChainInfo,
        initial_block: u64,
    ) -> StoreResult<ScanProgress>;

    /// Advances the scan pointer, marks the chain running and clears any error.
    /// A pointer lower than the stored one is ignored.
    async fn update_progress(
        &self,
        chain_id: u64,
        last_scanned_block: u64,
        latest_network_block: u64,
    ) -> StoreResult<()>;

    async fn update_status(
        &self,
        chain_id: u64,
        status: ScanStatus,
        error_message: Option<String>,
    ) -> StoreResult<()>;

    /// Moves the scan pointer unconditionally. Used for manual rescans.
    async fn reset_progress(&self, chain_id: u64, last_scanned_block: u64) -> StoreResult<()>;

    async fn list_progress(&self) -> StoreResult<Vec<ScanProgress>>;

    /// Marks every `running` chain as `paused`, returning how many changed.
    async fn pause_all_running(&self) -> StoreResult<usize>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Conflict-ignoring batch insert. Returns the number of new rows.
    async fn insert_events(&self, events: &[TimelockEvent]) -> StoreResult<usize>;

    /// Function signature recorded by the successful queue transaction of a flow.
    async fn queue_function_signature(
        &self,
        chain_id: u64,
        contract_address: &str,
        flow_id: &str,
    ) -> StoreResult<Option<String>>;
}

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn get_flow(&self, key: &FlowKey) -> StoreResult<Option<Flow>>;

    /// Creates the flow in `waiting`. Returns `false` if it already existed.
    async fn create_flow(&self, key: &FlowKey, fields: &QueueFields) -> StoreResult<bool>;

    async fn backfill_queue_fields(&self, id: i64, backfill: &QueueBackfill) -> StoreResult<bool>;

    /// Applies `change` only if the row is still in `from`.
    async fn transition(&self, id: i64, from: FlowStatus, change: &StatusChange)
        -> StoreResult<bool>;

    /// `waiting` flows whose eta has passed, oldest eta first.
    async fn waiting_flows_due(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Flow>>;

    /// `waiting` or `ready` flows whose grace period has elapsed.
    async fn flows_expired(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Flow>>;

    /// Moves the given rows from `from` to `to`, returning the ids actually changed.
    async fn batch_transition(
        &self,
        ids: &[i64],
        from: FlowStatus,
        to: FlowStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>>;

    /// Recomputes `expired_at = eta + grace_period` for every flow of a contract.
    async fn refresh_expired_at(
        &self,
        chain_id: u64,
        contract_address: &str,
        grace_period_secs: u64,
    ) -> StoreResult<usize>;

    async fn count_by_status(&self, chain_id: Option<u64>)
        -> StoreResult<HashMap<FlowStatus, i64>>;
}

#[async_trait]
pub trait TimelockMetadata: Send + Sync {
    async fn get_by_chain_and_address(
        &self,
        chain_id: u64,
        contract_address: &str,
    ) -> StoreResult<Option<TimelockInfo>>;
}

#[async_trait]
pub trait ChainDirectory: Send + Sync {
    async fn get_rpc_enabled_chains(&self, include_testnets: bool) -> StoreResult<Vec<ChainInfo>>;
}

/// Chains taken from the configuration file instead of the database.
pub struct StaticChainDirectory {
    chains: Vec<ChainInfo>,
}

impl StaticChainDirectory {
    pub fn new(chains: Vec<ChainInfo>) -> Self {
        Self { chains }
    }
}

#[async_trait]
impl ChainDirectory for StaticChainDirectory {
    async fn get_rpc_enabled_chains(&self, include_testnets: bool) -> StoreResult<Vec<ChainInfo>> {
        Ok(self
            .chains
            .iter()
            .filter(|c| include_testnets || !c.is_testnet)
            .filter(|c| !c.rpc_url_template.is_empty())
            .cloned()
            .collect())
    }
}

#[derive(Clone)]
pub struct Stores {
    pub progress: Arc<dyn ProgressStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub flows: Arc<dyn FlowStore>,
    pub metadata: Arc<dyn TimelockMetadata>,
    pub chains: Arc<dyn ChainDirectory>,
}

impl Stores {
    pub fn pg(db: timelock_pg_db::Db) -> Self {
        Self {
            progress: Arc::new(PgProgressStore::new(db.clone())),
            transactions: Arc::new(PgTransactionStore::new(db.clone())),
            flows: Arc::new(PgFlowStore::new(db.clone())),
            metadata: Arc::new(PgTimelockMetadata::new(db.clone())),
            chains: Arc::new(PgChainDirectory::new(db)),
        }
    }

    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            progress: store.clone(),
            transactions: store.clone(),
            flows: store.clone(),
            metadata: store.clone(),
            chains: store,
        }
    }

    pub fn with_chain_directory(mut self, chains: Arc<dyn ChainDirectory>) -> Self {
        self.chains = chains;
        self
    }
}
