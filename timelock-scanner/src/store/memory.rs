// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory store with the same conditional-update semantics as the Postgres
//! stores. Backs the scanner, reconciler and refresher tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use timelock_schema::models::{CompoundEventType, FlowStatus, ScanStatus, TxStatus};
use tokio::sync::Mutex;

use super::{
    ChainDirectory, ChainInfo, Flow, FlowKey, FlowStore, ProgressStore, QueueBackfill,
    QueueFields, ScanProgress, StatusChange, TimelockInfo, TimelockMetadata, TransactionStore,
};
use crate::block_processor::TimelockEvent;
use crate::error::{StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    progress: HashMap<u64, ScanProgress>,
    transactions: Vec<TimelockEvent>,
    transaction_keys: HashSet<(String, String, CompoundEventType)>,
    flows: BTreeMap<i64, Flow>,
    next_flow_id: i64,
    timelocks: HashMap<(u64, String), TimelockInfo>,
    chains: Vec<ChainInfo>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with a pool error until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn add_chain(&self, chain: ChainInfo) {
        self.inner.lock().await.chains.push(chain);
    }

    pub async fn set_timelock(&self, chain_id: u64, contract_address: &str, info: TimelockInfo) {
        self.inner
            .lock()
            .await
            .timelocks
            .insert((chain_id, contract_address.to_lowercase()), info);
    }

    pub async fn flows(&self) -> Vec<Flow> {
        self.inner.lock().await.flows.values().cloned().collect()
    }

    pub async fn transactions(&self) -> Vec<TimelockEvent> {
        self.inner.lock().await.transactions.clone()
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Pool("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn get_progress(&self, chain_id: u64) -> StoreResult<Option<ScanProgress>> {
        Ok(self.inner.lock().await.progress.get(&chain_id).cloned())
    }

    async fn get_or_create_progress(
        &self,
        chain: &ChainInfo,
        initial_block: u64,
    ) -> StoreResult<ScanProgress> {
        let mut inner = self.inner.lock().await;
        if !inner.progress.contains_key(&chain.chain_id) {
            self.check_writable()?;
        }
        Ok(inner
            .progress
            .entry(chain.chain_id)
            .or_insert_with(|| ScanProgress {
                chain_id: chain.chain_id,
                chain_name: chain.name.clone(),
                last_scanned_block: initial_block,
                latest_network_block: initial_block,
                status: ScanStatus::Running,
                error_message: None,
                last_update_time: Utc::now(),
            })
            .clone())
    }

    async fn update_progress(
        &self,
        chain_id: u64,
        last_scanned_block: u64,
        latest_network_block: u64,
    ) -> StoreResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        if let Some(progress) = inner.progress.get_mut(&chain_id) {
            if progress.last_scanned_block <= last_scanned_block {
                progress.last_scanned_block = last_scanned_block;
                progress.latest_network_block = latest_network_block;
                progress.status = ScanStatus::Running;
                progress.error_message = None;
                progress.last_update_time = Utc::now();
            }
        }
        Ok(())
    }

    async fn update_status(
        &self,
        chain_id: u64,
        status: ScanStatus,
        error_message: Option<String>,
    ) -> StoreResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        if let Some(progress) = inner.progress.get_mut(&chain_id) {
            progress.status = status;
            progress.error_message = error_message;
            progress.last_update_time = Utc::now();
        }
        Ok(())
    }

    async fn reset_progress(&self, chain_id: u64, last_scanned_block: u64) -> StoreResult<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let progress = inner
            .progress
            .get_mut(&chain_id)
            .ok_or_else(|| StoreError::Invalid(format!("no scan progress for chain {chain_id}")))?;
        progress.last_scanned_block = last_scanned_block;
        progress.status = ScanStatus::Running;
        progress.error_message = None;
        progress.last_update_time = Utc::now();
        Ok(())
    }

    async fn list_progress(&self) -> StoreResult<Vec<ScanProgress>> {
        let inner = self.inner.lock().await;
        let mut all: Vec<_> = inner.progress.values().cloned().collect();
        all.sort_by_key(|p| p.chain_id);
        Ok(all)
    }

    async fn pause_all_running(&self) -> StoreResult<usize> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let mut paused = 0;
        for progress in inner.progress.values_mut() {
            if progress.status == ScanStatus::Running {
                progress.status = ScanStatus::Paused;
                paused += 1;
            }
        }
        Ok(paused)
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn insert_events(&self, events: &[TimelockEvent]) -> StoreResult<usize> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let mut inserted = 0;
        for event in events {
            let key = (
                event.tx_hash.clone(),
                event.contract_address.clone(),
                event.event_type,
            );
            if inner.transaction_keys.insert(key) {
                inner.transactions.push(event.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn queue_function_signature(
        &self,
        chain_id: u64,
        contract_address: &str,
        flow_id: &str,
    ) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .iter()
            .filter(|e| {
                e.chain_id == chain_id
                    && e.contract_address == contract_address
                    && e.event_tx_hash == flow_id
                    && e.event_type == CompoundEventType::QueueTransaction
                    && e.tx_status == TxStatus::Success
            })
            .max_by_key(|e| e.block_number)
            .map(|e| e.function_signature.clone()))
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn get_flow(&self, key: &FlowKey) -> StoreResult<Option<Flow>> {
        let inner = self.inner.lock().await;
        Ok(inner.flows.values().find(|f| &f.key == key).cloned())
    }

    async fn create_flow(&self, key: &FlowKey, fields: &QueueFields) -> StoreResult<bool> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        if inner.flows.values().any(|f| &f.key == key) {
            return Ok(false);
        }
        inner.next_flow_id += 1;
        let id = inner.next_flow_id;
        inner.flows.insert(
            id,
            Flow {
                id,
                key: key.clone(),
                status: FlowStatus::Waiting,
                queue_tx_hash: Some(fields.queue_tx_hash.clone()),
                execute_tx_hash: None,
                cancel_tx_hash: None,
                initiator_address: Some(fields.initiator_address.clone()),
                queued_at: Some(fields.queued_at),
                executed_at: None,
                cancelled_at: None,
                eta: Some(fields.eta),
                expired_at: Some(fields.expired_at),
                target_address: Some(fields.target_address.clone()),
                call_data: Some(fields.call_data.clone()),
                value: fields.value.clone(),
            },
        );
        Ok(true)
    }

    async fn backfill_queue_fields(&self, id: i64, backfill: &QueueBackfill) -> StoreResult<bool> {
        if backfill.is_empty() {
            return Ok(false);
        }
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let Some(flow) = inner.flows.get_mut(&id) else {
            return Ok(false);
        };
        if let Some(v) = &backfill.queue_tx_hash {
            flow.queue_tx_hash = Some(v.clone());
        }
        if let Some(v) = &backfill.initiator_address {
            flow.initiator_address = Some(v.clone());
        }
        if let Some(v) = backfill.queued_at {
            flow.queued_at = Some(v);
        }
        if let Some(v) = backfill.eta {
            flow.eta = Some(v);
        }
        if let Some(v) = backfill.expired_at {
            flow.expired_at = Some(v);
        }
        if let Some(v) = &backfill.target_address {
            flow.target_address = Some(v.clone());
        }
        if let Some(v) = &backfill.call_data {
            flow.call_data = Some(v.clone());
        }
        Ok(true)
    }

    async fn transition(
        &self,
        id: i64,
        from: FlowStatus,
        change: &StatusChange,
    ) -> StoreResult<bool> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let Some(flow) = inner.flows.get_mut(&id) else {
            return Ok(false);
        };
        if flow.status != from {
            return Ok(false);
        }
        flow.status = change.to;
        match change.to {
            FlowStatus::Executed => {
                flow.execute_tx_hash = change.tx_hash.clone();
                flow.executed_at = Some(change.at);
            }
            FlowStatus::Cancelled => {
                flow.cancel_tx_hash = change.tx_hash.clone();
                flow.cancelled_at = Some(change.at);
            }
            _ => {}
        }
        Ok(true)
    }

    async fn waiting_flows_due(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Flow>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<_> = inner
            .flows
            .values()
            .filter(|f| f.status == FlowStatus::Waiting && f.eta.is_some_and(|eta| eta <= now))
            .cloned()
            .collect();
        due.sort_by_key(|f| f.eta);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn flows_expired(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Flow>> {
        let inner = self.inner.lock().await;
        let mut expired: Vec<_> = inner
            .flows
            .values()
            .filter(|f| matches!(f.status, FlowStatus::Waiting | FlowStatus::Ready))
            .filter(|f| f.expired_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        expired.sort_by_key(|f| f.expired_at);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn batch_transition(
        &self,
        ids: &[i64],
        from: FlowStatus,
        to: FlowStatus,
        _now: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let mut changed = vec![];
        for id in ids {
            if let Some(flow) = inner.flows.get_mut(id) {
                if flow.status == from {
                    flow.status = to;
                    changed.push(*id);
                }
            }
        }
        Ok(changed)
    }

    async fn refresh_expired_at(
        &self,
        chain_id: u64,
        contract_address: &str,
        grace_period_secs: u64,
    ) -> StoreResult<usize> {
        self.check_writable()?;
        let grace = ChronoDuration::seconds(grace_period_secs as i64);
        let mut inner = self.inner.lock().await;
        let mut updated = 0;
        for flow in inner.flows.values_mut() {
            if flow.key.chain_id == chain_id && flow.key.contract_address == contract_address {
                if let Some(eta) = flow.eta {
                    flow.expired_at = Some(eta + grace);
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn count_by_status(
        &self,
        chain_id: Option<u64>,
    ) -> StoreResult<HashMap<FlowStatus, i64>> {
        let inner = self.inner.lock().await;
        let mut counts = HashMap::new();
        for flow in inner
            .flows
            .values()
            .filter(|f| chain_id.map_or(true, |id| f.key.chain_id == id))
        {
            *counts.entry(flow.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl TimelockMetadata for MemoryStore {
    async fn get_by_chain_and_address(
        &self,
        chain_id: u64,
        contract_address: &str,
    ) -> StoreResult<Option<TimelockInfo>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .timelocks
            .get(&(chain_id, contract_address.to_lowercase()))
            .copied())
    }
}

#[async_trait]
impl ChainDirectory for MemoryStore {
    async fn get_rpc_enabled_chains(&self, include_testnets: bool) -> StoreResult<Vec<ChainInfo>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .chains
            .iter()
            .filter(|c| include_testnets || !c.is_testnet)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timelock_schema::models::TimelockStandard;

    fn key(flow_id: &str) -> FlowKey {
        FlowKey {
            flow_id: flow_id.to_string(),
            standard: TimelockStandard::Compound,
            chain_id: 1,
            contract_address: "0xc0".to_string(),
        }
    }

    fn fields(eta: DateTime<Utc>) -> QueueFields {
        QueueFields {
            queue_tx_hash: "0xq".into(),
            initiator_address: "0xi".into(),
            queued_at: eta - ChronoDuration::hours(1),
            eta,
            expired_at: eta + ChronoDuration::days(14),
            target_address: "0xt".into(),
            call_data: vec![],
            value: "0".into(),
        }
    }

    #[tokio::test]
    async fn test_conditional_transition() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert!(store.create_flow(&key("0x1"), &fields(now)).await.unwrap());
        assert!(!store.create_flow(&key("0x1"), &fields(now)).await.unwrap());
        let flow = store.get_flow(&key("0x1")).await.unwrap().unwrap();

        let change = StatusChange {
            to: FlowStatus::Executed,
            tx_hash: Some("0xe".into()),
            at: now,
        };
        // Wrong expected status, nothing happens.
        assert!(!store
            .transition(flow.id, FlowStatus::Ready, &change)
            .await
            .unwrap());
        assert!(store
            .transition(flow.id, FlowStatus::Waiting, &change)
            .await
            .unwrap());
        let flow = store.get_flow(&key("0x1")).await.unwrap().unwrap();
        assert_eq!(flow.status, FlowStatus::Executed);
        assert_eq!(flow.execute_tx_hash.as_deref(), Some("0xe"));
        assert_eq!(flow.executed_at, Some(now));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let store = MemoryStore::new();
        let chain = ChainInfo {
            chain_id: 1,
            name: "eth".into(),
            rpc_url_template: "http://x".into(),
            is_testnet: false,
        };
        store.get_or_create_progress(&chain, 100).await.unwrap();
        store.update_progress(1, 150, 170).await.unwrap();
        store.update_progress(1, 120, 170).await.unwrap();
        let progress = store.get_progress(1).await.unwrap().unwrap();
        assert_eq!(progress.last_scanned_block, 150);

        // Creating again returns the stored row untouched.
        let progress = store.get_or_create_progress(&chain, 5).await.unwrap();
        assert_eq!(progress.last_scanned_block, 150);
    }

    #[tokio::test]
    async fn test_failed_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.insert_events(&[]).await,
            Err(StoreError::Pool(_))
        ));
        store.set_fail_writes(false);
        assert_eq!(store.insert_events(&[]).await.unwrap(), 0);
    }
}
