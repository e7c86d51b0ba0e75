// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::{
    define_sql_function, sql_types::Text, BoolExpressionMethods, ExpressionMethods,
    OptionalExtension, QueryDsl, SelectableHelper,
};
use diesel_async::RunQueryDsl;
use timelock_pg_db::{Connection, Db};
use timelock_schema::models::{
    CompoundEventType, FlowQueueBackfill, FlowRow, FlowStatus, FlowStatusChange, NewFlow,
    NewScanProgress, ScanProgressRow, ScanStatus, TimelockStandard, TxStatus,
};
use timelock_schema::schema::{
    block_scan_progress, compound_timelock_transactions, compound_timelocks, support_chains,
    timelock_transaction_flows,
};
use tracing::debug;

use super::{
    ChainDirectory, ChainInfo, Flow, FlowKey, FlowStore, ProgressStore, QueueBackfill,
    QueueFields, ScanProgress, StatusChange, TimelockInfo, TimelockMetadata, TransactionStore,
};
use crate::block_processor::TimelockEvent;
use crate::error::{StoreError, StoreResult};

// Keeps a batch insert well below the Postgres bind parameter limit.
const INSERT_CHUNK_SIZE: usize = 1_000;

define_sql_function!(fn lower(x: Text) -> Text);

async fn connect(db: &Db) -> StoreResult<Connection<'_>> {
    db.connect()
        .await
        .map_err(|e| StoreError::Pool(e.to_string()))
}

fn to_i32(chain_id: u64) -> StoreResult<i32> {
    i32::try_from(chain_id).map_err(|_| StoreError::Invalid(format!("chain id {chain_id}")))
}

fn to_i64(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Invalid(format!("value {value} exceeds i64")))
}

fn parse<T: FromStr>(what: &str, value: &str) -> StoreResult<T> {
    T::from_str(value).map_err(|_| StoreError::Invalid(format!("{what} `{value}`")))
}

impl TryFrom<ScanProgressRow> for ScanProgress {
    type Error = StoreError;

    fn try_from(row: ScanProgressRow) -> StoreResult<Self> {
        Ok(Self {
            chain_id: row.chain_id as u64,
            chain_name: row.chain_name,
            last_scanned_block: row.last_scanned_block.max(0) as u64,
            latest_network_block: row.latest_network_block.max(0) as u64,
            status: parse("scan status", &row.scan_status)?,
            error_message: row.error_message,
            last_update_time: row.last_update_time,
        })
    }
}

impl TryFrom<FlowRow> for Flow {
    type Error = StoreError;

    fn try_from(row: FlowRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id,
            key: FlowKey {
                flow_id: row.flow_id,
                standard: parse("timelock standard", &row.timelock_standard)?,
                chain_id: row.chain_id as u64,
                contract_address: row.contract_address,
            },
            status: parse("flow status", &row.status)?,
            queue_tx_hash: row.queue_tx_hash,
            execute_tx_hash: row.execute_tx_hash,
            cancel_tx_hash: row.cancel_tx_hash,
            initiator_address: row.initiator_address,
            queued_at: row.queued_at,
            executed_at: row.executed_at,
            cancelled_at: row.cancelled_at,
            eta: row.eta,
            expired_at: row.expired_at,
            target_address: row.target_address,
            call_data: row.call_data,
            value: row.value,
        })
    }
}

fn flow_rows(rows: Vec<FlowRow>) -> StoreResult<Vec<Flow>> {
    rows.into_iter().map(Flow::try_from).collect()
}

#[derive(Clone)]
pub struct PgProgressStore {
    db: Db,
}

impl PgProgressStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProgressStore for PgProgressStore {
    async fn get_progress(&self, chain_id: u64) -> StoreResult<Option<ScanProgress>> {
        use block_scan_progress::dsl;

        let mut conn = connect(&self.db).await?;
        let row = dsl::block_scan_progress
            .filter(dsl::chain_id.eq(to_i32(chain_id)?))
            .select(ScanProgressRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(ScanProgress::try_from).transpose()
    }

    async fn get_or_create_progress(
        &self,
        chain: &ChainInfo,
        initial_block: u64,
    ) -> StoreResult<ScanProgress> {
        use block_scan_progress::dsl;

        let new_progress = NewScanProgress {
            chain_id: to_i32(chain.chain_id)?,
            chain_name: chain.name.clone(),
            last_scanned_block: to_i64(initial_block)?,
            latest_network_block: to_i64(initial_block)?,
            scan_status: ScanStatus::Running.as_ref().to_string(),
        };
        {
            let mut conn = connect(&self.db).await?;
            let inserted = diesel::insert_into(dsl::block_scan_progress)
                .values(&new_progress)
                .on_conflict(dsl::chain_id)
                .do_nothing()
                .execute(&mut conn)
                .await?;
            if inserted > 0 {
                debug!(
                    "[ProgressStore] Created progress for chain {} at block {}",
                    chain.chain_id, initial_block
                );
            }
        }

        self.get_progress(chain.chain_id).await?.ok_or_else(|| {
            StoreError::Invalid(format!("progress for chain {} vanished", chain.chain_id))
        })
    }

    async fn update_progress(
        &self,
        chain_id: u64,
        last_scanned_block: u64,
        latest_network_block: u64,
    ) -> StoreResult<()> {
        use block_scan_progress::dsl;

        let now = Utc::now();
        let last_scanned_block = to_i64(last_scanned_block)?;
        let mut conn = connect(&self.db).await?;
        diesel::update(
            dsl::block_scan_progress
                .filter(dsl::chain_id.eq(to_i32(chain_id)?))
                .filter(dsl::last_scanned_block.le(last_scanned_block)),
        )
        .set((
            dsl::last_scanned_block.eq(last_scanned_block),
            dsl::latest_network_block.eq(to_i64(latest_network_block)?),
            dsl::scan_status.eq(ScanStatus::Running.as_ref()),
            dsl::error_message.eq(None::<String>),
            dsl::last_update_time.eq(now),
            dsl::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        chain_id: u64,
        status: ScanStatus,
        error_message: Option<String>,
    ) -> StoreResult<()> {
        use block_scan_progress::dsl;

        let now = Utc::now();
        let mut conn = connect(&self.db).await?;
        diesel::update(dsl::block_scan_progress.filter(dsl::chain_id.eq(to_i32(chain_id)?)))
            .set((
                dsl::scan_status.eq(status.as_ref()),
                dsl::error_message.eq(error_message),
                dsl::last_update_time.eq(now),
                dsl::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn reset_progress(&self, chain_id: u64, last_scanned_block: u64) -> StoreResult<()> {
        use block_scan_progress::dsl;

        let now = Utc::now();
        let mut conn = connect(&self.db).await?;
        let updated =
            diesel::update(dsl::block_scan_progress.filter(dsl::chain_id.eq(to_i32(chain_id)?)))
                .set((
                    dsl::last_scanned_block.eq(to_i64(last_scanned_block)?),
                    dsl::scan_status.eq(ScanStatus::Running.as_ref()),
                    dsl::error_message.eq(None::<String>),
                    dsl::last_update_time.eq(now),
                    dsl::updated_at.eq(now),
                ))
                .execute(&mut conn)
                .await?;
        if updated == 0 {
            return Err(StoreError::Invalid(format!(
                "no scan progress for chain {chain_id}"
            )));
        }
        Ok(())
    }

    async fn list_progress(&self) -> StoreResult<Vec<ScanProgress>> {
        use block_scan_progress::dsl;

        let mut conn = connect(&self.db).await?;
        let rows = dsl::block_scan_progress
            .order(dsl::chain_id.asc())
            .select(ScanProgressRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(ScanProgress::try_from).collect()
    }

    async fn pause_all_running(&self) -> StoreResult<usize> {
        use block_scan_progress::dsl;

        let now = Utc::now();
        let mut conn = connect(&self.db).await?;
        Ok(diesel::update(
            dsl::block_scan_progress.filter(dsl::scan_status.eq(ScanStatus::Running.as_ref())),
        )
        .set((
            dsl::scan_status.eq(ScanStatus::Paused.as_ref()),
            dsl::last_update_time.eq(now),
            dsl::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await?)
    }
}

#[derive(Clone)]
pub struct PgTransactionStore {
    db: Db,
}

impl PgTransactionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn insert_events(&self, events: &[TimelockEvent]) -> StoreResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let rows = events
            .iter()
            .map(TimelockEvent::to_record)
            .collect::<StoreResult<Vec<_>>>()?;

        let mut conn = connect(&self.db).await?;
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
            inserted += diesel::insert_into(compound_timelock_transactions::table)
                .values(chunk)
                .on_conflict_do_nothing()
                .execute(&mut conn)
                .await?;
        }
        Ok(inserted)
    }

    async fn queue_function_signature(
        &self,
        chain_id: u64,
        contract_address: &str,
        flow_id: &str,
    ) -> StoreResult<Option<String>> {
        use compound_timelock_transactions::dsl;

        let mut conn = connect(&self.db).await?;
        let signature: Option<Option<String>> = dsl::compound_timelock_transactions
            .filter(dsl::chain_id.eq(to_i32(chain_id)?))
            .filter(dsl::contract_address.eq(contract_address))
            .filter(dsl::event_tx_hash.eq(flow_id))
            .filter(dsl::event_type.eq(CompoundEventType::QueueTransaction.as_ref()))
            .filter(dsl::tx_status.eq(TxStatus::Success.as_ref()))
            .order(dsl::block_number.desc())
            .select(dsl::event_function_signature)
            .first(&mut conn)
            .await
            .optional()?;
        Ok(signature.flatten())
    }
}

#[derive(Clone)]
pub struct PgFlowStore {
    db: Db,
}

impl PgFlowStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FlowStore for PgFlowStore {
    async fn get_flow(&self, key: &FlowKey) -> StoreResult<Option<Flow>> {
        use timelock_transaction_flows::dsl;

        let mut conn = connect(&self.db).await?;
        let row = dsl::timelock_transaction_flows
            .filter(dsl::flow_id.eq(&key.flow_id))
            .filter(dsl::timelock_standard.eq(key.standard.as_ref()))
            .filter(dsl::chain_id.eq(to_i32(key.chain_id)?))
            .filter(dsl::contract_address.eq(&key.contract_address))
            .select(FlowRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(Flow::try_from).transpose()
    }

    async fn create_flow(&self, key: &FlowKey, fields: &QueueFields) -> StoreResult<bool> {
        use timelock_transaction_flows::dsl;

        let new_flow = NewFlow {
            flow_id: key.flow_id.clone(),
            timelock_standard: key.standard.as_ref().to_string(),
            chain_id: to_i32(key.chain_id)?,
            contract_address: key.contract_address.clone(),
            status: FlowStatus::Waiting.as_ref().to_string(),
            queue_tx_hash: Some(fields.queue_tx_hash.clone()),
            initiator_address: Some(fields.initiator_address.clone()),
            queued_at: Some(fields.queued_at),
            eta: Some(fields.eta),
            expired_at: Some(fields.expired_at),
            target_address: Some(fields.target_address.clone()),
            call_data: Some(fields.call_data.clone()),
            value: fields.value.clone(),
        };

        let mut conn = connect(&self.db).await?;
        let inserted = diesel::insert_into(dsl::timelock_transaction_flows)
            .values(&new_flow)
            .on_conflict((
                dsl::flow_id,
                dsl::timelock_standard,
                dsl::chain_id,
                dsl::contract_address,
            ))
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted > 0)
    }

    async fn backfill_queue_fields(&self, id: i64, backfill: &QueueBackfill) -> StoreResult<bool> {
        use timelock_transaction_flows::dsl;

        if backfill.is_empty() {
            return Ok(false);
        }
        let changeset = FlowQueueBackfill {
            queue_tx_hash: backfill.queue_tx_hash.clone(),
            initiator_address: backfill.initiator_address.clone(),
            queued_at: backfill.queued_at,
            eta: backfill.eta,
            expired_at: backfill.expired_at,
            target_address: backfill.target_address.clone(),
            call_data: backfill.call_data.clone(),
            updated_at: Some(Utc::now()),
        };

        let mut conn = connect(&self.db).await?;
        let updated = diesel::update(dsl::timelock_transaction_flows.filter(dsl::id.eq(id)))
            .set(&changeset)
            .execute(&mut conn)
            .await?;
        Ok(updated > 0)
    }

    async fn transition(
        &self,
        id: i64,
        from: FlowStatus,
        change: &StatusChange,
    ) -> StoreResult<bool> {
        use timelock_transaction_flows::dsl;

        let executed = change.to == FlowStatus::Executed;
        let cancelled = change.to == FlowStatus::Cancelled;
        let changeset = FlowStatusChange {
            status: change.to.as_ref().to_string(),
            execute_tx_hash: change.tx_hash.clone().filter(|_| executed),
            executed_at: executed.then_some(change.at),
            cancel_tx_hash: change.tx_hash.clone().filter(|_| cancelled),
            cancelled_at: cancelled.then_some(change.at),
            updated_at: Utc::now(),
        };

        let mut conn = connect(&self.db).await?;
        let updated = diesel::update(
            dsl::timelock_transaction_flows
                .filter(dsl::id.eq(id))
                .filter(dsl::status.eq(from.as_ref())),
        )
        .set(&changeset)
        .execute(&mut conn)
        .await?;
        Ok(updated > 0)
    }

    async fn waiting_flows_due(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Flow>> {
        use timelock_transaction_flows::dsl;

        let mut conn = connect(&self.db).await?;
        let rows = dsl::timelock_transaction_flows
            .filter(dsl::status.eq(FlowStatus::Waiting.as_ref()))
            .filter(dsl::eta.le(now))
            .order(dsl::eta.asc())
            .limit(limit)
            .select(FlowRow::as_select())
            .load(&mut conn)
            .await?;
        flow_rows(rows)
    }

    async fn flows_expired(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Flow>> {
        use timelock_transaction_flows::dsl;

        let mut conn = connect(&self.db).await?;
        let rows = dsl::timelock_transaction_flows
            .filter(
                dsl::status
                    .eq(FlowStatus::Waiting.as_ref())
                    .or(dsl::status.eq(FlowStatus::Ready.as_ref())),
            )
            .filter(dsl::expired_at.le(now))
            .order(dsl::expired_at.asc())
            .limit(limit)
            .select(FlowRow::as_select())
            .load(&mut conn)
            .await?;
        flow_rows(rows)
    }

    async fn batch_transition(
        &self,
        ids: &[i64],
        from: FlowStatus,
        to: FlowStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>> {
        use timelock_transaction_flows::dsl;

        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = connect(&self.db).await?;
        Ok(diesel::update(
            dsl::timelock_transaction_flows
                .filter(dsl::id.eq_any(ids.to_vec()))
                .filter(dsl::status.eq(from.as_ref())),
        )
        .set((dsl::status.eq(to.as_ref()), dsl::updated_at.eq(now)))
        .returning(dsl::id)
        .get_results(&mut conn)
        .await?)
    }

    async fn refresh_expired_at(
        &self,
        chain_id: u64,
        contract_address: &str,
        grace_period_secs: u64,
    ) -> StoreResult<usize> {
        use diesel::sql_types::{Double, Integer, Text};

        let mut conn = connect(&self.db).await?;
        Ok(diesel::sql_query(
            "UPDATE timelock_transaction_flows \
             SET expired_at = eta + make_interval(secs => $1), updated_at = NOW() \
             WHERE chain_id = $2 AND contract_address = $3 \
               AND timelock_standard = $4 AND eta IS NOT NULL",
        )
        .bind::<Double, _>(grace_period_secs as f64)
        .bind::<Integer, _>(to_i32(chain_id)?)
        .bind::<Text, _>(contract_address)
        .bind::<Text, _>(TimelockStandard::Compound.as_ref())
        .execute(&mut conn)
        .await?)
    }

    async fn count_by_status(
        &self,
        chain_id: Option<u64>,
    ) -> StoreResult<HashMap<FlowStatus, i64>> {
        use diesel::dsl::count_star;
        use timelock_transaction_flows::dsl;

        let mut conn = connect(&self.db).await?;
        let counts: Vec<(String, i64)> = match chain_id {
            Some(chain_id) => {
                dsl::timelock_transaction_flows
                    .filter(dsl::chain_id.eq(to_i32(chain_id)?))
                    .group_by(dsl::status)
                    .select((dsl::status, count_star()))
                    .load(&mut conn)
                    .await?
            }
            None => {
                dsl::timelock_transaction_flows
                    .group_by(dsl::status)
                    .select((dsl::status, count_star()))
                    .load(&mut conn)
                    .await?
            }
        };
        counts
            .into_iter()
            .map(|(status, count)| Ok((parse("flow status", &status)?, count)))
            .collect()
    }
}

#[derive(Clone)]
pub struct PgTimelockMetadata {
    db: Db,
}

impl PgTimelockMetadata {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TimelockMetadata for PgTimelockMetadata {
    async fn get_by_chain_and_address(
        &self,
        chain_id: u64,
        contract_address: &str,
    ) -> StoreResult<Option<TimelockInfo>> {
        use compound_timelocks::dsl;

        let mut conn = connect(&self.db).await?;
        // The same contract can be imported by several users, the earliest import wins.
        let row: Option<(i64, DateTime<Utc>)> = dsl::compound_timelocks
            .filter(dsl::chain_id.eq(to_i32(chain_id)?))
            .filter(lower(dsl::contract_address).eq(contract_address.to_lowercase()))
            .filter(dsl::status.ne("deleted"))
            .order(dsl::created_at.asc())
            .select((dsl::grace_period, dsl::created_at))
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(|(grace_period, created_at)| TimelockInfo {
            grace_period_secs: grace_period.max(0) as u64,
            created_at,
        }))
    }
}

#[derive(Clone)]
pub struct PgChainDirectory {
    db: Db,
}

impl PgChainDirectory {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ChainDirectory for PgChainDirectory {
    async fn get_rpc_enabled_chains(&self, include_testnets: bool) -> StoreResult<Vec<ChainInfo>> {
        use support_chains::dsl;

        let mut conn = connect(&self.db).await?;
        let mut query = dsl::support_chains
            .select((
                dsl::chain_id,
                dsl::chain_name,
                dsl::alchemy_rpc_template,
                dsl::is_testnet,
            ))
            .filter(dsl::is_active.eq(true))
            .filter(dsl::rpc_enabled.eq(true))
            .filter(dsl::alchemy_rpc_template.is_not_null())
            .order(dsl::chain_id.asc())
            .into_boxed();
        if !include_testnets {
            query = query.filter(dsl::is_testnet.eq(false));
        }
        let rows: Vec<(i64, String, Option<String>, bool)> = query.load(&mut conn).await?;

        Ok(rows
            .into_iter()
            .filter_map(|(chain_id, name, template, is_testnet)| {
                let template = template.filter(|t| !t.is_empty())?;
                Some(ChainInfo {
                    chain_id: chain_id as u64,
                    name,
                    rpc_url_template: template,
                    is_testnet,
                })
            })
            .collect())
    }
}
