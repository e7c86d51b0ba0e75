// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Folds decoded timelock events into raw records and transaction flows.
//!
//! | flow            | event             | effect                              |
//! |-----------------|-------------------|-------------------------------------|
//! | none            | Queue             | create in `waiting`                 |
//! | none            | Execute / Cancel  | ignored                             |
//! | waiting / ready | Execute           | `executed`                          |
//! | waiting / ready | Cancel            | `cancelled`                         |
//! | any             | duplicate Queue   | backfill missing queue fields only  |
//! | terminal        | anything          | ignored                             |

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use timelock_schema::models::{CompoundEventType, FlowStatus, TimelockStandard};
use tracing::{debug, info, warn};

use crate::block_processor::TimelockEvent;
use crate::error::ScannerResult;
use crate::metrics::ScannerMetrics;
use crate::notification::{FlowNotification, NotificationDispatcher};
use crate::store::{
    ChainInfo, Flow, FlowKey, FlowStore, QueueFields, StatusChange, TimelockInfo,
    TimelockMetadata, TransactionStore,
};

// A conditional update that lost a race is re-read and retried this many times.
const MAX_TRANSITION_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub inserted: usize,
    pub flows_created: usize,
    pub flows_backfilled: usize,
    pub transitions: usize,
    pub ignored: usize,
}

/// Notifications are suppressed for activity that predates the import of the
/// contract into the system.
pub(crate) fn predates_import(at: Option<DateTime<Utc>>, info: Option<&TimelockInfo>) -> bool {
    match (at, info) {
        (Some(at), Some(info)) => at < info.created_at,
        _ => false,
    }
}

pub struct EventReconciler {
    transactions: Arc<dyn TransactionStore>,
    flows: Arc<dyn FlowStore>,
    metadata: Arc<dyn TimelockMetadata>,
    notifier: Arc<NotificationDispatcher>,
    default_grace_period_secs: u64,
    metrics: Arc<ScannerMetrics>,
}

impl EventReconciler {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        flows: Arc<dyn FlowStore>,
        metadata: Arc<dyn TimelockMetadata>,
        notifier: Arc<NotificationDispatcher>,
        default_grace_period_secs: u64,
        metrics: Arc<ScannerMetrics>,
    ) -> Self {
        Self {
            transactions,
            flows,
            metadata,
            notifier,
            default_grace_period_secs,
            metrics,
        }
    }

    /// Persists `events` and applies them to their flows in order.
    ///
    /// Any persistence error aborts the call so the caller can retry the same
    /// block range; re-applying already processed events is a no-op.
    pub async fn process_events(
        &self,
        chain: &ChainInfo,
        events: &[TimelockEvent],
    ) -> ScannerResult<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        if events.is_empty() {
            return Ok(stats);
        }

        stats.inserted = self.transactions.insert_events(events).await?;

        let mut timelocks: HashMap<String, Option<TimelockInfo>> = HashMap::new();
        for event in events {
            if !event.is_success() {
                debug!(
                    "[{}] Ignoring {} of reverted tx {}",
                    chain.name, event.event_type, event.tx_hash
                );
                stats.ignored += 1;
                continue;
            }

            let info = match timelocks.get(&event.contract_address) {
                Some(info) => *info,
                None => {
                    let info = self
                        .metadata
                        .get_by_chain_and_address(event.chain_id, &event.contract_address)
                        .await?;
                    timelocks.insert(event.contract_address.clone(), info);
                    info
                }
            };

            match event.event_type {
                CompoundEventType::QueueTransaction => {
                    self.apply_queue(chain, event, info.as_ref(), &mut stats)
                        .await?
                }
                CompoundEventType::ExecuteTransaction => {
                    self.apply_status_event(
                        chain,
                        event,
                        FlowStatus::Executed,
                        info.as_ref(),
                        &mut stats,
                    )
                    .await?
                }
                CompoundEventType::CancelTransaction => {
                    self.apply_status_event(
                        chain,
                        event,
                        FlowStatus::Cancelled,
                        info.as_ref(),
                        &mut stats,
                    )
                    .await?
                }
            }
        }

        info!(
            "[{}] Reconciled {} events: {} new records, {} flows created, {} transitions, {} ignored",
            chain.name,
            events.len(),
            stats.inserted,
            stats.flows_created,
            stats.transitions,
            stats.ignored
        );
        Ok(stats)
    }

    fn flow_key(event: &TimelockEvent) -> FlowKey {
        FlowKey {
            flow_id: event.event_tx_hash.clone(),
            standard: TimelockStandard::Compound,
            chain_id: event.chain_id,
            contract_address: event.contract_address.clone(),
        }
    }

    fn queue_fields(&self, event: &TimelockEvent, info: Option<&TimelockInfo>) -> Option<QueueFields> {
        let grace = info
            .map(|i| i.grace_period_secs)
            .unwrap_or(self.default_grace_period_secs);
        let eta = event.eta_time()?;
        let expired_at = eta.checked_add_signed(ChronoDuration::seconds(i64::try_from(grace).ok()?))?;
        Some(QueueFields {
            queue_tx_hash: event.tx_hash.clone(),
            initiator_address: event.from_address.clone(),
            queued_at: event.block_timestamp,
            eta,
            expired_at,
            target_address: event.event_target.clone(),
            call_data: event.call_data.clone(),
            value: event.event_value.clone(),
        })
    }

    async fn apply_queue(
        &self,
        chain: &ChainInfo,
        event: &TimelockEvent,
        info: Option<&TimelockInfo>,
        stats: &mut ReconcileStats,
    ) -> ScannerResult<()> {
        let key = Self::flow_key(event);
        let Some(fields) = self.queue_fields(event, info) else {
            warn!(
                "[{}] Flow {} has unrepresentable eta {}, ignoring queue event",
                chain.name, key.flow_id, event.eta
            );
            stats.ignored += 1;
            return Ok(());
        };

        if self.flows.get_flow(&key).await?.is_none() {
            if self.flows.create_flow(&key, &fields).await? {
                stats.flows_created += 1;
                self.metrics
                    .flow_transitions
                    .with_label_values(&["none", FlowStatus::Waiting.as_ref()])
                    .inc();
                if let Some(flow) = self.flows.get_flow(&key).await? {
                    debug!("[{}] Created flow {} ({})", chain.name, key.flow_id, flow.id);
                    if !predates_import(Some(event.block_timestamp), info) {
                        let notification = FlowNotification::for_flow(
                            &flow,
                            None,
                            FlowStatus::Waiting,
                            Some(event.tx_hash.clone()),
                        )
                        .with_function_signature(Some(event.function_signature.clone()));
                        self.notifier.dispatch(&notification).await;
                    }
                }
                return Ok(());
            }
            // Created concurrently; treat as a duplicate.
        }

        let Some(flow) = self.flows.get_flow(&key).await? else {
            return Ok(());
        };
        let backfill = fields.missing_on(&flow);
        if backfill.is_empty() {
            stats.ignored += 1;
            return Ok(());
        }
        if self.flows.backfill_queue_fields(flow.id, &backfill).await? {
            debug!("[{}] Backfilled queue fields of flow {}", chain.name, key.flow_id);
            stats.flows_backfilled += 1;
        }
        Ok(())
    }

    async fn apply_status_event(
        &self,
        chain: &ChainInfo,
        event: &TimelockEvent,
        to: FlowStatus,
        info: Option<&TimelockInfo>,
        stats: &mut ReconcileStats,
    ) -> ScannerResult<()> {
        let key = Self::flow_key(event);
        let change = StatusChange {
            to,
            tx_hash: Some(event.tx_hash.clone()),
            at: event.block_timestamp,
        };

        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let Some(flow) = self.flows.get_flow(&key).await? else {
                warn!(
                    "[{}] {} for unknown flow {} on {}, ignoring",
                    chain.name, event.event_type, key.flow_id, key.contract_address
                );
                stats.ignored += 1;
                return Ok(());
            };
            if !flow.status.can_transition_to(to) {
                debug!(
                    "[{}] Flow {} is {}, ignoring {}",
                    chain.name, key.flow_id, flow.status, event.event_type
                );
                stats.ignored += 1;
                return Ok(());
            }

            if self.flows.transition(flow.id, flow.status, &change).await? {
                stats.transitions += 1;
                self.on_transition(&flow, to, event, info).await;
                return Ok(());
            }
            debug!(
                "[{}] Flow {} changed concurrently, re-reading",
                chain.name, key.flow_id
            );
        }

        warn!(
            "[{}] Gave up applying {} to flow {} after {} attempts",
            chain.name, event.event_type, key.flow_id, MAX_TRANSITION_ATTEMPTS
        );
        stats.ignored += 1;
        Ok(())
    }

    async fn on_transition(
        &self,
        flow: &Flow,
        to: FlowStatus,
        event: &TimelockEvent,
        info: Option<&TimelockInfo>,
    ) {
        info!(
            "[{}] Flow {} {} -> {} by {}",
            event.chain_name, flow.key.flow_id, flow.status, to, event.tx_hash
        );
        self.metrics
            .flow_transitions
            .with_label_values(&[flow.status.as_ref(), to.as_ref()])
            .inc();

        if predates_import(Some(event.block_timestamp), info) {
            return;
        }
        let signature = self
            .transactions
            .queue_function_signature(flow.key.chain_id, &flow.key.contract_address, &flow.key.flow_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to look up function signature of {}: {}", flow.key.flow_id, e);
                None
            });
        let notification =
            FlowNotification::for_flow(flow, Some(flow.status), to, Some(event.tx_hash.clone()))
                .with_function_signature(signature);
        self.notifier.dispatch(&notification).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_utils::{timelock_event, LogFixture, RecordingSink};
    use crate::notification::NotificationSink;

    const ETA: u64 = 1_700_003_600;
    const GRACE: u64 = 14 * 24 * 3600;

    struct Harness {
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        reconciler: EventReconciler,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(ScannerMetrics::new_for_testing());
        let sinks: Vec<Arc<dyn NotificationSink>> = vec![sink.clone()];
        let reconciler = EventReconciler::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(NotificationDispatcher::new(sinks, metrics.clone())),
            GRACE,
            metrics,
        );
        Harness {
            store,
            sink,
            reconciler,
        }
    }

    fn chain() -> ChainInfo {
        crate::test_utils::test_chain(1)
    }

    #[tokio::test]
    async fn test_queue_creates_waiting_flow() {
        let h = harness();
        let queue = timelock_event(&LogFixture::queue(1, ETA));
        let stats = h.reconciler.process_events(&chain(), &[queue.clone()]).await.unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.flows_created, 1);

        let flows = h.store.flows().await;
        assert_eq!(flows.len(), 1);
        let flow = &flows[0];
        assert_eq!(flow.status, FlowStatus::Waiting);
        assert_eq!(flow.key.flow_id, queue.event_tx_hash);
        assert_eq!(flow.eta.unwrap().timestamp() as u64, ETA);
        assert_eq!(flow.expired_at.unwrap().timestamp() as u64, ETA + GRACE);
        assert_eq!(flow.queue_tx_hash.as_deref(), Some(queue.tx_hash.as_str()));

        let sent = h.sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status_from, None);
        assert_eq!(sent[0].status_to, FlowStatus::Waiting);
        assert_eq!(
            sent[0].function_signature.as_deref(),
            Some("setPendingAdmin(address)")
        );
    }

    #[tokio::test]
    async fn test_grace_period_from_metadata() {
        let h = harness();
        let queue = timelock_event(&LogFixture::queue(1, ETA));
        h.store
            .set_timelock(
                1,
                &queue.contract_address,
                TimelockInfo {
                    grace_period_secs: 3600,
                    created_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
                },
            )
            .await;
        h.reconciler.process_events(&chain(), &[queue]).await.unwrap();
        let flow = &h.store.flows().await[0];
        assert_eq!(flow.expired_at.unwrap().timestamp() as u64, ETA + 3600);
    }

    #[tokio::test]
    async fn test_reprocessing_is_idempotent() {
        let h = harness();
        let events = vec![
            timelock_event(&LogFixture::queue(1, ETA)),
            timelock_event(&LogFixture::execute(1, ETA).block(5)),
        ];
        h.reconciler.process_events(&chain(), &events).await.unwrap();
        let flows_before = h.store.flows().await;
        let sent_before = h.sink.sent().len();

        let stats = h.reconciler.process_events(&chain(), &events).await.unwrap();
        assert_eq!(stats.inserted, 0);
        assert_eq!(stats.flows_created, 0);
        assert_eq!(stats.transitions, 0);
        assert_eq!(stats.ignored, 2);
        assert_eq!(h.store.flows().await, flows_before);
        assert_eq!(h.store.transactions().await.len(), 2);
        assert_eq!(h.sink.sent().len(), sent_before);
    }

    #[tokio::test]
    async fn test_execute_from_ready() {
        let h = harness();
        h.reconciler
            .process_events(&chain(), &[timelock_event(&LogFixture::queue(1, ETA))])
            .await
            .unwrap();
        let flow = h.store.flows().await.remove(0);
        h.store
            .batch_transition(&[flow.id], FlowStatus::Waiting, FlowStatus::Ready, Utc::now())
            .await
            .unwrap();

        let execute = timelock_event(&LogFixture::execute(1, ETA).block(9));
        let stats = h
            .reconciler
            .process_events(&chain(), &[execute.clone()])
            .await
            .unwrap();
        assert_eq!(stats.transitions, 1);

        let flow = h.store.flows().await.remove(0);
        assert_eq!(flow.status, FlowStatus::Executed);
        assert_eq!(flow.execute_tx_hash.as_deref(), Some(execute.tx_hash.as_str()));
        assert_eq!(flow.executed_at, Some(execute.block_timestamp));

        let sent = h.sink.sent();
        let last = sent.last().unwrap();
        assert_eq!(last.status_from, Some(FlowStatus::Ready));
        assert_eq!(last.status_to, FlowStatus::Executed);
        assert_eq!(last.tx_hash.as_deref(), Some(execute.tx_hash.as_str()));
        assert_eq!(last.function_signature.as_deref(), Some("setPendingAdmin(address)"));
    }

    #[tokio::test]
    async fn test_cancel_from_waiting() {
        let h = harness();
        let events = vec![
            timelock_event(&LogFixture::queue(1, ETA)),
            timelock_event(&LogFixture::cancel(1, ETA).block(2)),
        ];
        h.reconciler.process_events(&chain(), &events).await.unwrap();
        let flow = h.store.flows().await.remove(0);
        assert_eq!(flow.status, FlowStatus::Cancelled);
        assert!(flow.cancelled_at.is_some());
        assert!(flow.execute_tx_hash.is_none());
    }

    #[tokio::test]
    async fn test_execute_without_queue_is_ignored() {
        let h = harness();
        let stats = h
            .reconciler
            .process_events(&chain(), &[timelock_event(&LogFixture::execute(7, ETA))])
            .await
            .unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.ignored, 1);
        assert!(h.store.flows().await.is_empty());
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_flow_ignores_later_events() {
        let h = harness();
        h.reconciler
            .process_events(
                &chain(),
                &[
                    timelock_event(&LogFixture::queue(1, ETA)),
                    timelock_event(&LogFixture::cancel(1, ETA).block(2)),
                ],
            )
            .await
            .unwrap();
        let stats = h
            .reconciler
            .process_events(&chain(), &[timelock_event(&LogFixture::execute(1, ETA).block(3))])
            .await
            .unwrap();
        assert_eq!(stats.transitions, 0);
        assert_eq!(stats.ignored, 1);
        assert_eq!(h.store.flows().await[0].status, FlowStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_reverted_events_are_recorded_but_inert() {
        let h = harness();
        let stats = h
            .reconciler
            .process_events(&chain(), &[timelock_event(&LogFixture::queue(1, ETA).failed())])
            .await
            .unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.ignored, 1);
        assert!(h.store.flows().await.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_propagates() {
        let h = harness();
        h.store.set_fail_writes(true);
        let err = h
            .reconciler
            .process_events(&chain(), &[timelock_event(&LogFixture::queue(1, ETA))])
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), "persistence");
        h.store.set_fail_writes(false);
        assert!(h.store.flows().await.is_empty());
    }

    #[tokio::test]
    async fn test_notifications_suppressed_before_import() {
        let h = harness();
        let queue = timelock_event(&LogFixture::queue(1, ETA));
        h.store
            .set_timelock(
                1,
                &queue.contract_address,
                TimelockInfo {
                    grace_period_secs: GRACE,
                    created_at: queue.block_timestamp + ChronoDuration::days(1),
                },
            )
            .await;
        h.reconciler.process_events(&chain(), &[queue]).await.unwrap();
        assert_eq!(h.store.flows().await.len(), 1);
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_affect_state() {
        let h = harness();
        h.sink.set_fail(true);
        let stats = h
            .reconciler
            .process_events(&chain(), &[timelock_event(&LogFixture::queue(1, ETA))])
            .await
            .unwrap();
        assert_eq!(stats.flows_created, 1);
        assert_eq!(h.store.flows().await[0].status, FlowStatus::Waiting);
    }

    #[test]
    fn test_predates_import() {
        let created_at = Utc::now();
        let info = TimelockInfo {
            grace_period_secs: GRACE,
            created_at,
        };
        assert!(predates_import(
            Some(created_at - ChronoDuration::seconds(1)),
            Some(&info)
        ));
        assert!(!predates_import(Some(created_at), Some(&info)));
        assert!(!predates_import(None, Some(&info)));
        assert!(!predates_import(Some(created_at), None));
    }
}
