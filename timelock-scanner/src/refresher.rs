// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wall-clock driven flow transitions: `waiting -> ready` once the eta has
//! passed and `waiting | ready -> expired` once the grace period has elapsed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use timelock_schema::models::FlowStatus;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::RefresherConfig;
use crate::error::ScannerResult;
use crate::metrics::ScannerMetrics;
use crate::notification::{FlowNotification, NotificationDispatcher};
use crate::reconciler::predates_import;
use crate::store::{Flow, FlowStore, TimelockInfo, TimelockMetadata};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub ready: usize,
    pub expired: usize,
    pub notified: usize,
}

pub struct FlowStatusRefresher {
    flows: Arc<dyn FlowStore>,
    metadata: Arc<dyn TimelockMetadata>,
    notifier: Arc<NotificationDispatcher>,
    config: RefresherConfig,
    metrics: Arc<ScannerMetrics>,
    // Token and task of the current run. Each start gets a fresh token so a
    // stopped refresher can be started again.
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl FlowStatusRefresher {
    pub fn new(
        flows: Arc<dyn FlowStore>,
        metadata: Arc<dyn TimelockMetadata>,
        notifier: Arc<NotificationDispatcher>,
        config: RefresherConfig,
        metrics: Arc<ScannerMetrics>,
    ) -> Self {
        Self {
            flows,
            metadata,
            notifier,
            config,
            metrics,
            running: Mutex::new(None),
        }
    }

    /// Spawns the periodic loop. A second call while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let refresher = self.clone();
        let interval = self.config.interval();
        info!("[Refresher] Starting, interval {:?}", interval);
        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = task_cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    if let Err(e) = refresher.tick_at(Utc::now()).await {
                        error!("[Refresher] Tick failed: {}", e);
                    }
                }
                info!("[Refresher] Stopped");
            }
            .instrument(info_span!("refresher")),
        );
        *running = Some((cancel, handle));
    }

    /// Signals the loop to stop and waits up to `timeout`. Returns `false` if
    /// the loop did not finish in time.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let Some((cancel, handle)) = self.running.lock().await.take() else {
            return true;
        };
        cancel.cancel();
        match tokio::time::timeout(timeout, handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!("[Refresher] Did not stop within {:?}", timeout);
                false
            }
        }
    }

    /// Runs both sweeps as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> ScannerResult<RefreshStats> {
        let mut stats = RefreshStats::default();
        let mut timelocks = HashMap::new();

        let due = self
            .flows
            .waiting_flows_due(now, self.config.batch_size)
            .await?;
        let ready = self
            .sweep(&due, FlowStatus::Waiting, FlowStatus::Ready, now)
            .await?;
        stats.ready = ready.len();
        for flow in &ready {
            stats.notified += self
                .notify(flow, FlowStatus::Waiting, FlowStatus::Ready, &mut timelocks)
                .await;
        }

        let expired = self
            .flows
            .flows_expired(now, self.config.batch_size)
            .await?;
        for from in [FlowStatus::Waiting, FlowStatus::Ready] {
            let candidates: Vec<Flow> = expired
                .iter()
                .filter(|f| f.status == from)
                .cloned()
                .collect();
            let changed = self
                .sweep(&candidates, from, FlowStatus::Expired, now)
                .await?;
            stats.expired += changed.len();
            for flow in &changed {
                stats.notified += self
                    .notify(flow, from, FlowStatus::Expired, &mut timelocks)
                    .await;
            }
        }

        if stats.ready > 0 || stats.expired > 0 {
            info!(
                "[Refresher] {} flows ready, {} expired, {} notified",
                stats.ready, stats.expired, stats.notified
            );
        }
        Ok(stats)
    }

    // Returns the flows whose conditional update actually applied.
    async fn sweep(
        &self,
        candidates: &[Flow],
        from: FlowStatus,
        to: FlowStatus,
        now: DateTime<Utc>,
    ) -> ScannerResult<Vec<Flow>> {
        if candidates.is_empty() {
            return Ok(vec![]);
        }
        let ids: Vec<i64> = candidates.iter().map(|f| f.id).collect();
        let changed = self.flows.batch_transition(&ids, from, to, now).await?;
        if changed.len() < ids.len() {
            debug!(
                "[Refresher] {} of {} flows left {} concurrently",
                ids.len() - changed.len(),
                ids.len(),
                from
            );
        }
        self.metrics
            .flow_transitions
            .with_label_values(&[from.as_ref(), to.as_ref()])
            .inc_by(changed.len() as u64);
        Ok(candidates
            .iter()
            .filter(|f| changed.contains(&f.id))
            .cloned()
            .collect())
    }

    async fn notify(
        &self,
        flow: &Flow,
        from: FlowStatus,
        to: FlowStatus,
        timelocks: &mut HashMap<(u64, String), Option<TimelockInfo>>,
    ) -> usize {
        let key = (flow.key.chain_id, flow.key.contract_address.clone());
        let info = match timelocks.get(&key) {
            Some(info) => *info,
            None => {
                let info = self
                    .metadata
                    .get_by_chain_and_address(flow.key.chain_id, &flow.key.contract_address)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(
                            "[Refresher] Failed to load timelock {}: {}",
                            flow.key.contract_address, e
                        );
                        None
                    });
                timelocks.insert(key, info);
                info
            }
        };
        if predates_import(flow.queued_at, info.as_ref()) {
            debug!(
                "[Refresher] Suppressing notification for pre-import flow {}",
                flow.key.flow_id
            );
            return 0;
        }
        self.notifier
            .dispatch(&FlowNotification::for_flow(flow, Some(from), to, None))
            .await;
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_processor::TimelockEvent;
    use crate::notification::NotificationSink;
    use crate::reconciler::EventReconciler;
    use crate::store::MemoryStore;
    use crate::test_utils::{test_chain, timelock_event, LogFixture, RecordingSink};
    use chrono::Duration as ChronoDuration;

    const ETA: i64 = 1_700_003_600;
    const GRACE: u64 = 3600;

    struct Harness {
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
        reconciler: EventReconciler,
        refresher: Arc<FlowStatusRefresher>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(ScannerMetrics::new_for_testing());
        let sinks: Vec<Arc<dyn NotificationSink>> = vec![sink.clone()];
        let notifier = Arc::new(NotificationDispatcher::new(sinks, metrics.clone()));
        let config = RefresherConfig {
            interval_secs: 1,
            batch_size: 100,
            default_grace_period_secs: GRACE,
        };
        Harness {
            reconciler: EventReconciler::new(
                store.clone(),
                store.clone(),
                store.clone(),
                notifier.clone(),
                GRACE,
                metrics.clone(),
            ),
            refresher: Arc::new(FlowStatusRefresher::new(
                store.clone(),
                store.clone(),
                notifier,
                config,
                metrics,
            )),
            store,
            sink,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).unwrap()
    }

    async fn queue(h: &Harness, events: &[TimelockEvent]) {
        h.reconciler
            .process_events(&test_chain(1), events)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_waiting_becomes_ready_after_eta() {
        let h = harness();
        queue(&h, &[timelock_event(&LogFixture::queue(1, ETA as u64))]).await;

        let stats = h.refresher.tick_at(at(ETA - 1)).await.unwrap();
        assert_eq!(stats, RefreshStats::default());
        assert_eq!(h.store.flows().await[0].status, FlowStatus::Waiting);

        let stats = h.refresher.tick_at(at(ETA + 1)).await.unwrap();
        assert_eq!(stats.ready, 1);
        assert_eq!(h.store.flows().await[0].status, FlowStatus::Ready);
        let last = h.sink.sent().pop().unwrap();
        assert_eq!(last.status_from, Some(FlowStatus::Waiting));
        assert_eq!(last.status_to, FlowStatus::Ready);
        assert_eq!(last.tx_hash, None);

        let stats = h.refresher.tick_at(at(ETA + 2)).await.unwrap();
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test]
    async fn test_ready_expires_after_grace() {
        let h = harness();
        queue(&h, &[timelock_event(&LogFixture::queue(1, ETA as u64))]).await;
        h.refresher.tick_at(at(ETA + 1)).await.unwrap();

        let stats = h
            .refresher
            .tick_at(at(ETA + GRACE as i64))
            .await
            .unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(h.store.flows().await[0].status, FlowStatus::Expired);
        let last = h.sink.sent().pop().unwrap();
        assert_eq!(last.status_from, Some(FlowStatus::Ready));
        assert_eq!(last.status_to, FlowStatus::Expired);
    }

    #[tokio::test]
    async fn test_terminal_flows_are_not_swept() {
        let h = harness();
        queue(
            &h,
            &[
                timelock_event(&LogFixture::queue(1, ETA as u64)),
                timelock_event(&LogFixture::execute(1, ETA as u64).block(3)),
            ],
        )
        .await;
        let stats = h
            .refresher
            .tick_at(at(ETA + GRACE as i64 + 10))
            .await
            .unwrap();
        assert_eq!(stats, RefreshStats::default());
        assert_eq!(h.store.flows().await[0].status, FlowStatus::Executed);
    }

    #[tokio::test]
    async fn test_batch_size_bounds_each_sweep() {
        let mut h = harness();
        let refresher = FlowStatusRefresher::new(
            h.store.clone(),
            h.store.clone(),
            Arc::new(NotificationDispatcher::new(
                vec![],
                Arc::new(ScannerMetrics::new_for_testing()),
            )),
            RefresherConfig {
                interval_secs: 1,
                batch_size: 2,
                default_grace_period_secs: GRACE,
            },
            Arc::new(ScannerMetrics::new_for_testing()),
        );
        h.refresher = Arc::new(refresher);
        let events: Vec<_> = (1..=5)
            .map(|seed| timelock_event(&LogFixture::queue(seed, ETA as u64)))
            .collect();
        queue(&h, &events).await;

        assert_eq!(h.refresher.tick_at(at(ETA)).await.unwrap().ready, 2);
        assert_eq!(h.refresher.tick_at(at(ETA)).await.unwrap().ready, 2);
        assert_eq!(h.refresher.tick_at(at(ETA)).await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_pre_import_flows_are_silent() {
        let h = harness();
        let event = timelock_event(&LogFixture::queue(1, ETA as u64));
        h.store
            .set_timelock(
                1,
                &event.contract_address,
                TimelockInfo {
                    grace_period_secs: GRACE,
                    created_at: event.block_timestamp + ChronoDuration::hours(1),
                },
            )
            .await;
        queue(&h, &[event]).await;
        let stats = h.refresher.tick_at(at(ETA + 1)).await.unwrap();
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.notified, 0);
        assert!(h.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_execute_racing_expiry_applies_once() {
        let h = harness();
        queue(&h, &[timelock_event(&LogFixture::queue(1, ETA as u64))]).await;
        let flow = h.store.flows().await.remove(0);

        // The refresher read the flow as waiting; an execute lands first.
        queue(&h, &[timelock_event(&LogFixture::execute(1, ETA as u64).block(4))]).await;
        let changed = h
            .refresher
            .sweep(&[flow], FlowStatus::Waiting, FlowStatus::Expired, at(ETA))
            .await
            .unwrap();
        assert!(changed.is_empty());
        assert_eq!(h.store.flows().await[0].status, FlowStatus::Executed);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let h = harness();
        h.refresher.start().await;
        h.refresher.start().await;
        assert!(h.refresher.stop(Duration::from_secs(5)).await);
        assert!(h.refresher.stop(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_restart_after_stop_sweeps_again() {
        let h = harness();
        h.refresher.start().await;
        assert!(h.refresher.stop(Duration::from_secs(5)).await);

        // Due long ago, so the first tick of the new run flips it.
        let eta = Utc::now().timestamp() - 60;
        queue(&h, &[timelock_event(&LogFixture::queue(7, eta as u64))]).await;
        h.refresher.start().await;
        let mut status = FlowStatus::Waiting;
        for _ in 0..100 {
            status = h.store.flows().await[0].status;
            if status != FlowStatus::Waiting {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, FlowStatus::Ready);
        assert!(h.refresher.stop(Duration::from_secs(5)).await);
    }
}
