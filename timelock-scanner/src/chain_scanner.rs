// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! One scanning loop per chain.
//!
//! Each tick reads the chain head, scans the next confirmed window after the
//! stored pointer, reconciles the decoded events and only then advances the
//! pointer. A failed tick leaves the pointer untouched, so the same window is
//! retried after the error cooldown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use timelock_schema::models::ScanStatus;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::block_processor::BlockRangeProcessor;
use crate::config::ScanConfig;
use crate::error::{ScannerError, ScannerResult};
use crate::metrics::ScannerMetrics;
use crate::reconciler::EventReconciler;
use crate::rpc::{ChainRpc, RpcManager};
use crate::store::{ChainInfo, ProgressStore};

/// Next window to scan after `last_scanned`, or `None` when nothing beyond
/// the confirmation depth is left.
pub fn compute_scan_window(
    last_scanned: u64,
    head: u64,
    confirmations: u64,
    batch_size: u64,
) -> Option<(u64, u64)> {
    let safe_head = head.checked_sub(confirmations)?;
    let from = last_scanned.checked_add(1)?;
    if from > safe_head {
        return None;
    }
    let to = from
        .saturating_add(batch_size.max(1) - 1)
        .min(safe_head);
    Some((from, to))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerState {
    pub status: ScanStatus,
    pub last_scanned_block: u64,
    pub latest_network_block: u64,
    pub last_error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for ScannerState {
    fn default() -> Self {
        Self {
            status: ScanStatus::Paused,
            last_scanned_block: 0,
            latest_network_block: 0,
            last_error: None,
            last_update: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing confirmed beyond the pointer.
    Idle,
    Scanned {
        from: u64,
        to: u64,
        far_behind: bool,
    },
}

pub struct ChainScanner {
    chain: ChainInfo,
    rpc: Arc<RpcManager>,
    progress: Arc<dyn ProgressStore>,
    processor: BlockRangeProcessor,
    reconciler: Arc<EventReconciler>,
    config: ScanConfig,
    metrics: Arc<ScannerMetrics>,
    state: RwLock<ScannerState>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChainScanner {
    pub fn new(
        chain: ChainInfo,
        rpc: Arc<RpcManager>,
        progress: Arc<dyn ProgressStore>,
        reconciler: Arc<EventReconciler>,
        config: ScanConfig,
        metrics: Arc<ScannerMetrics>,
        parent: &CancellationToken,
    ) -> Self {
        let processor = BlockRangeProcessor::new(
            chain.clone(),
            config.log_concurrency,
            config.strict_log_processing,
            metrics.clone(),
        );
        Self {
            chain,
            rpc,
            progress,
            processor,
            reconciler,
            config,
            metrics,
            state: RwLock::new(ScannerState::default()),
            cancel: parent.child_token(),
            handle: Mutex::new(None),
        }
    }

    pub fn chain(&self) -> &ChainInfo {
        &self.chain
    }

    pub async fn state(&self) -> ScannerState {
        self.state.read().await.clone()
    }

    /// Whether the scanning loop has been spawned and has not exited.
    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn head(&self) -> ScannerResult<u64> {
        let head = self
            .rpc
            .execute_with_retry(self.chain.chain_id, |client| async move {
                client.block_number().await
            })
            .await?;
        self.metrics
            .chain_head_block
            .with_label_values(&[&self.chain.chain_id.to_string()])
            .set(head as i64);
        Ok(head)
    }

    /// Block the pointer starts at for a chain without stored progress: the
    /// block before a configured start block, otherwise the current safe head.
    async fn initial_block(&self) -> ScannerResult<u64> {
        if let Some(start) = self.config.start_blocks.get(&self.chain.chain_id) {
            return Ok(start.saturating_sub(1));
        }
        Ok(self.head().await?.saturating_sub(self.config.confirmations))
    }

    /// Loads or creates the stored progress, marks the chain running and
    /// spawns the scanning loop.
    pub async fn start(self: &Arc<Self>) -> ScannerResult<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }

        let progress = match self.progress.get_progress(self.chain.chain_id).await? {
            Some(progress) => progress,
            None => {
                let initial = self.initial_block().await?;
                self.progress
                    .get_or_create_progress(&self.chain, initial)
                    .await?
            }
        };
        self.progress
            .update_status(self.chain.chain_id, ScanStatus::Running, None)
            .await?;
        {
            let mut state = self.state.write().await;
            state.status = ScanStatus::Running;
            state.last_scanned_block = progress.last_scanned_block;
            state.latest_network_block = progress.latest_network_block;
            state.last_error = None;
            state.last_update = Some(Utc::now());
        }
        info!(
            "[{}] Starting scanner at block {}",
            self.chain.name, progress.last_scanned_block
        );

        let scanner = self.clone();
        let span = info_span!("chain_scanner", chain_id = self.chain.chain_id, chain = %self.chain.name);
        *handle = Some(tokio::spawn(async move { scanner.run().await }.instrument(span)));
        Ok(())
    }

    async fn run(&self) {
        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = self.tick() => outcome,
            };
            let sleep = match outcome {
                Ok(TickOutcome::Scanned {
                    far_behind: true, ..
                }) => self.config.fast_interval(),
                Ok(_) => self.config.slow_interval(),
                Err(ScannerError::Shutdown) => break,
                Err(e) => {
                    self.record_error(&e).await;
                    self.config.error_cooldown()
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        debug!("[{}] Scanner loop exited", self.chain.name);
    }

    /// One scan step.
    pub async fn tick(&self) -> ScannerResult<TickOutcome> {
        let chain_id = self.chain.chain_id;
        let head = self.head().await?;
        let confirmations = self.config.confirmations;
        let progress = self
            .progress
            .get_or_create_progress(&self.chain, head.saturating_sub(confirmations))
            .await?;

        let Some((from, to)) = compute_scan_window(
            progress.last_scanned_block,
            head,
            confirmations,
            self.config.batch_size,
        ) else {
            self.progress
                .update_progress(chain_id, progress.last_scanned_block, head)
                .await?;
            self.record_progress(progress.last_scanned_block, head).await;
            return Ok(TickOutcome::Idle);
        };

        let processor = &self.processor;
        let events = self
            .rpc
            .execute_with_retry(chain_id, move |client: Arc<dyn ChainRpc>| async move {
                processor.scan_block_range(client.as_ref(), from, to).await
            })
            .await?;

        if !events.is_empty() {
            self.reconciler.process_events(&self.chain, &events).await?;
        }

        self.progress.update_progress(chain_id, to, head).await?;
        self.record_progress(to, head).await;
        self.metrics
            .last_scanned_block
            .with_label_values(&[&chain_id.to_string()])
            .set(to as i64);

        let remaining = head.saturating_sub(confirmations).saturating_sub(to);
        debug!(
            "[{}] Scanned {}..={} ({} events), {} blocks behind",
            self.chain.name,
            from,
            to,
            events.len(),
            remaining
        );
        Ok(TickOutcome::Scanned {
            from,
            to,
            far_behind: remaining > self.config.far_behind_threshold,
        })
    }

    async fn record_progress(&self, last_scanned: u64, head: u64) {
        let mut state = self.state.write().await;
        state.status = ScanStatus::Running;
        state.last_scanned_block = last_scanned;
        state.latest_network_block = head;
        state.last_error = None;
        state.last_update = Some(Utc::now());
    }

    pub(crate) async fn record_error(&self, e: &ScannerError) {
        warn!("[{}] Scan tick failed: {}", self.chain.name, e);
        self.metrics
            .scan_errors
            .with_label_values(&[&self.chain.chain_id.to_string(), e.error_type()])
            .inc();
        {
            let mut state = self.state.write().await;
            state.status = ScanStatus::Error;
            state.last_error = Some(e.to_string());
            state.last_update = Some(Utc::now());
        }
        if let Err(store_err) = self
            .progress
            .update_status(self.chain.chain_id, ScanStatus::Error, Some(e.to_string()))
            .await
        {
            error!(
                "[{}] Failed to persist error status: {}",
                self.chain.name, store_err
            );
        }
    }

    /// Stops the loop, waiting up to `timeout`, and persists `paused`.
    /// Returns `false` if the loop did not finish in time.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let finished = match self.handle.lock().await.take() {
            Some(handle) => tokio::time::timeout(timeout, handle).await.is_ok(),
            None => true,
        };
        if !finished {
            warn!(
                "[{}] Scanner did not stop within {:?}",
                self.chain.name, timeout
            );
        }

        self.state.write().await.status = ScanStatus::Paused;
        if let Err(e) = self
            .progress
            .update_status(self.chain.chain_id, ScanStatus::Paused, None)
            .await
        {
            error!("[{}] Failed to persist paused status: {}", self.chain.name, e);
        }
        info!("[{}] Scanner stopped", self.chain.name);
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::notification::NotificationDispatcher;
    use crate::store::{FlowStore, MemoryStore};
    use crate::test_utils::{compound_log, test_chain, LogFixture, MockChainRpc, MockConnector};
    use timelock_schema::models::FlowStatus;

    #[test]
    fn test_compute_scan_window() {
        // Caught up to the confirmed head.
        assert_eq!(compute_scan_window(88, 100, 12, 10), None);
        assert_eq!(compute_scan_window(87, 100, 12, 10), Some((88, 88)));
        // Bounded by batch size.
        assert_eq!(compute_scan_window(0, 1000, 12, 100), Some((1, 100)));
        // Bounded by the confirmation depth.
        assert_eq!(compute_scan_window(50, 100, 12, 100), Some((51, 88)));
        // Head within the confirmation depth.
        assert_eq!(compute_scan_window(0, 5, 12, 100), None);
        assert_eq!(compute_scan_window(u64::MAX, u64::MAX, 0, 1), None);
        // Zero batch size still makes progress.
        assert_eq!(compute_scan_window(9, 100, 0, 0), Some((10, 10)));
    }

    struct Harness {
        rpc: Arc<MockChainRpc>,
        store: Arc<MemoryStore>,
        scanner: Arc<ChainScanner>,
    }

    fn scan_config() -> ScanConfig {
        ScanConfig {
            batch_size: 10,
            confirmations: 2,
            fast_interval_ms: 1,
            slow_interval_secs: 1,
            error_cooldown_secs: 1,
            far_behind_threshold: 5,
            ..Default::default()
        }
    }

    async fn harness(config: ScanConfig, max_retries: usize) -> Harness {
        let rpc = Arc::new(MockChainRpc::new(1));
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(ScannerMetrics::new_for_testing());
        let manager = Arc::new(RpcManager::new(
            Arc::new(MockConnector::new(rpc.clone())),
            RpcConfig {
                max_retries,
                retry_delay_ms: 1,
                max_retry_delay_ms: 2,
                ..Default::default()
            },
            metrics.clone(),
        ));
        manager.register_chain(test_chain(1)).await;
        let reconciler = Arc::new(EventReconciler::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(NotificationDispatcher::new(vec![], metrics.clone())),
            3600,
            metrics.clone(),
        ));
        let scanner = Arc::new(ChainScanner::new(
            test_chain(1),
            manager,
            store.clone(),
            reconciler,
            config,
            metrics,
            &CancellationToken::new(),
        ));
        Harness {
            rpc,
            store,
            scanner,
        }
    }

    #[tokio::test]
    async fn test_tick_scans_confirmed_windows() {
        let h = harness(scan_config(), 0).await;
        h.rpc.set_head(30);
        h.store
            .get_or_create_progress(&test_chain(1), 0)
            .await
            .unwrap();
        h.rpc
            .push_log(compound_log(&LogFixture::queue(1, 1_700_003_600).block(4)));

        let outcome = h.scanner.tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Scanned {
                from: 1,
                to: 10,
                far_behind: true
            }
        );
        assert_eq!(h.store.flows().await[0].status, FlowStatus::Waiting);

        h.scanner.tick().await.unwrap();
        let outcome = h.scanner.tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Scanned {
                from: 21,
                to: 28,
                far_behind: false
            }
        );
        assert_eq!(h.scanner.tick().await.unwrap(), TickOutcome::Idle);
        assert_eq!(h.rpc.get_logs_ranges(), vec![(1, 10), (11, 20), (21, 28)]);

        let progress = h.store.get_progress(1).await.unwrap().unwrap();
        assert_eq!(progress.last_scanned_block, 28);
        assert_eq!(progress.latest_network_block, 30);
        assert_eq!(h.scanner.state().await.last_scanned_block, 28);
    }

    #[tokio::test]
    async fn test_new_chain_starts_at_safe_head() {
        let h = harness(scan_config(), 0).await;
        h.rpc.set_head(500);
        h.scanner.start().await.unwrap();
        let progress = h.store.get_progress(1).await.unwrap().unwrap();
        assert_eq!(progress.last_scanned_block, 498);
        assert!(h.scanner.stop(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_configured_start_block() {
        let mut config = scan_config();
        config.start_blocks.insert(1, 100);
        let h = harness(config, 0).await;
        h.rpc.set_head(500);
        h.scanner.start().await.unwrap();
        assert!(h.scanner.stop(Duration::from_secs(5)).await);
        let progress = h.store.get_progress(1).await.unwrap().unwrap();
        assert_eq!(progress.status, ScanStatus::Paused);
        // The loop may already have scanned a window past the start block.
        assert!(progress.last_scanned_block >= 99);
        assert!(progress.last_scanned_block <= 498);
    }

    #[tokio::test]
    async fn test_failed_persistence_keeps_pointer() {
        let h = harness(scan_config(), 0).await;
        h.rpc.set_head(30);
        h.store
            .get_or_create_progress(&test_chain(1), 0)
            .await
            .unwrap();
        h.rpc
            .push_log(compound_log(&LogFixture::queue(1, 1_700_003_600).block(4)));
        h.store.set_fail_writes(true);
        let err = h.scanner.tick().await.unwrap_err();
        assert!(matches!(err, ScannerError::Persistence(_)));
        h.store.set_fail_writes(false);
        assert_eq!(
            h.store.get_progress(1).await.unwrap().unwrap().last_scanned_block,
            0
        );

        assert!(matches!(
            h.scanner.tick().await.unwrap(),
            TickOutcome::Scanned { from: 1, .. }
        ));
        assert_eq!(h.store.count_by_status(Some(1)).await.unwrap()[&FlowStatus::Waiting], 1);
    }

    #[tokio::test]
    async fn test_error_status_is_recorded() {
        let h = harness(scan_config(), 1).await;
        h.store
            .get_or_create_progress(&test_chain(1), 0)
            .await
            .unwrap();
        h.rpc.fail_next_block_numbers(2);
        let err = h.scanner.tick().await.unwrap_err();
        h.scanner.record_error(&err).await;

        let progress = h.store.get_progress(1).await.unwrap().unwrap();
        assert_eq!(progress.status, ScanStatus::Error);
        assert!(progress.error_message.unwrap().contains("2 attempts"));
        assert_eq!(h.scanner.state().await.status, ScanStatus::Error);
    }
}
