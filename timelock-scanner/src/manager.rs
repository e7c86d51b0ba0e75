// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Supervises one [`ChainScanner`] per RPC-enabled chain, the flow status
//! refresher and a health check loop.
//!
//! Shutdown runs in a fixed order and every phase has its own timeout:
//! refresher, chain scanners, background tasks, rpc clients, and finally a
//! store-level `running -> paused` sweep for any scanner that was missed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use strum::IntoEnumIterator;
use timelock_schema::models::ScanStatus;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::chain_scanner::ChainScanner;
use crate::config::ScannerConfig;
use crate::error::{ScannerError, ScannerResult};
use crate::metrics::ScannerMetrics;
use crate::notification::NotificationDispatcher;
use crate::reconciler::EventReconciler;
use crate::refresher::FlowStatusRefresher;
use crate::rpc::{RpcConnector, RpcManager};
use crate::store::{ChainInfo, Stores};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainScanStatus {
    pub chain_id: u64,
    pub chain_name: String,
    pub last_scanned_block: u64,
    pub latest_network_block: u64,
    pub lag: u64,
    pub status: ScanStatus,
    pub last_error: Option<String>,
    /// Whether a scanner task runs for this chain in this process.
    pub active: bool,
}

pub struct ScannerManager {
    config: ScannerConfig,
    stores: Stores,
    rpc: Arc<RpcManager>,
    reconciler: Arc<EventReconciler>,
    refresher: Arc<FlowStatusRefresher>,
    metrics: Arc<ScannerMetrics>,
    scanners: RwLock<HashMap<u64, Arc<ChainScanner>>>,
    // Serializes scanner swaps (restart, rescan) with each other and with stop.
    admin: Mutex<()>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    #[cfg(test)]
    created: std::sync::Mutex<Vec<Arc<ChainScanner>>>,
}

impl ScannerManager {
    pub fn new(
        config: ScannerConfig,
        stores: Stores,
        connector: Arc<dyn RpcConnector>,
        notifier: Arc<NotificationDispatcher>,
        metrics: Arc<ScannerMetrics>,
    ) -> Self {
        let rpc = Arc::new(RpcManager::new(
            connector,
            config.rpc.clone(),
            metrics.clone(),
        ));
        let reconciler = Arc::new(EventReconciler::new(
            stores.transactions.clone(),
            stores.flows.clone(),
            stores.metadata.clone(),
            notifier.clone(),
            config.refresher.default_grace_period_secs,
            metrics.clone(),
        ));
        let refresher = Arc::new(FlowStatusRefresher::new(
            stores.flows.clone(),
            stores.metadata.clone(),
            notifier,
            config.refresher.clone(),
            metrics.clone(),
        ));
        Self {
            config,
            stores,
            rpc,
            reconciler,
            refresher,
            metrics,
            scanners: RwLock::new(HashMap::new()),
            admin: Mutex::new(()),
            cancel: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
            #[cfg(test)]
            created: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn new_scanner(&self, chain: ChainInfo) -> Arc<ChainScanner> {
        let scanner = Arc::new(ChainScanner::new(
            chain,
            self.rpc.clone(),
            self.stores.progress.clone(),
            self.reconciler.clone(),
            self.config.scanner.clone(),
            self.metrics.clone(),
            &self.cancel,
        ));
        #[cfg(test)]
        self.created.lock().unwrap().push(scanner.clone());
        scanner
    }

    /// Starts a scanner for every RPC-enabled chain, the refresher and the
    /// health check. A chain that fails to start is logged and skipped.
    /// Returns the number of scanners started.
    pub async fn start(self: &Arc<Self>) -> ScannerResult<usize> {
        let chains = self
            .stores
            .chains
            .get_rpc_enabled_chains(self.config.scanner.include_testnets)
            .await?;
        info!("[ScannerManager] Found {} rpc-enabled chains", chains.len());

        let mut started = 0;
        for chain in chains {
            self.rpc.register_chain(chain.clone()).await;
            let scanner = self.new_scanner(chain.clone());
            match scanner.start().await {
                Ok(()) => {
                    self.scanners.write().await.insert(chain.chain_id, scanner);
                    started += 1;
                }
                Err(e) => {
                    error!(
                        "[ScannerManager] Failed to start scanner for {} ({}): {}",
                        chain.name, chain.chain_id, e
                    );
                }
            }
        }

        self.refresher.start().await;

        let manager = self.clone();
        let interval = self.config.scanner.health_check_interval();
        let cancel = self.cancel.clone();
        self.background.lock().await.push(tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => manager.health_check().await,
                    };
                }
            }
            .instrument(info_span!("health_check")),
        ));

        info!("[ScannerManager] Started {} chain scanners", started);
        Ok(started)
    }

    /// Counts in-process scanners by status and publishes the counts.
    pub async fn health_check(&self) -> HashMap<ScanStatus, usize> {
        let scanners: Vec<_> = self.scanners.read().await.values().cloned().collect();
        let mut counts: HashMap<ScanStatus, usize> = HashMap::new();
        for scanner in &scanners {
            *counts.entry(scanner.state().await.status).or_default() += 1;
        }
        for status in ScanStatus::iter() {
            self.metrics
                .scanners_by_status
                .with_label_values(&[status.as_ref()])
                .set(counts.get(&status).copied().unwrap_or(0) as i64);
        }

        let flows = match self.stores.flows.count_by_status(None).await {
            Ok(flows) => flows,
            Err(e) => {
                warn!("[ScannerManager] Failed to count flows: {}", e);
                HashMap::new()
            }
        };
        info!(
            "[ScannerManager] Health: {} scanners ({} running, {} error, {} paused), flows {:?}",
            scanners.len(),
            counts.get(&ScanStatus::Running).copied().unwrap_or(0),
            counts.get(&ScanStatus::Error).copied().unwrap_or(0),
            counts.get(&ScanStatus::Paused).copied().unwrap_or(0),
            flows
        );
        counts
    }

    pub async fn stop(&self) {
        info!("[ScannerManager] Stopping");
        // Held to the end: a swap in flight finishes first, later ones see
        // the cancelled token.
        let _admin = self.admin.lock().await;
        let scanner_timeout = self.config.scanner.scanner_stop_timeout();
        let background_timeout = self.config.scanner.background_stop_timeout();

        if !self.refresher.stop(background_timeout).await {
            error!("[ScannerManager] Refresher stop timed out");
        }

        let scanners: Vec<_> = self.scanners.write().await.drain().map(|(_, s)| s).collect();
        let stops = futures::future::join_all(scanners.iter().map(|s| s.stop(scanner_timeout)));
        match tokio::time::timeout(scanner_timeout, stops).await {
            Ok(results) => {
                let stuck = results.iter().filter(|finished| !**finished).count();
                if stuck > 0 {
                    error!("[ScannerManager] {} chain scanners did not stop in time", stuck);
                }
            }
            Err(_) => error!(
                "[ScannerManager] Chain scanners did not stop within {:?}",
                scanner_timeout
            ),
        }

        self.cancel.cancel();
        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        if tokio::time::timeout(background_timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            error!(
                "[ScannerManager] Background tasks did not stop within {:?}",
                background_timeout
            );
        }

        self.rpc.close_all().await;

        match self.stores.progress.pause_all_running().await {
            Ok(0) => {}
            Ok(n) => info!("[ScannerManager] Marked {} running chains as paused", n),
            Err(e) => error!("[ScannerManager] Failed to pause running chains: {}", e),
        }
        info!("[ScannerManager] Stopped");
    }

    async fn chain_info(&self, chain_id: u64) -> ScannerResult<ChainInfo> {
        if let Some(scanner) = self.scanners.read().await.get(&chain_id) {
            return Ok(scanner.chain().clone());
        }
        self.stores
            .chains
            .get_rpc_enabled_chains(true)
            .await?
            .into_iter()
            .find(|c| c.chain_id == chain_id)
            .ok_or_else(|| ScannerError::Config(format!("chain {} is not rpc-enabled", chain_id)))
    }

    /// Removes and stops the chain's current scanner. Caller holds `admin`.
    async fn retire_scanner(&self, chain_id: u64) {
        let previous = self.scanners.write().await.remove(&chain_id);
        if let Some(previous) = previous {
            previous
                .stop(self.config.scanner.scanner_stop_timeout())
                .await;
        }
    }

    /// Starts a fresh scanner for `chain`. Caller holds `admin` and has
    /// retired the previous one.
    async fn launch_scanner(&self, chain: ChainInfo) -> ScannerResult<()> {
        self.rpc.register_chain(chain.clone()).await;
        let scanner = self.new_scanner(chain.clone());
        scanner.start().await?;
        let displaced = self.scanners.write().await.insert(chain.chain_id, scanner);
        if let Some(displaced) = displaced {
            warn!(
                "[ScannerManager] Stopping a second scanner found for {}",
                chain.name
            );
            displaced
                .stop(self.config.scanner.scanner_stop_timeout())
                .await;
        }
        Ok(())
    }

    /// Stops and starts the scanner of one chain.
    pub async fn restart_scanner(&self, chain_id: u64) -> ScannerResult<()> {
        let chain = self.chain_info(chain_id).await?;
        let _admin = self.admin.lock().await;
        if self.cancel.is_cancelled() {
            return Err(ScannerError::Shutdown);
        }
        info!("[ScannerManager] Restarting scanner for {}", chain.name);
        self.retire_scanner(chain_id).await;
        self.launch_scanner(chain).await
    }

    /// Moves the chain's pointer so that scanning resumes at `from_block`.
    pub async fn rescan_from_block(&self, chain_id: u64, from_block: u64) -> ScannerResult<()> {
        let chain = self.chain_info(chain_id).await?;
        let _admin = self.admin.lock().await;
        if self.cancel.is_cancelled() {
            return Err(ScannerError::Shutdown);
        }
        info!(
            "[ScannerManager] Rescanning {} from block {}",
            chain.name, from_block
        );
        // The old loop must be gone before the reset, or its next monotonic
        // progress write would undo it.
        self.retire_scanner(chain_id).await;
        let last_scanned = from_block.saturating_sub(1);
        self.stores
            .progress
            .get_or_create_progress(&chain, last_scanned)
            .await?;
        self.stores
            .progress
            .reset_progress(chain_id, last_scanned)
            .await?;
        self.launch_scanner(chain).await
    }

    pub async fn status(&self) -> ScannerResult<Vec<ChainScanStatus>> {
        let scanners = self.scanners.read().await.clone();
        let mut statuses = Vec::new();
        for progress in self.stores.progress.list_progress().await? {
            let mut status = ChainScanStatus {
                chain_id: progress.chain_id,
                chain_name: progress.chain_name,
                last_scanned_block: progress.last_scanned_block,
                latest_network_block: progress.latest_network_block,
                lag: 0,
                status: progress.status,
                last_error: progress.error_message,
                active: false,
            };
            if let Some(scanner) = scanners.get(&progress.chain_id) {
                let state = scanner.state().await;
                status.last_scanned_block = state.last_scanned_block;
                status.latest_network_block = state.latest_network_block;
                status.status = state.status;
                status.last_error = state.last_error;
                status.active = true;
            }
            status.lag = status
                .latest_network_block
                .saturating_sub(status.last_scanned_block);
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Recomputes `expired_at` for every flow of a contract after its grace
    /// period became known or changed.
    pub async fn refresh_grace_period(
        &self,
        chain_id: u64,
        contract_address: &str,
        grace_period_secs: u64,
    ) -> ScannerResult<usize> {
        let contract_address = contract_address.to_lowercase();
        let updated = self
            .stores
            .flows
            .refresh_expired_at(chain_id, &contract_address, grace_period_secs)
            .await?;
        info!(
            "[ScannerManager] Refreshed expired_at of {} flows of {} (grace period {}s)",
            updated, contract_address, grace_period_secs
        );
        Ok(updated)
    }

    pub async fn active_chains(&self) -> Vec<u64> {
        let mut chains: Vec<_> = self.scanners.read().await.keys().copied().collect();
        chains.sort_unstable();
        chains
    }
}
