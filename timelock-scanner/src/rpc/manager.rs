// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-chain RPC client cache with retry.
//!
//! Clients are dialed lazily and cached by chain id. A failed call evicts the
//! cached client so the next attempt dials a fresh connection; a stuck socket
//! therefore heals within one retry cycle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use backoff::ExponentialBackoff;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{ChainRpc, RpcConnector};
use crate::config::RpcConfig;
use crate::error::{RpcError, ScannerError, ScannerResult};
use crate::metrics::ScannerMetrics;
use crate::store::ChainInfo;

// Outcome of one attempt inside the retry loop.
enum AttemptError {
    Connect(ScannerError),
    Call(RpcError),
    Shutdown,
}

pub struct RpcManager {
    connector: Arc<dyn RpcConnector>,
    config: RpcConfig,
    metrics: Arc<ScannerMetrics>,
    chains: RwLock<HashMap<u64, ChainInfo>>,
    clients: RwLock<HashMap<u64, Arc<dyn ChainRpc>>>,
    shutdown: AtomicBool,
}

impl RpcManager {
    pub fn new(
        connector: Arc<dyn RpcConnector>,
        config: RpcConfig,
        metrics: Arc<ScannerMetrics>,
    ) -> Self {
        Self {
            connector,
            config,
            metrics,
            chains: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub async fn register_chain(&self, chain: ChainInfo) {
        self.chains.write().await.insert(chain.chain_id, chain);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub async fn get_or_create_client(&self, chain_id: u64) -> ScannerResult<Arc<dyn ChainRpc>> {
        if self.is_shutdown() {
            return Err(ScannerError::Shutdown);
        }
        if let Some(client) = self.clients.read().await.get(&chain_id) {
            return Ok(client.clone());
        }

        let chain = self
            .chains
            .read()
            .await
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| ScannerError::Connection {
                chain_id,
                reason: "chain is not registered".to_string(),
            })?;

        // Dial without holding the cache lock so other chains are not blocked.
        let client =
            self.connector
                .connect(&chain)
                .await
                .map_err(|e| ScannerError::Connection {
                    chain_id,
                    reason: e.to_string(),
                })?;

        let mut clients = self.clients.write().await;
        if self.is_shutdown() {
            return Err(ScannerError::Shutdown);
        }
        info!("[RpcManager] Connected to {} (chain {})", chain.name, chain_id);
        Ok(clients.entry(chain_id).or_insert(client).clone())
    }

    /// Drops the cached client of a chain. Returns whether one was cached.
    pub async fn evict(&self, chain_id: u64) -> bool {
        let evicted = self.clients.write().await.remove(&chain_id).is_some();
        if evicted {
            self.metrics
                .rpc_client_evictions
                .with_label_values(&[&chain_id.to_string()])
                .inc();
            debug!("[RpcManager] Evicted client for chain {}", chain_id);
        }
        evicted
    }

    /// Closes every client. No new client is created afterwards.
    pub async fn close_all(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let closed = {
            let mut clients = self.clients.write().await;
            let closed = clients.len();
            clients.clear();
            closed
        };
        info!("[RpcManager] Closed {} rpc clients", closed);
    }

    pub async fn connected_chains(&self) -> Vec<u64> {
        let mut chains: Vec<_> = self.clients.read().await.keys().copied().collect();
        chains.sort_unstable();
        chains
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.retry_delay(),
            randomization_factor: self.config.randomization_factor,
            multiplier: 2.0,
            max_interval: self.config.max_retry_delay(),
            // Bounded by attempt count instead.
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Runs `op` against the chain's client, retrying with exponential backoff
    /// for up to `max_retries` additional attempts. Every failed attempt evicts
    /// the cached client.
    pub async fn execute_with_retry<T, F, Fut>(&self, chain_id: u64, op: F) -> ScannerResult<T>
    where
        F: Fn(Arc<dyn ChainRpc>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let max_attempts = self.config.max_retries + 1;
        let attempts = AtomicUsize::new(0);
        let connected = AtomicBool::new(false);
        let chain_label = chain_id.to_string();

        let result = backoff::future::retry(self.backoff(), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let op = &op;
            let connected = &connected;
            let chain_label = &chain_label;
            async move {
                if attempt > 1 {
                    self.metrics
                        .rpc_retries
                        .with_label_values(&[chain_label])
                        .inc();
                }
                let outcome = match self.get_or_create_client(chain_id).await {
                    Ok(client) => {
                        connected.store(true, Ordering::SeqCst);
                        op(client).await.map_err(AttemptError::Call)
                    }
                    Err(ScannerError::Shutdown) => {
                        return Err(backoff::Error::permanent(AttemptError::Shutdown))
                    }
                    Err(e) => Err(AttemptError::Connect(e)),
                };

                match outcome {
                    Ok(value) => Ok(value),
                    Err(err) => {
                        self.evict(chain_id).await;
                        let message = match &err {
                            AttemptError::Connect(e) => e.to_string(),
                            AttemptError::Call(e) => e.to_string(),
                            AttemptError::Shutdown => "shutdown".to_string(),
                        };
                        warn!(
                            "[RpcManager] Chain {} attempt {}/{} failed: {}",
                            chain_id, attempt, max_attempts, message
                        );
                        if attempt >= max_attempts || self.is_shutdown() {
                            Err(backoff::Error::permanent(err))
                        } else {
                            Err(backoff::Error::transient(err))
                        }
                    }
                }
            }
        })
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                let attempts = attempts.load(Ordering::SeqCst);
                Err(match err {
                    AttemptError::Shutdown => ScannerError::Shutdown,
                    AttemptError::Connect(e) if !connected.load(Ordering::SeqCst) => e,
                    AttemptError::Connect(e) => ScannerError::ExhaustedRetries {
                        chain_id,
                        attempts,
                        last_error: RpcError::Transport(e.to_string()),
                    },
                    AttemptError::Call(last_error) => ScannerError::ExhaustedRetries {
                        chain_id,
                        attempts,
                        last_error,
                    },
                })
            }
        }
    }
}
