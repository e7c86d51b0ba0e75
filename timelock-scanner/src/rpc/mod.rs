// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Middleware, Provider, ProviderError};
use ethers::types::{Address, BlockNumber, Filter, Log, H256, U64};

use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::metrics::ScannerMetrics;
use crate::store::ChainInfo;

mod manager;
mod metered;

pub use manager::RpcManager;
pub use metered::{new_metered_provider, MeteredHttpTransport};

const API_KEY_PLACEHOLDER: &str = "{API_KEY}";

/// The subset of the JSON-RPC surface the scanner needs from one chain.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Chain id reported by the remote node.
    async fn chain_id(&self) -> Result<u64, RpcError>;

    async fn block_number(&self) -> Result<u64, RpcError>;

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError>;

    /// Sender of a transaction, recovered from its signature.
    async fn transaction_sender(&self, tx_hash: H256) -> Result<Address, RpcError>;

    async fn receipt_succeeded(&self, tx_hash: H256) -> Result<bool, RpcError>;

    /// Block timestamp in unix seconds.
    async fn block_timestamp(&self, block_number: u64) -> Result<u64, RpcError>;
}

pub struct EthRpcClient {
    provider: Provider<MeteredHttpTransport>,
    call_timeout: Duration,
}

impl EthRpcClient {
    pub fn new(provider: Provider<MeteredHttpTransport>, call_timeout: Duration) -> Self {
        Self {
            provider,
            call_timeout,
        }
    }

    async fn call<T, F>(&self, method: &'static str, fut: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| RpcError::Timeout {
                method,
                timeout: self.call_timeout,
            })?
            .map_err(|e| RpcError::Transport(e.to_string()))
    }
}

#[async_trait]
impl ChainRpc for EthRpcClient {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        let chain_id = self
            .call("eth_chainId", self.provider.get_chainid())
            .await?;
        Ok(chain_id.low_u64())
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let number = self
            .call("eth_blockNumber", self.provider.get_block_number())
            .await?;
        Ok(number.as_u64())
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        self.call("eth_getLogs", self.provider.get_logs(filter))
            .await
    }

    async fn transaction_sender(&self, tx_hash: H256) -> Result<Address, RpcError> {
        let tx = self
            .call(
                "eth_getTransactionByHash",
                self.provider.get_transaction(tx_hash),
            )
            .await?
            .ok_or_else(|| RpcError::NotFound(format!("transaction {:?}", tx_hash)))?;

        match tx.recover_from() {
            Ok(sender) => Ok(sender),
            // Some chains use signature schemes ethers cannot recover; trust the node then.
            Err(_) if tx.from != Address::zero() => Ok(tx.from),
            Err(e) => Err(RpcError::Signature(e.to_string())),
        }
    }

    async fn receipt_succeeded(&self, tx_hash: H256) -> Result<bool, RpcError> {
        let receipt = self
            .call(
                "eth_getTransactionReceipt",
                self.provider.get_transaction_receipt(tx_hash),
            )
            .await?
            .ok_or_else(|| RpcError::NotFound(format!("receipt {:?}", tx_hash)))?;
        Ok(receipt.status != Some(U64::zero()))
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, RpcError> {
        let block = self
            .call(
                "eth_getBlockByNumber",
                self.provider.get_block(BlockNumber::Number(block_number.into())),
            )
            .await?
            .ok_or_else(|| RpcError::NotFound(format!("block {}", block_number)))?;
        Ok(block.timestamp.low_u64())
    }
}

/// Dials a chain into a ready-to-use client.
#[async_trait]
pub trait RpcConnector: Send + Sync {
    async fn connect(&self, chain: &ChainInfo) -> Result<Arc<dyn ChainRpc>, RpcError>;
}

pub struct EthRpcConnector {
    config: RpcConfig,
    metrics: Arc<ScannerMetrics>,
}

impl EthRpcConnector {
    pub fn new(config: RpcConfig, metrics: Arc<ScannerMetrics>) -> Self {
        Self { config, metrics }
    }
}

pub fn expand_rpc_url(template: &str, provider_key: &str) -> String {
    template.replace(API_KEY_PLACEHOLDER, provider_key)
}

#[async_trait]
impl RpcConnector for EthRpcConnector {
    async fn connect(&self, chain: &ChainInfo) -> Result<Arc<dyn ChainRpc>, RpcError> {
        let url = expand_rpc_url(&chain.rpc_url_template, &self.config.provider_key);
        let provider = new_metered_provider(
            &url,
            chain.chain_id,
            self.config.max_concurrent_requests,
            self.metrics.clone(),
        )
        .map_err(|e| RpcError::Transport(format!("invalid rpc url for {}: {}", chain.name, e)))?;
        let client = EthRpcClient::new(provider, self.config.call_timeout());

        let dial_timeout = self.config.dial_timeout();
        let remote_chain_id = tokio::time::timeout(dial_timeout, client.chain_id())
            .await
            .map_err(|_| RpcError::Timeout {
                method: "eth_chainId",
                timeout: dial_timeout,
            })??;
        if remote_chain_id != chain.chain_id {
            return Err(RpcError::ChainIdMismatch {
                expected: chain.chain_id,
                actual: remote_chain_id,
            });
        }

        Ok(Arc::new(client))
    }
}
