// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;
use std::sync::Arc;

use ethers::providers::{Http, HttpClientError, JsonRpcClient, Provider};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Semaphore;
use url::{ParseError, Url};

use crate::metrics::ScannerMetrics;

/// HTTP transport that counts and times every request per chain and caps the
/// number of requests in flight against one provider.
#[derive(Debug, Clone)]
pub struct MeteredHttpTransport {
    inner: Http,
    chain_label: String,
    metrics: Arc<ScannerMetrics>,
    semaphore: Arc<Semaphore>,
}

#[async_trait::async_trait]
impl JsonRpcClient for MeteredHttpTransport {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        // The semaphore is never closed, a missing permit only means no limit.
        let _permit = self.semaphore.acquire().await.ok();

        self.metrics
            .rpc_queries
            .with_label_values(&[&self.chain_label, method])
            .inc();
        let _guard = self
            .metrics
            .rpc_queries_latency
            .with_label_values(&[&self.chain_label, method])
            .start_timer();

        self.inner.request(method, params).await
    }
}

impl MeteredHttpTransport {
    pub fn new(
        url: Url,
        chain_id: u64,
        max_concurrent_requests: usize,
        metrics: Arc<ScannerMetrics>,
    ) -> Self {
        Self {
            inner: Http::new(url),
            chain_label: chain_id.to_string(),
            metrics,
            semaphore: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
        }
    }
}

pub fn new_metered_provider(
    url: &str,
    chain_id: u64,
    max_concurrent_requests: usize,
    metrics: Arc<ScannerMetrics>,
) -> Result<Provider<MeteredHttpTransport>, ParseError> {
    let transport =
        MeteredHttpTransport::new(Url::parse(url)?, chain_id, max_concurrent_requests, metrics);
    Ok(Provider::new(transport))
}
