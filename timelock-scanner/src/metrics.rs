// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

const RPC_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.2, 0.3, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 7.5, 10., 15.,
    20., 30., 45., 60.,
];

#[derive(Clone, Debug)]
pub struct ScannerMetrics {
    pub(crate) rpc_queries: IntCounterVec,
    pub(crate) rpc_queries_latency: HistogramVec,
    pub(crate) rpc_retries: IntCounterVec,
    pub(crate) rpc_client_evictions: IntCounterVec,

    pub(crate) last_scanned_block: IntGaugeVec,
    pub(crate) chain_head_block: IntGaugeVec,
    pub(crate) scan_errors: IntCounterVec,

    pub(crate) decoded_events: IntCounterVec,
    pub(crate) skipped_logs: IntCounterVec,

    pub(crate) flow_transitions: IntCounterVec,
    pub(crate) notification_failures: IntCounterVec,
    pub(crate) scanners_by_status: IntGaugeVec,
}

impl ScannerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            rpc_queries: register_int_counter_vec_with_registry!(
                "timelock_rpc_queries",
                "Total number of queries issued to chain rpc providers, by chain and method",
                &["chain_id", "method"],
                registry,
            )
            .unwrap(),
            rpc_queries_latency: register_histogram_vec_with_registry!(
                "timelock_rpc_queries_latency",
                "Latency of queries issued to chain rpc providers, by chain and method",
                &["chain_id", "method"],
                RPC_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            rpc_retries: register_int_counter_vec_with_registry!(
                "timelock_rpc_retries",
                "Number of retried rpc operations, by chain",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            rpc_client_evictions: register_int_counter_vec_with_registry!(
                "timelock_rpc_client_evictions",
                "Number of cached rpc clients evicted after a failure, by chain",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            last_scanned_block: register_int_gauge_vec_with_registry!(
                "timelock_last_scanned_block",
                "Last confirmed block scanned, by chain",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            chain_head_block: register_int_gauge_vec_with_registry!(
                "timelock_chain_head_block",
                "Latest observed chain head, by chain",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            scan_errors: register_int_counter_vec_with_registry!(
                "timelock_scan_errors",
                "Failed scan ticks, by chain and error type",
                &["chain_id", "error_type"],
                registry,
            )
            .unwrap(),
            decoded_events: register_int_counter_vec_with_registry!(
                "timelock_decoded_events",
                "Decoded timelock events, by event type",
                &["event_type"],
                registry,
            )
            .unwrap(),
            skipped_logs: register_int_counter_vec_with_registry!(
                "timelock_skipped_logs",
                "Logs that could not be resolved and were skipped, by chain",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            flow_transitions: register_int_counter_vec_with_registry!(
                "timelock_flow_transitions",
                "Applied flow status transitions",
                &["from", "to"],
                registry,
            )
            .unwrap(),
            notification_failures: register_int_counter_vec_with_registry!(
                "timelock_notification_failures",
                "Failed flow notifications, by sink",
                &["sink"],
                registry,
            )
            .unwrap(),
            scanners_by_status: register_int_gauge_vec_with_registry!(
                "timelock_scanners_by_status",
                "Number of chain scanners in each scan status",
                &["status"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
