// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod block_processor;
pub mod chain_scanner;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod notification;
pub mod reconciler;
pub mod refresher;
pub mod rpc;
pub mod store;

#[cfg(test)]
pub(crate) mod test_utils;


pub use manager::ScannerManager;
