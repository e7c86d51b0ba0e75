// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use thiserror::Error;

/// Failure of a single JSON-RPC round trip.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("rpc call {method} timed out after {timeout:?}")]
    Timeout {
        method: &'static str,
        timeout: Duration,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("failed to recover transaction sender: {0}")]
    Signature(String),
    #[error("connected to chain {actual}, expected {expected}")]
    ChainIdMismatch { expected: u64, actual: u64 },
    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    pub fn error_type(&self) -> &'static str {
        match self {
            RpcError::Transport(_) => "transport",
            RpcError::Timeout { .. } => "timeout",
            RpcError::NotFound(_) => "not_found",
            RpcError::Signature(_) => "signature",
            RpcError::ChainIdMismatch { .. } => "chain_id_mismatch",
            RpcError::InvalidResponse(_) => "invalid_response",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum ScannerError {
    // No client could be obtained for the chain.
    #[error("chain {chain_id}: no rpc client available: {reason}")]
    Connection { chain_id: u64, reason: String },
    // A client was obtained but every attempt failed.
    #[error("chain {chain_id}: rpc call failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        chain_id: u64,
        attempts: usize,
        last_error: RpcError,
    },
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("scanner is shutting down")]
    Shutdown,
}

impl ScannerError {
    /// Short label used in metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            ScannerError::Connection { .. } => "connection",
            ScannerError::ExhaustedRetries { .. } => "exhausted_retries",
            ScannerError::Persistence(_) => "persistence",
            ScannerError::Decode(_) => "decode",
            ScannerError::Config(_) => "config",
            ScannerError::Shutdown => "shutdown",
        }
    }
}

pub type ScannerResult<T> = Result<T, ScannerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_labels() {
        let err = ScannerError::ExhaustedRetries {
            chain_id: 1,
            attempts: 4,
            last_error: RpcError::Transport("connection reset".into()),
        };
        assert_eq!(err.error_type(), "exhausted_retries");
        assert!(err.to_string().contains("after 4 attempts"));
        assert_eq!(
            ScannerError::from(StoreError::Invalid("x".into())).error_type(),
            "persistence"
        );
        assert_eq!(ScannerError::Shutdown.error_type(), "shutdown");
    }

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::Timeout {
            method: "eth_getLogs",
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.error_type(), "timeout");
        assert_eq!(err.to_string(), "rpc call eth_getLogs timed out after 5s");
        let err = RpcError::ChainIdMismatch {
            expected: 1,
            actual: 5,
        };
        assert_eq!(err.to_string(), "connected to chain 5, expected 1");
    }
}
