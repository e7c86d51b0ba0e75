// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use diesel::{AsChangeset, Identifiable, Insertable, Queryable, Selectable};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::schema::{
    block_scan_progress, compound_timelock_transactions, timelock_transaction_flows,
};

/// Lifecycle of one queued governance action.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Waiting,
    Ready,
    Executed,
    Cancelled,
    Expired,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Cancelled | Self::Expired)
    }

    /// Legal edges of the flow state machine. Terminal states have no outgoing edges.
    pub fn can_transition_to(&self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        matches!(
            (self, next),
            (Waiting, Ready)
                | (Waiting, Executed)
                | (Waiting, Cancelled)
                | (Waiting, Expired)
                | (Ready, Executed)
                | (Ready, Cancelled)
                | (Ready, Expired)
        )
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Paused,
    Error,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TimelockStandard {
    Compound,
    Openzeppelin,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
pub enum CompoundEventType {
    QueueTransaction,
    ExecuteTransaction,
    CancelTransaction,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Success,
    Failed,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = block_scan_progress)]
pub struct ScanProgressRow {
    pub id: i64,
    pub chain_id: i32,
    pub chain_name: String,
    pub last_scanned_block: i64,
    pub latest_network_block: i64,
    pub scan_status: String,
    pub error_message: Option<String>,
    pub last_update_time: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = block_scan_progress)]
pub struct NewScanProgress {
    pub chain_id: i32,
    pub chain_name: String,
    pub last_scanned_block: i64,
    pub latest_network_block: i64,
    pub scan_status: String,
}

// Raw decoded Compound timelock log. Append-only.
#[derive(Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = compound_timelock_transactions)]
pub struct NewCompoundTimelockTransaction {
    pub tx_hash: String,
    pub block_number: i64,
    pub block_timestamp: DateTime<Utc>,
    pub chain_id: i32,
    pub chain_name: String,
    pub contract_address: String,
    pub from_address: String,
    pub to_address: String,
    pub tx_status: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub event_tx_hash: Option<String>,
    pub event_target: Option<String>,
    pub event_value: String,
    pub event_function_signature: Option<String>,
    pub event_call_data: Option<Vec<u8>>,
    pub event_eta: Option<i64>,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = timelock_transaction_flows)]
pub struct FlowRow {
    pub id: i64,
    pub flow_id: String,
    pub timelock_standard: String,
    pub chain_id: i32,
    pub contract_address: String,
    pub status: String,
    pub queue_tx_hash: Option<String>,
    pub execute_tx_hash: Option<String>,
    pub cancel_tx_hash: Option<String>,
    pub initiator_address: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub eta: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub target_address: Option<String>,
    pub call_data: Option<Vec<u8>>,
    pub value: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = timelock_transaction_flows)]
pub struct NewFlow {
    pub flow_id: String,
    pub timelock_standard: String,
    pub chain_id: i32,
    pub contract_address: String,
    pub status: String,
    pub queue_tx_hash: Option<String>,
    pub initiator_address: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub eta: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub target_address: Option<String>,
    pub call_data: Option<Vec<u8>>,
    pub value: String,
}

// `None` fields are left untouched by diesel's changeset.
#[derive(AsChangeset, Debug, Clone, Default)]
#[diesel(table_name = timelock_transaction_flows)]
pub struct FlowQueueBackfill {
    pub queue_tx_hash: Option<String>,
    pub initiator_address: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub eta: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub target_address: Option<String>,
    pub call_data: Option<Vec<u8>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(AsChangeset, Debug, Clone)]
#[diesel(table_name = timelock_transaction_flows)]
pub struct FlowStatusChange {
    pub status: String,
    pub execute_tx_hash: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub cancel_tx_hash: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_flow_status_strings() {
        assert_eq!(FlowStatus::Waiting.as_ref(), "waiting");
        assert_eq!(FlowStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(FlowStatus::from_str("expired").unwrap(), FlowStatus::Expired);
        assert!(FlowStatus::from_str("queued").is_err());
    }

    #[test]
    fn test_event_type_strings_match_abi_names() {
        assert_eq!(
            CompoundEventType::QueueTransaction.as_ref(),
            "QueueTransaction"
        );
        assert_eq!(
            CompoundEventType::from_str("CancelTransaction").unwrap(),
            CompoundEventType::CancelTransaction
        );
    }

    #[test]
    fn test_terminal_states_have_no_edges() {
        let all = [
            FlowStatus::Waiting,
            FlowStatus::Ready,
            FlowStatus::Executed,
            FlowStatus::Cancelled,
            FlowStatus::Expired,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_legal_edges() {
        assert!(FlowStatus::Waiting.can_transition_to(FlowStatus::Ready));
        assert!(FlowStatus::Waiting.can_transition_to(FlowStatus::Expired));
        assert!(FlowStatus::Ready.can_transition_to(FlowStatus::Executed));
        assert!(!FlowStatus::Ready.can_transition_to(FlowStatus::Waiting));
        assert!(!FlowStatus::Waiting.can_transition_to(FlowStatus::Waiting));
    }
}
