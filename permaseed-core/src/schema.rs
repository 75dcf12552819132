//! Domain records shared by the stores, the task manager, and the
//! bundle aggregator.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    BroadcastMeta,
    Broadcast,
    Sync,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::BroadcastMeta => "broadcast-meta",
            TaskType::Broadcast => "broadcast",
            TaskType::Sync => "sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "broadcast-meta" => Some(TaskType::BroadcastMeta),
            "broadcast" => Some(TaskType::Broadcast),
            "sync" => Some(TaskType::Sync),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub ar_id: String,
    pub tk_type: TaskType,
    pub count_successed: u32,
    pub count_failed: u32,
    pub total_nodes: u32,
    pub status: TaskStatus,
    pub timestamp: i64,
}

impl Task {
    pub fn new(ar_id: &str, tk_type: TaskType, timestamp: i64) -> Self {
        Self {
            ar_id: ar_id.to_string(),
            tk_type,
            count_successed: 0,
            count_failed: 0,
            total_nodes: 0,
            status: TaskStatus::Pending,
            timestamp,
        }
    }

    pub fn task_id(&self) -> String {
        task_id(&self.ar_id, self.tk_type)
    }
}

pub fn task_id(ar_id: &str, tk_type: TaskType) -> String {
    format!("{}-{}", tk_type.as_str(), ar_id)
}

/// Splits a `tkType-arId` identity back apart. `broadcast-meta` embeds a
/// dash, so longest known prefix wins.
pub fn parse_task_id(task_id: &str) -> Option<(String, TaskType)> {
    for tk_type in [TaskType::BroadcastMeta, TaskType::Broadcast, TaskType::Sync] {
        let prefix = format!("{}-", tk_type.as_str());
        if let Some(ar_id) = task_id.strip_prefix(&prefix) {
            if !ar_id.is_empty() {
                return Some((ar_id.to_string(), tk_type));
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(PaymentStatus::Unpaid),
            "paid" => Some(PaymentStatus::Paid),
            "expired" => Some(PaymentStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnChainStatus {
    Waiting,
    Pending,
    Success,
    Failed,
}

impl OnChainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OnChainStatus::Waiting => "waiting",
            OnChainStatus::Pending => "pending",
            OnChainStatus::Success => "success",
            OnChainStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(OnChainStatus::Waiting),
            "pending" => Some(OnChainStatus::Pending),
            "success" => Some(OnChainStatus::Success),
            "failed" => Some(OnChainStatus::Failed),
            _ => None,
        }
    }
}

/// Billing record coupling an ingested bundle item to its fee quote and
/// settlement lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: i64,
    pub item_id: String,
    pub signer: String,
    pub signer_owner: String,
    pub size: u64,
    pub currency: String,
    pub decimals: i32,
    /// Decimal string in the currency's smallest unit.
    pub fee: String,
    pub payment_expired_time: i64,
    pub payment_status: PaymentStatus,
    pub payment_id: String,
    pub on_chain_status: OnChainStatus,
    pub expected_block: i64,
    /// Whether ingress order must be preserved within the bundle.
    pub sort: bool,
    pub api_key: String,
}

/// One aggregating on-chain bundle transaction.
#[derive(Debug, Clone, Serialize)]
pub struct OnChainTx {
    pub id: i64,
    pub ar_id: String,
    pub item_ids: Vec<String>,
    pub cur_height: i64,
    pub data_size: String,
    pub reward: String,
    pub status: OnChainStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPrice {
    pub symbol: String,
    pub decimals: i32,
    pub price: f64,
}

pub const RECEIPT_UNSPENT: &str = "unspent";
pub const RECEIPT_SPENT: &str = "spent";
pub const RECEIPT_UNREFUND: &str = "unrefund";

/// Settlement event recorded from the payment oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub raw_id: u64,
    pub ever_hash: String,
    pub from_addr: String,
    pub symbol: String,
    /// Decimal string in the currency's smallest unit.
    pub amount: String,
    pub item_id: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub manifest_url: String,
    pub manifest_id: String,
}

/// Order receipt returned to the submitting client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespOrder {
    pub item_id: String,
    pub bundler: String,
    pub currency: String,
    pub decimals: i32,
    pub fee: String,
    pub payment_expired_time: i64,
    pub expected_block: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespFee {
    pub currency: String,
    pub decimals: i32,
    pub final_fee: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trip() {
        for tk in [TaskType::BroadcastMeta, TaskType::Broadcast, TaskType::Sync] {
            let id = task_id("abc123", tk);
            assert_eq!(parse_task_id(&id), Some(("abc123".to_string(), tk)));
        }
        assert_eq!(parse_task_id("unknown-abc"), None);
        assert_eq!(parse_task_id("broadcast-"), None);
    }

    #[test]
    fn task_wire_names() {
        let task = Task::new("id", TaskType::BroadcastMeta, 7);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["tkType"], "broadcast-meta");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["countSuccessed"], 0);
        assert_eq!(json["arId"], "id");
    }

    #[test]
    fn status_parsing() {
        assert_eq!(PaymentStatus::parse("paid"), Some(PaymentStatus::Paid));
        assert_eq!(PaymentStatus::parse("bogus"), None);
        assert_eq!(OnChainStatus::parse("waiting"), Some(OnChainStatus::Waiting));
        assert!(TaskStatus::Success.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
