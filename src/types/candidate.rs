use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::DataPayload;

/// A changed item that may need a push notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotifyCandidate {
    pub id: String,
    pub version: String,
}

impl NotifyCandidate {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }

    /// Derives a candidate from a stored item. The item's `update` field is
    /// its version when present; otherwise a short hash of the item is used.
    pub fn from_item(id: &str, item: &Value) -> Self {
        let version = match item.get("update") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                let digest = Sha256::digest(item.to_string().as_bytes());
                hex::encode(&digest[..6])
            }
        };
        Self::new(id, version)
    }

    /// Key of the dedup marker for this (id, version) pair.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.id, self.version)
    }
}

/// Notification candidates for every session in a payload, in id order.
pub fn session_candidates(payload: &DataPayload) -> Vec<NotifyCandidate> {
    payload
        .sessions
        .iter()
        .map(|(id, item)| NotifyCandidate::from_item(id, item))
        .collect()
}
