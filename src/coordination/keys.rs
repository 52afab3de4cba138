use serde::{Deserialize, Serialize};

/// Identity of a leased resource: the resource class (usually a table name)
/// and the entry within it (usually a row id).
///
/// The same shape is used on the wire as the timeout notification payload,
/// so waiters are matched structurally against incoming notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseKey {
    pub table_name: String,
    pub entry_key: String,
}

impl LeaseKey {
    pub fn new(table_name: impl Into<String>, entry_key: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            entry_key: entry_key.into(),
        }
    }

    /// Store key for this lease: `<prefix>-<class>-<id>`.
    pub fn store_key(&self, prefix: &str) -> String {
        format!("{prefix}-{}-{}", self.table_name, self.entry_key)
    }
}

impl std::fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.table_name, self.entry_key)
    }
}

/// "Give up waiting on this key" broadcast, published when a lease is
/// force-acquired after its retry budget is exhausted.
pub type TimeoutNotification = LeaseKey;

/// Encode a timeout notification as the JSON wire payload.
pub fn encode_notification(key: &TimeoutNotification) -> serde_json::Result<String> {
    serde_json::to_string(key)
}

/// Decode a timeout notification from its JSON wire payload.
pub fn decode_notification(payload: &str) -> serde_json::Result<TimeoutNotification> {
    serde_json::from_str(payload)
}
