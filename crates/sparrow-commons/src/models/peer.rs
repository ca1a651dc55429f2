use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

/// The record each agent publishes to the shared registry so peers can pick
/// it up as a probe target. The transport is owned by the target manager;
/// only the format lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub url: String,
    pub last_seen: DateTime<Utc>,
}
