use std::collections::BTreeMap;

use chrono::{
    DateTime,
    Utc,
};
use schemars::JsonSchema;
use serde::{
    Deserialize,
    Serialize,
};

use crate::models::check::CheckKind;

/// One emission of a check. `data` is the kind-specific payload; the HTTP
/// layer returns it verbatim, consumers read `timestamp` to judge freshness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl CheckResult {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            timestamp: Utc::now(),
        }
    }
}

/// What checks put on the shared result channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub name: CheckKind,
    pub result: CheckResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

pub type HealthData = BTreeMap<String, HealthStatus>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LatencyResult {
    pub code: u16,
    pub error: Option<String>,
    /// Wall-clock seconds from request start to body close.
    pub total: f64,
}

pub type LatencyData = BTreeMap<String, LatencyResult>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DnsResult {
    pub resolved: Vec<String>,
    pub error: Option<String>,
    pub total: f64,
}

pub type DnsData = BTreeMap<String, DnsResult>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HopAddress {
    pub ip: String,
    pub port: u16,
}

/// One observation during a TTL walk: either an intermediate router that
/// expired the probe, or the destination confirming the path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Hop {
    /// Seconds between probe send and the reply, 0 when nothing answered.
    pub latency: f64,
    pub addr: HopAddress,
    /// Reverse-DNS name of `addr`, best effort.
    pub name: String,
    pub ttl: u8,
    pub reached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TracerouteResult {
    /// Smallest TTL that reached the destination, `maxHops` if none did.
    pub min_hops: u8,
    pub hops: BTreeMap<u8, Vec<Hop>>,
}

pub type TracerouteData = BTreeMap<String, TracerouteResult>;
