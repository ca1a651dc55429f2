use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;
use url::Url;

/// Checks may not run more often than this.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Probes may not give up faster than this.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(200);

const DEFAULT_MAX_HOPS: u8 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Health,
    Latency,
    Dns,
    Traceroute,
}

impl CheckKind {
    pub const ALL: [CheckKind; 4] = [
        CheckKind::Health,
        CheckKind::Latency,
        CheckKind::Dns,
        CheckKind::Traceroute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Health => "health",
            CheckKind::Latency => "latency",
            CheckKind::Dns => "dns",
            CheckKind::Traceroute => "traceroute",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "health" => Ok(CheckKind::Health),
            "latency" => Ok(CheckKind::Latency),
            "dns" => Ok(CheckKind::Dns),
            "traceroute" => Ok(CheckKind::Traceroute),
            other => Err(format!("unknown check kind: {other}")),
        }
    }
}

/// A check rejected its configuration. `field` names the offending field so
/// callers can report precisely what to fix.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {kind} config: field `{field}`: {reason}")]
pub struct ValidationError {
    pub kind: CheckKind,
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(kind: CheckKind, field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_count")]
    pub count: u32,
    #[serde(default = "default_retry_delay", with = "crate::utils::duration")]
    pub delay: Duration,
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            count: default_retry_count(),
            delay: default_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    pub targets: Vec<String>,
    #[serde(with = "crate::utils::duration")]
    pub interval: Duration,
    #[serde(with = "crate::utils::duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyConfig {
    pub targets: Vec<String>,
    #[serde(with = "crate::utils::duration")]
    pub interval: Duration,
    #[serde(with = "crate::utils::duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfig {
    pub targets: Vec<String>,
    #[serde(with = "crate::utils::duration")]
    pub interval: Duration,
    #[serde(with = "crate::utils::duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracerouteConfig {
    pub targets: Vec<TracerouteTarget>,
    #[serde(default)]
    pub protocol: TracerouteProtocol,
    #[serde(with = "crate::utils::duration")]
    pub interval: Duration,
    #[serde(with = "crate::utils::duration")]
    pub timeout: Duration,
    #[serde(default = "default_max_hops")]
    pub max_hops: u8,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_hops() -> u8 {
    DEFAULT_MAX_HOPS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerouteTarget {
    pub addr: String,
    pub port: u16,
}

impl TracerouteTarget {
    /// Label used for metric series and result map keys.
    pub fn label(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TracerouteProtocol {
    #[default]
    Icmp,
    Udp,
    Tcp,
}

/// One configuration, tagged by the kind of check it configures.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckConfig {
    Health(HealthConfig),
    Latency(LatencyConfig),
    Dns(DnsConfig),
    Traceroute(TracerouteConfig),
}

impl CheckConfig {
    pub fn kind(&self) -> CheckKind {
        match self {
            CheckConfig::Health(_) => CheckKind::Health,
            CheckConfig::Latency(_) => CheckKind::Latency,
            CheckConfig::Dns(_) => CheckKind::Dns,
            CheckConfig::Traceroute(_) => CheckKind::Traceroute,
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            CheckConfig::Health(c) => c.interval,
            CheckConfig::Latency(c) => c.interval,
            CheckConfig::Dns(c) => c.interval,
            CheckConfig::Traceroute(c) => c.interval,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            CheckConfig::Health(c) => c.timeout,
            CheckConfig::Latency(c) => c.timeout,
            CheckConfig::Dns(c) => c.timeout,
            CheckConfig::Traceroute(c) => c.timeout,
        }
    }

    pub fn retry(&self) -> RetryConfig {
        match self {
            CheckConfig::Health(c) => c.retry,
            CheckConfig::Latency(c) => c.retry,
            CheckConfig::Dns(c) => c.retry,
            CheckConfig::Traceroute(c) => c.retry,
        }
    }

    /// Metric label values for every configured target.
    pub fn target_labels(&self) -> Vec<String> {
        match self {
            CheckConfig::Health(c) => c.targets.clone(),
            CheckConfig::Latency(c) => c.targets.clone(),
            CheckConfig::Dns(c) => c.targets.clone(),
            CheckConfig::Traceroute(c) => c.targets.iter().map(TracerouteTarget::label).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let kind = self.kind();
        validate_cadence(kind, self.interval(), self.timeout())?;

        match self {
            CheckConfig::Health(c) => validate_url_targets(kind, &c.targets),
            CheckConfig::Latency(c) => validate_url_targets(kind, &c.targets),
            CheckConfig::Dns(c) => validate_dns_targets(&c.targets),
            CheckConfig::Traceroute(c) => validate_traceroute(c),
        }
    }
}

fn validate_cadence(
    kind: CheckKind, interval: Duration, timeout: Duration,
) -> Result<(), ValidationError> {
    if interval < MIN_INTERVAL {
        return Err(ValidationError::new(
            kind,
            "interval",
            format!(
                "must be at least {}",
                crate::utils::duration::format_duration(MIN_INTERVAL)
            ),
        ));
    }
    if timeout < MIN_TIMEOUT {
        return Err(ValidationError::new(
            kind,
            "timeout",
            format!(
                "must be at least {}",
                crate::utils::duration::format_duration(MIN_TIMEOUT)
            ),
        ));
    }
    Ok(())
}

fn validate_url_targets(kind: CheckKind, targets: &[String]) -> Result<(), ValidationError> {
    for target in targets {
        let url = Url::parse(target)
            .map_err(|e| ValidationError::new(kind, "targets", format!("`{target}`: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ValidationError::new(
                kind,
                "targets",
                format!("`{target}`: scheme must be http or https"),
            ));
        }
    }
    Ok(())
}

fn validate_dns_targets(targets: &[String]) -> Result<(), ValidationError> {
    for target in targets {
        if target.starts_with("http://") || target.starts_with("https://") {
            return Err(ValidationError::new(
                CheckKind::Dns,
                "targets",
                format!("`{target}`: must be a hostname or IP, not a URL"),
            ));
        }
        if target.is_empty() {
            return Err(ValidationError::new(
                CheckKind::Dns,
                "targets",
                "empty target",
            ));
        }
    }
    Ok(())
}

fn validate_traceroute(config: &TracerouteConfig) -> Result<(), ValidationError> {
    let kind = CheckKind::Traceroute;

    if config.protocol == TracerouteProtocol::Udp {
        return Err(ValidationError::new(
            kind,
            "protocol",
            "udp traceroute is not supported; use icmp or tcp",
        ));
    }
    if config.max_hops == 0 {
        return Err(ValidationError::new(kind, "maxHops", "must be at least 1"));
    }
    for target in &config.targets {
        if target.addr.is_empty() {
            return Err(ValidationError::new(kind, "targets", "empty addr"));
        }
    }
    if !has_raw_socket_capability() {
        return Err(ValidationError::new(
            kind,
            "protocol",
            "traceroute requires raw socket privilege (CAP_NET_RAW or root)",
        ));
    }
    Ok(())
}

/// Probe whether this process may open raw ICMP sockets. Opening one and
/// dropping it immediately is the only portable answer.
pub fn has_raw_socket_capability() -> bool {
    socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::RAW,
        Some(socket2::Protocol::ICMPV4),
    )
    .is_ok()
}
