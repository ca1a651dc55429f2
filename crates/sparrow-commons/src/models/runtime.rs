use serde::{
    Deserialize,
    Serialize,
};
use thiserror::Error;

use crate::models::check::{
    CheckConfig,
    CheckKind,
    DnsConfig,
    HealthConfig,
    LatencyConfig,
    TracerouteConfig,
};

pub const API_VERSION: &str = "0.0.1";
pub const CONFIG_KIND: &str = "Config";

/// The sparse set of check configurations the agent should currently run.
/// Presence is authoritative: a kind missing here must be retired.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceroute: Option<TracerouteConfig>,
}

impl RuntimeConfig {
    pub fn size(&self) -> usize {
        self.kinds().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn kinds(&self) -> Vec<CheckKind> {
        CheckKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind).is_some())
            .collect()
    }

    pub fn get(&self, kind: CheckKind) -> Option<CheckConfig> {
        match kind {
            CheckKind::Health => self.health.clone().map(CheckConfig::Health),
            CheckKind::Latency => self.latency.clone().map(CheckConfig::Latency),
            CheckKind::Dns => self.dns.clone().map(CheckConfig::Dns),
            CheckKind::Traceroute => self.traceroute.clone().map(CheckConfig::Traceroute),
        }
    }

    pub fn set(&mut self, config: CheckConfig) {
        match config {
            CheckConfig::Health(c) => self.health = Some(c),
            CheckConfig::Latency(c) => self.latency = Some(c),
            CheckConfig::Dns(c) => self.dns = Some(c),
            CheckConfig::Traceroute(c) => self.traceroute = Some(c),
        }
    }

    pub fn remove(&mut self, kind: CheckKind) {
        match kind {
            CheckKind::Health => self.health = None,
            CheckKind::Latency => self.latency = None,
            CheckKind::Dns => self.dns = None,
            CheckKind::Traceroute => self.traceroute = None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("unsupported apiVersion `{0}`, expected `{API_VERSION}`")]
    ApiVersion(String),
    #[error("unsupported document kind `{0}`, expected `{CONFIG_KIND}`")]
    Kind(String),
    #[error("failed to parse config document: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// The on-disk / on-wire form of a runtime config. YAML and JSON both parse
/// (JSON is a subset of YAML).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub checks: RuntimeConfig,
}

impl ConfigDocument {
    /// Parse and verify a runtime-config document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DocumentError> {
        let doc: ConfigDocument = serde_yaml::from_slice(bytes)?;
        if doc.api_version != API_VERSION {
            return Err(DocumentError::ApiVersion(doc.api_version));
        }
        if doc.kind != CONFIG_KIND {
            return Err(DocumentError::Kind(doc.kind));
        }
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const SAMPLE: &str = "\
apiVersion: 0.0.1
kind: Config
checks:
  health:
    targets:
      - https://example.com/
    interval: 1s
    timeout: 500ms
  dns:
    targets:
      - example.com
    interval: 10s
    timeout: 2s
";

    #[test]
    fn test_parse_sample_document() {
        let doc = ConfigDocument::from_slice(SAMPLE.as_bytes()).unwrap();
        assert_eq!(doc.checks.size(), 2);
        assert_eq!(
            doc.checks.kinds(),
            vec![CheckKind::Health, CheckKind::Dns]
        );
        let health = doc.checks.health.unwrap();
        assert_eq!(health.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_json_document() {
        let json = r#"{"apiVersion": "0.0.1", "kind": "Config", "checks": {}}"#;
        let doc = ConfigDocument::from_slice(json.as_bytes()).unwrap();
        assert!(doc.checks.is_empty());
    }

    #[test]
    fn test_rejects_wrong_api_version() {
        let bad = SAMPLE.replace("0.0.1", "1.0.0");
        assert!(matches!(
            ConfigDocument::from_slice(bad.as_bytes()),
            Err(DocumentError::ApiVersion(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let bad = SAMPLE.replace("kind: Config", "kind: Secret");
        assert!(matches!(
            ConfigDocument::from_slice(bad.as_bytes()),
            Err(DocumentError::Kind(_))
        ));
    }

    #[test]
    fn test_get_and_remove_track_presence() {
        let doc = ConfigDocument::from_slice(SAMPLE.as_bytes()).unwrap();
        let mut config = doc.checks;
        assert!(config.get(CheckKind::Health).is_some());
        assert!(config.get(CheckKind::Traceroute).is_none());

        config.remove(CheckKind::Health);
        assert!(config.get(CheckKind::Health).is_none());
        assert_eq!(config.size(), 1);
    }
}
