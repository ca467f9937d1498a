//! `<config_dir>/config.yaml` (spec §6): only `security.sandbox_runtime`
//! and `network.*` are consumed by the core. Every other section
//! round-trips through `extra` so external tooling's fields survive a
//! read-modify-write by this crate.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use serde_yaml::Value;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecuritySection {
    #[serde(default)]
    pub sandbox_runtime: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkSection {
    #[serde(default)]
    pub default_deny: bool,
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `config.yaml` top level. `agent`, `registry`, and `telemetry` are not
/// interpreted by the core; they're preserved as opaque YAML so a
/// round-trip through this type doesn't drop fields owned by the CLI,
/// dashboard, or telemetry exporter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: Value,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub registry: Value,
    #[serde(default)]
    pub telemetry: Value,
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Loads `path`, or returns the all-defaults config if it's absent
    /// (mirrors the policy file's "missing means default" convention).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, serde_yaml::Error> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_yaml(&std::fs::read_to_string(path).map_err(serde::de::Error::custom)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load(dir.path().join("nope.yaml")).unwrap();
        assert_eq!(config.security.sandbox_runtime, "");
        assert!(config.network.allowlist.is_empty());
    }

    #[test]
    fn unconsumed_sections_round_trip() {
        let yaml = r#"
agent:
  model: gpt-x
security:
  sandbox_runtime: gvisor
  future_knob: true
network:
  default_deny: true
  allowlist: ["example.com"]
registry:
  url: https://registry.example
telemetry:
  enabled: false
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.security.sandbox_runtime, "gvisor");
        assert!(config.network.default_deny);
        assert_eq!(config.network.allowlist, vec!["example.com".to_string()]);
        assert!(config.security.extra.contains_key("future_knob"));

        let serialized = serde_yaml::to_string(&config).unwrap();
        let roundtripped = Config::from_yaml(&serialized).unwrap();
        assert_eq!(roundtripped.security.sandbox_runtime, "gvisor");
        assert!(roundtripped.security.extra.contains_key("future_knob"));
    }
}
