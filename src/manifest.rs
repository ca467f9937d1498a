//! Skill manifest (spec §3/§6): the YAML document the orchestrator reads a
//! command out of. Owned by external tooling (the marketplace client, the
//! signing tool); the core only consumes it.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// One invocable command within a manifest, e.g. `commands.hello`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommandSpec {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A skill manifest as consumed by the orchestrator. Unknown fields are
/// ignored rather than rejected — this crate is not the manifest's owner
/// and must not break on fields added by tooling outside its scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub image: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandSpec>,
    #[serde(default)]
    pub signature: Option<String>,
}

impl Manifest {
    /// Parses a manifest from YAML text. A manifest without `image` is
    /// rejected (spec §6) unless it's the out-of-scope compose variant,
    /// which this crate does not support.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }
}
