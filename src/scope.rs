//! Capability/scope model (C1): parse `name[:resource]` into a capability
//! with a risk level, per a fixed registry.

use serde::Deserialize;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

use crate::error::AegisError;

/// Risk level attached to a scope. Ordered so `MaxRisk` is a plain `.max()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Risk {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Risk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
            Risk::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A single capability token: `name[:resource]`, with the risk resolved
/// from the registry at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub name: String,
    pub resource: Option<String>,
    pub risk: Risk,
}

impl Scope {
    /// Canonical textual form: `name` or `name:resource`.
    pub fn text(&self) -> String {
        match &self.resource {
            Some(resource) if !resource.is_empty() => format!("{}:{}", self.name, resource),
            _ => self.name.clone(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Authoritative registry mapping known scope names to risk levels.
/// Unknown names default to `Medium` (spec §4.1).
fn registry_risk(name: &str) -> Risk {
    match name {
        "shell.exec" => Risk::Critical,
        "files.write" | "email.send" | "secrets.access" => Risk::High,
        "http.request" | "email.read" | "calendar.read" => Risk::Medium,
        "files.read" => Risk::Low,
        _ => Risk::Medium,
    }
}

/// Parse `text` (`name` or `name:resource`) into a `Scope`.
///
/// Splits on the *first* `:` so a resource may itself contain colons (e.g.
/// a URL). Empty input is an error.
pub fn parse(text: &str) -> Result<Scope, AegisError> {
    if text.is_empty() {
        return Err(AegisError::Config("empty scope text".to_string()));
    }
    let (name, resource) = match text.split_once(':') {
        Some((name, resource)) => (name.to_string(), Some(resource.to_string())),
        None => (text.to_string(), None),
    };
    if name.is_empty() {
        return Err(AegisError::Config(format!("scope {text:?} has an empty name")));
    }
    let risk = registry_risk(&name);
    Ok(Scope { name, resource, risk })
}

/// A skill's declared set of capability requests.
#[derive(Debug, Clone)]
pub struct ScopeRequest {
    pub requested_by: String,
    pub reason: String,
    pub scopes: Vec<Scope>,
}

impl ScopeRequest {
    /// Max risk among contained scopes, or `Low` if empty (spec §3).
    pub fn max_risk(&self) -> Risk {
        self.scopes
            .iter()
            .map(|s| s.risk)
            .max()
            .unwrap_or(Risk::Low)
    }
}

impl PartialOrd for Scope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scope {
    fn cmp(&self, other: &Self) -> Ordering {
        self.text().cmp(&other.text())
    }
}
