//! Policy engine (C6): evaluates scopes against a small declarative rule
//! file, matched top-to-bottom, fail-closed to `RequireApproval`.

use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::scope::Risk;
use crate::scope::Scope;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("malformed policy rule on line {line}: {reason}")]
    MalformedRule { line: usize, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    RequireApproval,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::RequireApproval => "require_approval",
        };
        f.write_str(s)
    }
}

/// The flat record a policy rule is matched against (spec §3/§9).
#[derive(Debug, Clone)]
pub struct PolicyInput {
    pub name: String,
    pub resource: Option<String>,
    pub risk: Risk,
}

impl From<&Scope> for PolicyInput {
    fn from(scope: &Scope) -> Self {
        Self {
            name: scope.name.clone(),
            resource: scope.resource.clone(),
            risk: scope.risk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RiskOp {
    Eq,
    Ge,
    Le,
}

#[derive(Debug, Clone)]
struct Rule {
    name_glob: String,
    resource_glob: Option<String>,
    risk: Option<(RiskOp, Risk)>,
    decision: Decision,
}

impl Rule {
    fn matches(&self, input: &PolicyInput) -> bool {
        if !glob_match(&self.name_glob, &input.name) {
            return false;
        }
        if let Some(resource_glob) = &self.resource_glob {
            let resource = input.resource.as_deref().unwrap_or("");
            if !glob_match(resource_glob, resource) {
                return false;
            }
        }
        if let Some((op, risk)) = self.risk {
            let matches = match op {
                RiskOp::Eq => input.risk == risk,
                RiskOp::Ge => input.risk >= risk,
                RiskOp::Le => input.risk <= risk,
            };
            if !matches {
                return false;
            }
        }
        true
    }
}

/// `*` matches any run of characters; anything else must match literally.
/// Sufficient for the name/resource globs this grammar allows.
fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => text.starts_with(prefix),
        None => pattern == text,
    }
}

fn parse_risk(text: &str) -> Option<Risk> {
    match text {
        "low" => Some(Risk::Low),
        "medium" => Some(Risk::Medium),
        "high" => Some(Risk::High),
        "critical" => Some(Risk::Critical),
        _ => None,
    }
}

fn parse_decision(text: &str) -> Option<Decision> {
    match text {
        "allow" => Some(Decision::Allow),
        "deny" => Some(Decision::Deny),
        "require_approval" => Some(Decision::RequireApproval),
        _ => None,
    }
}

/// Parses one rule line of the form:
///
/// ```text
/// scope <glob-on-name> [resource <glob-on-resource>] [risk <op> <Risk>] -> allow|deny|require_approval
/// ```
fn parse_rule(line: &str) -> Result<Rule, String> {
    let (lhs, decision_text) = line
        .split_once("->")
        .ok_or_else(|| "missing `->`".to_string())?;
    let decision = parse_decision(decision_text.trim())
        .ok_or_else(|| format!("unknown decision {:?}", decision_text.trim()))?;

    let tokens: Vec<&str> = lhs.split_whitespace().collect();
    if tokens.first() != Some(&"scope") {
        return Err("rule must start with `scope`".to_string());
    }
    let name_glob = tokens
        .get(1)
        .ok_or_else(|| "missing scope name glob".to_string())?
        .to_string();

    let mut resource_glob = None;
    let mut risk = None;
    let mut i = 2;
    while i < tokens.len() {
        match tokens[i] {
            "resource" => {
                let value = tokens
                    .get(i + 1)
                    .ok_or_else(|| "missing resource glob".to_string())?;
                resource_glob = Some((*value).to_string());
                i += 2;
            }
            "risk" => {
                let op = match tokens.get(i + 1) {
                    Some(&">=") => RiskOp::Ge,
                    Some(&"<=") => RiskOp::Le,
                    Some(&"==") => RiskOp::Eq,
                    other => return Err(format!("unknown risk operator {other:?}")),
                };
                let value = tokens
                    .get(i + 2)
                    .and_then(|v| parse_risk(v))
                    .ok_or_else(|| "invalid risk value".to_string())?;
                risk = Some((op, value));
                i += 3;
            }
            other => return Err(format!("unexpected token {other:?}")),
        }
    }

    Ok(Rule {
        name_glob,
        resource_glob,
        risk,
        decision,
    })
}

/// A total function from `PolicyInput` to `Decision`, re-entrant and
/// cheap to evaluate concurrently (no interior mutability).
pub struct PolicyEngine {
    rules: Vec<Rule>,
}

impl PolicyEngine {
    /// The default policy: no rules, so every input falls through to
    /// `RequireApproval` (spec §6: a missing policy file uses this).
    pub fn default_policy() -> Self {
        Self { rules: Vec::new() }
    }

    /// Parses a rule file: one rule per non-empty, non-comment line.
    pub fn from_str(text: &str) -> Result<Self, PolicyError> {
        let mut rules = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let rule = parse_rule(line).map_err(|reason| PolicyError::MalformedRule {
                line: idx + 1,
                reason,
            })?;
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    /// Loads the rule file at `path`, or the default policy if it doesn't
    /// exist (spec §6).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default_policy());
        }
        Self::from_str(&std::fs::read_to_string(path)?)
    }

    /// Evaluates a single scope input. The first matching rule wins; no
    /// match fails closed to `RequireApproval`.
    pub fn evaluate(&self, input: &PolicyInput) -> Decision {
        self.rules
            .iter()
            .find(|rule| rule.matches(input))
            .map(|rule| rule.decision)
            .unwrap_or(Decision::RequireApproval)
    }

    /// Aggregates per-scope decisions over a whole request (spec §4.6):
    /// any `Deny` short-circuits; else accumulated `RequireApproval`
    /// scopes win; else `Allow`.
    pub fn evaluate_request(&self, scopes: &[Scope]) -> (Decision, Vec<Scope>) {
        let mut flagged = Vec::new();
        for scope in scopes {
            match self.evaluate(&PolicyInput::from(scope)) {
                Decision::Deny => return (Decision::Deny, vec![scope.clone()]),
                Decision::RequireApproval => flagged.push(scope.clone()),
                Decision::Allow => {}
            }
        }
        if flagged.is_empty() {
            (Decision::Allow, Vec::new())
        } else {
            (Decision::RequireApproval, flagged)
        }
    }
}
