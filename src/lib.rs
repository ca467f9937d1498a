//! AegisClaw core: a secure-by-default execution envelope for containerised
//! agent skills.
//!
//! This crate implements the enforcement pipeline only — the scope model,
//! policy engine, approval gate, hardened sandbox executor, egress proxy,
//! secret store/redactor, and hash-chained audit log (C1–C10). The CLI,
//! HTTP dashboard, marketplace client, MCP bridge, cluster control plane,
//! and telemetry exporters are external collaborators that consume this
//! crate through [`orchestrator::Orchestrator::execute_skill`],
//! [`audit::AuditLog::read_all`], the [`secrets::SecretStore`] trait, and
//! [`lockdown::Lockdown`].

pub mod approval;
pub mod audit;
pub mod config;
pub mod egress;
pub mod error;
pub mod lockdown;
pub mod manifest;
pub mod orchestrator;
pub mod policy;
pub mod redact;
pub mod sandbox;
pub mod scope;
pub mod secrets;

pub use error::AegisError;
pub use error::Result;
pub use orchestrator::ExecuteOutcome;
pub use orchestrator::ExecuteRequest;
pub use orchestrator::Orchestrator;
