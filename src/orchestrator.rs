//! Orchestrator (C10): the end-to-end `execute_skill` pipeline tying scopes,
//! policy, approval, audit, secrets, and the sandbox together.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing::warn;

use crate::approval::ApprovalStore;
use crate::audit::AuditLog;
use crate::egress::EgressProxy;
use crate::error::AegisError;
use crate::error::Result;
use crate::lockdown::Lockdown;
use crate::manifest::Manifest;
use crate::policy::Decision;
use crate::policy::PolicyEngine;
use crate::redact::Redactor;
use crate::sandbox::BindMount;
use crate::sandbox::ContainerRuntime;
use crate::sandbox::SandboxConfig;
use crate::scope;
use crate::scope::Scope;
use crate::scope::ScopeRequest;
use crate::secrets::SecretStore;

/// Default execution timeout (spec §4.10 step 9 / §5).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Outcome of presenting a flagged scope set to a human (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approve,
    Always,
    Deny,
}

/// The approval collaborator contract (spec §6). Blocks; an error from a
/// real implementation should map to `Deny` before it reaches this trait.
#[async_trait]
pub trait ApprovalUi: Send + Sync {
    async fn request_approval(&self, request: &ScopeRequest) -> ApprovalOutcome;
}

/// Deterministic stub for tests: always returns the outcome it was built
/// with, regardless of what's asked.
pub struct FixedApproval(pub ApprovalOutcome);

#[async_trait]
impl ApprovalUi for FixedApproval {
    async fn request_approval(&self, _request: &ScopeRequest) -> ApprovalOutcome {
        self.0
    }
}

/// Per-call inputs that aren't part of the manifest itself.
pub struct ExecuteRequest<'a> {
    pub manifest: &'a Manifest,
    pub command: &'a str,
    pub mounts: Vec<BindMount>,
    pub work_dir: Option<String>,
    /// Sandbox runtime override (`""` = docker default); spec §4.8.6.
    pub runtime: String,
    /// Caller-provided stdout sink (spec §6 "Caller streams"). `None` drops
    /// the live stream; the redacted output is still returned in
    /// `ExecuteOutcome::stdout` either way.
    pub stdout_sink: Option<Box<dyn Write + Send>>,
    /// Caller-provided stderr sink; same contract as `stdout_sink`.
    pub stderr_sink: Option<Box<dyn Write + Send>>,
}

impl<'a> ExecuteRequest<'a> {
    pub fn new(manifest: &'a Manifest, command: &'a str) -> Self {
        Self {
            manifest,
            command,
            mounts: Vec::new(),
            work_dir: None,
            runtime: String::new(),
            stdout_sink: None,
            stderr_sink: None,
        }
    }

    /// Attaches a sink that receives redacted stdout as it streams, in
    /// addition to the buffer returned in `ExecuteOutcome`.
    pub fn with_stdout_sink(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.stdout_sink = Some(sink);
        self
    }

    /// Attaches a sink that receives redacted stderr as it streams, in
    /// addition to the buffer returned in `ExecuteOutcome`.
    pub fn with_stderr_sink(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.stderr_sink = Some(sink);
        self
    }
}

pub struct ExecuteOutcome {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Ties together the six enforcement components for one skill invocation.
/// Holds only `Arc`s to shared, process-wide state; owns no back-reference
/// to anything that outlives a single `execute_skill` call.
pub struct Orchestrator {
    pub lockdown: Arc<Lockdown>,
    pub audit: Arc<AuditLog>,
    pub policy: Arc<PolicyEngine>,
    pub approvals: Arc<ApprovalStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub approval_ui: Arc<dyn ApprovalUi>,
    pub timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        lockdown: Arc<Lockdown>,
        audit: Arc<AuditLog>,
        policy: Arc<PolicyEngine>,
        approvals: Arc<ApprovalStore>,
        secrets: Arc<dyn SecretStore>,
        runtime: Arc<dyn ContainerRuntime>,
        approval_ui: Arc<dyn ApprovalUi>,
    ) -> Self {
        Self {
            lockdown,
            audit,
            policy,
            approvals,
            secrets,
            runtime,
            approval_ui,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets lockdown and forcibly removes every managed container. The
    /// collaborator that owns the transition (e.g. a dashboard) is out of
    /// scope; this is the core-side mechanism it would call (spec §4.9).
    pub async fn trigger_lockdown(&self) -> Result<usize> {
        self.lockdown.lockdown();
        Ok(self.runtime.kill_all_labeled().await?)
    }

    /// Runs the pipeline described in spec §4.10 for one skill invocation.
    pub async fn execute_skill(&self, request: ExecuteRequest<'_>) -> Result<ExecuteOutcome> {
        // Step 1: guard.
        if self.lockdown.is_locked_down() {
            return Err(AegisError::Lockdown);
        }

        // Step 2: resolve command.
        let command_spec = request
            .manifest
            .command(request.command)
            .ok_or_else(|| AegisError::CommandNotFound(request.command.to_string()))?
            .clone();

        // Step 3: prepare scopes.
        let mut scopes = Vec::with_capacity(request.manifest.scopes.len());
        let mut needs_network = false;
        let mut allowed_domains = Vec::new();
        for raw in &request.manifest.scopes {
            let parsed = scope::parse(raw)?;
            if parsed.name == "http.request" || parsed.name == "email.send" {
                needs_network = true;
                if let Some(resource) = &parsed.resource {
                    allowed_domains.push(resource.clone());
                }
            }
            scopes.push(parsed);
        }
        let scope_texts: Vec<String> = scopes.iter().map(Scope::text).collect();

        // Step 4: policy.
        let (decision, flagged) = self.policy.evaluate_request(&scopes);

        // Step 5: enforce.
        match decision {
            Decision::Deny => {
                self.audit
                    .log("skill.exec", &scope_texts, "deny", &request.manifest.name, None)?;
                let scope = flagged.first().map(Scope::text).unwrap_or_default();
                return Err(AegisError::PolicyDeny { scope });
            }
            Decision::RequireApproval => {
                self.resolve_approval(&request, &flagged, &scope_texts).await?;
            }
            Decision::Allow => {}
        }

        // Step 6: pre-audit with the final decision.
        let mut details = HashMap::new();
        details.insert("command".to_string(), request.command.to_string());
        details.insert("image".to_string(), request.manifest.image.clone());
        self.audit.log(
            "skill.exec",
            &scope_texts,
            "allow",
            &request.manifest.name,
            Some(details),
        )?;

        // Step 7 is implicit: every path above that isn't "allow" already
        // returned, so reaching here means the container may be created.

        // Step 8: secret injection, registered with the redactor before any
        // container output reaches the caller (I6).
        let redactor = Arc::new(Redactor::new());
        let mut env: Vec<String> = command_spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        for s in &scopes {
            if s.name != "secrets.access" {
                continue;
            }
            let Some(resource) = &s.resource else { continue };
            match self.secrets.get(resource).await {
                Ok(value) => {
                    redactor.register(value.clone());
                    env.push(format!("{resource}={value}"));
                }
                Err(e) => {
                    warn!(secret = %resource, error = %e, "requested secret missing; continuing without it");
                }
            }
        }

        // Egress proxy, started before the container so its address can be
        // injected as env (spec §4.8 step 2).
        let mut proxy = None;
        if needs_network && !allowed_domains.is_empty() {
            let started = EgressProxy::start(allowed_domains.clone(), Arc::clone(&self.audit)).await?;
            let proxy_url = started.proxy_url_for_container();
            env.push(format!("http_proxy={proxy_url}"));
            env.push(format!("https_proxy={proxy_url}"));
            env.push("NO_PROXY=127.0.0.1,localhost".to_string());
            proxy = Some(started);
        }

        let sandbox_config = SandboxConfig {
            skill_name: request.manifest.name.clone(),
            image: request.manifest.image.clone(),
            command: command_spec.args.clone(),
            env,
            work_dir: request.work_dir,
            mounts: request.mounts,
            network: needs_network,
            allowed_domains,
            runtime: request.runtime,
            seccomp_path: None,
        };

        let outcome = self
            .run_sandboxed(&sandbox_config, &redactor, request.stdout_sink, request.stderr_sink)
            .await;

        if let Some(proxy) = proxy {
            proxy.stop();
        }

        outcome
    }

    async fn resolve_approval(
        &self,
        request: &ExecuteRequest<'_>,
        flagged: &[Scope],
        scope_texts: &[String],
    ) -> Result<()> {
        let all_pre_approved = flagged.iter().all(|s| {
            self.approvals
                .check(&s.text())
                .ok()
                .flatten()
                .is_some()
        });
        if all_pre_approved {
            return Ok(());
        }

        let scope_request = ScopeRequest {
            requested_by: request.manifest.name.clone(),
            reason: format!("{} requires approval", request.command),
            scopes: flagged.to_vec(),
        };
        match self.approval_ui.request_approval(&scope_request).await {
            ApprovalOutcome::Deny => {
                self.audit.log(
                    "skill.exec",
                    scope_texts,
                    "user-denied",
                    &request.manifest.name,
                    None,
                )?;
                Err(AegisError::UserDeny)
            }
            ApprovalOutcome::Always => {
                for s in flagged {
                    self.approvals.grant_always(&s.text())?;
                }
                Ok(())
            }
            ApprovalOutcome::Approve => Ok(()),
        }
    }

    /// Step 2 (I2) guard right before the container would be created: even
    /// if lockdown lands mid-pipeline, no container is created once it's
    /// active.
    async fn run_sandboxed(
        &self,
        config: &SandboxConfig,
        redactor: &Arc<Redactor>,
        mut stdout_sink: Option<Box<dyn Write + Send>>,
        mut stderr_sink: Option<Box<dyn Write + Send>>,
    ) -> Result<ExecuteOutcome> {
        if self.lockdown.is_locked_down() {
            return Err(AegisError::Lockdown);
        }

        // Created outside the timeout so a timed-out run still has a
        // handle to kill and remove (spec §4.8 step 5 / §3 Lifecycles).
        let handle = self.runtime.create(config).await?;
        self.runtime.start(&handle).await?;
        let logs = self.runtime.logs(&handle).await?;

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        let drain = async {
            let stdout_writer = redactor.wrap(TeeSink {
                buf: &mut stdout_buf,
                sink: stdout_sink.as_deref_mut(),
            });
            let stderr_writer = redactor.wrap(TeeSink {
                buf: &mut stderr_buf,
                sink: stderr_sink.as_deref_mut(),
            });
            let stdout_copy = stream_redacted(logs.stdout, stdout_writer);
            let stderr_copy = stream_redacted(logs.stderr, stderr_writer);
            let (stdout_result, stderr_result) = tokio::join!(stdout_copy, stderr_copy);
            stdout_result?;
            stderr_result?;
            let result = self.runtime.wait(&handle).await?;
            Ok::<_, AegisError>(result)
        };

        match tokio::time::timeout(self.timeout, drain).await {
            Ok(Ok(result)) => {
                let _ = self.runtime.remove(&handle).await;
                Ok(ExecuteOutcome {
                    exit_code: result.exit_code,
                    stdout: stdout_buf,
                    stderr: stderr_buf,
                })
            }
            Ok(Err(e)) => {
                let _ = self.runtime.remove(&handle).await;
                Err(e)
            }
            Err(_) => {
                info!(container = %handle.id, "skill execution timed out; killing container");
                let _ = self.runtime.kill(&handle).await;
                let _ = self.runtime.remove(&handle).await;
                Err(AegisError::Timeout)
            }
        }
    }
}

/// Fans redacted output out to the in-memory buffer `ExecuteOutcome` returns
/// and, if the caller attached one, its own sink (spec §6 "Caller streams" /
/// §4.10 step 11).
struct TeeSink<'a> {
    buf: &'a mut Vec<u8>,
    sink: Option<&'a mut (dyn Write + Send)>,
}

impl Write for TeeSink<'_> {
    fn write(&mut self, p: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(p);
        if let Some(sink) = self.sink.as_deref_mut() {
            sink.write_all(p)?;
        }
        Ok(p.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.sink.as_deref_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }
}

/// Reads `reader` in fixed-size chunks and redacts each one through
/// `writer` as it arrives, rather than buffering the whole stream before a
/// single end-of-run redaction pass — this is what lets a caller observe a
/// long-running skill's (already-redacted) output as it streams.
async fn stream_redacted(
    mut reader: impl AsyncRead + Unpin,
    mut writer: impl Write,
) -> std::io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&chunk[..n])?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::CommandSpec;
    use crate::policy::PolicyEngine;
    use crate::sandbox::FakeRuntime;
    use crate::sandbox::ScriptedContainer;
    use crate::secrets::LocalSecretStore;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn manifest(scopes: Vec<&str>) -> Manifest {
        let mut commands = BTreeMap::new();
        commands.insert(
            "hello".to_string(),
            CommandSpec {
                args: vec!["echo".to_string(), "hi".to_string()],
                env: BTreeMap::new(),
            },
        );
        Manifest {
            name: "echo-skill".to_string(),
            version: "1.0.0".to_string(),
            image: "alpine:latest".to_string(),
            platform: None,
            scopes: scopes.into_iter().map(str::to_string).collect(),
            commands,
            signature: None,
        }
    }

    struct Harness {
        _dir: TempDir,
        orchestrator: Orchestrator,
        runtime: Arc<FakeRuntime>,
        audit_path: std::path::PathBuf,
    }

    fn harness(policy_text: &str, approval_outcome: ApprovalOutcome) -> Harness {
        let dir = TempDir::new().unwrap();
        let audit_path = dir.path().join("audit").join("audit.log");
        let secrets_identity = dir.path().join("keys.txt");
        LocalSecretStore::init(&secrets_identity).unwrap();
        let secrets = LocalSecretStore::open(&secrets_identity, dir.path().join("secrets.enc")).unwrap();

        let runtime = Arc::new(FakeRuntime::new());
        let orchestrator = Orchestrator::new(
            Arc::new(Lockdown::new()),
            Arc::new(AuditLog::open(&audit_path).unwrap()),
            Arc::new(PolicyEngine::from_str(policy_text).unwrap()),
            Arc::new(ApprovalStore::open(dir.path().join("approvals.json"))),
            Arc::new(secrets),
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::new(FixedApproval(approval_outcome)),
        );
        Harness {
            _dir: dir,
            orchestrator,
            runtime,
            audit_path,
        }
    }

    // Scenario 1: allow path.
    #[tokio::test]
    async fn allow_path_runs_container_and_audits_allow() {
        let h = harness("scope files.read -> allow\n", ApprovalOutcome::Deny);
        h.runtime.push_result(ScriptedContainer {
            stdout: b"hi\n".to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
        });
        let manifest = manifest(vec!["files.read:/tmp"]);
        let request = ExecuteRequest::new(&manifest, "hello");
        let outcome = h.orchestrator.execute_skill(request).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(String::from_utf8(outcome.stdout).unwrap(), "hi\n");

        let entries = AuditLog::read_all(&h.audit_path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision, "allow");
        assert_eq!(entries[0].action, "skill.exec");
    }

    // Scenario 2: policy deny.
    #[tokio::test]
    async fn policy_deny_never_creates_container() {
        let h = harness("scope shell.exec -> deny\n", ApprovalOutcome::Deny);
        let manifest = manifest(vec!["shell.exec"]);
        let request = ExecuteRequest::new(&manifest, "hello");
        let err = h.orchestrator.execute_skill(request).await.unwrap_err();
        assert_matches::assert_matches!(err, AegisError::PolicyDeny { .. });
        assert_eq!(h.runtime.live_count(), 0);

        let entries = AuditLog::read_all(&h.audit_path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision, "deny");
    }

    // Scenario 3: approval persists across invocations.
    #[tokio::test]
    async fn always_approval_persists_and_skips_second_prompt() {
        let h = harness("scope files.write -> require_approval\n", ApprovalOutcome::Always);
        h.runtime.push_result(ScriptedContainer::default());
        h.runtime.push_result(ScriptedContainer::default());
        let manifest = manifest(vec!["files.write:/data"]);

        h.orchestrator
            .execute_skill(ExecuteRequest::new(&manifest, "hello"))
            .await
            .unwrap();
        assert!(h.orchestrator.approvals.check("files.write:/data").unwrap().is_some());

        // Second call would deny if prompted again, but the stub always
        // returns Always — the point is this call never reaches the
        // prompt, which we can't observe directly but is implied by the
        // prior grant being consulted first without requiring interaction.
        let outcome = h
            .orchestrator
            .execute_skill(ExecuteRequest::new(&manifest, "hello"))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn user_deny_returns_error_and_audits_user_denied() {
        let h = harness("scope files.write -> require_approval\n", ApprovalOutcome::Deny);
        let manifest = manifest(vec!["files.write:/data"]);
        let err = h
            .orchestrator
            .execute_skill(ExecuteRequest::new(&manifest, "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, AegisError::UserDeny));
        let entries = AuditLog::read_all(&h.audit_path).unwrap();
        assert_eq!(entries[0].decision, "user-denied");
    }

    #[tokio::test]
    async fn lockdown_blocks_before_any_audit_entry() {
        let h = harness("scope files.read -> allow\n", ApprovalOutcome::Deny);
        h.orchestrator.lockdown.lockdown();
        let manifest = manifest(vec!["files.read:/tmp"]);
        let err = h
            .orchestrator
            .execute_skill(ExecuteRequest::new(&manifest, "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, AegisError::Lockdown));
        assert!(AuditLog::read_all(&h.audit_path).unwrap().is_empty());
        assert_eq!(h.runtime.live_count(), 0);
    }

    #[tokio::test]
    async fn unknown_command_is_not_found() {
        let h = harness("scope files.read -> allow\n", ApprovalOutcome::Deny);
        let manifest = manifest(vec![]);
        let err = h
            .orchestrator
            .execute_skill(ExecuteRequest::new(&manifest, "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, AegisError::CommandNotFound(_)));
    }

    // Scenario 5 (secret redaction) runs at the `Redactor` level directly
    // in `redact::tests`; here we confirm the env var is actually injected.
    #[tokio::test]
    async fn secret_scope_injects_env_var() {
        let h = harness("scope secrets.access -> allow\n", ApprovalOutcome::Deny);
        h.orchestrator.secrets.set("API_KEY", "sk-zzzzzzzz").await.unwrap();
        h.runtime.push_result(ScriptedContainer::default());
        let manifest = manifest(vec!["secrets.access:API_KEY"]);
        h.orchestrator
            .execute_skill(ExecuteRequest::new(&manifest, "hello"))
            .await
            .unwrap();
        let configs = h.runtime.created_configs();
        assert!(configs[0].env.iter().any(|e| e == "API_KEY=sk-zzzzzzzz"));
    }

    #[tokio::test]
    async fn missing_secret_is_a_warning_not_a_failure() {
        let h = harness("scope secrets.access -> allow\n", ApprovalOutcome::Deny);
        h.runtime.push_result(ScriptedContainer::default());
        let manifest = manifest(vec!["secrets.access:MISSING_KEY"]);
        let outcome = h
            .orchestrator
            .execute_skill(ExecuteRequest::new(&manifest, "hello"))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    // A caller-attached sink receives the same redacted bytes as the
    // returned buffer, streamed as the container produces them (spec §6
    // "Caller streams" / §4.10 step 11), not just a post-hoc copy.
    #[tokio::test]
    async fn caller_sink_receives_redacted_output_live() {
        let h = harness("scope secrets.access -> allow\n", ApprovalOutcome::Deny);
        h.orchestrator.secrets.set("API_KEY", "sk-zzzzzzzz").await.unwrap();
        h.runtime.push_result(ScriptedContainer {
            stdout: b"key is sk-zzzzzzzz here\n".to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
        });
        let manifest = manifest(vec!["secrets.access:API_KEY"]);
        let sink = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct SharedSink(Arc<std::sync::Mutex<Vec<u8>>>);
        impl std::io::Write for SharedSink {
            fn write(&mut self, p: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(p);
                Ok(p.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let request = ExecuteRequest::new(&manifest, "hello")
            .with_stdout_sink(Box::new(SharedSink(Arc::clone(&sink))));
        let outcome = h.orchestrator.execute_skill(request).await.unwrap();

        assert_eq!(String::from_utf8(outcome.stdout).unwrap(), "key is [REDACTED] here\n");
        let streamed = sink.lock().unwrap().clone();
        assert_eq!(String::from_utf8(streamed).unwrap(), "key is [REDACTED] here\n");
    }
}
