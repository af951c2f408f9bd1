//! In-memory collaborators for tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::certs::{CertificateIssuer, IssueStatus};
use crate::database::DatabaseEngine;
use crate::dns::DnsProvider;
use crate::error::{Result, RolloutError};
use crate::health::{HealthProbe, HealthTarget, ProbeOutcome};
use crate::proxy::ProxyControl;
use crate::registry::Site;
use crate::supervisor::{ProcessState, Supervisor};
use crate::types::{ProxyMode, SiteKind, TlsState};

pub fn site(domain: &str, kind: SiteKind, port: Option<u16>) -> Site {
    Site {
        domain: domain.to_string(),
        kind,
        port,
        program: None,
        database: None,
        health_path: None,
        tls_state: TlsState::DnsOnly,
        current_release_id: None,
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// DNS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct DnsRecordState {
    visible: ProxyMode,
    pending: Option<(ProxyMode, u32)>,
}

/// Edge DNS with configurable propagation lag: a change becomes visible to
/// `proxy_mode` only after `lag` further reads.
#[derive(Default)]
pub struct FakeDns {
    records: Mutex<HashMap<String, DnsRecordState>>,
    lag: AtomicU32,
    sets: AtomicU32,
}

impl FakeDns {
    pub fn set_mode(&self, domain: &str, mode: ProxyMode) {
        self.records.lock().unwrap().insert(
            domain.to_string(),
            DnsRecordState {
                visible: mode,
                pending: None,
            },
        );
    }

    pub fn set_lag(&self, reads: u32) {
        self.lag.store(reads, Ordering::SeqCst);
    }

    pub fn set_calls(&self) -> u32 {
        self.sets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsProvider for FakeDns {
    async fn proxy_mode(&self, domain: &str) -> Result<ProxyMode> {
        let mut records = self.records.lock().unwrap();
        let state = records.entry(domain.to_string()).or_insert(DnsRecordState {
            visible: ProxyMode::Direct,
            pending: None,
        });
        match state.pending {
            Some((mode, 0)) => {
                state.visible = mode;
                state.pending = None;
            }
            Some((mode, n)) => state.pending = Some((mode, n - 1)),
            None => {}
        }
        Ok(state.visible)
    }

    async fn set_proxy_mode(&self, domain: &str, mode: ProxyMode) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        let lag = self.lag.load(Ordering::SeqCst);
        let mut records = self.records.lock().unwrap();
        let state = records.entry(domain.to_string()).or_insert(DnsRecordState {
            visible: ProxyMode::Direct,
            pending: None,
        });
        if lag == 0 {
            state.visible = mode;
            state.pending = None;
        } else {
            state.pending = Some((mode, lag));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

/// Reports `Pending` for `pending_polls` status calls after a request.
#[derive(Default)]
pub struct FakeIssuer {
    pending_polls: AtomicU32,
    never_issue: AtomicBool,
    fail_reason: Mutex<Option<String>>,
    fail_request: AtomicBool,
    polls: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<String>>,
}

impl FakeIssuer {
    pub fn issue_after(polls: u32) -> Self {
        let issuer = Self::default();
        issuer.pending_polls.store(polls, Ordering::SeqCst);
        issuer
    }

    pub fn never_issue() -> Self {
        let issuer = Self::default();
        issuer.never_issue.store(true, Ordering::SeqCst);
        issuer
    }

    pub fn fail_with(&self, reason: &str) {
        *self.fail_reason.lock().unwrap() = Some(reason.to_string());
    }

    pub fn fail_request(&self, fail: bool) {
        self.fail_request.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CertificateIssuer for FakeIssuer {
    async fn request(&self, domain: &str) -> Result<()> {
        if self.fail_request.load(Ordering::SeqCst) {
            return Err(RolloutError::transient("certs", "acme directory unavailable"));
        }
        self.requests.lock().unwrap().push(domain.to_string());
        self.polls.lock().unwrap().insert(domain.to_string(), 0);
        Ok(())
    }

    async fn status(&self, domain: &str) -> Result<IssueStatus> {
        if let Some(reason) = self.fail_reason.lock().unwrap().clone() {
            return Ok(IssueStatus::Failed { reason });
        }
        let mut polls = self.polls.lock().unwrap();
        let Some(count) = polls.get_mut(domain) else {
            return Ok(IssueStatus::Pending);
        };
        *count += 1;
        if self.never_issue.load(Ordering::SeqCst)
            || *count <= self.pending_polls.load(Ordering::SeqCst)
        {
            return Ok(IssueStatus::Pending);
        }
        Ok(IssueStatus::Issued {
            fullchain: PathBuf::from(format!("/etc/letsencrypt/live/{domain}/fullchain.pem")),
        })
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Records commands and tracks each program's run state.
#[derive(Default)]
pub struct FakeSupervisor {
    calls: Mutex<Vec<String>>,
    states: Mutex<HashMap<String, ProcessState>>,
}

impl FakeSupervisor {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn restarts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with("restart "))
            .count()
    }

    fn record(&self, action: &str, program: &str, state: ProcessState) {
        self.calls.lock().unwrap().push(format!("{action} {program}"));
        self.states
            .lock()
            .unwrap()
            .insert(program.to_string(), state);
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn start(&self, program: &str) -> Result<()> {
        self.record("start", program, ProcessState::Running);
        Ok(())
    }

    async fn stop(&self, program: &str) -> Result<()> {
        self.record("stop", program, ProcessState::Stopped);
        Ok(())
    }

    async fn restart(&self, program: &str) -> Result<()> {
        self.record("restart", program, ProcessState::Running);
        Ok(())
    }

    async fn status(&self, program: &str) -> Result<ProcessState> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(program)
            .copied()
            .unwrap_or(ProcessState::Stopped))
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Handles to hold a database call mid-flight.
#[derive(Clone, Default)]
pub struct Pause {
    /// Notified once the call has started and is waiting.
    pub entered: Arc<Notify>,
    /// Notify to let the call finish.
    pub resume: Arc<Notify>,
}

impl Pause {
    async fn hold(&self) {
        self.entered.notify_one();
        self.resume.notified().await;
    }
}

#[derive(Default)]
pub struct FakeDatabase {
    calls: Mutex<Vec<String>>,
    applied: Mutex<Vec<u64>>,
    fail_version: Mutex<Option<u64>>,
    fail_dump: AtomicBool,
    empty_dump: AtomicBool,
    pause_reset: Mutex<Option<Pause>>,
    pause_apply: Mutex<Option<Pause>>,
}

impl FakeDatabase {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Versions applied since creation, in order.
    pub fn applied(&self) -> Vec<u64> {
        self.applied.lock().unwrap().clone()
    }

    pub fn resets(&self) -> usize {
        self.calls().iter().filter(|c| *c == "reset").count()
    }

    pub fn fail_version(&self, version: u64) {
        *self.fail_version.lock().unwrap() = Some(version);
    }

    pub fn fail_dump(&self, fail: bool) {
        self.fail_dump.store(fail, Ordering::SeqCst);
    }

    pub fn empty_dump(&self, empty: bool) {
        self.empty_dump.store(empty, Ordering::SeqCst);
    }

    pub fn pause_reset(&self) -> Pause {
        let pause = Pause::default();
        *self.pause_reset.lock().unwrap() = Some(pause.clone());
        pause
    }

    /// Hold the next migration script until resumed.
    pub fn pause_apply(&self) -> Pause {
        let pause = Pause::default();
        *self.pause_apply.lock().unwrap() = Some(pause.clone());
        pause
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn script_version(script: &Path) -> u64 {
    script
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('_').next())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl DatabaseEngine for FakeDatabase {
    async fn apply(&self, _url: &str, script: &Path) -> Result<()> {
        let version = script_version(script);
        self.record(format!("apply {version}"));
        let pause = self.pause_apply.lock().unwrap().take();
        if let Some(pause) = pause {
            pause.hold().await;
        }
        if *self.fail_version.lock().unwrap() == Some(version) {
            return Err(RolloutError::external(
                "database",
                format!("syntax error in migration {version}"),
            ));
        }
        self.applied.lock().unwrap().push(version);
        Ok(())
    }

    async fn reset(&self, _url: &str) -> Result<()> {
        self.record("reset".to_string());
        let pause = self.pause_reset.lock().unwrap().clone();
        if let Some(pause) = pause {
            pause.hold().await;
        }
        self.applied.lock().unwrap().clear();
        Ok(())
    }

    async fn dump(&self, _url: &str, dest: &Path) -> Result<u64> {
        self.record("dump".to_string());
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.fail_dump.load(Ordering::SeqCst) {
            // The connection drops after part of the dump is written.
            std::fs::write(dest, b"PGDMP")?;
            return Err(RolloutError::external("database", "pg_dump: connection lost"));
        }
        let data: &[u8] = if self.empty_dump.load(Ordering::SeqCst) {
            b""
        } else {
            b"PGDMP fake dump"
        };
        std::fs::write(dest, data)?;
        Ok(data.len() as u64)
    }

    async fn restore(&self, _url: &str, _src: &Path) -> Result<()> {
        self.record("restore".to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Scripted probe: queued outcomes first, then `fallback`.
pub struct FakeProbe {
    script: Mutex<VecDeque<bool>>,
    fallback: AtomicBool,
    targets: Mutex<Vec<HealthTarget>>,
}

impl FakeProbe {
    pub fn healthy() -> Self {
        Self::healthy_after(0)
    }

    pub fn healthy_after(failures: usize) -> Self {
        Self {
            script: Mutex::new(std::iter::repeat(false).take(failures).collect()),
            fallback: AtomicBool::new(true),
            targets: Mutex::new(Vec::new()),
        }
    }

    pub fn never_healthy() -> Self {
        let probe = Self::healthy();
        probe.fallback.store(false, Ordering::SeqCst);
        probe
    }

    /// Queue `count` failing probes ahead of the fallback.
    pub fn fail_next(&self, count: usize) {
        self.script
            .lock()
            .unwrap()
            .extend(std::iter::repeat(false).take(count));
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.fallback.store(healthy, Ordering::SeqCst);
    }

    pub fn targets(&self) -> Vec<HealthTarget> {
        self.targets.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, target: &HealthTarget) -> Result<ProbeOutcome> {
        self.targets.lock().unwrap().push(target.clone());
        let healthy = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.load(Ordering::SeqCst));
        Ok(if healthy {
            ProbeOutcome::Healthy
        } else {
            ProbeOutcome::Unhealthy("status 502 Bad Gateway".to_string())
        })
    }
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeProxyControl {
    tests: AtomicU32,
    reloads: AtomicU32,
    fail_test: AtomicBool,
}

impl FakeProxyControl {
    pub fn reloads(&self) -> u32 {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn fail_test(&self, fail: bool) {
        self.fail_test.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProxyControl for FakeProxyControl {
    async fn test(&self) -> Result<()> {
        self.tests.fetch_add(1, Ordering::SeqCst);
        if self.fail_test.load(Ordering::SeqCst) {
            return Err(RolloutError::external("proxy", "nginx: [emerg] unexpected \"}\""));
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
