//! The probe orchestrator: a fixed pool of workers, each running whole
//! configure → launch → probe → teardown lifecycles one at a time.

use std::{
    collections::{BTreeSet, VecDeque},
    fmt,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::{
    candidates::Candidate,
    config::Config,
    id::new_scan_id,
    ports::{PortAllocator, PortRangeError},
    probe::{ProbeClient, ProbeError, local_socks_url},
    proxy_core::{LaunchError, Lifecycle, LifecycleState, ProxyLauncher, Readiness},
    template::{BaseTemplate, ConfigError, MaterializeError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Success,
    ProcessFailedToStart,
    ProbeFailed,
    ConfigError,
}

impl ProbeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ProcessFailedToStart => "process_failed_to_start",
            Self::ProbeFailed => "probe_failed",
            Self::ConfigError => "config_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    /// Dispatch order; also the ranking tie-break.
    pub index: usize,
    pub candidate: Candidate,
    pub port: u16,
    pub status: ProbeStatus,
    pub latency_ms: Option<u32>,
    pub error: Option<String>,
    /// Cleanup problems (process would not stop, artifact not removed).
    pub warnings: Vec<String>,
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ProbeStatus::Success
    }
}

/// Outcomes in completion order. A dispatch index is recorded at most once.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    outcomes: Vec<ProbeOutcome>,
    recorded: BTreeSet<usize>,
}

impl ResultSet {
    /// Returns `false` (and keeps the first outcome) if `outcome.index` was
    /// already recorded.
    pub fn record(&mut self, outcome: ProbeOutcome) -> bool {
        if !self.recorded.insert(outcome.index) {
            return false;
        }
        self.outcomes.push(outcome);
        true
    }

    pub fn outcomes(&self) -> &[ProbeOutcome] {
        &self.outcomes
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn successes(&self) -> impl Iterator<Item = &ProbeOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn ranked(&self) -> Vec<ProbeOutcome> {
        rank(&self.outcomes)
    }
}

/// Successful outcomes by ascending latency; equal latencies keep dispatch order.
pub fn rank(outcomes: &[ProbeOutcome]) -> Vec<ProbeOutcome> {
    let mut ranked: Vec<ProbeOutcome> = outcomes
        .iter()
        .filter(|o| o.is_success())
        .cloned()
        .collect();
    ranked.sort_by_key(|o| (o.latency_ms.unwrap_or(u32::MAX), o.index));
    ranked
}

#[derive(Debug, Clone)]
pub struct ScanReport {
    pub scan_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub results: ResultSet,
    pub ranked: Vec<ProbeOutcome>,
    /// Candidates never dispatched because the scan was aborted.
    pub cancelled: usize,
    pub aborted: bool,
}

impl ScanReport {
    pub fn top(&self, k: usize) -> &[ProbeOutcome] {
        &self.ranked[..k.min(self.ranked.len())]
    }

    pub fn to_json(&self, k: usize) -> serde_json::Value {
        serde_json::json!({
            "scan_id": self.scan_id,
            "started_at": self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "finished_at": self.finished_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            "total": self.total,
            "succeeded": self.ranked.len(),
            "cancelled": self.cancelled,
            "aborted": self.aborted,
            "top": self.top(k),
            "outcomes": self.results.outcomes(),
        })
    }
}

#[derive(Debug)]
pub enum ScanError {
    Config(ConfigError),
    ProxyCoreNotFound { program: PathBuf },
    PortRange(PortRangeError),
    WorkDir { path: PathBuf, source: std::io::Error },
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "config error: {err}"),
            Self::ProxyCoreNotFound { program } => {
                write!(f, "proxy core not found: {}", program.display())
            }
            Self::PortRange(err) => write!(f, "{err}"),
            Self::WorkDir { path, source } => {
                write!(f, "work dir {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ScanError {}

#[derive(Debug, Clone)]
pub enum ScanEvent {
    Started {
        scan_id: String,
        total: usize,
        workers: usize,
    },
    Outcome(ProbeOutcome),
    Finished {
        scan_id: String,
        succeeded: usize,
        cancelled: usize,
    },
}

/// Stops dispatch of new lifecycles and interrupts in-flight ones at their next
/// wait. Interrupted lifecycles are still torn down and still get an outcome.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub base_port: u16,
    pub concurrency: usize,
    pub readiness: Readiness,
    pub probe_timeout: Duration,
    pub stop_timeout: Duration,
    /// Upper bound on launch + readiness + probe for one candidate.
    pub lifecycle_timeout: Duration,
    pub target_url: String,
    pub work_dir: PathBuf,
}

impl ScanOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_port: config.base_port,
            concurrency: config.concurrency as usize,
            readiness: Readiness {
                mode: config.readiness,
                grace: Duration::from_secs(config.startup_grace_secs),
            },
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            lifecycle_timeout: Duration::from_secs(config.lifecycle_timeout_secs),
            target_url: config.target_url.clone(),
            work_dir: config.work_dir(),
        }
    }
}

const DEFAULT_EVENT_CAPACITY: usize = 1024;

pub struct Scanner {
    template: Arc<BaseTemplate>,
    launcher: Arc<dyn ProxyLauncher>,
    probe: Arc<dyn ProbeClient>,
    opts: ScanOptions,
    events: broadcast::Sender<ScanEvent>,
}

impl Scanner {
    pub fn new(
        template: Arc<BaseTemplate>,
        launcher: Arc<dyn ProxyLauncher>,
        probe: Arc<dyn ProbeClient>,
        opts: ScanOptions,
    ) -> Self {
        let (events, _events_rx) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            template,
            launcher,
            probe,
            opts,
            events,
        }
    }

    /// Replaces the event channel. Call before [`Scanner::subscribe`]; a
    /// capacity of `candidates + 2` lets a slow subscriber see every event.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let (events, _events_rx) = broadcast::channel(capacity.max(1));
        self.events = events;
        self
    }

    pub fn options(&self) -> &ScanOptions {
        &self.opts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub async fn scan(&self, candidates: Vec<Candidate>) -> Result<ScanReport, ScanError> {
        self.scan_with_abort(candidates, &AbortHandle::new()).await
    }

    /// Probes every candidate. A broken template or a missing proxy core stops
    /// dispatch, lets in-flight lifecycles finish, and is returned instead of a
    /// report. `abort` additionally interrupts in-flight lifecycles.
    pub async fn scan_with_abort(
        &self,
        candidates: Vec<Candidate>,
        abort: &AbortHandle,
    ) -> Result<ScanReport, ScanError> {
        let scan_id = new_scan_id();
        let started_at = Utc::now();
        let total = candidates.len();
        let ports = PortAllocator::new(self.opts.base_port, total).map_err(ScanError::PortRange)?;

        if total == 0 {
            debug!(scan_id = %scan_id, "no candidates; nothing to scan");
            return Ok(ScanReport {
                scan_id,
                started_at,
                finished_at: Utc::now(),
                total,
                results: ResultSet::default(),
                ranked: Vec::new(),
                cancelled: 0,
                aborted: abort.is_aborted(),
            });
        }

        std::fs::create_dir_all(&self.opts.work_dir).map_err(|source| ScanError::WorkDir {
            path: self.opts.work_dir.clone(),
            source,
        })?;

        let workers = self.opts.concurrency.max(1).min(total);
        let ctx = Arc::new(ScanContext {
            scan_id: scan_id.clone(),
            template: Arc::clone(&self.template),
            launcher: Arc::clone(&self.launcher),
            probe: Arc::clone(&self.probe),
            opts: self.opts.clone(),
            ports,
            queue: Mutex::new(candidates.into_iter().enumerate().collect()),
            results: Mutex::new(ResultSet::default()),
            fatal: Mutex::new(None),
            halted: AtomicBool::new(false),
            abort: abort.clone(),
            events: self.events.clone(),
        });

        info!(
            scan_id = %scan_id,
            total,
            workers,
            base_port = self.opts.base_port,
            target_url = %self.opts.target_url,
            "scan started"
        );
        let _ = self.events.send(ScanEvent::Started {
            scan_id: scan_id.clone(),
            total,
            workers,
        });

        let handles: Vec<_> = (0..workers)
            .map(|worker| tokio::spawn(run_worker(Arc::clone(&ctx), worker)))
            .collect();
        for res in join_all(handles).await {
            if let Err(join_err) = res {
                warn!(%join_err, "scan worker join error");
            }
        }

        if let Some(err) = ctx.fatal.lock().await.take() {
            error!(scan_id = %scan_id, error = %err, "scan aborted");
            return Err(err);
        }

        let results = std::mem::take(&mut *ctx.results.lock().await);
        let cancelled = ctx.queue.lock().await.len();
        let ranked = results.ranked();

        info!(
            scan_id = %scan_id,
            total,
            completed = results.len(),
            succeeded = ranked.len(),
            cancelled,
            "scan finished"
        );
        let _ = self.events.send(ScanEvent::Finished {
            scan_id: scan_id.clone(),
            succeeded: ranked.len(),
            cancelled,
        });

        Ok(ScanReport {
            scan_id,
            started_at,
            finished_at: Utc::now(),
            total,
            results,
            ranked,
            cancelled,
            aborted: abort.is_aborted(),
        })
    }
}

struct ScanContext {
    scan_id: String,
    template: Arc<BaseTemplate>,
    launcher: Arc<dyn ProxyLauncher>,
    probe: Arc<dyn ProbeClient>,
    opts: ScanOptions,
    ports: PortAllocator,
    queue: Mutex<VecDeque<(usize, Candidate)>>,
    results: Mutex<ResultSet>,
    fatal: Mutex<Option<ScanError>>,
    /// Set by the first fatal error; stops dispatch without interrupting.
    halted: AtomicBool,
    abort: AbortHandle,
    events: broadcast::Sender<ScanEvent>,
}

enum LifecycleEnd {
    Outcome(ProbeOutcome),
    Fatal {
        error: ScanError,
        outcome: Option<ProbeOutcome>,
    },
}

async fn run_worker(ctx: Arc<ScanContext>, worker: usize) {
    loop {
        let next = {
            let mut queue = ctx.queue.lock().await;
            if ctx.abort.is_aborted() || ctx.halted.load(Ordering::SeqCst) {
                debug!(worker, "dispatch stopped; worker exiting");
                break;
            }
            queue.pop_front()
        };
        let Some((index, candidate)) = next else {
            break;
        };
        let Some(port) = ctx.ports.port_for(index) else {
            break;
        };

        match run_lifecycle(&ctx, index, candidate, port).await {
            LifecycleEnd::Outcome(outcome) => record(&ctx, outcome).await,
            LifecycleEnd::Fatal { error, outcome } => {
                // Under the queue lock so no worker pops after this point.
                {
                    let _queue = ctx.queue.lock().await;
                    ctx.halted.store(true, Ordering::SeqCst);
                }
                if let Some(outcome) = outcome {
                    record(&ctx, outcome).await;
                }
                let mut fatal = ctx.fatal.lock().await;
                if fatal.is_none() {
                    *fatal = Some(error);
                }
                break;
            }
        }
    }
}

async fn record(ctx: &ScanContext, outcome: ProbeOutcome) {
    match outcome.status {
        ProbeStatus::Success => info!(
            candidate = %outcome.candidate,
            port = outcome.port,
            latency_ms = outcome.latency_ms,
            "candidate ok"
        ),
        status => debug!(
            candidate = %outcome.candidate,
            port = outcome.port,
            status = status.as_str(),
            error = outcome.error.as_deref().unwrap_or(""),
            "candidate failed"
        ),
    }

    let recorded = ctx.results.lock().await.record(outcome.clone());
    if recorded {
        let _ = ctx.events.send(ScanEvent::Outcome(outcome));
    } else {
        warn!(index = outcome.index, "duplicate outcome ignored");
    }
}

enum Driven {
    Probed(Result<u32, ProbeError>),
    NotReady,
    LaunchFailed(LaunchError),
    WriteFailed(String),
    Config(ConfigError),
    TimedOut,
    Interrupted,
}

async fn run_lifecycle(
    ctx: &ScanContext,
    index: usize,
    candidate: Candidate,
    port: u16,
) -> LifecycleEnd {
    let mut lifecycle = Lifecycle::new(ctx.opts.stop_timeout);
    let mut abort_rx = ctx.abort.subscribe();

    let driven = tokio::select! {
        biased;
        _ = wait_aborted(&mut abort_rx) => Driven::Interrupted,
        res = tokio::time::timeout(
            ctx.opts.lifecycle_timeout,
            drive(ctx, &mut lifecycle, &candidate, port),
        ) => res.unwrap_or(Driven::TimedOut),
    };

    let reached = lifecycle.state();
    let warnings = lifecycle.teardown().await;

    let outcome = |status: ProbeStatus, latency_ms: Option<u32>, error: Option<String>| {
        ProbeOutcome {
            index,
            candidate: candidate.clone(),
            port,
            status,
            latency_ms,
            error,
            warnings: warnings.clone(),
        }
    };

    match driven {
        Driven::Probed(Ok(latency_ms)) => {
            LifecycleEnd::Outcome(outcome(ProbeStatus::Success, Some(latency_ms), None))
        }
        Driven::Probed(Err(err)) => LifecycleEnd::Outcome(outcome(
            ProbeStatus::ProbeFailed,
            None,
            Some(err.to_string()),
        )),
        Driven::NotReady => LifecycleEnd::Outcome(outcome(
            ProbeStatus::ProcessFailedToStart,
            None,
            Some("proxy core not ready within grace period".to_string()),
        )),
        Driven::LaunchFailed(LaunchError::NotFound { program }) => LifecycleEnd::Fatal {
            error: ScanError::ProxyCoreNotFound { program },
            outcome: None,
        },
        Driven::LaunchFailed(err) => LifecycleEnd::Outcome(outcome(
            ProbeStatus::ProcessFailedToStart,
            None,
            Some(err.to_string()),
        )),
        Driven::WriteFailed(message) => LifecycleEnd::Outcome(outcome(
            ProbeStatus::ProcessFailedToStart,
            None,
            Some(message),
        )),
        Driven::Config(err) => {
            let message = err.to_string();
            LifecycleEnd::Fatal {
                error: ScanError::Config(err),
                outcome: Some(outcome(ProbeStatus::ConfigError, None, Some(message))),
            }
        }
        Driven::TimedOut => {
            let status = if reached == LifecycleState::ReadyProbing {
                ProbeStatus::ProbeFailed
            } else {
                ProbeStatus::ProcessFailedToStart
            };
            warn!(
                candidate = %candidate,
                port,
                state = reached.as_str(),
                "lifecycle timed out; proxy core force-stopped"
            );
            LifecycleEnd::Outcome(outcome(
                status,
                None,
                Some(format!(
                    "lifecycle timed out after {}s",
                    ctx.opts.lifecycle_timeout.as_secs()
                )),
            ))
        }
        Driven::Interrupted => {
            let status = if reached == LifecycleState::ReadyProbing {
                ProbeStatus::ProbeFailed
            } else {
                ProbeStatus::ProcessFailedToStart
            };
            debug!(candidate = %candidate, port, state = reached.as_str(), "lifecycle interrupted");
            LifecycleEnd::Outcome(outcome(status, None, Some("scan aborted".to_string())))
        }
    }
}

async fn drive(
    ctx: &ScanContext,
    lifecycle: &mut Lifecycle,
    candidate: &Candidate,
    port: u16,
) -> Driven {
    let artifact = match ctx
        .template
        .materialize(candidate, port, &ctx.opts.work_dir, &ctx.scan_id)
    {
        Ok(artifact) => artifact,
        Err(MaterializeError::Config(err)) => return Driven::Config(err),
        Err(err) => return Driven::WriteFailed(err.to_string()),
    };
    lifecycle.attach_artifact(artifact);

    match lifecycle.run(&ctx.launcher, ctx.opts.readiness).await {
        Ok(true) => {}
        Ok(false) => return Driven::NotReady,
        Err(err) => return Driven::LaunchFailed(err),
    }

    let proxy_url = local_socks_url(port);
    Driven::Probed(
        ctx.probe
            .probe(&proxy_url, &ctx.opts.target_url, ctx.opts.probe_timeout)
            .await,
    )
}

async fn wait_aborted(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|aborted| *aborted).await.is_err() {
        // Sender gone: nobody can abort any more.
        std::future::pending::<()>().await;
    }
}
