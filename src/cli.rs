use std::{io::Write, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::{
    candidates::{self, Candidate},
    config::{CheckArgs, Cli, Command, Config, ScanArgs},
    id::new_scan_id,
    probe::{HttpProbeClient, ProbeClient, local_socks_url},
    proxy_core::{CommandLauncher, LaunchError, Lifecycle, ProxyLauncher},
    results::ResultsFile,
    scan::{AbortHandle, ScanError, ScanEvent, ScanOptions, ScanReport, Scanner},
    template::{BaseTemplate, MaterializeError},
};

pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_CONFIG: i32 = 3;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug)]
pub struct ExitError {
    pub code: i32,
    pub message: String,
}

impl ExitError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ExitError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(EXIT_FAILURE, format!("error: {err:#}"))
    }
}

impl From<ScanError> for ExitError {
    fn from(err: ScanError) -> Self {
        let code = match &err {
            ScanError::Config(_) => EXIT_CONFIG,
            ScanError::PortRange(_) => EXIT_USAGE,
            ScanError::ProxyCoreNotFound { .. } | ScanError::WorkDir { .. } => EXIT_FAILURE,
        };
        Self::new(code, format!("scan aborted: {err}"))
    }
}

pub async fn run() -> i32 {
    let cli = Cli::parse();

    let res: Result<(), ExitError> = match cli.command {
        Some(Command::Scan(args)) => cmd_scan(cli.config, args).await,
        Some(Command::Check(args)) => cmd_check(cli.config, args).await,
        None => cmd_scan(cli.config, ScanArgs::default()).await,
    };

    match res {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}", e.message);
            e.code
        }
    }
}

fn load_template(config: &Config) -> Result<BaseTemplate, ExitError> {
    BaseTemplate::load(&config.template).map_err(|e| ExitError::new(EXIT_CONFIG, e.to_string()))
}

fn load_candidates(args: &ScanArgs) -> Result<Vec<Candidate>, ExitError> {
    let res = match (&args.cidr, &args.from_results) {
        (Some(cidr), _) => candidates::from_cidr(cidr),
        (None, Some(path)) => candidates::from_results_file(path),
        (None, None) => {
            return Err(ExitError::new(
                EXIT_USAGE,
                "no candidates: pass --cidr <CIDR> or --from-results <PATH>",
            ));
        }
    };
    res.map_err(|e| ExitError::new(EXIT_USAGE, e.to_string()))
}

pub async fn cmd_scan(config: Config, args: ScanArgs) -> Result<(), ExitError> {
    let candidates = load_candidates(&args)?;
    let template = Arc::new(load_template(&config)?);
    let results = Arc::new(
        ResultsFile::create(&config.results)
            .with_context(|| format!("create {}", config.results.display()))?,
    );

    let launcher: Arc<dyn ProxyLauncher> = Arc::new(CommandLauncher::xray(&config.xray_bin));
    let probe: Arc<dyn ProbeClient> = Arc::new(HttpProbeClient::default());
    let scanner = Scanner::new(template, launcher, probe, ScanOptions::from_config(&config))
        .with_event_capacity(candidates.len() + 2);

    let printer = tokio::spawn(print_progress(
        scanner.subscribe(),
        Arc::clone(&results),
        !args.json,
    ));

    let abort = AbortHandle::new();
    let ctrl_c = {
        let abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping scan");
                abort.abort();
            }
        })
    };

    let res = scanner.scan_with_abort(candidates, &abort).await;
    ctrl_c.abort();
    // Closes the event channel so the printer drains and exits.
    drop(scanner);
    if let Err(join_err) = printer.await {
        warn!(%join_err, "progress printer join error");
    }

    let report = res?;
    results
        .write_ranked(&report.ranked)
        .with_context(|| format!("write {}", results.path().display()))?;

    let top = config.top as usize;
    if args.json {
        let json = serde_json::to_string_pretty(&report.to_json(top))
            .context("serialize report")?;
        println!("{json}");
    } else {
        print_summary(&report, top);
    }

    if report.aborted {
        return Err(ExitError::new(EXIT_INTERRUPTED, "scan interrupted"));
    }
    Ok(())
}

async fn print_progress(
    mut rx: broadcast::Receiver<ScanEvent>,
    results: Arc<ResultsFile>,
    verbose: bool,
) {
    let mut total = 0;
    let mut done: u64 = 0;
    loop {
        match rx.recv().await {
            Ok(ScanEvent::Started {
                scan_id,
                total: n,
                workers,
            }) => {
                total = n;
                if verbose {
                    println!("scan {scan_id}: {n} candidates, {workers} workers");
                }
            }
            Ok(ScanEvent::Outcome(outcome)) => {
                done += 1;
                if let Err(err) = results.append(&outcome) {
                    warn!(path = %results.path().display(), error = %err, "append result failed");
                }
                if !verbose {
                    continue;
                }
                match outcome.latency_ms.filter(|_| outcome.is_success()) {
                    Some(ms) => println!("[{done}/{total}] {:<39} ok {ms} ms", outcome.candidate),
                    None => println!(
                        "[{done}/{total}] {:<39} {} {}",
                        outcome.candidate,
                        outcome.status.as_str(),
                        outcome.error.as_deref().unwrap_or("")
                    ),
                }
                let _ = std::io::stdout().flush();
            }
            Ok(ScanEvent::Finished { .. }) => {}
            Err(RecvError::Lagged(n)) => {
                done += n;
                warn!(
                    skipped = n,
                    "progress printer lagged; the results file is completed when the scan ends"
                );
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_summary(report: &ScanReport, top: usize) {
    println!();
    println!(
        "scan {}: {}/{} candidates ok, {} cancelled",
        report.scan_id,
        report.ranked.len(),
        report.total,
        report.cancelled
    );
    if report.ranked.is_empty() {
        println!("no working candidates");
        return;
    }
    println!("{:>3}  {:<39}  {:>10}", "#", "candidate", "latency");
    for (rank, outcome) in report.top(top).iter().enumerate() {
        let latency = outcome
            .latency_ms
            .map(|ms| format!("{ms} ms"))
            .unwrap_or_default();
        println!("{:>3}  {:<39}  {:>10}", rank + 1, outcome.candidate, latency);
    }
}

/// Runs the template against its own remote and probes each site through it.
pub async fn cmd_check(config: Config, args: CheckArgs) -> Result<(), ExitError> {
    let template = load_template(&config)?;
    let candidate = template
        .outbound_address()
        .map(Candidate::from)
        .map_err(|e| ExitError::new(EXIT_CONFIG, e.to_string()))?;
    let opts = ScanOptions::from_config(&config);
    let port = opts.base_port;

    std::fs::create_dir_all(&opts.work_dir)
        .with_context(|| format!("create {}", opts.work_dir.display()))?;
    let artifact = template
        .materialize(&candidate, port, &opts.work_dir, &new_scan_id())
        .map_err(|e| match e {
            MaterializeError::Config(err) => ExitError::new(EXIT_CONFIG, err.to_string()),
            other => ExitError::new(EXIT_FAILURE, other.to_string()),
        })?;

    let launcher: Arc<dyn ProxyLauncher> =
        Arc::new(CommandLauncher::xray(&config.xray_bin).capture_stderr());
    let probe = HttpProbeClient::default();
    let mut lifecycle = Lifecycle::new(opts.stop_timeout);
    lifecycle.attach_artifact(artifact);

    let res = tokio::select! {
        res = check_sites(&mut lifecycle, &launcher, &probe, &opts, &args.urls) => res,
        _ = tokio::signal::ctrl_c() => {
            Err(ExitError::new(EXIT_INTERRUPTED, "check interrupted"))
        }
    };

    for warning in lifecycle.teardown().await {
        eprintln!("warning: {warning}");
    }
    res
}

async fn check_sites(
    lifecycle: &mut Lifecycle,
    launcher: &Arc<dyn ProxyLauncher>,
    probe: &dyn ProbeClient,
    opts: &ScanOptions,
    urls: &[String],
) -> Result<(), ExitError> {
    let ready = lifecycle
        .run(launcher, opts.readiness)
        .await
        .map_err(|e: LaunchError| ExitError::new(EXIT_FAILURE, e.to_string()))?;
    if !ready {
        let mut message = format!(
            "proxy core did not become ready within {}s",
            opts.readiness.grace.as_secs()
        );
        match lifecycle.stderr_output().await {
            Some(stderr) if !stderr.trim().is_empty() => {
                message.push_str("; proxy core stderr:\n");
                message.push_str(stderr.trim_end());
            }
            _ => {}
        }
        return Err(ExitError::new(EXIT_FAILURE, message));
    }

    let proxy_url = local_socks_url(lifecycle.artifact().map_or(opts.base_port, |a| a.port));
    info!(proxy_url = %proxy_url, sites = urls.len(), "proxy core ready; checking sites");

    let mut ok = 0;
    for url in urls {
        match probe.probe(&proxy_url, url, opts.probe_timeout).await {
            Ok(ms) => {
                ok += 1;
                println!("{url:<40} ok {ms} ms");
            }
            Err(err) => println!("{url:<40} failed {err}"),
        }
    }

    if ok == 0 {
        return Err(ExitError::new(
            EXIT_FAILURE,
            format!("none of {} sites reachable through the proxy", urls.len()),
        ));
    }
    Ok(())
}
