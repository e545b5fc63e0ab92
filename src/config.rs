use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessMode {
    /// Sleep for the whole grace period, then check the process is still alive.
    Sleep,
    /// Poll the local SOCKS port until it accepts or the grace period runs out.
    Connect,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "xscan",
    about = "Scan candidate endpoints through short-lived Xray instances",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Probe every candidate through its own Xray instance (default).
    Scan(ScanArgs),

    /// Run the template once as-is and probe a list of sites through it.
    Check(CheckArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ScanArgs {
    /// Scan the usable host addresses of this network.
    #[arg(long, value_name = "CIDR", env = "XSCAN_CIDR", conflicts_with = "from_results")]
    pub cidr: Option<String>,

    /// Re-scan the addresses listed in a previous results file.
    #[arg(long, value_name = "PATH")]
    pub from_results: Option<PathBuf>,

    /// Print the final report as JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    /// Site to probe; may be repeated.
    #[arg(
        long = "url",
        value_name = "URL",
        default_values_t = [
            "https://www.google.com".to_string(),
            "https://www.youtube.com".to_string(),
            "https://www.x.com".to_string(),
        ]
    )]
    pub urls: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "XSCAN_TEMPLATE",
        value_name = "PATH",
        default_value = "config.json"
    )]
    pub template: PathBuf,

    #[arg(
        long = "xray-bin",
        global = true,
        env = "XSCAN_XRAY_BIN",
        value_name = "PATH",
        default_value = "xray"
    )]
    pub xray_bin: PathBuf,

    #[arg(
        long = "target-url",
        global = true,
        env = "XSCAN_TARGET_URL",
        value_name = "URL",
        default_value = "https://www.youtube.com"
    )]
    pub target_url: String,

    #[arg(
        long,
        global = true,
        env = "XSCAN_CONCURRENCY",
        value_name = "N",
        default_value_t = 8,
        value_parser = clap::value_parser!(u64).range(1..=256)
    )]
    pub concurrency: u64,

    #[arg(
        long = "base-port",
        global = true,
        env = "XSCAN_BASE_PORT",
        value_name = "PORT",
        default_value_t = 10808,
        value_parser = clap::value_parser!(u16).range(1024..)
    )]
    pub base_port: u16,

    #[arg(
        long = "startup-grace-secs",
        global = true,
        env = "XSCAN_STARTUP_GRACE_SECS",
        value_name = "SECS",
        default_value_t = 4,
        value_parser = clap::value_parser!(u64).range(1..=60)
    )]
    pub startup_grace_secs: u64,

    #[arg(
        long,
        global = true,
        env = "XSCAN_READINESS",
        value_name = "MODE",
        default_value = "connect",
        value_enum
    )]
    pub readiness: ReadinessMode,

    #[arg(
        long = "probe-timeout-secs",
        global = true,
        env = "XSCAN_PROBE_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..=120)
    )]
    pub probe_timeout_secs: u64,

    #[arg(
        long = "stop-timeout-secs",
        global = true,
        env = "XSCAN_STOP_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 3,
        value_parser = clap::value_parser!(u64).range(1..=30)
    )]
    pub stop_timeout_secs: u64,

    #[arg(
        long = "lifecycle-timeout-secs",
        global = true,
        env = "XSCAN_LIFECYCLE_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(5..=600)
    )]
    pub lifecycle_timeout_secs: u64,

    #[arg(
        long,
        global = true,
        env = "XSCAN_RESULTS",
        value_name = "PATH",
        default_value = "working_ips.txt"
    )]
    pub results: PathBuf,

    /// Directory for per-candidate config files (defaults to the system temp dir).
    #[arg(long = "work-dir", global = true, env = "XSCAN_WORK_DIR", value_name = "PATH")]
    pub work_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "XSCAN_TOP",
        value_name = "N",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=100)
    )]
    pub top: u64,
}

impl Config {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["xscan"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config.template, PathBuf::from("config.json"));
        assert_eq!(cli.config.xray_bin, PathBuf::from("xray"));
        assert_eq!(cli.config.target_url, "https://www.youtube.com");
        assert_eq!(cli.config.concurrency, 8);
        assert_eq!(cli.config.base_port, 10808);
        assert_eq!(cli.config.startup_grace_secs, 4);
        assert_eq!(cli.config.readiness, ReadinessMode::Connect);
        assert_eq!(cli.config.probe_timeout_secs, 10);
        assert_eq!(cli.config.stop_timeout_secs, 3);
        assert_eq!(cli.config.lifecycle_timeout_secs, 60);
        assert_eq!(cli.config.results, PathBuf::from("working_ips.txt"));
        assert_eq!(cli.config.work_dir, None);
        assert_eq!(cli.config.top, 5);
    }

    #[test]
    fn scan_args_parse_cidr() {
        let cli = Cli::try_parse_from(["xscan", "scan", "--cidr", "173.245.48.0/20"]).unwrap();
        let Some(Command::Scan(args)) = cli.command else {
            panic!("expected scan command");
        };
        assert_eq!(args.cidr.as_deref(), Some("173.245.48.0/20"));
        assert!(args.from_results.is_none());
    }

    #[test]
    fn scan_rejects_both_candidate_sources() {
        let err = Cli::try_parse_from([
            "xscan",
            "scan",
            "--cidr",
            "10.0.0.0/30",
            "--from-results",
            "working_ips.txt",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("--from-results"));
    }

    #[test]
    fn check_has_default_sites() {
        let cli = Cli::try_parse_from(["xscan", "check"]).unwrap();
        let Some(Command::Check(args)) = cli.command else {
            panic!("expected check command");
        };
        assert_eq!(args.urls.len(), 3);
        assert_eq!(args.urls[1], "https://www.youtube.com");
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "xscan",
            "scan",
            "--concurrency",
            "2",
            "--readiness",
            "sleep",
        ])
        .unwrap();
        assert_eq!(cli.config.concurrency, 2);
        assert_eq!(cli.config.readiness, ReadinessMode::Sleep);
    }

    #[test]
    fn rejects_invalid_concurrency() {
        let err = Cli::try_parse_from(["xscan", "--concurrency", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--concurrency"));
        assert!(msg.contains("1..=256"));
    }

    #[test]
    fn rejects_privileged_base_port() {
        let err = Cli::try_parse_from(["xscan", "--base-port", "80"]).unwrap_err();
        assert!(err.to_string().contains("--base-port"));
    }

    #[test]
    fn rejects_invalid_startup_grace_secs() {
        let err = Cli::try_parse_from(["xscan", "--startup-grace-secs", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--startup-grace-secs"));
        assert!(msg.contains("1..=60"));
    }

    #[test]
    fn rejects_invalid_lifecycle_timeout_secs() {
        let err = Cli::try_parse_from(["xscan", "--lifecycle-timeout-secs", "1"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--lifecycle-timeout-secs"));
        assert!(msg.contains("5..=600"));
    }
}
