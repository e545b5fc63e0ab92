//! The `working_ips.txt`-style results artifact.
//!
//! One `IP: <candidate>, Ping: <latency_ms> ms` line per successful candidate.
//! The file is truncated when a scan starts, grows in completion order while it
//! runs, and is replaced with the ranked list once it finishes.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::scan::ProbeOutcome;

pub fn format_line(outcome: &ProbeOutcome) -> Option<String> {
    let latency_ms = outcome.latency_ms.filter(|_| outcome.is_success())?;
    Some(format!("IP: {}, Ping: {latency_ms} ms", outcome.candidate))
}

#[derive(Debug)]
pub struct ResultsFile {
    path: PathBuf,
}

impl ResultsFile {
    /// Creates (or truncates) the file.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line for a successful outcome; failures are ignored.
    pub fn append(&self, outcome: &ProbeOutcome) -> io::Result<()> {
        let Some(line) = format_line(outcome) else {
            return Ok(());
        };
        let mut file = fs::OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{line}")
    }

    pub fn write_ranked(&self, ranked: &[ProbeOutcome]) -> io::Result<()> {
        let mut content = String::new();
        for line in ranked.iter().filter_map(format_line) {
            content.push_str(&line);
            content.push('\n');
        }
        let tmp = tmp_path_next_to(&self.path);
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)
    }
}

fn tmp_path_next_to(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("results"));
    parent.join(format!(
        ".{}.tmp.{}",
        file.to_string_lossy(),
        std::process::id()
    ))
}
