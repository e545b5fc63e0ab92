use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde_json::Value;

use crate::candidates::Candidate;

/// The template is structurally unusable: one of the fields every lifecycle
/// rewrites is missing. This aborts the whole scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub field: &'static str,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template is missing `{}`", self.field)
    }
}

impl std::error::Error for ConfigError {}

const OUTBOUND_ADDRESS_FIELD: &str =
    "outbounds[0].settings.vnext[0].address | outbounds[0].settings.servers[0].address";
const INBOUND_PORT_FIELD: &str = "inbounds[0].port";

#[derive(Debug)]
pub enum TemplateError {
    Read { path: String, source: std::io::Error },
    Parse { path: String, source: serde_json::Error },
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "read template {path}: {source}"),
            Self::Parse { path, source } => write!(f, "parse template {path}: {source}"),
        }
    }
}

impl std::error::Error for TemplateError {}

#[derive(Debug)]
pub enum MaterializeError {
    Config(ConfigError),
    Write { path: PathBuf, source: std::io::Error },
}

impl fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Write { path, source } => {
                write!(f, "write config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for MaterializeError {}

impl From<ConfigError> for MaterializeError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

/// A per-lifecycle config file. Deleted by the lifecycle's teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    pub path: PathBuf,
    pub port: u16,
}

/// Read-only base Xray config. Every lifecycle renders its own deep copy.
#[derive(Debug, Clone)]
pub struct BaseTemplate {
    root: Value,
}

impl BaseTemplate {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let bytes = std::fs::read(path).map_err(|source| TemplateError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let root = serde_json::from_slice(&bytes).map_err(|source| TemplateError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    /// The remote address the template currently points at.
    pub fn outbound_address(&self) -> Result<&str, ConfigError> {
        let settings = self
            .root
            .pointer("/outbounds/0/settings")
            .ok_or(ConfigError {
                field: OUTBOUND_ADDRESS_FIELD,
            })?;
        ["/vnext/0/address", "/servers/0/address"]
            .iter()
            .find_map(|p| settings.pointer(p).and_then(Value::as_str))
            .ok_or(ConfigError {
                field: OUTBOUND_ADDRESS_FIELD,
            })
    }

    /// Copy of the template with the outbound remote and inbound port replaced.
    pub fn render(&self, candidate: &Candidate, port: u16) -> Result<Value, ConfigError> {
        let mut config = self.root.clone();

        let settings = config
            .pointer_mut("/outbounds/0/settings")
            .ok_or(ConfigError {
                field: OUTBOUND_ADDRESS_FIELD,
            })?;
        let address = if settings.pointer("/vnext/0/address").is_some() {
            settings.pointer_mut("/vnext/0/address")
        } else {
            settings.pointer_mut("/servers/0/address")
        };
        let address = address.ok_or(ConfigError {
            field: OUTBOUND_ADDRESS_FIELD,
        })?;
        *address = Value::String(candidate.as_str().to_string());

        let inbound_port = config.pointer_mut("/inbounds/0/port").ok_or(ConfigError {
            field: INBOUND_PORT_FIELD,
        })?;
        *inbound_port = Value::from(port);

        Ok(config)
    }

    /// Renders the config for one lifecycle and writes it to
    /// `<dir>/xscan-<scan_id>-<port>.json`.
    pub fn materialize(
        &self,
        candidate: &Candidate,
        port: u16,
        dir: &Path,
        scan_id: &str,
    ) -> Result<ConfigArtifact, MaterializeError> {
        let config = self.render(candidate, port)?;
        let path = artifact_path(dir, scan_id, port);
        let bytes = serde_json::to_vec_pretty(&config).map_err(|e| MaterializeError::Write {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        write_private_file(&path, &bytes).map_err(|source| MaterializeError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(ConfigArtifact { path, port })
    }
}

pub fn artifact_path(dir: &Path, scan_id: &str, port: u16) -> PathBuf {
    dir.join(format!("xscan-{scan_id}-{port}.json"))
}

fn write_private_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(bytes)?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        file.write_all(bytes)
    }
}
