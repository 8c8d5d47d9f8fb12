//! Layered configuration for OmniGen.
//!
//! Values are resolved file → environment → CLI. The file is
//! `omnigen.toml` in the working directory unless `--config` points
//! elsewhere; a missing file means defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3000
//! public_dir = "public"
//! dev_mode = false
//! open_browser = false
//!
//! [worker]
//! program = "python3"
//! args = ["-u", "generator.py"]
//! artifact_dir = "."
//!
//! [job]
//! poll_interval_ms = 500
//! diagnostic_policy = "forward"
//! replay_state_on_connect = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::job::controller::DiagnosticPolicy;
use crate::job::poller::DEFAULT_POLL_INTERVAL;

pub const DEFAULT_CONFIG_FILE: &str = "omnigen.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Directory holding the static UI. Not served when absent.
    pub public_dir: PathBuf,
    /// Permissive CORS and bind on all interfaces.
    pub dev_mode: bool,
    pub open_browser: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            public_dir: PathBuf::from("public"),
            dev_mode: false,
            open_browser: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub program: String,
    /// Arguments placed before `--charset/--min/--max`.
    pub args: Vec<String>,
    /// Worker working directory; the artifacts are written here.
    pub artifact_dir: PathBuf,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-u".to_string(), "generator.py".to_string()],
            artifact_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSection {
    pub poll_interval_ms: u64,
    pub diagnostic_policy: DiagnosticPolicy,
    pub replay_state_on_connect: bool,
}

impl Default for JobSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            diagnostic_policy: DiagnosticPolicy::Forward,
            replay_state_on_connect: false,
        }
    }
}

/// The complete omnigen.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub job: JobSection,
}

/// Overrides taken from the command line. `None` leaves the value alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub worker_cmd: Option<String>,
    pub artifact_dir: Option<PathBuf>,
    pub public_dir: Option<PathBuf>,
    pub dev_mode: bool,
    pub open_browser: bool,
}

impl Settings {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse omnigen.toml")
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize omnigen.toml")
    }

    /// Full resolution: file, then environment, then CLI.
    pub fn resolve(path: &Path, cli: &CliOverrides) -> Result<Self> {
        let mut settings = Self::load_or_default(path)?;
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.apply_cli(cli);
        Ok(settings)
    }

    /// Apply `OMNIGEN_*` overrides. `lookup` abstracts the environment for tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("OMNIGEN_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid OMNIGEN_PORT '{}'", port))?;
        }
        if let Some(cmd) = lookup("OMNIGEN_WORKER_CMD") {
            self.set_worker_command(&cmd);
        }
        if let Some(dir) = lookup("OMNIGEN_ARTIFACT_DIR") {
            self.worker.artifact_dir = PathBuf::from(dir);
        }
        if let Some(policy) = lookup("OMNIGEN_DIAGNOSTIC_POLICY") {
            self.job.diagnostic_policy = policy.parse()?;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(ref host) = cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(ref cmd) = cli.worker_cmd {
            self.set_worker_command(cmd);
        }
        if let Some(ref dir) = cli.artifact_dir {
            self.worker.artifact_dir = dir.clone();
        }
        if let Some(ref dir) = cli.public_dir {
            self.server.public_dir = dir.clone();
        }
        if cli.dev_mode {
            self.server.dev_mode = true;
        }
        if cli.open_browser {
            self.server.open_browser = true;
        }
    }

    /// Replace program and prefix args from a whitespace-separated command line.
    fn set_worker_command(&mut self, cmd: &str) {
        let mut parts = cmd.split_whitespace().map(str::to_string);
        if let Some(program) = parts.next() {
            self.worker.program = program;
            self.worker.args = parts.collect();
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.job.poll_interval_ms)
    }

    pub fn bind_addr(&self) -> String {
        let host = if self.server.dev_mode {
            "0.0.0.0"
        } else {
            self.server.host.as_str()
        };
        format!("{}:{}", host, self.server.port)
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.job.poll_interval_ms == 0 {
            warnings.push("job.poll_interval_ms is 0; sizes will be sampled as fast as possible".into());
        }
        if self.worker.program.trim().is_empty() {
            warnings.push("worker.program is empty; every start will fail".into());
        }
        if !self.worker.artifact_dir.is_dir() {
            warnings.push(format!(
                "worker.artifact_dir '{}' does not exist",
                self.worker.artifact_dir.display()
            ));
        }
        if !self.server.public_dir.is_dir() {
            warnings.push(format!(
                "server.public_dir '{}' does not exist; no UI will be served",
                self.server.public_dir.display()
            ));
        }
        warnings
    }
}
