use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use wasmtime_wasi::p2::pipe::MemoryOutputPipe;

use crate::error::PgLiteError;

/// Where a guest output stream goes.
#[derive(Clone, Default)]
pub enum StdioSink {
    /// Forward to the host process's own stream.
    #[default]
    Inherit,
    /// Discard.
    Null,
    /// Buffer in memory; read back with [`MemoryOutputPipe::contents`].
    Capture(MemoryOutputPipe),
}

impl fmt::Debug for StdioSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inherit => f.write_str("Inherit"),
            Self::Null => f.write_str("Null"),
            Self::Capture(_) => f.write_str("Capture"),
        }
    }
}

/// Session settings.
///
/// Every `with_*` method consumes the value and returns a modified copy, so a
/// `Config` handed to [`crate::PgLite::start`] is never shared or mutated.
///
/// ```rust
/// use pglite_runtime::Config;
///
/// let cfg = Config::new()
///     .with_tmp_dir("/var/lib/pglite/tmp")
///     .with_user("app")
///     .with_database("app")
///     .with_listen(5433);
/// assert_eq!(cfg.listen_port(), Some(5433));
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    stdout: StdioSink,
    stderr: StdioSink,
    tmp_dir: PathBuf,
    dev_dir: PathBuf,
    user: String,
    database: String,
    listen: Option<SocketAddr>,
    cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            stdout: StdioSink::Inherit,
            stderr: StdioSink::Inherit,
            tmp_dir: PathBuf::from(default_tmp_dir()),
            dev_dir: PathBuf::from(default_dev_dir()),
            user: default_user(),
            database: default_database(),
            listen: None,
            cache_dir: None,
        }
    }

    /// Read a TOML config file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, PgLiteError> {
        let content = std::fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&content)
            .map_err(|e| PgLiteError::Config(format!("{}: {e}", path.display())))?;
        Ok(file.into_config())
    }

    pub fn with_stdout(mut self, sink: StdioSink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn with_stderr(mut self, sink: StdioSink) -> Self {
        self.stderr = sink;
        self
    }

    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    pub fn with_dev_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dir.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Enable the TCP front on `port`. Port 0 leaves the listener disabled.
    pub fn with_listen(mut self, port: u16) -> Self {
        if port == 0 {
            return self;
        }
        self.listen = Some(SocketAddr::from(([0, 0, 0, 0], port)));
        self
    }

    /// Bind the TCP front to exactly `addr`. Port 0 here asks the OS for a
    /// free port; read the result back from [`crate::PgLite::listen_addr`].
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    /// Cache compiled guest modules under `dir`, keyed by image hash.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn stdout(&self) -> &StdioSink {
        &self.stdout
    }

    pub fn stderr(&self) -> &StdioSink {
        &self.stderr
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn dev_dir(&self) -> &Path {
        &self.dev_dir
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.listen.map(|addr| addr.port())
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }
}

/// On-disk form of [`Config`].
///
/// ```toml
/// [guest]
/// user = "postgres"
/// database = "postgres"
/// quiet = false
///
/// [paths]
/// tmp_dir = "./tmp"
/// dev_dir = "./dev"
/// cache_dir = "/home/me/.cache/pglite"
///
/// [listen]
/// port = 5432
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub guest: GuestSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub listen: ListenSection,
}

#[derive(Debug, Deserialize)]
pub struct GuestSection {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_database")]
    pub database: String,
    /// Discard guest stdout/stderr instead of inheriting them.
    #[serde(default)]
    pub quiet: bool,
}

impl Default for GuestSection {
    fn default() -> Self {
        Self {
            user: default_user(),
            database: default_database(),
            quiet: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: String,
    #[serde(default = "default_dev_dir")]
    pub dev_dir: String,
    pub cache_dir: Option<String>,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            tmp_dir: default_tmp_dir(),
            dev_dir: default_dev_dir(),
            cache_dir: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListenSection {
    #[serde(default)]
    pub port: u16,
}

fn default_tmp_dir() -> String {
    "./tmp".into()
}
fn default_dev_dir() -> String {
    "./dev".into()
}
fn default_user() -> String {
    "postgres".into()
}
fn default_database() -> String {
    "postgres".into()
}

impl ConfigFile {
    pub fn into_config(self) -> Config {
        let mut cfg = Config::new()
            .with_tmp_dir(self.paths.tmp_dir)
            .with_dev_dir(self.paths.dev_dir)
            .with_user(self.guest.user)
            .with_database(self.guest.database)
            .with_listen(self.listen.port);
        if let Some(dir) = self.paths.cache_dir {
            cfg = cfg.with_cache_dir(dir);
        }
        if self.guest.quiet {
            cfg = cfg.with_stdout(StdioSink::Null).with_stderr(StdioSink::Null);
        }
        cfg
    }
}
