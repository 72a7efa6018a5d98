use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use config::{Config, Environment, File, Map};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

const ENV_PREFIX: &str = "NICOCACHE";
const LOCAL_SUFFIX: &str = "local";
const SEARCH_PATH: [&str; 2] = ["nicocache.toml", "/etc/nicocache/nicocache.toml"];

/// Written to the main config path on first start. Mirrors [`Settings::default`].
const DEFAULT_CONFIG: &str = r#"# nicocache configuration
listen = "127.0.0.1:8080"
# Relative paths are resolved against this file's directory.
cache_dir = "./cache/nico"
# "json" or "text"
log = "json"

# Seconds.
client_timeout = 30
upstream_connect_timeout = 5
upstream_timeout = 60

max_request_header_size = 32768
max_response_header_size = 32768
max_title_scan_bytes = 262144

# metrics_listen = "127.0.0.1:9090"
"#;

/// Runtime configuration. Timeouts are whole seconds; every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub listen: SocketAddr,
    /// Cache root. Relative paths are taken from the directory of the main config file.
    pub cache_dir: PathBuf,
    pub log: LogFormat,
    pub client_timeout: u64,
    pub upstream_connect_timeout: u64,
    pub upstream_timeout: u64,
    pub max_request_header_size: usize,
    pub max_response_header_size: usize,
    /// Upper bound on how much of a watch page is buffered while looking for its title.
    pub max_title_scan_bytes: usize,
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            cache_dir: PathBuf::from("./cache/nico"),
            log: LogFormat::Json,
            client_timeout: 30,
            upstream_connect_timeout: 5,
            upstream_timeout: 60,
            max_request_header_size: 32 * 1024,
            max_response_header_size: 32 * 1024,
            max_title_scan_bytes: 256 * 1024,
            metrics_listen: None,
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_with_env(cli, None)
    }

    /// Like [`Settings::load`], reading overrides from `env` instead of the process environment
    /// when given.
    pub fn load_with_env(cli: &Cli, env: Option<Map<String, String>>) -> Result<Self> {
        let main = main_config_path(cli);
        write_default_config(&main)?;
        let (local, local_required) = local_config_path(cli, &main);

        let mut settings: Settings = Config::builder()
            .add_source(File::from(main.as_path()).required(true))
            .add_source(File::from(local.as_path()).required(local_required))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|err| anyhow!("loading {}: {err}", main.display()))?;

        if settings.cache_dir.is_relative() {
            let base = main
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            settings.cache_dir = base.join(&settings.cache_dir);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            bail!("cache_dir must not be empty");
        }
        let positive = [
            ("client_timeout", self.client_timeout),
            ("upstream_connect_timeout", self.upstream_connect_timeout),
            ("upstream_timeout", self.upstream_timeout),
            ("max_request_header_size", self.max_request_header_size as u64),
            ("max_response_header_size", self.max_response_header_size as u64),
            ("max_title_scan_bytes", self.max_title_scan_bytes as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            bail!("{name} must be greater than zero");
        }
        if let Some(metrics) = self.metrics_listen
            && metrics == self.listen
            && metrics.port() != 0
        {
            bail!("metrics_listen must differ from listen ({metrics})");
        }
        Ok(())
    }
}

/// `--config`, else the first search path entry that exists, else the first search path entry.
fn main_config_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.config {
        return path.clone();
    }
    SEARCH_PATH
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(SEARCH_PATH[0]))
}

/// Creates `path` from [`DEFAULT_CONFIG`] when it does not exist yet.
fn write_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating config directory {}", dir.display()))?;
    }
    fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("writing default configuration to {}", path.display()))
}

/// The local override file and whether it must exist. An explicit `--local-config` is
/// mandatory; the derived `<stem>.local.<ext>` next to the main file is optional.
fn local_config_path(cli: &Cli, main: &Path) -> (PathBuf, bool) {
    if let Some(path) = &cli.local_config {
        return (path.clone(), true);
    }
    let stem = main.file_stem().and_then(|stem| stem.to_str()).unwrap_or("nicocache");
    let ext = main.extension().and_then(|ext| ext.to_str()).unwrap_or("toml");
    (main.with_file_name(format!("{stem}.{LOCAL_SUFFIX}.{ext}")), false)
}
