use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::streamtunnel::tunnel::mux::MuxConfig;

pub const CONFIG_ENV: &str = "STREAMTUNNEL_CONFIG";
const CONFIG_CANDIDATES: [&str; 3] = ["streamtunnel.toml", "streamtunnel.yaml", "streamtunnel.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl ConfigPathSource {
    /// Paths named explicitly by the user must exist; discovered ones are optional.
    pub fn is_explicit(self) -> bool {
        matches!(self, ConfigPathSource::Flag | ConfigPathSource::Env)
    }
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps the env var into the flag already; this covers callers that skip clap.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join(CONFIG_CANDIDATES[0])));
        }
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/streamtunnel/streamtunnel.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("com", "koding", "streamtunnel")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join(CONFIG_CANDIDATES[0]))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_addr: String,
    pub identifier: String,
    pub local_addr: Option<String>,
    pub debug: bool,
    pub logging: LoggingConfig,
    pub mux: MuxConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            identifier: String::new(),
            local_addr: None,
            debug: false,
            logging: LoggingConfig::default(),
            mux: MuxConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

/// Values given on the command line; each one set wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server_addr: Option<String>,
    pub identifier: Option<String>,
    pub local_addr: Option<String>,
    pub debug: bool,
}

impl Config {
    pub fn apply(&mut self, o: &Overrides) {
        if let Some(v) = o.server_addr.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            self.server_addr = v.to_string();
        }
        if let Some(v) = o.identifier.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            self.identifier = v.to_string();
        }
        if let Some(v) = o.local_addr.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            self.local_addr = Some(v.to_string());
        }
        if o.debug {
            self.debug = true;
        }
        if self.debug {
            self.logging.level = "debug".into();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_addr.is_empty() {
            anyhow::bail!("config: server_addr is required");
        }
        if self.identifier.is_empty() {
            anyhow::bail!("config: identifier is required");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    server_addr: String,
    #[serde(default)]
    identifier: String,
    local_addr: Option<String>,
    #[serde(default)]
    debug: bool,
    logging: Option<FileLogging>,
    mux: Option<FileMux>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileMux {
    accept_backlog: Option<i64>,
    enable_keepalive: Option<bool>,
    keepalive_interval_ms: Option<i64>,
    connection_write_timeout_ms: Option<i64>,
    max_stream_count: Option<i64>,
    max_stream_window_size: Option<i64>,
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?} (expected .toml or .yaml/.yml)", ext),
    };

    Config::from_file_config(fc)
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            server_addr: fc.server_addr.trim().to_string(),
            identifier: fc.identifier.trim().to_string(),
            local_addr: fc
                .local_addr
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty()),
            debug: fc.debug,
            ..Config::default()
        };

        if let Some(l) = fc.logging {
            if let Some(v) = l.level {
                cfg.logging.level = v.trim().to_ascii_lowercase();
            }
            if let Some(v) = l.format {
                cfg.logging.format = v.trim().to_ascii_lowercase();
            }
            if let Some(v) = l.output {
                cfg.logging.output = v.trim().to_string();
            }
            cfg.logging.add_source = l.add_source;
        }
        if !matches!(cfg.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("config: logging.format must be text or json (got {:?})", cfg.logging.format);
        }

        if let Some(m) = fc.mux {
            let mux = &mut cfg.mux;
            if let Some(v) = m.accept_backlog {
                mux.accept_backlog = non_negative("mux.accept_backlog", v)? as usize;
            }
            if let Some(v) = m.enable_keepalive {
                mux.enable_keepalive = v;
            }
            if let Some(v) = m.keepalive_interval_ms {
                mux.keepalive_interval = Duration::from_millis(non_negative("mux.keepalive_interval_ms", v)?);
            }
            if let Some(v) = m.connection_write_timeout_ms {
                mux.connection_write_timeout =
                    Duration::from_millis(non_negative("mux.connection_write_timeout_ms", v)?);
            }
            if let Some(v) = m.max_stream_count {
                mux.max_stream_count = non_negative("mux.max_stream_count", v)? as usize;
            }
            if let Some(v) = m.max_stream_window_size {
                mux.max_stream_window_size = u32::try_from(v)
                    .with_context(|| format!("config: mux.max_stream_window_size out of range: {v}"))?;
            }
        }

        if cfg.debug {
            cfg.logging.level = "debug".into();
        }

        Ok(cfg)
    }
}

fn non_negative(key: &str, v: i64) -> anyhow::Result<u64> {
    u64::try_from(v).with_context(|| format!("config: {key} must not be negative (got {v})"))
}
