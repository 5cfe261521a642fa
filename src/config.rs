use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs, path::PathBuf};

use crate::error::PanelResult;
use crate::patcher::EndpointOverrides;
use crate::request::BatchLimits;
use crate::schedule::{FeedEntry, HttpScheduleSource, ScheduleSource, StaticScheduleSource};

/// Panel settings, loaded from `panel.json` with defaults for every field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Path to the PacketRusher executable.
    pub binary_path: PathBuf,
    /// Working directory for the simulator; defaults to the binary's directory.
    pub working_dir: Option<PathBuf>,
    /// Simulator YAML config; defaults to `<working_dir>/config/config.yml`.
    pub simulator_config: Option<PathBuf>,
    pub session_timeout_secs: u64,
    pub kill_grace_ms: u64,
    pub max_session_count: u32,
    pub max_ues_per_session: u32,
    pub log_capacity: usize,
    pub endpoints: EndpointOverrides,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// JSON feed of flight arrivals. Takes precedence over `entries`.
    pub feed_url: Option<String>,
    pub entries: Vec<FeedEntry>,
    /// UEs per trigger when an entry carries no size.
    pub default_session_size: u32,
    pub request_timeout_secs: u64,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            binary_path: env::var("PACKETRUSHER_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./packetrusher")),
            working_dir: None,
            simulator_config: env::var("PACKETRUSHER_CONFIG").ok().map(PathBuf::from),
            session_timeout_secs: 30,
            kill_grace_ms: 2000,
            max_session_count: 100,
            max_ues_per_session: 1000,
            log_capacity: crate::relay::DEFAULT_LOG_CAPACITY,
            endpoints: EndpointOverrides::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            feed_url: env::var("FLIGHT_FEED_URL").ok(),
            entries: Vec::new(),
            default_session_size: 1,
            request_timeout_secs: 10,
        }
    }
}

impl PanelConfig {
    /// Load from the resolved config path, or fall back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        match resolve_panel_config_path() {
            Some(path) => {
                tracing::info!("Loading panel config from {}", path.display());
                Self::load_from(&path)
            }
            None => {
                tracing::info!("No panel.json found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", path.display(), e))?;
        let cfg: PanelConfig = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid panel config {}: {}", path.display(), e))?;
        Ok(cfg.expanded())
    }

    /// Expand `${VAR}` references in path and address fields.
    fn expanded(mut self) -> Self {
        let expand_path = |p: &PathBuf| PathBuf::from(expand_env_vars(&p.to_string_lossy()));

        self.binary_path = expand_path(&self.binary_path);
        self.working_dir = self.working_dir.as_ref().map(expand_path);
        self.simulator_config = self.simulator_config.as_ref().map(expand_path);
        for ip in [
            &mut self.endpoints.gnb_control_ip,
            &mut self.endpoints.gnb_data_ip,
            &mut self.endpoints.amf_ip,
        ]
        .into_iter()
        .flatten()
        {
            *ip = expand_env_vars(ip);
        }
        if let Some(url) = self.schedule.feed_url.as_mut() {
            *url = expand_env_vars(url);
        }
        self
    }

    pub fn working_dir(&self) -> PathBuf {
        if let Some(dir) = &self.working_dir {
            return dir.clone();
        }
        match self.binary_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn simulator_config_path(&self) -> PathBuf {
        self.simulator_config
            .clone()
            .unwrap_or_else(|| self.working_dir().join("config").join("config.yml"))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn limits(&self) -> BatchLimits {
        BatchLimits {
            max_session_count: self.max_session_count,
            max_ues_per_session: self.max_ues_per_session,
        }
    }

    /// The schedule source this config describes.
    pub fn schedule_source(&self) -> PanelResult<Arc<dyn ScheduleSource>> {
        match &self.schedule.feed_url {
            Some(url) => Ok(Arc::new(HttpScheduleSource::new(
                url.clone(),
                Duration::from_secs(self.schedule.request_timeout_secs),
            )?)),
            None => Ok(Arc::new(StaticScheduleSource::new(
                self.schedule.entries.clone(),
            ))),
        }
    }
}

pub fn resolve_panel_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("PANEL_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg)
            .join("packetrusher-panel")
            .join("panel.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("panel.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}
