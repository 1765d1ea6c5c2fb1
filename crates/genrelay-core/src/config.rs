//! Configuration resolution for genrelay.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/genrelay/settings.json)
//! 3. Project config (.genrelay/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binaries)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete genrelay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default = "default_modes")]
    pub modes: BTreeMap<String, ModeConfig>,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            sessions: SessionConfig::default(),
            modes: default_modes(),
            mcp_servers: BTreeMap::new(),
        }
    }
}

/// Relay daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    /// Maximum generations running at once across all sessions.
    pub max_generations: usize,
    /// Inactivity lease of a session lock before it may be reclaimed.
    pub lock_lease_secs: u64,
    /// How long a submission waits for a busy session (0 = fail fast).
    pub lock_wait_ms: u64,
    /// How long terminal responses stay queryable.
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Grace period between SIGINT and kill when stopping a process.
    pub terminate_timeout_secs: u64,
    pub claude_bin: PathBuf,
    /// Pass `--dangerously-skip-permissions` (headless runs cannot answer prompts).
    pub skip_permissions: bool,
    /// Pre-approved tools when `skip_permissions` is off.
    pub allowed_tools: Vec<String>,
    /// Ask the process for partial text deltas.
    pub partial_messages: bool,
    pub database_path: Option<PathBuf>,
    pub uploads_dir: Option<PathBuf>,
    pub attachments_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8765)),
            max_generations: 8,
            lock_lease_secs: 120,
            lock_wait_ms: 0,
            retention_secs: 600,
            sweep_interval_secs: 30,
            terminate_timeout_secs: 5,
            claude_bin: PathBuf::from("claude"),
            skip_permissions: true,
            allowed_tools: Vec::new(),
            partial_messages: false,
            database_path: None,
            uploads_dir: None,
            attachments_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    pub const fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub const fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub const fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.uploads_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("uploads"))
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.attachments_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("attachments"))
    }
}

/// Session default configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_model: String,
    pub allowed_models: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_model: "sonnet".to_string(),
            allowed_models: vec!["haiku".into(), "sonnet".into(), "opus".into()],
        }
    }
}

impl SessionConfig {
    /// Requested model if allowed, otherwise the default model.
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|m| self.allowed_models.iter().any(|a| a == m))
            .map_or_else(|| self.default_model.clone(), String::from)
    }
}

/// Per-mode generation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Base working directory for the mode.
    pub work_dir: PathBuf,
    /// Run each session in `<work_dir>/<name>` instead of `work_dir`.
    #[serde(default)]
    pub per_session_dir: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Restrict built-in tools (`--tools`).
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

impl ModeConfig {
    /// Working directory for a session of this mode.
    pub fn session_dir(&self, name: &str) -> PathBuf {
        if self.per_session_dir {
            self.work_dir.join(name)
        } else {
            self.work_dir.clone()
        }
    }
}

/// An MCP server offered to the external process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(flatten)]
    pub transport: McpTransport,
    /// Modes this server is offered in (empty = all).
    #[serde(default)]
    pub modes: Vec<String>,
    /// Tool names the server exposes.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl McpServerConfig {
    pub fn serves_mode(&self, mode: &str) -> bool {
        self.modes.is_empty() || self.modes.iter().any(|m| m == mode)
    }
}

/// MCP transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpTransport {
    Sse {
        url: String,
    },
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_modes() -> BTreeMap<String, ModeConfig> {
    let base = data_dir();
    let mut modes = BTreeMap::new();
    modes.insert(
        "chat".to_string(),
        ModeConfig {
            work_dir: base.join("chat"),
            per_session_dir: false,
            system_prompt: None,
            tools: None,
        },
    );
    modes.insert(
        "code".to_string(),
        ModeConfig {
            work_dir: base.join("workspace"),
            per_session_dir: true,
            system_prompt: None,
            tools: None,
        },
    );
    modes.insert(
        "paper".to_string(),
        ModeConfig {
            work_dir: base.join("papers"),
            per_session_dir: true,
            system_prompt: None,
            tools: None,
        },
    );
    modes
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".genrelay").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

fn config_home() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_home().map(|p| p.join("genrelay").join("settings.json"))
}

/// Default database path for the transcript store.
pub fn database_path() -> Option<PathBuf> {
    config_home().map(|p| p.join("genrelay").join("transcripts.db"))
}

/// Base directory for working directories, uploads and attachments.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".local").join("share"))
        })
        .unwrap_or_else(std::env::temp_dir)
        .join("genrelay")
}

/// Read a single JSON settings file.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    let previous = std::mem::replace(&mut base.relay, overlay.relay);
    if base.relay.database_path.is_none() {
        base.relay.database_path = previous.database_path;
    }
    if base.relay.uploads_dir.is_none() {
        base.relay.uploads_dir = previous.uploads_dir;
    }
    if base.relay.attachments_dir.is_none() {
        base.relay.attachments_dir = previous.attachments_dir;
    }

    base.sessions = overlay.sessions;
    base.modes.extend(overlay.modes);
    base.mcp_servers.extend(overlay.mcp_servers);
}

fn parse_into<T: std::str::FromStr>(value: Option<String>, slot: &mut T) {
    if let Some(parsed) = value.and_then(|v| v.parse().ok()) {
        *slot = parsed;
    }
}

/// Apply `GENRELAY_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let relay = &mut config.relay;
    parse_into(lookup("GENRELAY_ADDR"), &mut relay.addr);
    parse_into(lookup("GENRELAY_MAX_GENERATIONS"), &mut relay.max_generations);
    parse_into(lookup("GENRELAY_LOCK_LEASE_SECS"), &mut relay.lock_lease_secs);
    parse_into(lookup("GENRELAY_RETENTION_SECS"), &mut relay.retention_secs);
    if let Some(val) = lookup("GENRELAY_CLAUDE_BIN") {
        relay.claude_bin = PathBuf::from(val);
    }
    if let Some(val) = lookup("GENRELAY_DB_PATH") {
        relay.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("GENRELAY_UPLOADS_DIR") {
        relay.uploads_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("GENRELAY_ATTACHMENTS_DIR") {
        relay.attachments_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("GENRELAY_LOG_LEVEL") {
        relay.log_level = val;
    }
    if let Some(val) = lookup("GENRELAY_DEFAULT_MODEL") {
        config.sessions.default_model = val;
    }

    for (mode, var) in [
        ("chat", "GENRELAY_CHAT_DIR"),
        ("code", "GENRELAY_WORKSPACE_DIR"),
        ("paper", "GENRELAY_PAPERS_DIR"),
    ] {
        if let Some(dir) = lookup(var)
            && let Some(mode_config) = config.modes.get_mut(mode)
        {
            mode_config.work_dir = PathBuf::from(dir);
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_relay_timeouts() {
        let config = Config::default();
        assert_eq!(config.relay.lock_lease(), Duration::from_secs(120));
        assert_eq!(config.relay.retention(), Duration::from_secs(600));
        assert_eq!(config.relay.lock_wait(), Duration::ZERO);
        assert!(config.modes.contains_key("chat"));
        assert!(config.modes["code"].per_session_dir);
    }

    #[test]
    fn resolve_model_falls_back_to_default() {
        let sessions = SessionConfig::default();
        assert_eq!(sessions.resolve_model(Some("opus")), "opus");
        assert_eq!(sessions.resolve_model(Some("gpt-4")), "sonnet");
        assert_eq!(sessions.resolve_model(None), "sonnet");
    }

    #[test]
    fn session_dir_per_mode() {
        let config = Config::default();
        let chat = &config.modes["chat"];
        let code = &config.modes["code"];
        assert_eq!(chat.session_dir("x"), chat.work_dir);
        assert_eq!(code.session_dir("proj"), code.work_dir.join("proj"));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("GENRELAY_MAX_GENERATIONS", "3"),
            ("GENRELAY_CLAUDE_BIN", "/opt/claude"),
            ("GENRELAY_WORKSPACE_DIR", "/srv/ws"),
            ("GENRELAY_RETENTION_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string));

        assert_eq!(config.relay.max_generations, 3);
        assert_eq!(config.relay.claude_bin, PathBuf::from("/opt/claude"));
        assert_eq!(config.modes["code"].work_dir, PathBuf::from("/srv/ws"));
        assert_eq!(config.relay.retention_secs, 600);
    }

    #[test]
    fn config_file_with_mcp_servers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "relay": {"max_generations": 2},
                "mcp_servers": {
                    "search": {"type": "sse", "url": "http://localhost:9000/sse", "tools": ["web_search"]},
                    "fs": {"type": "stdio", "command": "mcp-fs", "modes": ["code"]}
                }
            }"#,
        )
        .unwrap();

        let loaded = load_config_file(&path).unwrap();
        assert_eq!(loaded.relay.max_generations, 2);
        assert_eq!(loaded.relay.retention_secs, 600);
        assert!(loaded.modes.contains_key("paper"));
        let fs = &loaded.mcp_servers["fs"];
        assert!(fs.serves_mode("code"));
        assert!(!fs.serves_mode("chat"));
        assert!(matches!(
            loaded.mcp_servers["search"].transport,
            McpTransport::Sse { ref url } if url.ends_with("/sse")
        ));
    }

    #[test]
    fn merge_keeps_earlier_paths() {
        let mut base = Config::default();
        base.relay.database_path = Some(PathBuf::from("/data/t.db"));
        let mut overlay = Config::default();
        overlay.relay.max_generations = 1;
        merge_config(&mut base, overlay);
        assert_eq!(base.relay.max_generations, 1);
        assert_eq!(base.relay.database_path, Some(PathBuf::from("/data/t.db")));
    }

    #[test]
    fn invalid_config_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }
}
