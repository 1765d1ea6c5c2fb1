//! Turning a submission into CLI input: session keys, MCP flags, saved
//! commands and attachments.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use genrelay_core::config::{McpServerConfig, McpTransport};
use regex::Regex;
use serde_json::json;
use tracing::{debug, warn};

use crate::storage::{DatabaseError, TranscriptStore};

/// Tool that needs an interactive answer, which headless runs cannot give.
pub const INTERACTIVE_TOOL: &str = "AskUserQuestion";

#[allow(clippy::expect_used)]
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid session name regex"));

#[allow(clippy::expect_used)]
static FILE_PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{file:([a-zA-Z0-9._-]+)\}\}").expect("valid file placeholder regex")
});

#[allow(clippy::expect_used)]
static COMMAND_PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{cmd:([a-zA-Z0-9_-]+)\}\}").expect("valid command placeholder regex")
});

/// Session names become directory names, so only a safe charset is allowed.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Relay-wide session id of a named session in a mode.
pub fn session_key(mode: &str, name: &str) -> String {
    format!("{mode}_{name}")
}

/// `--mcp-config` documents and the tools to disallow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct McpFlags {
    pub configs: Vec<String>,
    pub disallowed_tools: Vec<String>,
}

/// Build MCP flags for `mode`.
///
/// Every known tool of an offered server that the user did not enable is
/// disallowed, as is the interactive question tool.
pub fn mcp_flags(
    servers: &BTreeMap<String, McpServerConfig>,
    mode: &str,
    enabled_tools: &[String],
) -> McpFlags {
    let mut flags = McpFlags::default();

    for (name, server) in servers.iter().filter(|(_, s)| s.serves_mode(mode)) {
        let entry = match &server.transport {
            McpTransport::Sse { url } => json!({"type": "sse", "url": url}),
            McpTransport::Stdio { command, args } => {
                json!({"type": "stdio", "command": command, "args": args})
            }
        };
        flags
            .configs
            .push(json!({"mcpServers": {name.as_str(): entry}}).to_string());

        flags.disallowed_tools.extend(
            server
                .tools
                .iter()
                .filter(|tool| !enabled_tools.iter().any(|e| e == *tool))
                .map(|tool| format!("mcp__{name}__{tool}")),
        );
    }

    flags.disallowed_tools.push(INTERACTIVE_TOOL.to_string());
    flags
}

/// Replace `{{cmd:name}}` placeholders with saved command content.
///
/// Unknown names stay as written. Inserted content is not expanded again.
pub async fn expand_commands(
    text: &str,
    store: &dyn TranscriptStore,
) -> Result<String, DatabaseError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in COMMAND_PLACEHOLDER_RE.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&text[last..whole.start()]);
        last = whole.end();
        match store.command(name.as_str()).await? {
            Some(content) => out.push_str(&content),
            None => {
                debug!(command = name.as_str(), "Unknown command placeholder");
                out.push_str(whole.as_str());
            }
        }
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Plain file name without path components.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && Path::new(name).file_name().is_some_and(|f| f == name)
}

/// Replace `{{file:short}}` placeholders with attachment notes.
///
/// Each referenced upload is moved from `uploads_dir` to `attachments_dir`.
pub async fn substitute_files(
    text: &str,
    substitutions: &[(String, String)],
    uploads_dir: &Path,
    attachments_dir: &Path,
) -> String {
    if !FILE_PLACEHOLDER_RE.is_match(text) {
        return text.to_string();
    }
    if let Err(e) = tokio::fs::create_dir_all(attachments_dir).await {
        warn!(dir = %attachments_dir.display(), error = %e, "Cannot create attachments dir");
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in FILE_PLACEHOLDER_RE.captures_iter(text) {
        let (Some(whole), Some(short)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&text[last..whole.start()]);
        last = whole.end();

        let short = short.as_str();
        let saved = substitutions
            .iter()
            .find(|(s, _)| s == short)
            .map_or(short, |(_, saved)| saved.as_str());
        out.push_str(&attach(short, saved, uploads_dir, attachments_dir).await);
    }
    out.push_str(&text[last..]);
    out
}

async fn attach(short: &str, saved: &str, uploads_dir: &Path, attachments_dir: &Path) -> String {
    let source = uploads_dir.join(saved);
    if !is_plain_file_name(saved) || !tokio::fs::try_exists(&source).await.unwrap_or(false) {
        return format!("[Attachment not found: {short}]");
    }

    let dest: PathBuf = attachments_dir.join(saved);
    match tokio::fs::copy(&source, &dest).await {
        Ok(_) => {
            if let Err(e) = tokio::fs::remove_file(&source).await {
                debug!(path = %source.display(), error = %e, "Upload not removed after copy");
            }
            format!("\n[Attachment: {}]\n", dest.display())
        }
        Err(e) => format!("[File transfer failed: {e}]"),
    }
}
