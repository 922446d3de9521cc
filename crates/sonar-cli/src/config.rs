//! Node configuration – reads `~/.sonar_relay/config.toml`.
//!
//! The file is optional.  Without it every field takes its default, which
//! reproduces the stock `sonar_wb_poster` node.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Node name, used as the tracing service name.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Sonar channels are `<channel_prefix><index>`.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Per-channel subscription queue length.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// WebSocket URL of the robot's `rosbridge_server`.
    #[serde(default = "default_rosbridge_url")]
    pub rosbridge_url: String,

    /// Port of the whiteboard WebSocket server; 0 disables it.
    #[serde(default = "default_whiteboard_port")]
    pub whiteboard_port: u16,
}

fn default_node_name() -> String {
    "sonar_wb_poster".to_string()
}
fn default_channel_prefix() -> String {
    "sonar_".to_string()
}
fn default_queue_size() -> usize {
    10
}
fn default_rosbridge_url() -> String {
    "ws://localhost:9090".to_string()
}
fn default_whiteboard_port() -> u16 {
    9091
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            channel_prefix: default_channel_prefix(),
            queue_size: default_queue_size(),
            rosbridge_url: default_rosbridge_url(),
            whiteboard_port: default_whiteboard_port(),
        }
    }
}

/// Return the path to `~/.sonar_relay/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".sonar_relay").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Final config: the loaded file (defaults when it is absent or unreadable)
/// with `SONAR_RELAY_*` overrides looked up through `lookup`.
pub fn resolve<F>(loaded: &Result<Option<Config>, String>, lookup: F) -> Config
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = loaded.clone().ok().flatten().unwrap_or_default();
    apply_overrides(&mut cfg, lookup);
    cfg
}

/// Apply `SONAR_RELAY_*` overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SONAR_RELAY_NODE_NAME` | `node_name` |
/// | `SONAR_RELAY_ROSBRIDGE_URL` | `rosbridge_url` |
/// | `SONAR_RELAY_WHITEBOARD_PORT` | `whiteboard_port` |
pub fn apply_overrides<F>(cfg: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("SONAR_RELAY_NODE_NAME") {
        cfg.node_name = v;
    }
    if let Some(v) = lookup("SONAR_RELAY_ROSBRIDGE_URL") {
        cfg.rosbridge_url = v;
    }
    if let Some(v) = lookup("SONAR_RELAY_WHITEBOARD_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.whiteboard_port = port;
    }
}

/// Node name remapping in the ROS argument style, `__name:=<name>`.
///
/// The last occurrence wins; every other argument is ignored.
pub fn node_name_from_args<I>(args: I) -> Option<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    args.into_iter()
        .filter_map(|a| a.as_ref().strip_prefix("__name:=").map(str::to_string))
        .filter(|name| !name.is_empty())
        .last()
}
