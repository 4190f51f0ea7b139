//! Groupcast Configuration
//!
//! TOML configuration loading and validation

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub const DEFAULT_EMOJI: &str = "✅";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub clients: Vec<ClientRule>,
    pub bridge: Option<BridgeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    #[default]
    React, // reaction with the rule emoji
    Reply, // quoted text reply
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_rate_per_minute")]
    pub rate_per_minute: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_true")]
    pub normalize_arabic: bool,
    #[serde(default)]
    pub mode: SendMode,
    #[serde(default = "default_reply_text")]
    pub reply_text: String,
    #[serde(default = "default_emoji")]
    pub default_emoji: String,
    /// Destinations the reactive engine listens to. Empty means every destination.
    #[serde(default)]
    pub watch_list: Vec<String>,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_per_minute: default_rate_per_minute(),
            cooldown_seconds: default_cooldown_seconds(),
            normalize_arabic: true,
            mode: SendMode::React,
            reply_text: default_reply_text(),
            default_emoji: default_emoji(),
            watch_list: Vec::new(),
            dedup_capacity: default_dedup_capacity(),
            log_capacity: default_log_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub flush_on_idle: bool,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target: None,
            batch_size: default_batch_size(),
            flush_on_idle: true,
        }
    }
}

impl ForwardConfig {
    /// Target destination when forwarding is enabled and a non-empty target is set.
    pub fn active_target(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.target
            .as_deref()
            .map(str::trim)
            .filter(|target| !target.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRule {
    pub name: String,
    #[serde(default = "default_emoji")]
    pub emoji: String,
}

impl ClientRule {
    pub fn new(name: &str, emoji: &str) -> Self {
        Self {
            name: name.to_string(),
            emoji: emoji.to_string(),
        }
    }
}

/// Parse operator-supplied client rules, one per line: `name | emoji` or a bare `name`.
///
/// Blank lines and lines starting with `#` are ignored. Order is preserved,
/// since the first matching rule wins.
pub fn parse_client_rules(raw: &str, default_emoji: &str) -> Vec<ClientRule> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (name, emoji) = match line.split_once('|') {
                Some((name, emoji)) => (name.trim(), emoji.trim()),
                None => (line, ""),
            };
            if name.is_empty() {
                return None;
            }
            let emoji = if emoji.is_empty() { default_emoji } else { emoji };
            Some(ClientRule::new(name, emoji))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub base_url: String,
    pub poll_timeout_secs: Option<u64>,
    /// Identity of the outbound account, used to flag self-sent messages.
    pub self_id: Option<String>,
    pub history_limit: Option<usize>,
}

/// Engine settings that the operator may change at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub clients: Vec<ClientRule>,
}

impl Settings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.engine.rate_per_minute == 0 {
            anyhow::bail!("engine.rate_per_minute must be at least 1");
        }
        if self.engine.dedup_capacity == 0 {
            anyhow::bail!("engine.dedup_capacity must be at least 1");
        }
        if self.engine.log_capacity == 0 {
            anyhow::bail!("engine.log_capacity must be at least 1");
        }
        if self.engine.mode == SendMode::Reply && self.engine.reply_text.trim().is_empty() {
            anyhow::bail!("engine.reply_text cannot be empty in reply mode");
        }

        let mut watched = HashSet::new();
        for destination in &self.engine.watch_list {
            let destination = destination.trim();
            if destination.is_empty() {
                anyhow::bail!("engine.watch_list contains an empty destination");
            }
            if !watched.insert(destination) {
                anyhow::bail!("Duplicate watched destination '{}'", destination);
            }
        }

        if self.forward.batch_size == 0 {
            anyhow::bail!("forward.batch_size must be at least 1");
        }
        if self.forward.enabled && self.forward.active_target().is_none() {
            anyhow::bail!("forward.target is required when forwarding is enabled");
        }

        for (index, client) in self.clients.iter().enumerate() {
            if client.name.trim().is_empty() {
                anyhow::bail!("Client rule #{} has an empty name", index + 1);
            }
            if client.emoji.trim().is_empty() {
                anyhow::bail!("Client rule '{}' has an empty emoji", client.name);
            }
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_rate_per_minute() -> u32 {
    20
}

fn default_cooldown_seconds() -> u64 {
    3
}

fn default_reply_text() -> String {
    format!("تم {}", DEFAULT_EMOJI)
}

fn default_emoji() -> String {
    DEFAULT_EMOJI.to_string()
}

fn default_dedup_capacity() -> usize {
    50_000
}

fn default_log_capacity() -> usize {
    2_000
}

fn default_batch_size() -> usize {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|dir| dir.join("groupcast").join("config.toml"))
    }

    pub fn settings(&self) -> Settings {
        Settings {
            engine: self.engine.clone(),
            forward: self.forward.clone(),
            clients: self.clients.clone(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.settings().validate()?;

        if let Some(bridge) = &self.bridge {
            let base_url = bridge.base_url.trim();
            if base_url.is_empty() {
                anyhow::bail!("bridge.base_url cannot be empty");
            }
            let parsed = url::Url::parse(base_url)
                .map_err(|e| anyhow::anyhow!("Invalid bridge.base_url '{}': {}", base_url, e))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                anyhow::bail!(
                    "bridge.base_url must use http or https, got '{}'",
                    parsed.scheme()
                );
            }
            if bridge.poll_timeout_secs == Some(0) {
                anyhow::bail!("bridge.poll_timeout_secs must be at least 1");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_client_rules, Config, SendMode};

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    #[test]
    fn empty_config_uses_engine_defaults() {
        let cfg = parse_config("");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.engine.rate_per_minute, 20);
        assert_eq!(cfg.engine.cooldown_seconds, 3);
        assert_eq!(cfg.engine.dedup_capacity, 50_000);
        assert_eq!(cfg.engine.log_capacity, 2_000);
        assert_eq!(cfg.engine.mode, SendMode::React);
        assert!(cfg.engine.normalize_arabic);
        assert_eq!(cfg.forward.batch_size, 10);
        assert!(cfg.forward.flush_on_idle);
    }

    #[test]
    fn validate_accepts_full_config() {
        let cfg = parse_config(
            r#"
[core]
data_dir = "~/.groupcast"

[engine]
rate_per_minute = 30
cooldown_seconds = 5
mode = "reply"
reply_text = "done"
watch_list = ["123@g.us", "456@g.us"]

[forward]
enabled = true
target = "999@g.us"
batch_size = 5

[[clients]]
name = "احمد"
emoji = "👍"

[[clients]]
name = "Sara"

[bridge]
base_url = "http://127.0.0.1:8787"
poll_timeout_secs = 30
"#,
        );
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.clients.len(), 2);
        assert_eq!(cfg.clients[1].emoji, "✅");
        assert_eq!(cfg.forward.active_target(), Some("999@g.us"));
    }

    #[test]
    fn validate_rejects_zero_rate() {
        let cfg = parse_config(
            r#"
[engine]
rate_per_minute = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_forwarding_without_target() {
        let cfg = parse_config(
            r#"
[forward]
enabled = true
target = "   "
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_watched_destination() {
        let cfg = parse_config(
            r#"
[engine]
watch_list = ["a@g.us", "a@g.us"]
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_http_bridge_url() {
        let cfg = parse_config(
            r#"
[bridge]
base_url = "ftp://bridge.local"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn disabled_forwarding_has_no_active_target() {
        let cfg = parse_config(
            r#"
[forward]
enabled = false
target = "999@g.us"
"#,
        );
        assert_eq!(cfg.forward.active_target(), None);
    }

    #[test]
    fn parse_client_rules_keeps_order_and_defaults_emoji() {
        let rules = parse_client_rules(
            "# clients\nاحمد | 👍\n\nSara\n | 🔥\nOmar|",
            "✅",
        );
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].name, "احمد");
        assert_eq!(rules[0].emoji, "👍");
        assert_eq!(rules[1].name, "Sara");
        assert_eq!(rules[1].emoji, "✅");
        assert_eq!(rules[2].name, "Omar");
        assert_eq!(rules[2].emoji, "✅");
    }
}
