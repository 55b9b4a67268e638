use std::{
    env, fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

const PROJECT_CONFIG_FILE: &str = "storeforward.toml";
const HOME_CONFIG_DIR: &str = ".storeforward";
const HOME_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub relay: RelayConfig,
    pub offline: OfflineConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub replay: Option<ReplayConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Resolves the active config: an explicit override path wins, then
    /// `./storeforward.toml`, then `~/.storeforward/config.toml`.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = override_path {
            return Self::from_path(path)
                .with_context(|| format!("load config override {}", path.display()));
        }

        let project_config = Path::new(PROJECT_CONFIG_FILE);
        if project_config.exists() {
            return Self::from_path(project_config)
                .with_context(|| format!("load config from project ./{PROJECT_CONFIG_FILE}"));
        }

        if let Some(home) = env::var_os("HOME") {
            let home_config = PathBuf::from(home)
                .join(HOME_CONFIG_DIR)
                .join(HOME_CONFIG_FILE);
            if home_config.exists() {
                return Self::from_path(&home_config)
                    .with_context(|| format!("load config from home {}", home_config.display()));
            }
        }

        anyhow::bail!(
            "no config found; pass --config or create ./{PROJECT_CONFIG_FILE} \
             or ~/{HOME_CONFIG_DIR}/{HOME_CONFIG_FILE}"
        )
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub upstream: String,
    #[serde(default)]
    pub admin_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OfflineConfig {
    pub rule: MatchRuleConfig,
}

/// URL predicate deciding which requests qualify for offline deferral.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchRuleConfig {
    Suffix { value: String },
    Contains { value: String },
    PathPrefix { value: String },
    Regex { value: String },
}

impl fmt::Display for MatchRuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suffix { value } => write!(f, "suffix:{value}"),
            Self::Contains { value } => write!(f, "contains:{value}"),
            Self::PathPrefix { value } => write!(f, "path_prefix:{value}"),
            Self::Regex { value } => write!(f, "regex:{value}"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayConfig {
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub ack: Option<ReplayAck>,
}

/// How replayed records are acknowledged out of the queue.
///
/// `Drained` removes every drained record once its replay has been attempted,
/// whatever the outcome. `Delivered` removes only records whose replay completed
/// with a success status; the rest stay queued for the next trigger.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayAck {
    #[default]
    Drained,
    Delivered,
}

impl fmt::Display for ReplayAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drained => write!(f, "drained"),
            Self::Delivered => write!(f, "delivered"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[cfg(test)]
mod tests {
    use super::{Config, MatchRuleConfig, ReplayAck};

    fn minimal_toml() -> &'static str {
        r#"
[relay]
listen = "127.0.0.1:0"
upstream = "http://127.0.0.1:8080"

[offline]
rule = { kind = "suffix", value = ".json" }

[storage]
path = "/var/lib/storeforward"
"#
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = Config::from_toml_str(minimal_toml()).expect("config should parse");

        assert_eq!(config.relay.upstream, "http://127.0.0.1:8080");
        assert_eq!(config.relay.admin_port, None);
        assert_eq!(
            config.offline.rule,
            MatchRuleConfig::Suffix {
                value: ".json".to_owned()
            }
        );
        assert!(config.replay.is_none());
        assert!(config.logging.is_none());
    }

    #[test]
    fn full_config_parses_every_section() {
        let config = Config::from_toml_str(
            r#"
[relay]
listen = "127.0.0.1:8400"
upstream = "https://api.example.net"
admin_port = 8401

[offline]
rule = { kind = "path_prefix", value = "/submit" }

[storage]
path = "/tmp/sf"

[replay]
interval_secs = 300
ack = "delivered"

[logging]
level = "debug"
format = "pretty"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.relay.admin_port, Some(8401));
        assert_eq!(
            config.offline.rule,
            MatchRuleConfig::PathPrefix {
                value: "/submit".to_owned()
            }
        );
        let replay = config.replay.expect("replay section should be present");
        assert_eq!(replay.interval_secs, Some(300));
        assert_eq!(replay.ack, Some(ReplayAck::Delivered));
    }

    #[test]
    fn every_rule_kind_parses() {
        for (kind, expected) in [
            ("suffix", MatchRuleConfig::Suffix { value: "x".into() }),
            ("contains", MatchRuleConfig::Contains { value: "x".into() }),
            (
                "path_prefix",
                MatchRuleConfig::PathPrefix { value: "x".into() },
            ),
            ("regex", MatchRuleConfig::Regex { value: "x".into() }),
        ] {
            let toml = format!(
                r#"
[relay]
listen = "127.0.0.1:0"
upstream = "http://127.0.0.1:1"

[offline]
rule = {{ kind = "{kind}", value = "x" }}

[storage]
path = "/tmp/sf"
"#
            );
            let config = Config::from_toml_str(&toml).expect("rule kind should parse");
            assert_eq!(config.offline.rule, expected);
        }
    }

    #[test]
    fn unknown_rule_kind_is_rejected() {
        assert!(
            Config::from_toml_str(
                r#"
[relay]
listen = "127.0.0.1:0"
upstream = "http://127.0.0.1:1"

[offline]
rule = { kind = "glob", value = "*.json" }

[storage]
path = "/tmp/sf"
"#,
            )
            .is_err()
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let toml = format!("{}\nunknown_key = \"invalid\"\n", minimal_toml());
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn missing_storage_section_is_rejected() {
        assert!(
            Config::from_toml_str(
                r#"
[relay]
listen = "127.0.0.1:0"
upstream = "http://127.0.0.1:1"

[offline]
rule = { kind = "suffix", value = ".json" }
"#,
            )
            .is_err()
        );
    }
}
