use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::backup::{DEFAULT_MAX_MESSAGES_PER_BACKUP, DEFAULT_MAX_MESSAGES_PER_FULL_BACKUP};
use crate::ratelimit::DEFAULT_QUOTA_PER_SECOND;

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub name: String,
    /// Gmail user id, usually "me" or the account's email address.
    pub user_id: String,
    /// Shell command that prints a fresh OAuth access token to stdout.
    pub token_command: String,
}

#[derive(Debug)]
pub struct Config {
    pub accounts: Vec<AccountConfig>,
    pub gmail: GmailConfig,
}

#[derive(Debug)]
pub struct GmailConfig {
    pub backup_folder: String,
    pub export_folder: String,
    pub max_messages_per_backup: u32,
    pub max_messages_per_full_backup: u32,
    pub quota_per_second: i64,
    pub burst_size: Option<i64>,
    /// API endpoint override; tests point this at a mock server.
    pub api_base_url: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse config file: {}", e),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    gmail: RawGmailConfig,
    #[serde(default)]
    account: BTreeMap<String, RawAccountFields>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGmailConfig {
    #[serde(default = "default_backup_folder")]
    backup_folder: String,
    #[serde(default = "default_export_folder")]
    export_folder: String,
    #[serde(default = "default_max_messages_per_backup")]
    max_messages_per_backup: u32,
    #[serde(default = "default_max_messages_per_full_backup")]
    max_messages_per_full_backup: u32,
    #[serde(default = "default_quota_per_second")]
    quota_per_second: i64,
    #[serde(default)]
    burst_size: Option<i64>,
    #[serde(default)]
    api_base_url: Option<String>,
}

impl Default for RawGmailConfig {
    fn default() -> Self {
        Self {
            backup_folder: default_backup_folder(),
            export_folder: default_export_folder(),
            max_messages_per_backup: default_max_messages_per_backup(),
            max_messages_per_full_backup: default_max_messages_per_full_backup(),
            quota_per_second: default_quota_per_second(),
            burst_size: None,
            api_base_url: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAccountFields {
    #[serde(default)]
    user_id: Option<String>,
    token_command: Option<String>,
}

fn default_backup_folder() -> String {
    "backups/gmail".to_string()
}

fn default_export_folder() -> String {
    "exports/gmail".to_string()
}

fn default_max_messages_per_backup() -> u32 {
    DEFAULT_MAX_MESSAGES_PER_BACKUP
}

fn default_max_messages_per_full_backup() -> u32 {
    DEFAULT_MAX_MESSAGES_PER_FULL_BACKUP
}

fn default_quota_per_second() -> i64 {
    DEFAULT_QUOTA_PER_SECOND
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;

        if raw.gmail.quota_per_second <= 0 {
            return Err(ConfigError::Parse(
                "quota_per_second must be greater than 0".to_string(),
            ));
        }
        if let Some(burst) = raw.gmail.burst_size {
            if burst <= 0 {
                return Err(ConfigError::Parse(
                    "burst_size must be greater than 0".to_string(),
                ));
            }
        }

        let mut accounts = Vec::new();
        for (name, account) in raw.account {
            let account_name = name.clone();
            accounts.push(AccountConfig {
                name,
                user_id: account.user_id.unwrap_or_else(|| "me".to_string()),
                token_command: require_field(
                    account.token_command,
                    &format!("missing token_command in [account.{}]", account_name),
                )?,
            });
        }

        if accounts.is_empty() {
            return Err(ConfigError::Parse(
                "no accounts configured (add an [account.NAME] section)".to_string(),
            ));
        }

        Ok(Config {
            accounts,
            gmail: GmailConfig {
                backup_folder: raw.gmail.backup_folder,
                export_folder: raw.gmail.export_folder,
                max_messages_per_backup: raw.gmail.max_messages_per_backup,
                max_messages_per_full_backup: raw.gmail.max_messages_per_full_backup,
                quota_per_second: raw.gmail.quota_per_second,
                burst_size: raw.gmail.burst_size,
                api_base_url: raw.gmail.api_base_url,
            },
        })
    }

    pub fn account(&self, name: Option<&str>) -> Result<&AccountConfig, ConfigError> {
        match name {
            Some(name) => self
                .accounts
                .iter()
                .find(|a| a.name == name)
                .ok_or_else(|| ConfigError::Parse(format!("no account named '{}'", name))),
            None => self
                .accounts
                .first()
                .ok_or_else(|| ConfigError::Parse("no accounts configured".to_string())),
        }
    }
}

fn require_field(value: Option<String>, err: &str) -> Result<String, ConfigError> {
    value.ok_or_else(|| ConfigError::Parse(err.to_string()))
}
