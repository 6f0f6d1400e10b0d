use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::email::sink::SinkKind;
use crate::migrations::blockcount::CurrencyCode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub currencies: CurrenciesConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsConfig {
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
    #[serde(default = "default_max_password_length")]
    pub max_password_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrenciesConfig {
    #[serde(default = "default_currency_codes")]
    pub codes: Vec<CurrencyCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub sink: SinkKind,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_from_address")]
    pub from_address: String,
    #[serde(default = "default_site_name")]
    pub site_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub db_path: Option<String>,
    pub currencies: Option<Vec<CurrencyCode>>,
}

impl Config {
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".config/clerk/config.toml")
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(Self::default_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("failed reading config: {}", path.display()))?;
        let parsed: Self = toml::from_str(&data)
            .with_context(|| format!("failed parsing TOML config: {}", path.display()))?;
        Ok(parsed)
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(db_path) = overrides.db_path {
            self.storage.db_path = db_path;
        }
        if let Some(currencies) = overrides.currencies {
            self.currencies.codes = currencies;
        }
    }

    pub fn write_template(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed creating config directory: {}", parent.display())
            })?;
        }
        fs::write(path, Self::default_template())
            .with_context(|| format!("failed writing config template: {}", path.display()))
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    pub fn default_template() -> String {
        let template = r#"[storage]
db_path = "~/.local/share/clerk/clerk.db"

[server]
host = "127.0.0.1"
port = 3001

[accounts]
min_password_length = 6
max_password_length = 255

[currencies]
codes = ["btc", "ltc", "nmc", "dog", "ftc", "ppc"]

[email]
sink = "outbox"
webhook_url = ""
from_address = "support@localhost"
site_name = "Clerk"
"#;
        template.to_string()
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
            accounts: AccountsConfig::default(),
            currencies: CurrenciesConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            min_password_length: default_min_password_length(),
            max_password_length: default_max_password_length(),
        }
    }
}

impl Default for CurrenciesConfig {
    fn default() -> Self {
        Self {
            codes: default_currency_codes(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::default(),
            webhook_url: String::new(),
            from_address: default_from_address(),
            site_name: default_site_name(),
        }
    }
}

fn default_db_path() -> String {
    "~/.local/share/clerk/clerk.db".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_min_password_length() -> usize {
    6
}

fn default_max_password_length() -> usize {
    255
}

fn default_currency_codes() -> Vec<CurrencyCode> {
    ["btc", "ltc", "nmc", "dog", "ftc", "ppc"]
        .into_iter()
        .filter_map(|code| code.parse().ok())
        .collect()
}

fn default_from_address() -> String {
    "support@localhost".to_string()
}

fn default_site_name() -> String {
    "Clerk".to_string()
}
