use crate::decoder::timeout_from_secs;
use crate::ldap_protocol::SearchScope;
use crate::session::ConnectOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ldap:// or ldaps:// (default ports 389 / 636).
    pub uri: String,
    /// Seconds allowed for TCP connect plus TLS handshake. 0 disables the limit.
    pub network_timeout: u64,
    /// Seconds per result fetch. 0 or negative blocks indefinitely.
    pub timeout: f64,
    /// Largest server message accepted, in bytes. Unset means 16 MiB.
    pub max_message_size: Option<usize>,
    pub bind: Option<BindConfig>,
    pub tls: Option<TlsConfig>,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindConfig {
    pub binddn: Option<String>,
    pub credentials: Option<String>,
    /// Attach the password policy request control to the bind.
    #[serde(default)]
    pub password_policy: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca_file: Option<String>,
    /// Do not verify the server certificate (test setups only).
    #[serde(default)]
    pub skip_verify: bool,
    /// Upgrade ldap:// connections with StartTLS.
    #[serde(default)]
    pub start_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub base: String,
    /// base, one, sub or children.
    pub scope: String,
    pub filter: String,
    pub attributes: Vec<String>,
    /// Entries per page; 0 turns paging off.
    pub page_size: u32,
    /// Server side sort keys, e.g. "-uidNumber cn:caseIgnoreOrderingMatch".
    pub sort: Option<String>,
    pub size_limit: i32,
    pub time_limit: i32,
    pub attrs_only: bool,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Like [`Config::from_file`], but a missing file yields the defaults.
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Parse YAML config")?;
        Ok(config)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            network_timeout: (self.network_timeout > 0).then(|| Duration::from_secs(self.network_timeout)),
            ca_file: self.tls.as_ref().and_then(|t| t.ca_file.clone()),
            tls_skip_verify: self.tls.as_ref().map(|t| t.skip_verify).unwrap_or(false),
            start_tls: self.tls.as_ref().map(|t| t.start_tls).unwrap_or(false),
            max_message_size: self.max_message_size,
        }
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        timeout_from_secs(self.timeout)
    }
}

impl SearchConfig {
    pub fn search_scope(&self) -> Result<SearchScope> {
        self.scope.parse()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uri: "ldap://127.0.0.1:389".to_string(),
            network_timeout: 5,
            timeout: 30.0,
            max_message_size: None,
            bind: None,
            tls: None,
            search: SearchConfig::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base: String::new(),
            scope: "sub".to_string(),
            filter: "(objectClass=*)".to_string(),
            attributes: vec![],
            page_size: 0,
            sort: None,
            size_limit: 0,
            time_limit: 0,
            attrs_only: false,
        }
    }
}
