use crate::cursor::MultiValue;
use crate::error::LdapError;
use crate::paging::{DEFAULT_MAX_PAGES, DEFAULT_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use anyhow::Result;

#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hosts tried in order when the link is established.
    pub hosts: Vec<String>,
    /// Default 389, or 636 when `use_ssl` is set.
    pub port: Option<u16>,
    #[serde(default)]
    pub base_dn: String,
    /// Issue StartTLS right after connect; a failure is fatal.
    #[serde(default)]
    pub use_tls: bool,
    /// Connect with the ldaps:// scheme.
    #[serde(default)]
    pub use_ssl: bool,
    /// Do not verify the server certificate (test / internal networks only).
    #[serde(default)]
    pub tls_skip_verify: bool,
    #[serde(default)]
    pub follow_referrals: bool,
    pub page_size: Option<u32>,
    pub use_paging: Option<bool>,
    /// Upper bound on pages per search before the run is aborted (default 10000).
    pub max_pages: Option<usize>,
    /// Connect timeout in seconds (default 5).
    pub network_timeout_sec: Option<u64>,
    /// Timeout for each directory operation in seconds. Unset means unbounded.
    pub operation_timeout_sec: Option<u64>,
    /// Attribute holding the login name (default samaccountname).
    pub login_attribute: Option<String>,
    #[serde(default)]
    pub account_prefix: String,
    #[serde(default)]
    pub account_suffix: String,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    /// Re-establish the link once when a bind fails on a transport error (default true).
    pub reconnect_on_bind_failure: Option<bool>,
    #[serde(default)]
    pub multi_value: MultiValue,
    /// TTL for cached records in seconds (default 300).
    pub cache_ttl_sec: Option<u64>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Config for the given hosts with every other field at its default.
    pub fn for_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), LdapError> {
        if self.hosts.is_empty() {
            return Err(LdapError::config("at least one host is required"));
        }
        if self.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(LdapError::config("host names must not be empty"));
        }
        if self.port == Some(0) {
            return Err(LdapError::config("port must be non-zero"));
        }
        if self.use_tls && self.use_ssl {
            return Err(LdapError::config("use_tls (StartTLS) and use_ssl (ldaps) are mutually exclusive"));
        }
        if self.page_size == Some(0) {
            return Err(LdapError::config("page_size must be positive"));
        }
        if self.max_pages == Some(0) {
            return Err(LdapError::config("max_pages must be positive"));
        }
        if self.admin_username.is_some() != self.admin_password.is_some() {
            return Err(LdapError::config("admin_username and admin_password must be set together"));
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.use_ssl { 636 } else { 389 })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.unwrap_or(DEFAULT_PAGE_SIZE)
    }

    pub fn use_paging(&self) -> bool {
        self.use_paging.unwrap_or(true)
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages.unwrap_or(DEFAULT_MAX_PAGES)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_sec.unwrap_or(5))
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_sec.map(Duration::from_secs)
    }

    pub fn login_attribute(&self) -> &str {
        self.login_attribute.as_deref().unwrap_or("samaccountname")
    }

    pub fn reconnect_on_bind_failure(&self) -> bool {
        self.reconnect_on_bind_failure.unwrap_or(true)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_sec.unwrap_or(300))
    }

    /// Wrap a bare username with the account prefix and suffix. DNs pass
    /// through unchanged.
    pub fn qualify_username(&self, username: &str) -> String {
        if username.contains('=') {
            return username.to_string();
        }
        format!("{}{}{}", self.account_prefix, username, self.account_suffix)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1".to_string()],
            port: None,
            base_dn: String::new(),
            use_tls: false,
            use_ssl: false,
            tls_skip_verify: false,
            follow_referrals: false,
            page_size: Some(DEFAULT_PAGE_SIZE),
            use_paging: Some(true),
            max_pages: Some(DEFAULT_MAX_PAGES),
            network_timeout_sec: Some(5),
            operation_timeout_sec: None,
            login_attribute: Some("samaccountname".to_string()),
            account_prefix: String::new(),
            account_suffix: String::new(),
            admin_username: None,
            admin_password: None,
            reconnect_on_bind_failure: Some(true),
            multi_value: MultiValue::Joined,
            cache_ttl_sec: Some(300),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("hosts", &self.hosts)
            .field("port", &self.port())
            .field("base_dn", &self.base_dn)
            .field("use_tls", &self.use_tls)
            .field("use_ssl", &self.use_ssl)
            .field("follow_referrals", &self.follow_referrals)
            .field("page_size", &self.page_size())
            .field("admin_username", &self.admin_username)
            .field("admin_password", &self.admin_password.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}
