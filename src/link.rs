//! The native directory primitive, seen as a port.
//!
//! `Connection` only talks to the directory through these traits. The
//! production implementation lives in [`crate::native`]; tests script their
//! own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

/// Only LDAPv3 is spoken.
pub const PROTOCOL_VERSION: u32 = 3;

/// Whether a failure came from the network or from a server verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    Server,
}

/// Raw failure reported by a primitive call: the `errno` / `err2str` /
/// `ERROR_STRING` triple of classic client libraries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFailure {
    pub kind: FailureKind,
    pub result_code: Option<u32>,
    pub message: String,
    pub diagnostic: String,
}

impl LinkFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transport,
            result_code: None,
            message: message.into(),
            diagnostic: String::new(),
        }
    }

    pub fn server(result_code: u32, diagnostic: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Server,
            result_code: Some(result_code),
            message: crate::diagnostic::result_code_name(result_code).to_string(),
            diagnostic: diagnostic.into(),
        }
    }
}

impl fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.result_code {
            Some(rc) => write!(f, "rc={} {} {}", rc, self.message, self.diagnostic),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for LinkFailure {}

/// Search breadth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Base,
    OneLevel,
    Subtree,
}

/// Connection target: every host joined with the scheme, tried in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    urls: Vec<String>,
}

impl LinkTarget {
    /// Build a target from a host list. Fails on an empty list, empty or
    /// whitespace-containing hosts, or port 0.
    pub fn new(hosts: &[String], port: u16, ssl: bool) -> Result<Self, LinkFailure> {
        if hosts.is_empty() {
            return Err(LinkFailure::transport("no hosts configured"));
        }
        if port == 0 {
            return Err(LinkFailure::transport("invalid port 0"));
        }
        let scheme = if ssl { "ldaps" } else { "ldap" };
        let mut urls = Vec::with_capacity(hosts.len());
        for host in hosts {
            let host = host.trim();
            if host.is_empty() || host.contains(char::is_whitespace) || host.contains('/') {
                return Err(LinkFailure::transport(format!("malformed host {:?}", host)));
            }
            urls.push(format!("{}://{}:{}", scheme, host, port));
        }
        Ok(Self { urls })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn is_ssl(&self) -> bool {
        self.urls.first().is_some_and(|u| u.starts_with("ldaps://"))
    }
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.urls.join(" "))
    }
}

/// Options applied right after connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOption {
    ProtocolVersion(u32),
    Referrals(bool),
    NetworkTimeout(Duration),
    TlsSkipVerify(bool),
}

/// One primitive search call.
#[derive(Debug, Clone)]
pub struct PrimitiveSearch<'a> {
    pub base_dn: &'a str,
    pub scope: Scope,
    pub filter: &'a str,
    pub attributes: &'a [String],
    pub size_limit: u32,
}

/// RFC 2696 paged results request control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingControl {
    pub size: u32,
    pub critical: bool,
    pub cookie: Vec<u8>,
}

/// One page returned by the primitive, with the paging response cookie
/// (`None` when the server sent no paging control).
pub struct SearchPage {
    pub page: Box<dyn ResultPage>,
    pub cookie: Option<Vec<u8>>,
}

/// An entry as the primitive hands it over: DN and the attribute chain in
/// server order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub dn: String,
    pub attributes: Vec<(String, Vec<Vec<u8>>)>,
}

impl RawEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Vec::new(),
        }
    }

    pub fn attr<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        self.attributes
            .push((name.into(), values.into_iter().map(Into::into).collect()));
        self
    }
}

/// Native result handle for one page.
pub trait ResultPage: Send {
    /// Number of entries, known without walking them.
    fn entry_count(&self) -> usize;

    /// Next entry in server order, `None` once the page is exhausted.
    fn next_entry(&mut self) -> Option<RawEntry>;

    /// Release the native result. Called at most once by `RawPage`.
    fn free(&mut self);
}

/// In-memory page, used by the native link after `ldap3` has decoded the
/// response.
#[derive(Debug, Default)]
pub struct MemoryPage {
    entries: VecDeque<RawEntry>,
    count: usize,
}

impl MemoryPage {
    pub fn new(entries: Vec<RawEntry>) -> Self {
        let count = entries.len();
        Self {
            entries: entries.into(),
            count,
        }
    }
}

impl ResultPage for MemoryPage {
    fn entry_count(&self) -> usize {
        self.count
    }

    fn next_entry(&mut self) -> Option<RawEntry> {
        self.entries.pop_front()
    }

    fn free(&mut self) {
        self.entries.clear();
    }
}

/// Modification operation for `modify_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    Add(String, Vec<String>),
    Delete(String, Vec<String>),
    Replace(String, Vec<String>),
}

impl Modification {
    pub fn attribute(&self) -> &str {
        match self {
            Modification::Add(a, _) | Modification::Delete(a, _) | Modification::Replace(a, _) => a,
        }
    }
}

/// Attribute map used by `add` and `modify`.
pub type AttributeMap = BTreeMap<String, Vec<String>>;

/// Opens native links.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Create a link for the target. Implementations may defer the network
    /// round-trip to the first operation that needs it.
    async fn connect(&self, target: &LinkTarget) -> Result<Box<dyn DirectoryLink>, LinkFailure>;
}

/// An open native directory handle. Not reentrant: one caller at a time.
#[async_trait]
pub trait DirectoryLink: Send {
    fn set_option(&mut self, option: LinkOption) -> Result<(), LinkFailure>;

    async fn start_tls(&mut self) -> Result<(), LinkFailure>;

    /// Simple bind. Empty DN and password is the anonymous bind.
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), LinkFailure>;

    async fn search(
        &mut self,
        request: &PrimitiveSearch<'_>,
        paging: Option<&PagingControl>,
    ) -> Result<SearchPage, LinkFailure>;

    async fn add(&mut self, dn: &str, attributes: &AttributeMap) -> Result<(), LinkFailure>;

    async fn delete(&mut self, dn: &str) -> Result<(), LinkFailure>;

    async fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_parent: Option<&str>,
        delete_old_rdn: bool,
    ) -> Result<(), LinkFailure>;

    async fn modify(&mut self, dn: &str, changes: &[Modification]) -> Result<(), LinkFailure>;

    async fn compare(&mut self, dn: &str, attribute: &str, value: &str) -> Result<bool, LinkFailure>;

    /// RFC 4532 "Who am I?"; `None` for an anonymous session.
    async fn whoami(&mut self) -> Result<Option<String>, LinkFailure>;

    async fn unbind(&mut self) -> Result<(), LinkFailure>;
}
