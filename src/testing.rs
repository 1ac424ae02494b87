//! Scripted in-memory directory used by the unit tests.

use crate::link::{
    AttributeMap, DirectoryLink, LinkConnector, LinkFailure, LinkOption, LinkTarget, MemoryPage,
    Modification, PagingControl, PrimitiveSearch, RawEntry, SearchPage,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const AD_INVALID_CREDENTIALS: &str =
    "52e: 80090308: LdapErr: DSID-0C09042A, comment: AcceptSecurityContext error, data 52e, v4563";

/// Page layout returned for successive search calls.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSearch {
    page_sizes: Vec<usize>,
    endless: Option<usize>,
    fail_at: Option<(usize, u32, String)>,
}

impl ScriptedSearch {
    /// One page per element, each with that many entries.
    pub fn pages(page_sizes: Vec<usize>) -> Self {
        Self {
            page_sizes,
            ..Self::default()
        }
    }

    /// A misbehaving server that always hands back a cookie.
    pub fn endless(entries_per_page: usize) -> Self {
        Self {
            endless: Some(entries_per_page),
            ..Self::default()
        }
    }

    /// Fail the call for page `index` (0-based) with a server error.
    pub fn fail_at(mut self, index: usize, rc: u32, diagnostic: &str) -> Self {
        self.fail_at = Some((index, rc, diagnostic.to_string()));
        self
    }
}

#[derive(Default)]
struct State {
    users: BTreeMap<String, String>,
    allow_anonymous: bool,
    unreachable_binds: usize,
    tls_failure: Option<String>,
    hang_searches: bool,
    script: Option<ScriptedSearch>,
    entries: BTreeMap<String, AttributeMap>,
    failures: BTreeMap<&'static str, (u32, String)>,

    connects: usize,
    targets: Vec<String>,
    options: Vec<LinkOption>,
    tls_started: usize,
    binds: Vec<String>,
    unbinds: usize,
    search_calls: usize,
    sent_cookies: Vec<Vec<u8>>,
    sent_page_sizes: Vec<Option<u32>>,
    filters: Vec<String>,
    modifications: Vec<(String, Vec<Modification>)>,
}

/// Shared fake server. Every link it hands out sees the same state.
#[derive(Clone, Default)]
pub struct MockDirectory {
    state: Arc<Mutex<State>>,
}

impl MockDirectory {
    pub fn new() -> Self {
        let dir = Self::default();
        dir.lock().allow_anonymous = true;
        dir
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn with_user(self, dn: &str, password: &str) -> Self {
        self.lock().users.insert(dn.to_string(), password.to_string());
        self
    }

    pub fn deny_anonymous(self) -> Self {
        self.lock().allow_anonymous = false;
        self
    }

    pub fn with_entry(self, dn: &str, attributes: &[(&str, &[&str])]) -> Self {
        let map = attributes
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect();
        self.lock().entries.insert(dn.to_string(), map);
        self
    }

    /// The next `n` binds fail as if the server were unreachable.
    pub fn unreachable_binds(&self, n: usize) {
        self.lock().unreachable_binds = n;
    }

    pub fn fail_tls(&self, diagnostic: &str) {
        self.lock().tls_failure = Some(diagnostic.to_string());
    }

    pub fn hang_searches(&self) {
        self.lock().hang_searches = true;
    }

    pub fn script_search(&self, script: ScriptedSearch) {
        self.lock().script = Some(script);
    }

    pub fn fail_operation(&self, operation: &'static str, rc: u32, diagnostic: &str) {
        self.lock().failures.insert(operation, (rc, diagnostic.to_string()));
    }

    pub fn open_link(&self) -> Box<dyn DirectoryLink> {
        Box::new(MockLink {
            dir: self.clone(),
            bound_as: None,
        })
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn targets(&self) -> Vec<String> {
        self.lock().targets.clone()
    }

    pub fn options(&self) -> Vec<LinkOption> {
        self.lock().options.clone()
    }

    pub fn tls_started(&self) -> usize {
        self.lock().tls_started
    }

    pub fn binds(&self) -> Vec<String> {
        self.lock().binds.clone()
    }

    pub fn unbinds(&self) -> usize {
        self.lock().unbinds
    }

    pub fn search_calls(&self) -> usize {
        self.lock().search_calls
    }

    pub fn sent_cookies(&self) -> Vec<Vec<u8>> {
        self.lock().sent_cookies.clone()
    }

    pub fn sent_page_sizes(&self) -> Vec<Option<u32>> {
        self.lock().sent_page_sizes.clone()
    }

    pub fn filters(&self) -> Vec<String> {
        self.lock().filters.clone()
    }

    pub fn modifications(&self) -> Vec<(String, Vec<Modification>)> {
        self.lock().modifications.clone()
    }

    pub fn entry(&self, dn: &str) -> Option<AttributeMap> {
        self.lock().entries.get(dn).cloned()
    }

    fn check_failure(&self, operation: &'static str) -> Result<(), LinkFailure> {
        match self.lock().failures.get(operation) {
            Some((rc, diag)) => Err(LinkFailure::server(*rc, diag.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LinkConnector for MockDirectory {
    async fn connect(&self, target: &LinkTarget) -> Result<Box<dyn DirectoryLink>, LinkFailure> {
        {
            let mut state = self.lock();
            state.connects += 1;
            state.targets.push(target.to_string());
        }
        Ok(self.open_link())
    }
}

struct MockLink {
    dir: MockDirectory,
    bound_as: Option<String>,
}

fn generated_entries(page: usize, count: usize) -> Vec<RawEntry> {
    (0..count)
        .map(|i| {
            RawEntry::new(format!("cn=user{}-{},dc=example,dc=com", page, i))
                .attr("sn", [format!("User{}", i)])
                .attr("cn", [format!("user{}-{}", page, i)])
        })
        .collect()
}

fn page_index(cookie: &[u8]) -> usize {
    std::str::from_utf8(cookie)
        .ok()
        .and_then(|s| s.strip_prefix("page-"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Server-side attribute projection: empty or `*` returns everything.
fn selected(requested: &[String], name: &str) -> bool {
    requested.is_empty() || requested.iter().any(|a| a == "*" || a.eq_ignore_ascii_case(name))
}

fn in_scope(dn: &str, base: &str) -> bool {
    base.is_empty() || dn.to_ascii_lowercase().ends_with(&base.to_ascii_lowercase())
}

#[async_trait]
impl DirectoryLink for MockLink {
    fn set_option(&mut self, option: LinkOption) -> Result<(), LinkFailure> {
        if let LinkOption::ProtocolVersion(v) = option {
            if v != 3 {
                return Err(LinkFailure::transport(format!("unsupported protocol version {}", v)));
            }
        }
        self.dir.lock().options.push(option);
        Ok(())
    }

    async fn start_tls(&mut self) -> Result<(), LinkFailure> {
        let mut state = self.dir.lock();
        if let Some(diag) = state.tls_failure.clone() {
            return Err(LinkFailure::server(52, diag));
        }
        state.tls_started += 1;
        Ok(())
    }

    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), LinkFailure> {
        let mut state = self.dir.lock();
        state.binds.push(dn.to_string());
        if state.unreachable_binds > 0 {
            state.unreachable_binds -= 1;
            return Err(LinkFailure::transport("Can't contact LDAP server"));
        }
        if dn.is_empty() && password.is_empty() {
            if state.allow_anonymous {
                self.bound_as = None;
                return Ok(());
            }
            return Err(LinkFailure::server(48, "anonymous bind disallowed"));
        }
        match state.users.get(dn) {
            Some(expected) if expected == password => {
                self.bound_as = Some(dn.to_string());
                Ok(())
            }
            _ => Err(LinkFailure::server(49, AD_INVALID_CREDENTIALS)),
        }
    }

    async fn search(
        &mut self,
        request: &PrimitiveSearch<'_>,
        paging: Option<&PagingControl>,
    ) -> Result<SearchPage, LinkFailure> {
        let (hang, script) = {
            let mut state = self.dir.lock();
            state.search_calls += 1;
            state.filters.push(request.filter.to_string());
            state.sent_cookies.push(paging.map(|p| p.cookie.clone()).unwrap_or_default());
            state.sent_page_sizes.push(paging.map(|p| p.size));
            (state.hang_searches, state.script.clone())
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.dir.check_failure("search")?;

        let Some(script) = script else {
            let state = self.dir.lock();
            let entries: Vec<RawEntry> = state
                .entries
                .iter()
                .filter(|(dn, _)| in_scope(dn, request.base_dn))
                .map(|(dn, attrs)| RawEntry {
                    dn: dn.clone(),
                    attributes: attrs
                        .iter()
                        .filter(|(k, _)| selected(request.attributes, k))
                        .map(|(k, v)| (k.clone(), v.iter().map(|s| s.as_bytes().to_vec()).collect()))
                        .collect(),
                })
                .collect();
            return Ok(SearchPage {
                page: Box::new(MemoryPage::new(entries)),
                cookie: paging.map(|_| Vec::new()),
            });
        };

        let Some(control) = paging else {
            let total = script.page_sizes.iter().sum::<usize>() + script.endless.unwrap_or(0);
            return Ok(SearchPage {
                page: Box::new(MemoryPage::new(generated_entries(0, total))),
                cookie: None,
            });
        };

        let index = page_index(&control.cookie);
        if let Some((at, rc, diag)) = &script.fail_at {
            if *at == index {
                return Err(LinkFailure::server(*rc, diag.clone()));
            }
        }
        if let Some(per_page) = script.endless {
            return Ok(SearchPage {
                page: Box::new(MemoryPage::new(generated_entries(index, per_page))),
                cookie: Some(format!("page-{}", index + 1).into_bytes()),
            });
        }
        let size = script.page_sizes.get(index).copied().unwrap_or(0);
        let cookie = if index + 1 < script.page_sizes.len() {
            format!("page-{}", index + 1).into_bytes()
        } else {
            Vec::new()
        };
        Ok(SearchPage {
            page: Box::new(MemoryPage::new(generated_entries(index, size))),
            cookie: Some(cookie),
        })
    }

    async fn add(&mut self, dn: &str, attributes: &AttributeMap) -> Result<(), LinkFailure> {
        self.dir.check_failure("add")?;
        let mut state = self.dir.lock();
        if state.entries.contains_key(dn) {
            return Err(LinkFailure::server(68, ""));
        }
        state.entries.insert(dn.to_string(), attributes.clone());
        Ok(())
    }

    async fn delete(&mut self, dn: &str) -> Result<(), LinkFailure> {
        self.dir.check_failure("delete")?;
        match self.dir.lock().entries.remove(dn) {
            Some(_) => Ok(()),
            None => Err(LinkFailure::server(32, "0000208D: NameErr: DSID-03100241, problem 2001 (NO_OBJECT)")),
        }
    }

    async fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_parent: Option<&str>,
        _delete_old_rdn: bool,
    ) -> Result<(), LinkFailure> {
        self.dir.check_failure("rename")?;
        let mut state = self.dir.lock();
        let Some(attrs) = state.entries.remove(dn) else {
            return Err(LinkFailure::server(32, ""));
        };
        let parent = match new_parent {
            Some(p) => p.to_string(),
            None => dn.split_once(',').map(|(_, p)| p.to_string()).unwrap_or_default(),
        };
        state.entries.insert(format!("{},{}", new_rdn, parent), attrs);
        Ok(())
    }

    async fn modify(&mut self, dn: &str, changes: &[Modification]) -> Result<(), LinkFailure> {
        self.dir.check_failure("modify")?;
        let mut state = self.dir.lock();
        state.modifications.push((dn.to_string(), changes.to_vec()));
        let Some(entry) = state.entries.get_mut(dn) else {
            return Err(LinkFailure::server(32, ""));
        };
        for change in changes {
            match change {
                Modification::Replace(attr, values) => {
                    entry.insert(attr.clone(), values.clone());
                }
                Modification::Add(attr, values) => {
                    entry.entry(attr.clone()).or_default().extend(values.iter().cloned());
                }
                Modification::Delete(attr, values) => {
                    if values.is_empty() {
                        entry.remove(attr);
                    } else if let Some(existing) = entry.get_mut(attr) {
                        existing.retain(|v| !values.contains(v));
                    }
                }
            }
        }
        Ok(())
    }

    async fn compare(&mut self, dn: &str, attribute: &str, value: &str) -> Result<bool, LinkFailure> {
        self.dir.check_failure("compare")?;
        let state = self.dir.lock();
        let Some(entry) = state.entries.get(dn) else {
            return Err(LinkFailure::server(32, ""));
        };
        Ok(entry
            .get(attribute)
            .is_some_and(|values| values.iter().any(|v| v == value)))
    }

    async fn whoami(&mut self) -> Result<Option<String>, LinkFailure> {
        Ok(self.bound_as.as_ref().map(|dn| format!("dn:{}", dn)))
    }

    async fn unbind(&mut self) -> Result<(), LinkFailure> {
        self.dir.lock().unbinds += 1;
        self.bound_as = None;
        Ok(())
    }
}
