//! `ldap3`-backed implementation of the directory link.

use crate::link::{
    AttributeMap, DirectoryLink, LinkConnector, LinkFailure, LinkOption, LinkTarget, MemoryPage,
    Modification, PagingControl, PrimitiveSearch, RawEntry, Scope, SearchPage, PROTOCOL_VERSION,
};
use async_trait::async_trait;
use ldap3::controls::{Control, ControlType, PagedResults, RawControl};
use ldap3::exop::WhoAmI;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapResult, Mod, SearchEntry, SearchOptions};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
const RC_REFERRAL: u32 = 10;

/// Opens [`NativeLink`]s. Establishment is deferred to the first call that
/// needs the network.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ldap3Connector;

#[async_trait]
impl LinkConnector for Ldap3Connector {
    async fn connect(&self, target: &LinkTarget) -> Result<Box<dyn DirectoryLink>, LinkFailure> {
        Ok(Box::new(NativeLink::new(target)))
    }
}

/// One `ldap3` handle plus the settings used to (re)establish it.
pub struct NativeLink {
    urls: Vec<String>,
    conn_timeout: Duration,
    follow_referrals: bool,
    starttls: bool,
    no_tls_verify: bool,
    active_url: Option<String>,
    ldap: Option<Ldap>,
}

impl NativeLink {
    pub fn new(target: &LinkTarget) -> Self {
        Self {
            urls: target.urls().to_vec(),
            conn_timeout: Duration::from_secs(5),
            follow_referrals: false,
            starttls: false,
            no_tls_verify: false,
            active_url: None,
            ldap: None,
        }
    }

    /// URL of the host that accepted the connection, once established.
    pub fn active_url(&self) -> Option<&str> {
        self.active_url.as_deref()
    }

    fn settings(&self) -> LdapConnSettings {
        LdapConnSettings::new()
            .set_conn_timeout(self.conn_timeout)
            .set_starttls(self.starttls)
            .set_no_tls_verify(self.no_tls_verify)
    }

    /// Try every URL in order; the first one that answers wins.
    async fn establish(&mut self) -> Result<Ldap, LinkFailure> {
        let mut last_error = LinkFailure::transport("no hosts configured");
        for url in &self.urls {
            debug!(url = %url, starttls = self.starttls, "connecting to LDAP server");
            match LdapConnAsync::with_settings(self.settings(), url).await {
                Ok((conn, ldap)) => {
                    let driver_url = url.clone();
                    tokio::spawn(async move {
                        if let Err(e) = conn.drive().await {
                            warn!(url = %driver_url, error = %e, "LDAP connection driver error");
                        }
                    });
                    self.active_url = Some(url.clone());
                    return Ok(ldap);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "failed to connect to LDAP server");
                    last_error = failure(e);
                }
            }
        }
        Err(last_error)
    }

    async fn ldap(&mut self) -> Result<&mut Ldap, LinkFailure> {
        if self.ldap.is_none() {
            let ldap = self.establish().await?;
            self.ldap = Some(ldap);
        }
        self.ldap
            .as_mut()
            .ok_or_else(|| LinkFailure::transport("link not established"))
    }

    /// Drop the handle after a transport failure so the next call reconnects.
    fn on_failure(&mut self, failure: LinkFailure) -> LinkFailure {
        if failure.result_code.is_none() {
            self.ldap = None;
            self.active_url = None;
        }
        failure
    }
}

/// Map an `ldap3` error to a link failure. Server verdicts keep their result
/// code and diagnostic text; everything else is a transport failure.
pub(crate) fn failure(err: ldap3::LdapError) -> LinkFailure {
    match err {
        ldap3::LdapError::LdapResult { result } => LinkFailure::server(result.rc, result.text),
        other => LinkFailure::transport(other.to_string()),
    }
}

fn check(result: LdapResult) -> Result<(), LinkFailure> {
    if result.rc == 0 {
        Ok(())
    } else {
        Err(LinkFailure::server(result.rc, result.text))
    }
}

fn native_scope(scope: Scope) -> ldap3::Scope {
    match scope {
        Scope::Base => ldap3::Scope::Base,
        Scope::OneLevel => ldap3::Scope::OneLevel,
        Scope::Subtree => ldap3::Scope::Subtree,
    }
}

fn value_set(values: &[String]) -> HashSet<&str> {
    values.iter().map(String::as_str).collect()
}

fn response_cookie(ctrls: &[Control]) -> Option<Vec<u8>> {
    ctrls.iter().find_map(|ctrl| match ctrl {
        Control(Some(ControlType::PagedResults), raw) => Some(raw.parse::<PagedResults>().cookie),
        _ => None,
    })
}

fn raw_entry(entry: SearchEntry) -> RawEntry {
    let mut raw = RawEntry::new(entry.dn);
    for (name, values) in entry.attrs {
        raw = raw.attr(name, values);
    }
    for (name, values) in entry.bin_attrs {
        raw = raw.attr(name, values);
    }
    raw
}

#[async_trait]
impl DirectoryLink for NativeLink {
    fn set_option(&mut self, option: LinkOption) -> Result<(), LinkFailure> {
        match option {
            LinkOption::ProtocolVersion(v) if v != PROTOCOL_VERSION => {
                return Err(LinkFailure::transport(format!("unsupported protocol version {}", v)));
            }
            LinkOption::ProtocolVersion(_) => {}
            LinkOption::Referrals(follow) => self.follow_referrals = follow,
            LinkOption::NetworkTimeout(timeout) => self.conn_timeout = timeout,
            LinkOption::TlsSkipVerify(skip) => self.no_tls_verify = skip,
        }
        Ok(())
    }

    /// `ldap3` negotiates StartTLS while establishing, so the link is
    /// (re)established here with the extended operation enabled.
    async fn start_tls(&mut self) -> Result<(), LinkFailure> {
        if self.urls.iter().any(|u| u.starts_with("ldaps://")) {
            return Err(LinkFailure::transport("StartTLS requested on an ldaps:// link"));
        }
        self.starttls = true;
        self.ldap = None;
        match self.establish().await {
            Ok(ldap) => {
                self.ldap = Some(ldap);
                Ok(())
            }
            Err(e) => {
                self.starttls = false;
                Err(e)
            }
        }
    }

    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<(), LinkFailure> {
        let ldap = self.ldap().await?;
        let response = ldap.simple_bind(dn, password).await;
        let outcome = match response {
            Ok(result) => check(result),
            Err(e) => Err(failure(e)),
        };
        outcome.map_err(|f| self.on_failure(f))
    }

    async fn search(
        &mut self,
        request: &PrimitiveSearch<'_>,
        paging: Option<&PagingControl>,
    ) -> Result<SearchPage, LinkFailure> {
        let follow_referrals = self.follow_referrals;
        let ldap = self.ldap().await?;
        let mut options = SearchOptions::new();
        if request.size_limit > 0 {
            options = options.sizelimit(request.size_limit.min(i32::MAX as u32) as i32);
        }
        ldap.with_search_options(options);
        if let Some(control) = paging {
            let mut raw: RawControl = PagedResults {
                size: control.size.min(i32::MAX as u32) as i32,
                cookie: control.cookie.clone(),
            }
            .into();
            raw.crit = control.critical;
            ldap.with_controls(raw);
        }
        let attrs: Vec<&str> = request.attributes.iter().map(String::as_str).collect();
        let response = ldap
            .search(request.base_dn, native_scope(request.scope), request.filter, attrs)
            .await;
        let ldap3::SearchResult(entries, result) = match response {
            Ok(r) => r,
            Err(e) => return Err(self.on_failure(failure(e))),
        };

        match result.rc {
            0 => {}
            RC_SIZE_LIMIT_EXCEEDED => {
                debug!(base = %request.base_dn, "size limit reached, returning partial page");
            }
            RC_REFERRAL if follow_referrals => {
                debug!(base = %request.base_dn, refs = ?result.refs, "search returned referrals");
            }
            rc => return Err(LinkFailure::server(rc, result.text)),
        }

        let cookie = paging.map(|_| response_cookie(&result.ctrls).unwrap_or_default());
        let entries: Vec<RawEntry> = entries
            .into_iter()
            .filter(|e| !e.is_ref() && !e.is_intermediate())
            .map(|e| raw_entry(SearchEntry::construct(e)))
            .collect();
        Ok(SearchPage {
            page: Box::new(MemoryPage::new(entries)),
            cookie,
        })
    }

    async fn add(&mut self, dn: &str, attributes: &AttributeMap) -> Result<(), LinkFailure> {
        let attrs: Vec<(&str, HashSet<&str>)> = attributes
            .iter()
            .map(|(name, values)| (name.as_str(), value_set(values)))
            .collect();
        let ldap = self.ldap().await?;
        let response = ldap.add(dn, attrs).await;
        match response {
            Ok(result) => check(result),
            Err(e) => Err(self.on_failure(failure(e))),
        }
    }

    async fn delete(&mut self, dn: &str) -> Result<(), LinkFailure> {
        let ldap = self.ldap().await?;
        let response = ldap.delete(dn).await;
        match response {
            Ok(result) => check(result),
            Err(e) => Err(self.on_failure(failure(e))),
        }
    }

    async fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_parent: Option<&str>,
        delete_old_rdn: bool,
    ) -> Result<(), LinkFailure> {
        let ldap = self.ldap().await?;
        let response = ldap.modifydn(dn, new_rdn, delete_old_rdn, new_parent).await;
        match response {
            Ok(result) => check(result),
            Err(e) => Err(self.on_failure(failure(e))),
        }
    }

    async fn modify(&mut self, dn: &str, changes: &[Modification]) -> Result<(), LinkFailure> {
        let mods: Vec<Mod<&str>> = changes
            .iter()
            .map(|change| match change {
                Modification::Add(attr, values) => Mod::Add(attr.as_str(), value_set(values)),
                Modification::Delete(attr, values) => Mod::Delete(attr.as_str(), value_set(values)),
                Modification::Replace(attr, values) => Mod::Replace(attr.as_str(), value_set(values)),
            })
            .collect();
        let ldap = self.ldap().await?;
        let response = ldap.modify(dn, mods).await;
        match response {
            Ok(result) => check(result),
            Err(e) => Err(self.on_failure(failure(e))),
        }
    }

    async fn compare(&mut self, dn: &str, attribute: &str, value: &str) -> Result<bool, LinkFailure> {
        let ldap = self.ldap().await?;
        let response = ldap.compare(dn, attribute, value).await;
        match response {
            Ok(result) => result.equal().map_err(failure),
            Err(e) => Err(self.on_failure(failure(e))),
        }
    }

    async fn whoami(&mut self) -> Result<Option<String>, LinkFailure> {
        let ldap = self.ldap().await?;
        let response = ldap.extended(WhoAmI).await;
        let response = match response {
            Ok(r) => r,
            Err(e) => return Err(self.on_failure(failure(e))),
        };
        let (exop, _) = response.success().map_err(failure)?;
        Ok(exop
            .val
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .filter(|authz| !authz.is_empty()))
    }

    async fn unbind(&mut self) -> Result<(), LinkFailure> {
        let Some(mut ldap) = self.ldap.take() else {
            return Ok(());
        };
        self.active_url = None;
        ldap.unbind().await.map_err(failure)
    }
}
