//! The connection state machine: connect, options, StartTLS, bind, and the
//! directory operations that sit on top of a bound link.

use crate::cache::RecordCache;
use crate::config::Config;
use crate::cursor::{RawPage, Record, ResultCursor};
use crate::diagnostic::Diagnostic;
use crate::error::{LdapError, Result, SearchError};
use crate::filter::Condition;
use crate::guard::{is_interruption, OpGuard};
use crate::link::{
    AttributeMap, DirectoryLink, LinkConnector, LinkFailure, LinkOption, LinkTarget, Modification,
    Scope, PROTOCOL_VERSION,
};
use crate::metrics::Metrics;
use crate::native::Ldap3Connector;
use crate::paging::{operation_name, PagedSearchController, PartialPages, SearchRequest};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tag and key prefix for records stored in the cache.
const CACHE_KIND: &str = "entry";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connected,
    TlsEstablished,
    Bound,
}

/// Who the link is bound as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Anonymous,
    /// Bound with this (qualified) identity.
    User(String),
}

/// Session credentials. `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One directory session. Every operation takes `&mut self`; share it
/// between tasks behind a `tokio::sync::Mutex`.
pub struct Connection {
    config: Config,
    connector: Arc<dyn LinkConnector>,
    link: Option<Box<dyn DirectoryLink>>,
    /// Hosts and port of the last `connect`, reused by `open` and `reopen`.
    endpoint: Option<(Vec<String>, u16)>,
    state: ConnectionState,
    bind_state: BindState,
    /// Identity used by lazy opens. `None` binds anonymously.
    credentials: Option<Credentials>,
    cancel: CancellationToken,
    paging: PagedSearchController,
    metrics: Arc<Metrics>,
    cache: Option<Arc<dyn RecordCache>>,
}

impl Connection {
    pub fn new(config: Config, connector: Arc<dyn LinkConnector>) -> Self {
        let credentials = match (&config.admin_username, &config.admin_password) {
            (Some(user), Some(password)) => Some(Credentials::new(user.clone(), password.clone())),
            _ => None,
        };
        let paging = PagedSearchController::new(config.max_pages());
        Self {
            config,
            connector,
            link: None,
            endpoint: None,
            state: ConnectionState::Closed,
            bind_state: BindState::Unbound,
            credentials,
            cancel: CancellationToken::new(),
            paging,
            metrics: Arc::new(Metrics::new()),
            cache: None,
        }
    }

    /// Validate `config` and talk to the directory through `ldap3`.
    pub fn native(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config, Arc::new(Ldap3Connector)))
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn RecordCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn bind_state(&self) -> &BindState {
        &self.bind_state
    }

    pub fn is_bound(&self) -> bool {
        self.state == ConnectionState::Bound
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Replace the identity used by later lazy opens. Does not touch the
    /// current link.
    pub fn switch_credentials(&mut self, credentials: Option<Credentials>) {
        self.credentials = credentials;
    }

    /// Token that aborts the operation in flight. `close()` replaces a
    /// triggered token, so fetch a fresh one after a cancellation.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn guard(&self) -> OpGuard {
        OpGuard::new(self.cancel.clone(), self.config.operation_timeout())
    }

    fn endpoint(&self) -> (Vec<String>, u16) {
        self.endpoint
            .clone()
            .unwrap_or_else(|| (self.config.hosts.clone(), self.config.port()))
    }

    fn link_mut(&mut self) -> Result<&mut Box<dyn DirectoryLink>> {
        self.link
            .as_mut()
            .ok_or_else(|| LdapError::invalid_state("no open link"))
    }

    /// Create the native link for `hosts` and apply the session options. The
    /// network is not touched until the first operation that needs it.
    pub async fn connect(&mut self, hosts: &[String], port: u16) -> Result<()> {
        if self.state != ConnectionState::Closed {
            debug!(state = ?self.state, "connect on an open link, closing it first");
            self.close().await;
        }
        let target = LinkTarget::new(hosts, port, self.config.use_ssl)
            .map_err(|f| LdapError::connection(&f))?;

        let guard = self.guard();
        let outcome = guard.run("connect", self.connector.connect(&target)).await;
        let mut link = match outcome {
            Ok(Ok(link)) => link,
            Ok(Err(f)) => {
                warn!(target = %target, error = %f, "failed to create LDAP link");
                return Err(LdapError::connection(&f));
            }
            Err(e) => return Err(e),
        };

        for option in [
            LinkOption::ProtocolVersion(PROTOCOL_VERSION),
            LinkOption::Referrals(self.config.follow_referrals),
            LinkOption::NetworkTimeout(self.config.network_timeout()),
            LinkOption::TlsSkipVerify(self.config.tls_skip_verify),
        ] {
            link.set_option(option).map_err(|f| LdapError::connection(&f))?;
        }

        self.metrics.inc_connects();
        self.link = Some(link);
        self.endpoint = Some((hosts.to_vec(), port));
        self.state = ConnectionState::Connected;
        self.bind_state = BindState::Unbound;
        info!(target = %target, "LDAP link created");
        Ok(())
    }

    /// Upgrade a connected, not yet bound link with StartTLS.
    pub async fn start_tls(&mut self) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(LdapError::invalid_state(format!(
                "StartTLS needs a connected, unbound link (state is {:?})",
                self.state
            )));
        }
        let guard = self.guard();
        let link = self.link_mut()?;
        let outcome = guard.run("start_tls", link.start_tls()).await;
        match outcome {
            Ok(Ok(())) => {
                self.state = ConnectionState::TlsEstablished;
                debug!("StartTLS established");
                Ok(())
            }
            Ok(Err(f)) => {
                warn!(error = %f, "StartTLS failed");
                Err(LdapError::connection(&f))
            }
            Err(e) => {
                self.abandon();
                Err(e)
            }
        }
    }

    /// Bind the link. `anonymous` sends no credentials at all. A bare
    /// username is decorated with the account prefix and suffix.
    ///
    /// Any failure leaves the connection closed.
    pub async fn bind(&mut self, identity: &str, credential: &str, anonymous: bool) -> Result<()> {
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::TlsEstablished | ConnectionState::Bound
        ) {
            return Err(LdapError::invalid_state("bind needs a connected link"));
        }
        let started = Instant::now();
        let result = self.bind_link(identity, credential, anonymous).await;
        self.record("bind", started, &result);
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn bind_link(&mut self, identity: &str, credential: &str, anonymous: bool) -> Result<()> {
        if !anonymous && credential.is_empty() {
            warn!(identity = %identity, "refusing bind with an empty password");
            return Err(LdapError::Bind(Diagnostic::new(
                "empty password for a non-anonymous bind would be an unauthenticated bind",
            )));
        }
        let dn = if anonymous {
            String::new()
        } else {
            self.config.qualify_username(identity)
        };
        let password = if anonymous { "" } else { credential };

        let mut reconnected = false;
        loop {
            let guard = self.guard();
            let link = self.link_mut()?;
            let outcome = guard.run("bind", link.simple_bind(&dn, password)).await;
            match outcome {
                Ok(Ok(())) => break,
                Ok(Err(f))
                    if !reconnected
                        && Diagnostic::is_transport(&f)
                        && self.config.reconnect_on_bind_failure() =>
                {
                    warn!(dn = %dn, error = %f, "bind lost the link, re-establishing once");
                    reconnected = true;
                    self.metrics.inc_reconnects();
                    self.reestablish().await?;
                }
                Ok(Err(f)) if Diagnostic::is_transport(&f) => {
                    warn!(dn = %dn, error = %f, "bind could not reach the directory");
                    return Err(LdapError::connection(&f));
                }
                Ok(Err(f)) => {
                    warn!(dn = %dn, error = %f, "bind failed");
                    return Err(LdapError::bind(&f));
                }
                Err(e) => return Err(e),
            }
        }

        self.state = ConnectionState::Bound;
        if anonymous {
            self.bind_state = BindState::Anonymous;
            self.credentials = None;
            info!("bound anonymously");
        } else {
            self.bind_state = BindState::User(dn.clone());
            self.credentials = Some(Credentials::new(identity, credential));
            info!(dn = %dn, "bound");
        }
        Ok(())
    }

    /// Drop a broken link and build a new one for the same endpoint.
    async fn reestablish(&mut self) -> Result<()> {
        let tls = self.config.use_tls || self.state == ConnectionState::TlsEstablished;
        let (hosts, port) = self.endpoint();
        self.abandon();
        self.connect(&hosts, port).await?;
        if tls {
            self.start_tls().await?;
        }
        Ok(())
    }

    /// Connect (and StartTLS when configured) without binding.
    pub(crate) async fn open_unbound(&mut self) -> Result<()> {
        let result = self.establish().await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn establish(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            let (hosts, port) = self.endpoint();
            self.connect(&hosts, port).await?;
        }
        if self.config.use_tls && self.state == ConnectionState::Connected {
            self.start_tls().await?;
        }
        Ok(())
    }

    /// Connect, StartTLS if configured, then bind with the session
    /// credentials (anonymous when there are none).
    pub async fn open(&mut self) -> Result<()> {
        if self.is_bound() {
            return Ok(());
        }
        self.open_unbound().await?;
        match self.credentials.clone() {
            Some(c) => self.bind(&c.username, &c.password, false).await,
            None => self.bind("", "", true).await,
        }
    }

    /// Open lazily; called at the top of every directory operation.
    pub async fn ensure_open(&mut self) -> Result<()> {
        if self.is_bound() {
            return Ok(());
        }
        self.open().await
    }

    /// Close and open again with the identity used last.
    pub async fn reopen(&mut self) -> Result<()> {
        self.close().await;
        self.open().await
    }

    /// Unbind best-effort and drop the link. Idempotent; always `true`.
    pub async fn close(&mut self) -> bool {
        if let Some(mut link) = self.link.take() {
            let outcome = tokio::time::timeout(self.config.network_timeout(), link.unbind()).await;
            match outcome {
                Ok(Ok(())) => debug!("unbound"),
                Ok(Err(f)) => debug!(error = %f, "unbind failed, dropping the link anyway"),
                Err(_) => debug!("unbind timed out, dropping the link anyway"),
            }
            info!("LDAP link closed");
        }
        self.reset();
        true
    }

    /// Drop the link without unbinding, after a transport failure or an
    /// interrupted call left its protocol state unknown.
    fn abandon(&mut self) {
        if self.link.take().is_some() {
            warn!("dropping LDAP link in an unknown state");
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = ConnectionState::Closed;
        self.bind_state = BindState::Unbound;
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
    }

    fn record<T>(&self, operation: &'static str, started: Instant, result: &Result<T>) {
        self.metrics.observe(operation, started.elapsed());
        if let Err(e) = result {
            self.metrics.inc_error(operation, e.kind());
        }
    }

    async fn prepare(&mut self, operation: &'static str) -> Result<(Instant, OpGuard)> {
        let started = Instant::now();
        if let Err(e) = self.ensure_open().await {
            self.metrics.observe(operation, started.elapsed());
            self.metrics.inc_error(operation, e.kind());
            return Err(e);
        }
        Ok((started, self.guard()))
    }

    fn finish<T>(
        &mut self,
        operation: &'static str,
        started: Instant,
        outcome: std::result::Result<std::result::Result<T, LinkFailure>, LdapError>,
    ) -> Result<T> {
        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(f)) => Err(LdapError::from_link(operation, &f)),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(operation, error = %e, "directory operation failed");
            if is_interruption(e) || matches!(e, LdapError::Connection(_)) {
                self.abandon();
            }
        }
        self.record(operation, started, &result);
        result
    }

    fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_tag(CACHE_KIND);
        }
    }

    fn cursor(&self, pages: Vec<RawPage>, attributes: &[String]) -> ResultCursor {
        let cursor = ResultCursor::new(pages, self.config.multi_value);
        match &self.cache {
            Some(cache) => cursor.with_cache(
                Arc::clone(cache),
                CACHE_KIND,
                attributes,
                self.config.cache_ttl(),
            ),
            None => cursor,
        }
    }

    pub async fn add(&mut self, dn: &str, attributes: &AttributeMap) -> Result<()> {
        let (started, guard) = self.prepare("add").await?;
        let link = self.link_mut()?;
        let outcome = guard.run("add", link.add(dn, attributes)).await;
        let result = self.finish("add", started, outcome);
        if result.is_ok() {
            self.invalidate_cache();
            debug!(dn = %dn, "entry added");
        }
        result
    }

    pub async fn delete(&mut self, dn: &str) -> Result<()> {
        let (started, guard) = self.prepare("delete").await?;
        let link = self.link_mut()?;
        let outcome = guard.run("delete", link.delete(dn)).await;
        let result = self.finish("delete", started, outcome);
        if result.is_ok() {
            self.invalidate_cache();
            debug!(dn = %dn, "entry deleted");
        }
        result
    }

    /// Move or rename an entry. `new_parent` of `None` keeps it in place.
    pub async fn rename(
        &mut self,
        dn: &str,
        new_rdn: &str,
        new_parent: Option<&str>,
        delete_old_rdn: bool,
    ) -> Result<()> {
        let (started, guard) = self.prepare("rename").await?;
        let link = self.link_mut()?;
        let outcome = guard
            .run("rename", link.rename(dn, new_rdn, new_parent, delete_old_rdn))
            .await;
        let result = self.finish("rename", started, outcome);
        if result.is_ok() {
            self.invalidate_cache();
            debug!(dn = %dn, new_rdn = %new_rdn, "entry renamed");
        }
        result
    }

    /// Replace every listed attribute with the given values.
    pub async fn modify(&mut self, dn: &str, attributes: &AttributeMap) -> Result<()> {
        let changes: Vec<Modification> = attributes
            .iter()
            .map(|(name, values)| Modification::Replace(name.clone(), values.clone()))
            .collect();
        self.apply("modify", dn, &changes).await
    }

    /// Apply a batch of add / delete / replace changes in one request.
    pub async fn modify_batch(&mut self, dn: &str, changes: &[Modification]) -> Result<()> {
        self.apply("modify_batch", dn, changes).await
    }

    async fn apply(&mut self, operation: &'static str, dn: &str, changes: &[Modification]) -> Result<()> {
        if changes.is_empty() {
            debug!(dn = %dn, "no modifications to send");
            return Ok(());
        }
        let (started, guard) = self.prepare(operation).await?;
        let link = self.link_mut()?;
        let outcome = guard.run(operation, link.modify(dn, changes)).await;
        let result = self.finish(operation, started, outcome);
        if result.is_ok() {
            self.invalidate_cache();
            debug!(dn = %dn, changes = changes.len(), "entry modified");
        }
        result
    }

    /// Request prefilled with the configured paging defaults.
    pub fn search_request(&self, base_dn: impl Into<String>, filter: impl Into<String>) -> SearchRequest {
        SearchRequest::new(base_dn, filter)
            .page_size(self.config.page_size())
            .paging(self.config.use_paging())
    }

    /// Run a search. On failure the pages that did arrive travel in the
    /// error.
    pub async fn search(&mut self, request: &SearchRequest) -> Result<ResultCursor, SearchError> {
        let operation = operation_name(request.scope);
        let (started, guard) = self.prepare(operation).await?;
        let controller = self.paging;
        let link = self.link_mut()?;
        let outcome = controller.run(&mut **link, request, &guard).await;
        self.metrics.observe(operation, started.elapsed());
        match outcome {
            Ok(pages) => {
                let cursor = self.cursor(pages, &request.attributes);
                self.metrics.add_search_volume(cursor.page_count(), cursor.count());
                debug!(
                    base = %request.base_dn,
                    filter = %request.filter,
                    entries = cursor.count(),
                    pages = cursor.page_count(),
                    "search completed"
                );
                Ok(cursor)
            }
            Err(PartialPages { error, pages }) => {
                self.metrics.inc_error(operation, error.kind());
                warn!(
                    base = %request.base_dn,
                    filter = %request.filter,
                    pages = pages.len(),
                    error = %error,
                    "search failed"
                );
                if is_interruption(&error) || matches!(error, LdapError::Connection(_)) {
                    self.abandon();
                }
                if pages.is_empty() {
                    return Err(SearchError::new(error));
                }
                self.metrics
                    .add_search_volume(pages.len(), pages.iter().map(RawPage::entry_count).sum());
                Err(SearchError::with_partial(error, self.cursor(pages, &request.attributes)))
            }
        }
    }

    /// Immediate children of `base_dn`.
    pub async fn list(
        &mut self,
        base_dn: &str,
        filter: &str,
        attributes: &[&str],
    ) -> Result<ResultCursor, SearchError> {
        let request = self
            .search_request(base_dn, filter)
            .scope(Scope::OneLevel)
            .attributes(attributes.iter().copied());
        self.search(&request).await
    }

    /// The entry at `dn` itself.
    pub async fn read(&mut self, dn: &str, attributes: &[&str]) -> Result<ResultCursor, SearchError> {
        let request = self
            .search_request(dn, "(objectClass=*)")
            .scope(Scope::Base)
            .attributes(attributes.iter().copied());
        self.search(&request).await
    }

    /// First entry under `base_dn` whose login attribute equals `username`.
    pub async fn find_by_login(&mut self, username: &str) -> Result<Option<Record>> {
        let condition = Condition::eq(self.config.login_attribute(), username);
        let request = self.search_request(self.config.base_dn.clone(), condition.to_string());
        let mut cursor = self.search(&request).await?;
        let record = cursor.advance()?;
        cursor.close();
        Ok(record)
    }

    pub async fn compare(&mut self, dn: &str, attribute: &str, value: &str) -> Result<bool> {
        let (started, guard) = self.prepare("compare").await?;
        let link = self.link_mut()?;
        let outcome = guard.run("compare", link.compare(dn, attribute, value)).await;
        self.finish("compare", started, outcome)
    }

    /// Authorization identity of the session (RFC 4532); `None` when anonymous.
    pub async fn whoami(&mut self) -> Result<Option<String>> {
        let (started, guard) = self.prepare("whoami").await?;
        let link = self.link_mut()?;
        let outcome = guard.run("whoami", link.whoami()).await;
        self.finish("whoami", started, outcome)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("hosts", &self.endpoint().0)
            .field("state", &self.state)
            .field("bind_state", &self.bind_state)
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = link.unbind().await {
                        debug!(error = %e, "unbind on drop failed");
                    }
                });
            }
            Err(_) => debug!("no runtime available, dropping LDAP link without unbind"),
        }
    }
}
