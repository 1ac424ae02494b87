//! Search requests and the RFC 2696 paged-results cookie loop.

use crate::cursor::RawPage;
use crate::diagnostic::Diagnostic;
use crate::error::LdapError;
use crate::filter::Condition;
use crate::guard::OpGuard;
use crate::link::{DirectoryLink, PagingControl, PrimitiveSearch, Scope};
use tracing::debug;

pub const DEFAULT_PAGE_SIZE: u32 = 1000;
pub const DEFAULT_MAX_PAGES: usize = 10_000;

/// A search, immutable once handed to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub filter: String,
    pub attributes: Vec<String>,
    pub scope: Scope,
    /// 0 means no client-side limit.
    pub size_limit: u32,
    pub page_size: u32,
    pub use_paging: bool,
}

impl SearchRequest {
    pub fn new(base_dn: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            filter: filter.into(),
            attributes: Vec::new(),
            scope: Scope::Subtree,
            size_limit: 0,
            page_size: DEFAULT_PAGE_SIZE,
            use_paging: true,
        }
    }

    /// Search with a filter compiled from a condition tree.
    pub fn with_condition(base_dn: impl Into<String>, condition: &Condition) -> Self {
        Self::new(base_dn, condition.to_string())
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    pub fn size_limit(mut self, limit: u32) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    pub fn paging(mut self, enabled: bool) -> Self {
        self.use_paging = enabled;
        self
    }

    /// Base-scope reads never page.
    pub fn is_paged(&self) -> bool {
        self.use_paging && self.scope != Scope::Base
    }

    fn primitive(&self) -> PrimitiveSearch<'_> {
        PrimitiveSearch {
            base_dn: &self.base_dn,
            scope: self.scope,
            filter: &self.filter,
            attributes: &self.attributes,
            size_limit: self.size_limit,
        }
    }
}

/// A paging run that stopped early. `pages` holds what arrived before the
/// failure.
#[derive(Debug)]
pub struct PartialPages {
    pub error: LdapError,
    pub pages: Vec<RawPage>,
}

/// Drives repeated primitive searches while the server hands back a cookie.
#[derive(Debug, Clone, Copy)]
pub struct PagedSearchController {
    max_pages: usize,
}

impl Default for PagedSearchController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAGES)
    }
}

impl PagedSearchController {
    pub fn new(max_pages: usize) -> Self {
        Self {
            max_pages: max_pages.max(1),
        }
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Execute `request`, returning every page in server order.
    pub(crate) async fn run(
        &self,
        link: &mut dyn DirectoryLink,
        request: &SearchRequest,
        guard: &OpGuard,
    ) -> Result<Vec<RawPage>, PartialPages> {
        let operation = operation_name(request.scope);
        let primitive = request.primitive();

        if !request.is_paged() {
            return match guard.run(operation, link.search(&primitive, None)).await {
                Ok(Ok(result)) => Ok(vec![RawPage::new(result.page)]),
                Ok(Err(failure)) => Err(PartialPages {
                    error: LdapError::from_link(operation, &failure),
                    pages: Vec::new(),
                }),
                Err(interrupted) => Err(PartialPages {
                    error: interrupted,
                    pages: Vec::new(),
                }),
            };
        }

        let mut pages: Vec<RawPage> = Vec::new();
        let mut control = PagingControl {
            size: request.page_size.max(1),
            critical: false,
            cookie: Vec::new(),
        };
        loop {
            if pages.len() >= self.max_pages {
                return Err(PartialPages {
                    error: LdapError::Connection(Diagnostic::new(format!(
                        "paged search on {:?} exceeded {} pages without a final cookie",
                        request.base_dn, self.max_pages
                    ))),
                    pages,
                });
            }
            let result = match guard.run(operation, link.search(&primitive, Some(&control))).await {
                Ok(Ok(result)) => result,
                Ok(Err(failure)) => {
                    return Err(PartialPages {
                        error: LdapError::from_link(operation, &failure),
                        pages,
                    });
                }
                Err(interrupted) => {
                    return Err(PartialPages {
                        error: interrupted,
                        pages,
                    });
                }
            };
            let cookie = result.cookie.unwrap_or_default();
            let page = RawPage::new(result.page);
            debug!(
                base = %request.base_dn,
                page = pages.len() + 1,
                entries = page.entry_count(),
                more = !cookie.is_empty(),
                "fetched search page"
            );
            pages.push(page);
            if cookie.is_empty() {
                return Ok(pages);
            }
            control.cookie = cookie;
        }
    }
}

/// Operation name reported in errors and metrics.
pub(crate) fn operation_name(scope: Scope) -> &'static str {
    match scope {
        Scope::Base => "read",
        Scope::OneLevel => "list",
        Scope::Subtree => "search",
    }
}
