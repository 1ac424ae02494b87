//! Forward-only cursor over search result pages.

use crate::cache::RecordCache;
use crate::error::{LdapError, Result};
use crate::link::{RawEntry, ResultPage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How multi-valued attributes are exposed in a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiValue {
    /// All values joined with `,` into a single string. A value that itself
    /// contains a comma cannot be told apart from two values.
    #[default]
    Joined,
    /// Every value kept as its own string.
    Preserve,
}

impl MultiValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            MultiValue::Joined => "joined",
            MultiValue::Preserve => "preserve",
        }
    }
}

/// One directory entry: DN and attributes sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Record {
    /// Walk the raw attribute chain once and build the sorted map.
    pub fn from_raw(raw: RawEntry, mode: MultiValue) -> Self {
        let mut attributes = BTreeMap::new();
        for (name, values) in raw.attributes {
            let values: Vec<String> = values
                .into_iter()
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .collect();
            let values = match mode {
                MultiValue::Joined => vec![values.join(",")],
                MultiValue::Preserve => values,
            };
            attributes.insert(name, values);
        }
        Self {
            dn: raw.dn,
            attributes,
        }
    }

    /// First value of an attribute (the joined string in `Joined` mode).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn values(&self, name: &str) -> Option<&[String]> {
        self.attributes.get(name).map(Vec::as_slice)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }
}

/// Owner of one native page. Freeing is idempotent and happens on drop.
pub struct RawPage {
    inner: Box<dyn ResultPage>,
    freed: bool,
}

impl RawPage {
    pub fn new(inner: Box<dyn ResultPage>) -> Self {
        Self {
            inner,
            freed: false,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.inner.entry_count()
    }

    fn next_entry(&mut self) -> Option<RawEntry> {
        if self.freed {
            return None;
        }
        self.inner.next_entry()
    }

    pub fn is_freed(&self) -> bool {
        self.freed
    }

    pub fn free(&mut self) {
        if !self.freed {
            self.inner.free();
            self.freed = true;
        }
    }
}

impl Drop for RawPage {
    fn drop(&mut self) {
        self.free();
    }
}

impl fmt::Debug for RawPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawPage")
            .field("entries", &self.entry_count())
            .field("freed", &self.freed)
            .finish()
    }
}

struct CacheHook {
    cache: Arc<dyn RecordCache>,
    kind: String,
    /// Requested attributes, lowercased and sorted; `*` for all.
    projection: String,
    ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Ready,
    Active,
    Exhausted,
    Closed,
}

/// Single-pass cursor over one or more pages. Cannot be rewound once it
/// has moved.
pub struct ResultCursor {
    pages: Vec<RawPage>,
    page_index: usize,
    count: usize,
    state: CursorState,
    current: Option<Record>,
    mode: MultiValue,
    cache: Option<CacheHook>,
}

impl ResultCursor {
    pub fn new(pages: Vec<RawPage>, mode: MultiValue) -> Self {
        let count = pages.iter().map(RawPage::entry_count).sum();
        Self {
            pages,
            page_index: 0,
            count,
            state: CursorState::Ready,
            current: None,
            mode,
            cache: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), MultiValue::default())
    }

    /// Consult `cache` before materializing a record. Entries are keyed by
    /// `kind`, value mode, the attribute selection and DN, and tagged with
    /// `kind`. An empty `attributes` slice means every attribute.
    pub fn with_cache(
        mut self,
        cache: Arc<dyn RecordCache>,
        kind: impl Into<String>,
        attributes: &[String],
        ttl: Duration,
    ) -> Self {
        self.cache = Some(CacheHook {
            cache,
            kind: kind.into(),
            projection: projection_key(attributes),
            ttl,
        });
        self
    }

    /// Total entries across all pages, known before any entry is walked.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state == CursorState::Closed
    }

    /// Move to the next entry, crossing page boundaries. `Ok(None)` once every
    /// page is exhausted.
    pub fn advance(&mut self) -> Result<Option<Record>> {
        match self.state {
            CursorState::Closed => return Err(LdapError::invalid_state("cursor is closed")),
            CursorState::Exhausted => return Ok(None),
            CursorState::Ready | CursorState::Active => {}
        }
        self.state = CursorState::Active;
        while let Some(page) = self.pages.get_mut(self.page_index) {
            if let Some(raw) = page.next_entry() {
                let record = self.materialize(raw);
                self.current = Some(record.clone());
                return Ok(Some(record));
            }
            page.free();
            self.page_index += 1;
        }
        self.state = CursorState::Exhausted;
        self.current = None;
        Ok(None)
    }

    /// Record at the current position, if the cursor sits on one.
    pub fn current(&self) -> Option<&Record> {
        self.current.as_ref()
    }

    /// Succeeds only while nothing has been consumed.
    pub fn rewind(&mut self) -> Result<()> {
        match self.state {
            CursorState::Ready => Ok(()),
            CursorState::Closed => Err(LdapError::invalid_state("cursor is closed")),
            CursorState::Active | CursorState::Exhausted => {
                Err(LdapError::invalid_state("result cursor is forward-only and cannot be rewound"))
            }
        }
    }

    /// Drain every remaining record.
    pub fn to_array(&mut self) -> Result<Vec<Record>> {
        if self.state == CursorState::Closed {
            return Err(LdapError::invalid_state("cursor is closed"));
        }
        if self.count == 0 {
            return Ok(Vec::new());
        }
        let mut records = Vec::with_capacity(self.count);
        while let Some(record) = self.advance()? {
            records.push(record);
        }
        Ok(records)
    }

    /// Borrowing iterator over the remaining records. A closed cursor yields
    /// one `InvalidState` error.
    pub fn records(&mut self) -> impl Iterator<Item = Result<Record>> + '_ {
        let mut failed = false;
        std::iter::from_fn(move || {
            if failed {
                return None;
            }
            match self.advance() {
                Ok(record) => record.map(Ok),
                Err(e) => {
                    failed = true;
                    Some(Err(e))
                }
            }
        })
    }

    /// Free every page. Safe to call more than once.
    pub fn close(&mut self) {
        for page in &mut self.pages {
            page.free();
        }
        self.current = None;
        self.state = CursorState::Closed;
    }

    fn materialize(&self, raw: RawEntry) -> Record {
        let Some(hook) = &self.cache else {
            return Record::from_raw(raw, self.mode);
        };
        let key = format!("{}:{}:{}:{}", hook.kind, self.mode.as_str(), hook.projection, raw.dn);
        if let Some(bytes) = hook.cache.get(&key) {
            match serde_json::from_slice::<Record>(&bytes) {
                Ok(record) => {
                    debug!(key = %key, "record served from cache");
                    return record;
                }
                Err(e) => warn!(key = %key, error = %e, "discarding undecodable cached record"),
            }
        }
        let record = Record::from_raw(raw, self.mode);
        match serde_json::to_vec(&record) {
            Ok(bytes) => hook.cache.set(&key, bytes, hook.ttl, &[hook.kind.as_str()]),
            Err(e) => warn!(key = %key, error = %e, "record not cached"),
        }
        record
    }
}

fn projection_key(attributes: &[String]) -> String {
    let mut names: Vec<String> = attributes.iter().map(|a| a.to_ascii_lowercase()).collect();
    if names.is_empty() || names.iter().any(|a| a == "*") {
        return "*".to_string();
    }
    names.sort();
    names.dedup();
    names.join(",")
}

impl fmt::Debug for ResultCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCursor")
            .field("count", &self.count)
            .field("pages", &self.pages.len())
            .field("page_index", &self.page_index)
            .field("state", &self.state)
            .finish()
    }
}
