pub mod auth;
pub mod cache;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod diagnostic;
pub mod error;
pub mod filter;
mod guard;
pub mod link;
pub mod metrics;
pub mod native;
pub mod paging;

#[cfg(test)]
mod testing;

pub use auth::{AuthOptions, AuthResult};
pub use cache::{MemoryCache, RecordCache};
pub use config::Config;
pub use connection::{BindState, Connection, ConnectionState, Credentials};
pub use cursor::{MultiValue, Record, ResultCursor};
pub use diagnostic::{extract_diagnostic_code, Diagnostic};
pub use error::{LdapError, Result, SearchError};
pub use filter::Condition;
pub use link::{AttributeMap, Modification, Scope};
pub use metrics::Metrics;
pub use paging::{PagedSearchController, SearchRequest};
