//! Credential checks that leave the session the way they found it.

use crate::connection::Connection;
use crate::diagnostic::Diagnostic;
use crate::error::{LdapError, Result};
use serde::Serialize;
use tracing::{debug, info};

/// Outcome of [`Connection::authenticate`]. Only bind failures end up here;
/// everything else is returned as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuthResult {
    Authenticated { identity: String },
    Rejected(Diagnostic),
}

impl AuthResult {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthResult::Authenticated { .. })
    }

    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            AuthResult::Rejected(d) => Some(d),
            AuthResult::Authenticated { .. } => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.diagnostic().and_then(Diagnostic::code)
    }

    pub fn message(&self) -> Option<&str> {
        self.diagnostic().map(|d| d.message.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuthOptions {
    /// Keep the user-bound session and use these credentials for later
    /// lazy opens.
    pub switch_credentials: bool,
}

impl Connection {
    /// Check `identity` / `credential` with a fresh bind, then restore the
    /// previous session.
    pub async fn authenticate(&mut self, identity: &str, credential: &str) -> Result<AuthResult> {
        self.authenticate_with(identity, credential, AuthOptions::default())
            .await
    }

    pub async fn authenticate_with(
        &mut self,
        identity: &str,
        credential: &str,
        options: AuthOptions,
    ) -> Result<AuthResult> {
        let was_bound = self.is_bound();
        let prior = self.credentials().cloned();
        debug!(identity = %identity, was_bound, "authenticating");

        self.close().await;
        let attempt = match self.open_unbound().await {
            Ok(()) => self.bind(identity, credential, false).await,
            Err(e) => Err(e),
        };
        let result = match attempt {
            Ok(()) => AuthResult::Authenticated {
                identity: self.config().qualify_username(identity),
            },
            Err(LdapError::Bind(diagnostic)) => {
                info!(identity = %identity, code = ?diagnostic.code(), "authentication rejected");
                AuthResult::Rejected(diagnostic)
            }
            Err(other) => {
                self.switch_credentials(prior);
                return Err(other);
            }
        };

        if result.is_authenticated() && options.switch_credentials {
            info!(identity = %identity, "session switched to authenticated user");
            return Ok(result);
        }

        self.switch_credentials(prior);
        if was_bound {
            self.reopen().await?;
        } else {
            self.close().await;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::{BindState, ConnectionState, Credentials};
    use crate::testing::MockDirectory;
    use std::sync::Arc;

    const ADMIN: &str = "cn=admin,dc=example,dc=com";

    fn directory() -> MockDirectory {
        MockDirectory::new()
            .with_user(ADMIN, "adminpw")
            .with_user("alice@example.com", "alicepw")
    }

    fn connection(dir: &MockDirectory) -> Connection {
        let mut config = Config::for_hosts(["dc1.example.com"]);
        config.account_suffix = "@example.com".into();
        config.admin_username = Some(ADMIN.into());
        config.admin_password = Some("adminpw".into());
        Connection::new(config, Arc::new(dir.clone()))
    }

    #[tokio::test]
    async fn test_wrong_password_restores_admin_session() {
        let dir = directory();
        let mut conn = connection(&dir);
        conn.open().await.unwrap();

        let result = conn.authenticate("alice", "wrongpass").await.unwrap();
        assert!(!result.is_authenticated());
        assert_eq!(result.code(), Some("52e"));
        assert!(!result.message().unwrap().is_empty());

        assert!(conn.is_bound());
        assert_eq!(conn.bind_state(), &BindState::User(ADMIN.into()));
        assert_eq!(dir.binds(), vec![ADMIN, "alice@example.com", ADMIN]);
    }

    #[tokio::test]
    async fn test_success_without_switch_restores_admin() {
        let dir = directory();
        let mut conn = connection(&dir);
        conn.open().await.unwrap();

        let result = conn.authenticate("alice", "alicepw").await.unwrap();
        assert_eq!(
            result,
            AuthResult::Authenticated {
                identity: "alice@example.com".into()
            }
        );
        assert_eq!(conn.bind_state(), &BindState::User(ADMIN.into()));
        assert_eq!(conn.credentials(), Some(&Credentials::new(ADMIN, "adminpw")));
    }

    #[tokio::test]
    async fn test_success_with_switch_keeps_user_session() {
        let dir = directory();
        let mut conn = connection(&dir);
        conn.open().await.unwrap();

        let options = AuthOptions {
            switch_credentials: true,
        };
        let result = conn.authenticate_with("alice", "alicepw", options).await.unwrap();
        assert!(result.is_authenticated());
        assert_eq!(conn.bind_state(), &BindState::User("alice@example.com".into()));

        conn.close().await;
        conn.ensure_open().await.unwrap();
        assert_eq!(dir.binds().last().map(String::as_str), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn test_no_prior_session_ends_closed() {
        let dir = directory();
        let mut conn = connection(&dir);

        let result = conn.authenticate("alice", "alicepw").await.unwrap();
        assert!(result.is_authenticated());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.credentials(), Some(&Credentials::new(ADMIN, "adminpw")));

        let rejected = conn.authenticate("alice", "nope").await.unwrap();
        assert!(!rejected.is_authenticated());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_empty_password_is_rejected_not_raised() {
        let dir = directory();
        let mut conn = connection(&dir);
        let result = conn.authenticate("alice", "").await.unwrap();
        assert!(!result.is_authenticated());
        assert!(dir.binds().is_empty());
    }

    #[tokio::test]
    async fn test_connection_errors_propagate() {
        let dir = directory();
        let mut config = Config::for_hosts(["dc 1"]);
        config.admin_username = Some(ADMIN.into());
        config.admin_password = Some("adminpw".into());
        let mut broken = Connection::new(config, Arc::new(dir.clone()));
        let err = broken.authenticate("alice", "alicepw").await.unwrap_err();
        assert!(matches!(err, LdapError::Connection(_)));
        assert_eq!(broken.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_not_a_rejection() {
        let dir = directory();
        let mut conn = connection(&dir);
        dir.unreachable_binds(2);

        let err = conn.authenticate("alice", "alicepw").await.unwrap_err();
        assert!(matches!(err, LdapError::Connection(_)));
        assert!(!err.is_bind());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.credentials(), Some(&Credentials::new(ADMIN, "adminpw")));
    }

    #[test]
    fn test_auth_result_serializes_tagged() {
        let ok = AuthResult::Authenticated {
            identity: "alice@example.com".into(),
        };
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["result"], "authenticated");
        assert_eq!(json["identity"], "alice@example.com");
    }
}
