//! Decoding of server diagnostics: hex sub-codes and LDAP result code names.

use crate::link::{FailureKind, LinkFailure};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

static DIAGNOSTIC_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9a-fA-F]+):").expect("diagnostic code pattern is valid")
});

/// Extract the leading hex sub-code from a raw diagnostic message.
///
/// `"52e: 80090308: LdapErr: ..."` yields `Some("52e")`; a message without a
/// `<hex>:` prefix yields `None`.
pub fn extract_diagnostic_code(message: &str) -> Option<&str> {
    DIAGNOSTIC_CODE
        .captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Human-readable text for an LDAP result code (RFC 4511 plus the usual
/// client-side codes).
pub fn result_code_name(rc: u32) -> &'static str {
    match rc {
        0 => "Success",
        1 => "Operations error",
        2 => "Protocol error",
        3 => "Time limit exceeded",
        4 => "Size limit exceeded",
        5 => "Compare false",
        6 => "Compare true",
        7 => "Authentication method not supported",
        8 => "Strong(er) authentication required",
        10 => "Referral",
        11 => "Administrative limit exceeded",
        12 => "Critical extension is unavailable",
        13 => "Confidentiality required",
        14 => "SASL bind in progress",
        16 => "No such attribute",
        17 => "Undefined attribute type",
        18 => "Inappropriate matching",
        19 => "Constraint violation",
        20 => "Type or value exists",
        21 => "Invalid syntax",
        32 => "No such object",
        33 => "Alias problem",
        34 => "Invalid DN syntax",
        36 => "Alias dereferencing problem",
        48 => "Inappropriate authentication",
        49 => "Invalid credentials",
        50 => "Insufficient access",
        51 => "Server is busy",
        52 => "Server is unavailable",
        53 => "Server is unwilling to perform",
        54 => "Loop detected",
        64 => "Naming violation",
        65 => "Object class violation",
        66 => "Operation not allowed on non-leaf",
        67 => "Operation not allowed on RDN",
        68 => "Already exists",
        69 => "Cannot modify object class",
        71 => "Results too large",
        80 => "Internal (implementation specific) error",
        81 => "Can't contact LDAP server",
        82 => "Local error",
        85 => "Timed out",
        89 => "Bad parameter to an ldap routine",
        91 => "Connect error",
        _ => "Unknown error",
    }
}

/// Decoded diagnostic attached to every typed error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// Numeric LDAP result code, when the server answered.
    pub result_code: Option<u32>,
    /// Hex sub-code from the diagnostic prefix, else the numeric result code.
    pub code: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            result_code: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_result_code(mut self, rc: u32) -> Self {
        self.result_code = Some(rc);
        if self.code.is_none() {
            self.code = Some(rc.to_string());
        }
        self
    }

    /// Decode a primitive failure. The server diagnostic wins over the generic
    /// result text when it is present.
    pub fn from_failure(failure: &LinkFailure) -> Self {
        let diagnostic = failure.diagnostic.trim();
        let message = if !diagnostic.is_empty() {
            diagnostic.to_string()
        } else if !failure.message.is_empty() {
            failure.message.clone()
        } else {
            failure
                .result_code
                .map(result_code_name)
                .unwrap_or("Unknown error")
                .to_string()
        };
        let code = extract_diagnostic_code(diagnostic)
            .map(str::to_string)
            .or_else(|| failure.result_code.map(|rc| rc.to_string()));
        Self {
            result_code: failure.result_code,
            code,
            message,
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// True when the failure came from the transport rather than a server
    /// verdict (used by the bind reconnect policy).
    pub(crate) fn is_transport(failure: &LinkFailure) -> bool {
        failure.kind == FailureKind::Transport || matches!(failure.result_code, Some(51 | 52 | 81 | 91))
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}
