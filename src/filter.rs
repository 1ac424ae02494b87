//! Condition trees compiled to RFC 4515 filter strings.

use std::fmt;

/// A search condition. `Display` renders the filter string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Equals { attribute: String, value: String },
    Present { attribute: String },
    StartsWith { attribute: String, value: String },
    Contains { attribute: String, value: String },
    GreaterOrEqual { attribute: String, value: String },
    LessOrEqual { attribute: String, value: String },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    /// Pre-built filter text, emitted as is.
    Raw(String),
}

impl Condition {
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Condition::Equals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn present(attribute: impl Into<String>) -> Self {
        Condition::Present {
            attribute: attribute.into(),
        }
    }

    pub fn starts_with(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Condition::StartsWith {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn contains(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Condition::Contains {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Condition::And(conditions)
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Condition::Or(conditions)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: Condition) -> Self {
        Condition::Not(Box::new(condition))
    }

    /// Hash form: every pair must match, `(&(a=b)(c=d))`. A single pair
    /// renders without the `&` wrapper.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut conditions: Vec<Condition> = pairs.into_iter().map(|(k, v)| Condition::eq(k, v)).collect();
        if conditions.len() == 1 {
            conditions.remove(0)
        } else {
            Condition::And(conditions)
        }
    }
}

/// Escape a value for use inside a filter (RFC 4515 section 3).
pub fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            _ => out.push(ch),
        }
    }
    out
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Equals { attribute, value } => {
                write!(f, "({}={})", attribute, escape_filter_value(value))
            }
            Condition::Present { attribute } => write!(f, "({}=*)", attribute),
            Condition::StartsWith { attribute, value } => {
                write!(f, "({}={}*)", attribute, escape_filter_value(value))
            }
            Condition::Contains { attribute, value } => {
                write!(f, "({}=*{}*)", attribute, escape_filter_value(value))
            }
            Condition::GreaterOrEqual { attribute, value } => {
                write!(f, "({}>={})", attribute, escape_filter_value(value))
            }
            Condition::LessOrEqual { attribute, value } => {
                write!(f, "({}<={})", attribute, escape_filter_value(value))
            }
            Condition::And(inner) => {
                f.write_str("(&")?;
                for c in inner {
                    write!(f, "{}", c)?;
                }
                f.write_str(")")
            }
            Condition::Or(inner) => {
                f.write_str("(|")?;
                for c in inner {
                    write!(f, "{}", c)?;
                }
                f.write_str(")")
            }
            Condition::Not(inner) => write!(f, "(!{})", inner),
            Condition::Raw(text) => f.write_str(text),
        }
    }
}
