//! Allow / deny interpretation of a probe result

use crate::template::NOT_NULL_SENTINEL;
use serde::{Deserialize, Serialize};

/// Outcome of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    /// Neither sentinel matched; treated as deny
    Inconclusive,
}

impl Verdict {
    /// Interpret the first column of the first row
    pub fn from_rows(rows: &[Vec<Option<String>>], allow: &str, deny: &str) -> Self {
        let Some(first) = rows.first() else {
            return Verdict::Deny;
        };
        let value = first.first().cloned().flatten();
        Self::from_value(value.as_deref(), allow, deny)
    }

    pub fn from_value(value: Option<&str>, allow: &str, deny: &str) -> Self {
        match value {
            Some(v) if v == deny => Verdict::Deny,
            Some(v) if v == allow => Verdict::Allow,
            Some(v) if allow == NOT_NULL_SENTINEL && !v.is_empty() => Verdict::Allow,
            _ => Verdict::Inconclusive,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
            Verdict::Inconclusive => "inconclusive",
        }
    }
}
