//! Probe templates
//!
//! 저장 형식: hex(JSON definition). 로드 시 한 번 decode.
//!
//! Placeholder: `${actor}`, `${user}`, `${host}`, `${database}`, `${object}`,
//! `${object_type}`, `${scope}`

use crate::schema::DbFamily;
use dbguard_foundation::{Error, Result, TemplateRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Allow sentinel matching any non-null, non-empty value
pub const NOT_NULL_SENTINEL: &str = "NOT NULL";

pub const VAR_ACTOR: &str = "actor";
pub const VAR_USER: &str = "user";
pub const VAR_HOST: &str = "host";
pub const VAR_DATABASE: &str = "database";
pub const VAR_OBJECT: &str = "object";
pub const VAR_OBJECT_TYPE: &str = "object_type";
pub const VAR_SCOPE: &str = "scope";

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern")
    })
}

/// Decoded template body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    /// Probe query
    pub query: String,

    /// Sentinel meaning "granted"
    pub allow: String,

    /// Sentinel meaning "not granted"
    pub deny: String,

    /// Object-specific variant of the probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_query: Option<String>,

    /// Statement granting this privilege on the live server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_sql: Option<String>,

    /// Statement revoking this privilege on the live server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_sql: Option<String>,
}

impl TemplateDefinition {
    /// JSON → hex, as stored in `policy_templates.definition`
    pub fn encode(&self) -> Result<String> {
        Ok(hex::encode(serde_json::to_vec(self)?))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Parse(format!("Invalid template definition: {}", e)))
    }
}

/// Decoded, immutable probe template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTemplate {
    pub id: i64,
    pub family: DbFamily,
    pub action_id: i64,
    pub object_type_id: i64,
    pub definition: TemplateDefinition,
}

impl ProbeTemplate {
    pub fn decode(record: &TemplateRecord) -> Result<Self> {
        let family = record
            .family
            .parse::<DbFamily>()
            .map_err(|e| Error::template(record.id, e.to_string()))?;
        let definition = TemplateDefinition::decode(&record.definition)
            .map_err(|e| Error::template(record.id, e.to_string()))?;
        Ok(Self {
            id: record.id,
            family,
            action_id: record.action_id,
            object_type_id: record.object_type_id,
            definition,
        })
    }

    /// Query text used for a given probe shape
    pub fn query_for_object(&self) -> &str {
        self.definition
            .object_query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(&self.definition.query)
    }

    /// Whether any of the template's probe texts use `${name}`
    pub fn uses(&self, name: &str) -> bool {
        uses_placeholder(&self.definition.query, name)
            || self
                .definition
                .object_query
                .as_deref()
                .is_some_and(|q| uses_placeholder(q, name))
    }

    pub fn is_super(&self) -> bool {
        self.id == self.family.super_template_id()
    }
}

/// Placeholder values for one probe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    values: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Replace `${name}` with the SQL-escaped value; unknown names stay as-is
pub fn substitute(sql: &str, vars: &TemplateVars) -> String {
    placeholder_re()
        .replace_all(sql, |caps: &regex::Captures| match vars.get(&caps[1]) {
            Some(value) => value.replace('\'', "''"),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Placeholder names still present in `sql`
pub fn unresolved_placeholders(sql: &str) -> Vec<String> {
    let mut names: Vec<String> = placeholder_re()
        .captures_iter(sql)
        .map(|caps| caps[1].to_string())
        .collect();
    names.dedup();
    names
}

pub fn uses_placeholder(sql: &str, name: &str) -> bool {
    placeholder_re()
        .captures_iter(sql)
        .any(|caps| &caps[1] == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> TemplateDefinition {
        TemplateDefinition {
            query: "SELECT Select_priv FROM mysql.db WHERE User = '${user}' AND Db = '${database}'"
                .into(),
            allow: "Y".into(),
            deny: "N".into(),
            object_query: None,
            grant_sql: Some("GRANT SELECT ON `${database}`.* TO '${user}'@'${host}'".into()),
            revoke_sql: None,
        }
    }

    #[test]
    fn test_decode_stored_record() {
        let record = TemplateRecord {
            id: 12,
            family: "mysql".into(),
            action_id: 3,
            object_type_id: 1,
            definition: definition().encode().unwrap(),
        };
        let template = ProbeTemplate::decode(&record).unwrap();
        assert_eq!(template.definition, definition());
        assert!(template.uses(VAR_DATABASE));
        assert!(!template.uses(VAR_OBJECT));
        assert!(!template.is_super());
    }

    #[test]
    fn test_decode_errors_carry_template_id() {
        let record = TemplateRecord {
            id: 44,
            family: "mysql".into(),
            action_id: 1,
            object_type_id: 0,
            definition: "not-hex".into(),
        };
        let err = ProbeTemplate::decode(&record).unwrap_err();
        assert!(err.to_string().contains("44"));
    }

    #[test]
    fn test_substitute_escapes_quotes() {
        let vars = TemplateVars::new()
            .set(VAR_USER, "o'brien")
            .set(VAR_DATABASE, "sales");
        let sql = substitute(&definition().query, &vars);
        assert_eq!(
            sql,
            "SELECT Select_priv FROM mysql.db WHERE User = 'o''brien' AND Db = 'sales'"
        );
        assert!(unresolved_placeholders(&sql).is_empty());
    }

    #[test]
    fn test_unknown_placeholders_stay() {
        let vars = TemplateVars::new().set(VAR_USER, "a");
        let sql = substitute("SELECT '${object}' , '${user}'", &vars);
        assert_eq!(sql, "SELECT '${object}' , 'a'");
        assert_eq!(unresolved_placeholders(&sql), vec!["object".to_string()]);
    }
}
