use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use crate::transport::RecordSet;

pub const CLIENT_CONFIG_QUERY: &str = "CALL dbms.clientConfig()";
pub const LIST_CONFIG_QUERY: &str = "CALL dbms.listConfig()";

pub const ALLOW_OUTGOING_CONNECTIONS: &str = "browser.allow_outgoing_connections";
pub const CREDENTIAL_TIMEOUT: &str = "browser.credential_timeout";
pub const REMOTE_CONTENT_ALLOWLIST: &str = "browser.remote_content_hostname_allowlist";
pub const REMOTE_CONTENT_WHITELIST: &str = "browser.remote_content_hostname_whitelist";
pub const RETAIN_CONNECTION_CREDENTIALS: &str = "browser.retain_connection_credentials";
pub const AUTH_ENABLED: &str = "dbms.security.auth_enabled";
pub const ACTIVE_DATABASE: &str = "dbms.active_database";

const DEFAULT_ALLOWLIST: &str = "guides.neo4j.com, localhost";

/// Explicit "off" values in server configuration. Absent or null is not falsy.
#[must_use]
pub fn is_config_val_falsy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "false" | "no" | "0" | "off"
        ),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    values: BTreeMap<String, Value>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let mut values = BTreeMap::new();
        values.insert(ALLOW_OUTGOING_CONNECTIONS.to_string(), Value::Bool(false));
        values.insert(
            REMOTE_CONTENT_ALLOWLIST.to_string(),
            Value::String(DEFAULT_ALLOWLIST.to_string()),
        );
        values.insert(RETAIN_CONNECTION_CREDENTIALS.to_string(), Value::Bool(false));
        Self { values }
    }
}

/// Side effects implied by a settings payload, dispatched alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SettingsEffects {
    pub retain_credentials: Option<bool>,
    pub auth_enabled: Option<bool>,
}

impl ServerSettings {
    #[must_use]
    pub fn new(mut values: BTreeMap<String, Value>) -> Self {
        if let Some(legacy) = values.remove(REMOTE_CONTENT_WHITELIST) {
            values.entry(REMOTE_CONTENT_ALLOWLIST.to_string()).or_insert(legacy);
        }
        Self { values }
    }

    /// Builds settings from `name`/`value` configuration records.
    #[must_use]
    pub fn from_records(result: &RecordSet) -> (Self, SettingsEffects) {
        let mut effects = SettingsEffects::default();
        let mut values = BTreeMap::new();

        for record in &result.records {
            let Some(name) = record.get("name").and_then(Value::as_str) else {
                continue;
            };
            let raw = record.get("value").cloned().unwrap_or(Value::Null);
            let value = match name {
                RETAIN_CONNECTION_CREDENTIALS => {
                    let retain = !is_config_val_falsy(&raw);
                    effects.retain_credentials = Some(retain);
                    Value::Bool(retain)
                }
                ALLOW_OUTGOING_CONNECTIONS => Value::Bool(!is_config_val_falsy(&raw)),
                AUTH_ENABLED => {
                    let enabled = !is_config_val_falsy(&raw);
                    effects.auth_enabled = Some(enabled);
                    Value::Bool(enabled)
                }
                _ => raw,
            };
            values.insert(name.to_string(), value);
        }

        (Self::new(values), effects)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    #[must_use]
    pub fn allow_outgoing_connections(&self) -> bool {
        self.get(ALLOW_OUTGOING_CONNECTIONS)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn retain_connection_credentials(&self) -> bool {
        self.get(RETAIN_CONNECTION_CREDENTIALS)
            .filter(|value| !value.is_null())
            .is_some_and(|value| !is_config_val_falsy(value))
    }

    /// Zero means credentials never time out.
    #[must_use]
    pub fn credential_timeout(&self) -> Duration {
        let seconds = match self.get(CREDENTIAL_TIMEOUT) {
            Some(Value::Number(number)) => number.as_u64().unwrap_or(0),
            Some(Value::String(text)) => parse_duration_seconds(text),
            _ => 0,
        };
        Duration::from_secs(seconds)
    }

    #[must_use]
    pub fn remote_content_hostname_allowlist(&self) -> Option<&str> {
        self.get(REMOTE_CONTENT_ALLOWLIST).and_then(Value::as_str)
    }

    #[must_use]
    pub fn active_database(&self) -> Option<&str> {
        self.get(ACTIVE_DATABASE).and_then(Value::as_str)
    }
}

// Accepts plain seconds or the server's `<n>s` / `<n>m` / `<n>h` forms.
fn parse_duration_seconds(text: &str) -> u64 {
    let text = text.trim();
    let (digits, multiplier) = match text.char_indices().last() {
        Some((index, 's')) => (&text[..index], 1),
        Some((index, 'm')) => (&text[..index], 60),
        Some((index, 'h')) => (&text[..index], 3_600),
        _ => (text, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .map_or(0, |value| value.saturating_mul(multiplier))
}
