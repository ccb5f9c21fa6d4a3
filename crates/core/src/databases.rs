use serde_json::{Map, Value};

use crate::transport::RecordSet;

pub const SHOW_DATABASES_QUERY: &str = "SHOW DATABASES";

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseRecord {
    pub name: String,
    pub status: Option<String>,
    pub default: bool,
    /// Every column the server returned for this row.
    pub fields: Map<String, Value>,
}

impl DatabaseRecord {
    #[must_use]
    pub fn new(name: impl Into<String>, default: bool) -> Self {
        Self {
            name: name.into(),
            status: Some("online".to_string()),
            default,
            fields: Map::new(),
        }
    }
}

/// Parses a `SHOW DATABASES` result. Rows without a name are skipped.
#[must_use]
pub fn databases_from_records(result: &RecordSet) -> Vec<DatabaseRecord> {
    result
        .records
        .iter()
        .filter_map(|record| {
            let name = record.get("name").and_then(Value::as_str)?;
            Some(DatabaseRecord {
                name: name.to_string(),
                status: record
                    .get("currentStatus")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                default: record
                    .get("default")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                fields: record.to_map(),
            })
        })
        .collect()
}

/// What the poller has to do after a cycle to settle the active database.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatabaseSelection {
    pub use_db: Option<String>,
    pub clear_request: bool,
    pub unknown_database_command: Option<String>,
    pub refetch_schema: bool,
}

impl DatabaseSelection {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

#[must_use]
pub fn resolve_database_selection(
    current_use_db: Option<&str>,
    requested_use_db: Option<&str>,
    databases: &[DatabaseRecord],
) -> DatabaseSelection {
    if current_use_db.is_some_and(|current| !current.is_empty()) {
        return DatabaseSelection::default();
    }

    let default_db = || {
        databases
            .iter()
            .find(|database| database.default)
            .map(|database| database.name.clone())
    };

    let Some(requested) = requested_use_db.filter(|requested| !requested.is_empty()) else {
        return DatabaseSelection {
            use_db: default_db(),
            ..DatabaseSelection::default()
        };
    };

    let wanted = databases
        .iter()
        .find(|database| database.name.to_lowercase() == requested.to_lowercase());

    match wanted {
        Some(database) => DatabaseSelection {
            use_db: Some(database.name.clone()),
            clear_request: true,
            unknown_database_command: None,
            refetch_schema: true,
        },
        None => DatabaseSelection {
            use_db: default_db(),
            clear_request: true,
            unknown_database_command: Some(format!(":use {requested}")),
            refetch_schema: false,
        },
    }
}
