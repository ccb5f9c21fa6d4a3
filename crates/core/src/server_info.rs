use serde_json::Value;

use crate::transport::RecordSet;

pub const SERVER_INFO_QUERY: &str = "CALL dbms.components() YIELD name, versions, edition";

const KERNEL_COMPONENT: &str = "Neo4j Kernel";
const ENTERPRISE_EDITIONS: [&str; 2] = ["enterprise", "auraenterprise"];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerInfo {
    pub version: Option<String>,
    pub edition: Option<String>,
    pub store_size: Option<String>,
    pub cluster_role: Option<String>,
    pub auth_enabled: Option<bool>,
}

/// Fields reported by one fetch; `None` leaves the stored value alone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerInfoPatch {
    pub version: Option<String>,
    pub edition: Option<String>,
    pub store_size: Option<String>,
}

impl ServerInfoPatch {
    /// Reads version and edition from a `dbms.components()` result, preferring
    /// the kernel component. Results of other shapes yield an empty patch.
    #[must_use]
    pub fn from_components(result: &RecordSet) -> Self {
        let component = result
            .records
            .iter()
            .find(|record| record.get("name").and_then(Value::as_str) == Some(KERNEL_COMPONENT))
            .or_else(|| result.records.first());
        let Some(component) = component else {
            return Self::default();
        };

        Self {
            version: component
                .get("versions")
                .and_then(Value::as_array)
                .and_then(|versions| versions.first())
                .and_then(Value::as_str)
                .map(str::to_string),
            edition: component
                .get("edition")
                .and_then(Value::as_str)
                .map(str::to_string),
            store_size: None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.version.is_none() && self.edition.is_none() && self.store_size.is_none()
    }
}

impl ServerInfo {
    pub fn apply(&mut self, patch: &ServerInfoPatch) {
        if let Some(version) = &patch.version {
            self.version = Some(version.clone());
        }
        if let Some(edition) = &patch.edition {
            self.edition = Some(edition.clone());
        }
        if let Some(store_size) = &patch.store_size {
            self.store_size = Some(store_size.clone());
        }
    }

    #[must_use]
    pub fn is_enterprise(&self) -> bool {
        self.edition
            .as_deref()
            .is_some_and(|edition| ENTERPRISE_EDITIONS.contains(&edition))
    }

    #[must_use]
    pub fn is_beta(&self) -> bool {
        self.version
            .as_deref()
            .is_some_and(|version| version.contains('-'))
    }
}
