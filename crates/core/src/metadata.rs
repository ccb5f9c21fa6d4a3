use serde_json::Value;

use crate::transport::RecordSet;

pub const SYSTEM_DB: &str = "system";

pub const META_QUERY: &str = "\
CALL db.labels() YIELD label
RETURN {name:'labels', data:COLLECT(label)[..1000]} AS result
UNION ALL
CALL db.relationshipTypes() YIELD relationshipType
RETURN {name:'relationshipTypes', data:COLLECT(relationshipType)[..1000]} AS result
UNION ALL
CALL db.propertyKeys() YIELD propertyKey
RETURN {name:'propertyKeys', data:COLLECT(propertyKey)[..1000]} AS result
UNION ALL
CALL dbms.functions() YIELD name, signature, description
RETURN {name:'functions', data: collect({name: name, signature: signature, description: description})} AS result
UNION ALL
CALL dbms.procedures() YIELD name, signature, description
RETURN {name:'procedures', data:collect({name: name, signature: signature, description: description})} AS result
UNION ALL
MATCH () RETURN { name:'nodes', data:count(*) } AS result
UNION ALL
MATCH ()-[]->() RETURN { name:'relationships', data: count(*)} AS result";

const LABELS: usize = 0;
const RELATIONSHIP_TYPES: usize = 1;
const PROPERTY_KEYS: usize = 2;
const FUNCTIONS: usize = 3;
const PROCEDURES: usize = 4;
const NODE_COUNT: usize = 5;
const RELATIONSHIP_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaItem {
    pub value: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocableItem {
    pub name: String,
    pub context: Option<String>,
    pub signature: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataSnapshot {
    pub labels: Vec<MetaItem>,
    pub relationship_types: Vec<MetaItem>,
    pub properties: Vec<MetaItem>,
    pub functions: Vec<InvocableItem>,
    pub procedures: Vec<InvocableItem>,
    pub node_count: u64,
    pub relationship_count: u64,
}

impl MetadataSnapshot {
    /// Folds a schema query result into the snapshot for `context`.
    ///
    /// Entries tagged with other contexts survive untouched. A missing or empty
    /// result resets the whole snapshot.
    pub fn merge(&mut self, result: Option<&RecordSet>, context: Option<&str>) {
        let Some(result) = result.filter(|result| !result.is_empty()) else {
            *self = Self::default();
            return;
        };

        let section = move |index: usize| {
            result
                .records
                .get(index)
                .and_then(|record| record.value(0))
                .and_then(|value| value.get("data"))
        };

        merge_values(&mut self.labels, section(LABELS), context);
        merge_values(
            &mut self.relationship_types,
            section(RELATIONSHIP_TYPES),
            context,
        );
        merge_values(&mut self.properties, section(PROPERTY_KEYS), context);
        merge_invocables(&mut self.functions, section(FUNCTIONS), context);
        merge_invocables(&mut self.procedures, section(PROCEDURES), context);

        if result.records.get(NODE_COUNT).is_some() {
            self.node_count = count_value(section(NODE_COUNT));
        }
        if result.records.get(RELATIONSHIP_COUNT).is_some() {
            self.relationship_count = count_value(section(RELATIONSHIP_COUNT));
        }
    }

    #[must_use]
    pub fn in_context(&self, context: Option<&str>) -> Self {
        let items = |items: &[MetaItem]| -> Vec<MetaItem> {
            items
                .iter()
                .filter(|item| item.context.as_deref() == context)
                .cloned()
                .collect()
        };
        let invocables = |items: &[InvocableItem]| -> Vec<InvocableItem> {
            items
                .iter()
                .filter(|item| item.context.as_deref() == context)
                .cloned()
                .collect()
        };

        Self {
            labels: items(&self.labels),
            relationship_types: items(&self.relationship_types),
            properties: items(&self.properties),
            functions: invocables(&self.functions),
            procedures: invocables(&self.procedures),
            node_count: self.node_count,
            relationship_count: self.relationship_count,
        }
    }
}

fn merge_values(existing: &mut Vec<MetaItem>, data: Option<&Value>, context: Option<&str>) {
    existing.retain(|item| item.context.as_deref() != context);
    existing.extend(
        data.and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(|value| MetaItem {
                value: value.to_string(),
                context: context.map(str::to_string),
            }),
    );
    existing.sort_by(|left, right| left.value.cmp(&right.value));
}

fn merge_invocables(
    existing: &mut Vec<InvocableItem>,
    data: Option<&Value>,
    context: Option<&str>,
) {
    let text = |entry: &Value, key: &str| {
        entry
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    existing.retain(|item| item.context.as_deref() != context);
    existing.extend(
        data.and_then(Value::as_array)
            .into_iter()
            .flatten()
            .map(|entry| InvocableItem {
                name: text(entry, "name"),
                context: context.map(str::to_string),
                signature: text(entry, "signature"),
                description: text(entry, "description"),
            }),
    );
}

fn count_value(data: Option<&Value>) -> u64 {
    data.and_then(Value::as_u64).unwrap_or(0)
}
