use crate::interpreter::events::{EventCallback, EventClass, TraceColumn};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Type of the column in a rowset, used to render values and to compare them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueKind {
    #[default]
    Text,
    Integer,
    Float,
    Boolean,
}

impl ValueKind {
    /// Map an XML schema type (i.e. xsd:long) to the kind.
    pub fn from_xsd(type_name: &str) -> Self {
        let type_name = type_name.rsplit(':').next().unwrap_or(type_name);
        match type_name {
            "long" | "int" | "short" | "byte" | "unsignedLong" | "unsignedInt"
            | "unsignedShort" | "unsignedByte" | "integer" => ValueKind::Integer,
            "double" | "float" | "decimal" => ValueKind::Float,
            "boolean" => ValueKind::Boolean,
            _ => ValueKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowsetColumn {
    /// Element name in the row
    pub element: String,
    /// Human readable name (i.e. 'Sales'[Amount])
    pub name: String,
    pub kind: ValueKind,
}

/// Result of Execute/Discover, all values are kept as text, None is NULL.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rowset {
    pub columns: Vec<RowsetColumn>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Rowset {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        return self
            .columns
            .iter()
            .position(|column| column.name == name || column.element == name);
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.column_index(column)?;
        return self.rows.get(row)?.get(index)?.as_deref();
    }

    pub fn column_names(&self) -> Vec<String> {
        return self.columns.iter().map(|c| c.name.clone()).collect();
    }

    pub fn value(&self, row: &[Option<String>], index: usize) -> serde_json::Value {
        let kind = self.columns.get(index).map(|c| c.kind).unwrap_or_default();
        let cell = match row.get(index) {
            Some(Some(cell)) => cell,
            _ => return serde_json::Value::Null,
        };
        let value = match kind {
            ValueKind::Integer => cell.parse::<i64>().ok().map(serde_json::Value::from),
            ValueKind::Float => cell.parse::<f64>().ok().map(serde_json::Value::from),
            ValueKind::Boolean => cell.parse::<bool>().ok().map(serde_json::Value::from),
            ValueKind::Text => None,
        };
        return value.unwrap_or_else(|| serde_json::Value::String(cell.clone()));
    }

    /// Compare two rows by all columns left-to-right (NULLs first, numbers numerically).
    pub fn compare_rows(&self, a: &[Option<String>], b: &[Option<String>]) -> Ordering {
        for index in 0..a.len().max(b.len()) {
            let left = a.get(index).and_then(|v| v.as_deref());
            let right = b.get(index).and_then(|v| v.as_deref());
            let ordering = match (left, right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(left), Some(right)) => match (left.parse::<f64>(), right.parse::<f64>()) {
                    (Ok(l), Ok(r)) => l.total_cmp(&r),
                    _ => left.cmp(right),
                },
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        return Ordering::Equal;
    }
}

/// Server side trace definition, rendered by the connection into its wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceDefinition {
    pub id: String,
    pub name: String,
    pub events: Vec<(EventClass, Vec<TraceColumn>)>,
    pub filter: TraceFilter,
    /// The server stops (and removes) the trace on its own after this time
    pub stop_time: DateTime<Utc>,
}

/// Logical OR of the two equality predicates.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFilter {
    pub session_id: String,
    pub application_name: String,
}

/// Live event subscription of a trace.
#[async_trait]
pub trait Subscription: Send {
    async fn stop(self: Box<Self>) -> Result<()>;
}

/// One session against the tabular server.
///
/// Everything (probes, query, cache clearing) goes through the same session, since the trace
/// filter matches only this session.
#[async_trait]
pub trait Connection: Send + Sync {
    fn session_id(&self) -> &str;
    fn application_name(&self) -> &str;
    fn catalog(&self) -> &str;

    async fn execute(&self, statement: &str, timeout: Duration) -> Result<Rowset>;
    async fn discover(&self, request_type: &str, restrictions: &[(&str, &str)]) -> Result<Rowset>;
    async fn clear_cache(&self) -> Result<()>;

    async fn create_trace(&self, definition: &TraceDefinition) -> Result<()>;
    async fn delete_trace(&self, trace_id: &str) -> Result<()>;
    /// Starts delivering trace rows to the callback, returns once the subscription is live.
    async fn subscribe(
        &self,
        trace_id: &str,
        on_event: EventCallback,
    ) -> Result<Box<dyn Subscription>>;

    async fn close(&self) -> Result<()>;
}

/// Turns an (opaque for the engine) connection string into a live connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        connection_string: &str,
        catalog: &str,
        application_name: &str,
    ) -> Result<Arc<dyn Connection>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rowset() -> Rowset {
        return Rowset {
            columns: vec![
                RowsetColumn {
                    element: "C0".into(),
                    name: "Product[Name]".into(),
                    kind: ValueKind::Text,
                },
                RowsetColumn {
                    element: "C1".into(),
                    name: "[Total]".into(),
                    kind: ValueKind::Integer,
                },
            ],
            rows: vec![
                vec![Some("b".into()), Some("10".into())],
                vec![None, Some("7".into())],
            ],
        };
    }

    #[test]
    fn test_get_by_name_and_element() {
        let rowset = rowset();
        assert_eq!(rowset.get(0, "Product[Name]"), Some("b"));
        assert_eq!(rowset.get(0, "C1"), Some("10"));
        assert_eq!(rowset.get(1, "C0"), None);
        assert_eq!(rowset.get(5, "C0"), None);
        assert_eq!(rowset.get(0, "missing"), None);
    }

    #[test]
    fn test_value_by_kind() {
        let rowset = rowset();
        assert_eq!(rowset.value(&rowset.rows[0], 0), serde_json::json!("b"));
        assert_eq!(rowset.value(&rowset.rows[0], 1), serde_json::json!(10));
        assert_eq!(rowset.value(&rowset.rows[1], 0), serde_json::Value::Null);
    }

    #[test]
    fn test_compare_rows() {
        let rowset = rowset();
        let row = |a: Option<&str>, b: Option<&str>| vec![a.map(String::from), b.map(String::from)];
        assert_eq!(
            rowset.compare_rows(&row(None, Some("1")), &row(Some("a"), Some("1"))),
            Ordering::Less
        );
        assert_eq!(
            rowset.compare_rows(&row(Some("a"), Some("9")), &row(Some("a"), Some("10"))),
            Ordering::Less
        );
        assert_eq!(
            rowset.compare_rows(&row(Some("b"), None), &row(Some("a"), None)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_value_kind_from_xsd() {
        assert_eq!(ValueKind::from_xsd("xsd:long"), ValueKind::Integer);
        assert_eq!(ValueKind::from_xsd("xsd:double"), ValueKind::Float);
        assert_eq!(ValueKind::from_xsd("xsd:boolean"), ValueKind::Boolean);
        assert_eq!(ValueKind::from_xsd("xsd:string"), ValueKind::Text);
    }
}
