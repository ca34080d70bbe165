use crate::interpreter::connection::{Connection, Rowset};
use anyhow::{Context, Result};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Lookups from the storage engine internal ids (used in the xmSQL text of scans) to the names
/// from the model.
///
/// The first mapping for an id wins, duplicates (rare, ids are unique per table) are ignored,
/// since this is used for readability only.
#[derive(Debug, Clone, Default)]
pub struct IdentifierMaps {
    columns: HashMap<String, String>,
    tables: HashMap<String, String>,
    // Alternation of all known ids, built on first use
    pattern: OnceLock<Option<Regex>>,
}

impl IdentifierMaps {
    pub async fn load(connection: &dyn Connection) -> Result<Self> {
        let catalog = connection.catalog().to_string();
        let restrictions = [("DATABASE_NAME", catalog.as_str())];
        let tables = connection
            .discover("DISCOVER_STORAGE_TABLES", &restrictions)
            .await
            .context("Cannot discover storage tables")?;
        let columns = connection
            .discover("DISCOVER_STORAGE_TABLE_COLUMNS", &restrictions)
            .await
            .context("Cannot discover storage table columns")?;

        let maps = Self::from_rowsets(&tables, &columns);
        log::debug!(
            "Loaded {} table and {} column identifiers",
            maps.tables.len(),
            maps.columns.len()
        );
        return Ok(maps);
    }

    pub fn from_rowsets(tables: &Rowset, columns: &Rowset) -> Self {
        let mut maps = Self::default();
        for row in 0..tables.rows.len() {
            if let (Some(id), Some(name)) = (
                tables.get(row, "TABLE_ID"),
                tables.get(row, "DIMENSION_NAME"),
            ) {
                maps.insert_table(id, name);
            }
        }
        for row in 0..columns.rows.len() {
            if let (Some(id), Some(name)) = (
                columns.get(row, "COLUMN_ID"),
                columns.get(row, "ATTRIBUTE_NAME"),
            ) {
                maps.insert_column(id, name);
            }
        }
        return maps;
    }

    /// Returns false if the id is already known (the first name is kept).
    pub fn insert_column(&mut self, id: &str, name: &str) -> bool {
        self.pattern = OnceLock::new();
        return insert_first(&mut self.columns, id, name);
    }

    pub fn insert_table(&mut self, id: &str, name: &str) -> bool {
        self.pattern = OnceLock::new();
        return insert_first(&mut self.tables, id, name);
    }

    pub fn column_name(&self, id: &str) -> Option<&str> {
        return self.columns.get(id).map(|s| s.as_str());
    }

    pub fn table_name(&self, id: &str) -> Option<&str> {
        return self.tables.get(id).map(|s| s.as_str());
    }

    pub fn is_empty(&self) -> bool {
        return self.columns.is_empty() && self.tables.is_empty();
    }

    /// Replace every known id in the text with its name.
    ///
    /// Single pass, the names that were put in are never matched again, even if a name is an
    /// id itself. Longer ids win, so that an id that is a prefix of another one does not break it.
    pub fn resolve(&self, text: &str) -> String {
        let Some(pattern) = self.pattern.get_or_init(|| self.build_pattern()) else {
            return text.to_string();
        };
        let resolved = pattern.replace_all(text, |captures: &Captures<'_>| {
            let id = &captures[0];
            return self
                .table_name(id)
                .or_else(|| self.column_name(id))
                .unwrap_or(id)
                .to_string();
        });
        return resolved.into_owned();
    }

    fn build_pattern(&self) -> Option<Regex> {
        let mut ids = self
            .tables
            .iter()
            .chain(self.columns.iter())
            .filter(|(id, name)| !id.is_empty() && id != name)
            .map(|(id, _)| id.as_str())
            .collect::<Vec<_>>();
        if ids.is_empty() {
            return None;
        }
        ids.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        ids.dedup();

        let alternation = ids.into_iter().map(regex::escape).collect::<Vec<_>>().join("|");
        match Regex::new(&alternation) {
            Ok(pattern) => return Some(pattern),
            Err(err) => {
                log::warn!("Storage engine identifiers will not be resolved: {}", err);
                return None;
            }
        }
    }
}

fn insert_first(map: &mut HashMap<String, String>, id: &str, name: &str) -> bool {
    if map.contains_key(id) {
        log::trace!("Ignoring duplicate identifier {} ({})", id, name);
        return false;
    }
    map.insert(id.to_string(), name.to_string());
    return true;
}
