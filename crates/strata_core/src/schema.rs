//! Table schemas as seen by the client.

use serde::{Deserialize, Serialize};

/// One column family of a table schema.
///
/// `id` is the small integer the servers use in index-table row keys;
/// it is never 0 and at most three decimal digits wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFamily {
    pub id: u32,
    pub name: String,
    pub max_versions: u32,
    pub counter: bool,
    pub deleted: bool,
    pub has_index: bool,
    pub has_qualifier_index: bool,
}

impl ColumnFamily {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            max_versions: 0,
            counter: false,
            deleted: false,
            has_index: false,
            has_qualifier_index: false,
        }
    }

    pub fn with_index(mut self) -> Self {
        self.has_index = true;
        self
    }

    pub fn with_qualifier_index(mut self) -> Self {
        self.has_qualifier_index = true;
        self
    }
}

/// A table schema: the set of column families.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    column_families: Vec<ColumnFamily>,
}

impl Schema {
    pub fn new(column_families: Vec<ColumnFamily>) -> Self {
        Self { column_families }
    }

    pub fn column_families(&self) -> &[ColumnFamily] {
        &self.column_families
    }

    pub fn family_by_id(&self, id: u32) -> Option<&ColumnFamily> {
        self.column_families.iter().find(|cf| cf.id == id)
    }

    pub fn family_by_name(&self, name: &str) -> Option<&ColumnFamily> {
        self.column_families.iter().find(|cf| cf.name == name)
    }
}
