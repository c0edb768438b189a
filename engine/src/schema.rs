//! Sync schema: table descriptions in dependency order.
//!
//! The position of a table in [`SyncSchema::tables`] is its dependency order:
//! a table always comes after every table it references. Deletes are applied
//! walking this list backwards, inserts and updates walking it forwards.

use crate::{
    error::Result, row::RowKey, ConflictResolutionPolicy, Error, RowValues, SyncWay, TableName,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Column types supported in table descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::String => write!(f, "String"),
            ColumnType::Int => write!(f, "Int"),
            ColumnType::Float => write!(f, "Float"),
            ColumnType::Bool => write!(f, "Bool"),
            ColumnType::Timestamp => write!(f, "Timestamp"),
            ColumnType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a column in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Column type
    pub column_type: ColumnType,
    /// Whether NULL / missing is accepted
    pub nullable: bool,
    /// Whether values must be unique across the table
    #[serde(default)]
    pub unique: bool,
}

impl ColumnDef {
    /// Create a non-nullable column definition.
    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            unique: false,
        }
    }

    /// Create a nullable column definition.
    pub fn optional(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            unique: false,
        }
    }

    /// Mark the column as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Validate a JSON value against this column definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None | Some(serde_json::Value::Null) if !self.nullable => {
                Err(Error::MissingRequiredColumn(self.name.clone()))
            }
            None | Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.column_type {
            ColumnType::String => value.is_string(),
            ColumnType::Int => value.is_i64() || value.is_u64(),
            ColumnType::Float => value.is_number(),
            ColumnType::Bool => value.is_boolean(),
            ColumnType::Timestamp => value.is_u64() || value.is_i64(),
            ColumnType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                column: self.name.clone(),
                expected: self.column_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// A reference from a column of a child table to a column of its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub column: String,
    pub parent_table: TableName,
    pub parent_column: String,
}

/// Which directions a table takes part in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncDirection {
    #[default]
    Bidirectional,
    /// Only sent from the local side to the remote side
    UploadOnly,
    /// Only sent from the remote side to the local side
    DownloadOnly,
}

impl SyncDirection {
    /// Whether rows of a table with this direction may be selected or
    /// written while syncing in `way`.
    pub fn allows(self, way: SyncWay) -> bool {
        !matches!(
            (self, way),
            (SyncDirection::DownloadOnly, SyncWay::Upload)
                | (SyncDirection::UploadOnly, SyncWay::Download)
        )
    }
}

/// Description of one synced table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescription {
    /// Table name
    pub name: TableName,
    /// Column definitions
    pub columns: Vec<ColumnDef>,
    /// Primary key column names, in key order
    pub primary_keys: Vec<String>,
    /// References to parent tables
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    /// Declared sync direction
    #[serde(default)]
    pub sync_direction: SyncDirection,
}

impl TableDescription {
    /// Create a bidirectional table without foreign keys.
    pub fn new(
        name: impl Into<TableName>,
        columns: Vec<ColumnDef>,
        primary_keys: Vec<&str>,
    ) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_keys: primary_keys.into_iter().map(String::from).collect(),
            foreign_keys: Vec::new(),
            sync_direction: SyncDirection::Bidirectional,
        }
    }

    /// Builder-style method to add a foreign key.
    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        parent_table: impl Into<TableName>,
        parent_column: impl Into<String>,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            parent_table: parent_table.into(),
            parent_column: parent_column.into(),
        });
        self
    }

    /// Builder-style method to set the sync direction.
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.sync_direction = direction;
        self
    }

    /// Get a column definition by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Names of the tables this table references.
    pub fn parents(&self) -> impl Iterator<Item = &TableName> {
        self.foreign_keys.iter().map(|fk| &fk.parent_table)
    }

    /// Columns declared unique.
    pub fn unique_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.unique)
    }

    /// Build the key identifying a row from its primary key values.
    pub fn row_key(&self, values: &RowValues) -> Result<RowKey> {
        let mut key = Vec::with_capacity(self.primary_keys.len());
        for column in &self.primary_keys {
            match values.get(column) {
                Some(v) if !v.is_null() => key.push(v),
                _ => {
                    return Err(Error::MissingPrimaryKey {
                        table: self.name.clone(),
                        column: column.clone(),
                    })
                }
            }
        }
        Ok(RowKey::from_values(&key))
    }

    /// Copy of only the primary key values of a row.
    pub fn key_values(&self, values: &RowValues) -> RowValues {
        self.primary_keys
            .iter()
            .filter_map(|c| values.get(c).map(|v| (c.clone(), v.clone())))
            .collect()
    }

    /// Validate a full row (modified state) against this table.
    pub fn validate_row(&self, values: &RowValues) -> Result<()> {
        self.row_key(values)?;
        for column in &self.columns {
            column.validate(values.get(&column.name))?;
        }
        Ok(())
    }
}

/// The synced tables of one scope, in dependency order, plus the conflict
/// policy the side owning the schema resolves with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSchema {
    /// Tables in dependency order (parents first)
    pub tables: Vec<TableDescription>,
    /// Conflict policy of the side owning this schema
    #[serde(default)]
    pub conflict_resolution_policy: ConflictResolutionPolicy,
}

impl Default for SyncSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncSchema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            conflict_resolution_policy: ConflictResolutionPolicy::default(),
        }
    }

    /// Append a table; it must come after the tables it references.
    pub fn add_table(&mut self, table: TableDescription) -> &mut Self {
        self.tables.push(table);
        self
    }

    /// Builder-style method to append a table.
    pub fn with_table(mut self, table: TableDescription) -> Self {
        self.add_table(table);
        self
    }

    /// Builder-style method to set the conflict policy.
    pub fn with_policy(mut self, policy: ConflictResolutionPolicy) -> Self {
        self.conflict_resolution_policy = policy;
        self
    }

    /// Get a table description by name.
    pub fn get_table(&self, name: &str) -> Option<&TableDescription> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Get a table description by name or fail.
    pub fn table(&self, name: &str) -> Result<&TableDescription> {
        self.get_table(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Whether the schema has any table.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Check names, keys and that every table comes after its parents.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for table in &self.tables {
            if table.primary_keys.is_empty() {
                return Err(Error::InvalidSchema(format!(
                    "table '{}' has no primary key",
                    table.name
                )));
            }
            for pk in &table.primary_keys {
                if table.column(pk).is_none() {
                    return Err(Error::InvalidSchema(format!(
                        "primary key column '{}' is not a column of '{}'",
                        pk, table.name
                    )));
                }
            }
            for parent in table.parents() {
                if parent != &table.name && !seen.contains(parent.as_str()) {
                    return Err(Error::InvalidSchema(format!(
                        "table '{}' references '{}' which does not precede it",
                        table.name, parent
                    )));
                }
            }
            if !seen.insert(table.name.as_str()) {
                return Err(Error::InvalidSchema(format!(
                    "duplicate table '{}'",
                    table.name
                )));
            }
        }
        Ok(())
    }

    /// Reorder the tables so that parents precede children.
    ///
    /// Ties keep their declared order. Self references are allowed; any
    /// other cycle is rejected.
    pub fn sorted_by_dependencies(mut self) -> Result<Self> {
        let names: HashSet<_> = self.tables.iter().map(|t| t.name.clone()).collect();
        let mut pending: HashMap<TableName, usize> = HashMap::new();
        for table in &self.tables {
            let parents: HashSet<_> = table
                .parents()
                .filter(|p| *p != &table.name)
                .collect();
            for parent in &parents {
                if !names.contains(parent.as_str()) {
                    return Err(Error::InvalidSchema(format!(
                        "table '{}' references unknown table '{}'",
                        table.name, parent
                    )));
                }
            }
            pending.insert(table.name.clone(), parents.len());
        }

        let mut remaining = std::mem::take(&mut self.tables);
        while !remaining.is_empty() {
            let Some(idx) = remaining
                .iter()
                .position(|t| pending.get(&t.name).copied() == Some(0))
            else {
                let cycle: Vec<_> = remaining.iter().map(|t| t.name.as_str()).collect();
                return Err(Error::InvalidSchema(format!(
                    "dependency cycle between tables: {}",
                    cycle.join(", ")
                )));
            };
            let table = remaining.remove(idx);
            for child in &remaining {
                let references = child
                    .parents()
                    .filter(|p| *p != &child.name)
                    .collect::<HashSet<_>>()
                    .contains(&table.name);
                if references {
                    if let Some(count) = pending.get_mut(&child.name) {
                        *count -= 1;
                    }
                }
            }
            self.tables.push(table);
        }
        Ok(self)
    }

    /// A schema restricted to the named tables, keeping dependency order.
    ///
    /// An empty list selects every table.
    pub fn subset(&self, names: &[TableName]) -> Result<Self> {
        if names.is_empty() {
            return Ok(self.clone());
        }
        for name in names {
            self.table(name)?;
        }
        Ok(Self {
            tables: self
                .tables
                .iter()
                .filter(|t| names.contains(&t.name))
                .cloned()
                .collect(),
            conflict_resolution_policy: self.conflict_resolution_policy,
        })
    }
}
