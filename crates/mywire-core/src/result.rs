//! Materialized query results.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column names shared by every row of one result set.
#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    /// Column names in order
    names: Vec<String>,
    /// Name -> index mapping; the first occurrence wins on duplicates
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let mut name_to_index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            name_to_index.entry(name.clone()).or_insert(i);
        }
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get all column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// One decoded row.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a row sharing column metadata with its result set.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a typed value by column name.
    #[allow(clippy::result_large_err)]
    pub fn get_named<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("column '{}' not found", name),
                column: Some(name.to_string()),
            })
        })?;
        T::try_from(value.clone()).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    /// All values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consume the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

#[derive(Debug, Clone)]
enum Data {
    Nested(Vec<Row>),
    Flat(Vec<Value>),
}

/// A fully read result set.
///
/// In nested mode every row keeps its own value list. In flattened mode the
/// cells of all rows are appended to one list in row-major order.
#[derive(Debug, Clone)]
pub struct ResultSet {
    columns: Arc<ColumnInfo>,
    data: Data,
}

impl ResultSet {
    /// A result set with no columns and no rows (OK-only responses).
    pub fn empty() -> Self {
        Self {
            columns: Arc::new(ColumnInfo::default()),
            data: Data::Nested(Vec::new()),
        }
    }

    /// Build a nested result set from rows of values.
    pub fn from_rows(columns: Arc<ColumnInfo>, rows: Vec<Vec<Value>>) -> Self {
        let rows = rows
            .into_iter()
            .map(|values| Row::with_columns(Arc::clone(&columns), values))
            .collect();
        Self {
            columns,
            data: Data::Nested(rows),
        }
    }

    /// Build a flattened result set.
    pub fn from_flat(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self {
            columns,
            data: Data::Flat(values),
        }
    }

    /// Column names in order.
    pub fn columns(&self) -> &[String] {
        self.columns.names()
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.index_of(name)
    }

    /// Rows in nested mode; empty when flattened.
    pub fn rows(&self) -> &[Row] {
        match &self.data {
            Data::Nested(rows) => rows,
            Data::Flat(_) => &[],
        }
    }

    /// Cell values in flattened mode; empty when nested.
    pub fn values(&self) -> &[Value] {
        match &self.data {
            Data::Nested(_) => &[],
            Data::Flat(values) => values,
        }
    }

    pub fn is_flattened(&self) -> bool {
        matches!(self.data, Data::Flat(_))
    }

    /// Number of rows (nested) or number of cells (flattened).
    pub fn len(&self) -> usize {
        match &self.data {
            Data::Nested(rows) => rows.len(),
            Data::Flat(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate rows as column-name to value maps.
    ///
    /// Flattened results are re-chunked by column count.
    pub fn iter_maps(&self) -> impl Iterator<Item = HashMap<&str, &Value>> + '_ {
        let width = self.columns.len().max(1);
        let chunks: Box<dyn Iterator<Item = &[Value]> + '_> = match &self.data {
            Data::Nested(rows) => Box::new(rows.iter().map(Row::values)),
            Data::Flat(values) => Box::new(values.chunks(width)),
        };
        chunks.map(move |values| {
            self.columns
                .names()
                .iter()
                .map(String::as_str)
                .zip(values.iter())
                .collect()
        })
    }
}

impl Default for ResultSet {
    fn default() -> Self {
        Self::empty()
    }
}
