//! Table schema as seen by the merge path.
//!
//! A [`TableSchema`] is an ordered list of [`ColumnDef`]s. Every schema ends
//! with the physical-address pseudo-column, which is never read or written by
//! a merge: writers regenerate it for the rows they place. At most one column
//! carries the sort key; a primary key is always also the sort key.

use std::{collections::HashSet, sync::Arc};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

/// Name of the physical row-address pseudo-column.
pub const PHYS_ADDR_COLUMN: &str = "__phys_addr";

/// Sequence number reserved for the physical-address column.
pub const PHYS_ADDR_SEQ_NUM: u16 = u16::MAX;

/// Errors raised while declaring a table schema.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The schema declares no user columns.
    #[error("table `{0}` declares no columns")]
    NoColumns(String),
    /// Two columns share a name.
    #[error("duplicate column `{0}`")]
    DuplicateColumn(String),
    /// A user column uses the reserved pseudo-column name.
    #[error("column name `{0}` is reserved")]
    ReservedName(String),
    /// The sort or primary key references a column that does not exist.
    #[error("key column `{0}` not found")]
    UnknownKey(String),
    /// Sort key and primary key name different columns.
    #[error("sort key `{sort}` conflicts with primary key `{primary}`")]
    KeyConflict {
        /// Declared sort key.
        sort: String,
        /// Declared primary key.
        primary: String,
    },
    /// Blocks must hold at least one row.
    #[error("block_max_rows must be positive")]
    ZeroBlockRows,
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    name: String,
    data_type: DataType,
    nullable: bool,
    seq_num: u16,
    idx: usize,
    phys_addr: bool,
    sort_key: bool,
    primary_key: bool,
}

impl ColumnDef {
    /// Column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arrow type of the column values.
    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    /// Whether the column accepts nulls.
    pub fn nullable(&self) -> bool {
        self.nullable
    }

    /// Stable sequence number; survives column renames and reorders.
    pub fn seq_num(&self) -> u16 {
        self.seq_num
    }

    /// Logical position in the table definition.
    pub fn idx(&self) -> usize {
        self.idx
    }

    /// Whether this is the physical row-address pseudo-column.
    pub fn is_phys_addr(&self) -> bool {
        self.phys_addr
    }

    /// Whether rows are ordered by this column.
    pub fn is_sort_key(&self) -> bool {
        self.sort_key
    }

    /// Whether this column is the primary key.
    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }
}

/// Column layout, versioning and block sizing of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    name: String,
    version: u32,
    columns: Vec<ColumnDef>,
    block_max_rows: u32,
    data_schema: SchemaRef,
}

impl TableSchema {
    /// Start declaring a schema for table `name`.
    pub fn builder(name: impl Into<String>) -> TableSchemaBuilder {
        TableSchemaBuilder::new(name)
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema version; bumped by DDL.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// All columns, physical-address column last.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Maximum rows in one block.
    pub fn block_max_rows(&self) -> u32 {
        self.block_max_rows
    }

    /// Columns that carry user data (everything except the physical address).
    pub fn data_columns(&self) -> impl Iterator<Item = &ColumnDef> + '_ {
        self.columns.iter().filter(|def| !def.is_phys_addr())
    }

    /// Logical indices of the data columns, in schema order.
    pub fn data_column_indices(&self) -> Vec<usize> {
        self.data_columns().map(ColumnDef::idx).collect()
    }

    /// Sequence numbers of the data columns, in schema order.
    pub fn data_seq_nums(&self) -> Vec<u16> {
        self.data_columns().map(ColumnDef::seq_num).collect()
    }

    /// Arrow schema of the data columns.
    pub fn data_schema(&self) -> &SchemaRef {
        &self.data_schema
    }

    /// Position of the sort key within the data columns, if the table has one.
    pub fn sort_key_pos(&self) -> Option<usize> {
        self.data_columns().position(ColumnDef::is_sort_key)
    }

    /// Whether the table declares a primary key.
    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(ColumnDef::is_primary_key)
    }

    /// Whether the sort key is also the primary key.
    pub fn sort_key_is_primary(&self) -> bool {
        self.columns
            .iter()
            .any(|def| def.is_sort_key() && def.is_primary_key())
    }

    /// Look up a column by its logical index.
    pub fn column(&self, idx: usize) -> Option<&ColumnDef> {
        self.columns.get(idx)
    }
}

/// Builder for [`TableSchema`] with validation at [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct TableSchemaBuilder {
    name: String,
    version: u32,
    columns: Vec<(String, DataType, bool)>,
    sort_key: Option<String>,
    primary_key: Option<String>,
    block_max_rows: u32,
}

impl TableSchemaBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            columns: Vec::new(),
            sort_key: None,
            primary_key: None,
            block_max_rows: 8192,
        }
    }

    /// Append a user column.
    pub fn column(mut self, name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        self.columns.push((name.into(), data_type, nullable));
        self
    }

    /// Order rows by `name`, without making it a primary key.
    pub fn sort_key(mut self, name: impl Into<String>) -> Self {
        self.sort_key = Some(name.into());
        self
    }

    /// Declare `name` as primary key; it becomes the sort key too.
    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = Some(name.into());
        self
    }

    /// Override the schema version.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Cap the rows stored in one block.
    pub fn block_max_rows(mut self, rows: u32) -> Self {
        self.block_max_rows = rows;
        self
    }

    /// Validate and produce the schema.
    pub fn build(self) -> Result<TableSchema, SchemaError> {
        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns(self.name));
        }
        if self.block_max_rows == 0 {
            return Err(SchemaError::ZeroBlockRows);
        }
        let sort_key = match (self.sort_key, self.primary_key.clone()) {
            (Some(sort), Some(primary)) if sort != primary => {
                return Err(SchemaError::KeyConflict { sort, primary });
            }
            (sort, primary) => sort.or(primary),
        };

        let mut seen = HashSet::new();
        let mut columns = Vec::with_capacity(self.columns.len() + 1);
        for (idx, (name, data_type, nullable)) in self.columns.into_iter().enumerate() {
            if name == PHYS_ADDR_COLUMN {
                return Err(SchemaError::ReservedName(name));
            }
            if !seen.insert(name.clone()) {
                return Err(SchemaError::DuplicateColumn(name));
            }
            columns.push(ColumnDef {
                sort_key: sort_key.as_deref() == Some(name.as_str()),
                primary_key: self.primary_key.as_deref() == Some(name.as_str()),
                name,
                data_type,
                nullable,
                seq_num: idx as u16,
                idx,
                phys_addr: false,
            });
        }
        for key in sort_key.iter().chain(self.primary_key.iter()) {
            if !seen.contains(key) {
                return Err(SchemaError::UnknownKey(key.clone()));
            }
        }
        columns.push(ColumnDef {
            name: PHYS_ADDR_COLUMN.to_string(),
            data_type: DataType::UInt64,
            nullable: false,
            seq_num: PHYS_ADDR_SEQ_NUM,
            idx: columns.len(),
            phys_addr: true,
            sort_key: false,
            primary_key: false,
        });

        let fields: Vec<Field> = columns
            .iter()
            .filter(|def| !def.is_phys_addr())
            .map(|def| Field::new(def.name(), def.data_type().clone(), def.nullable()))
            .collect();
        Ok(TableSchema {
            name: self.name,
            version: self.version,
            columns,
            block_max_rows: self.block_max_rows,
            data_schema: Arc::new(Schema::new(fields)),
        })
    }
}
