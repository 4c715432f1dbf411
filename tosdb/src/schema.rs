//! Logical schema: databases, tables, columns, and secondary indexes.

use alloc::string::String;
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Boolean,
    String,
    Bytes,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub id: u64,
    pub name: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Primary,
    Unique,
    Secondary,
}

#[derive(Debug, Clone)]
pub struct IndexDef {
    pub id: u64,
    pub name: String,
    pub column_id: u64,
    pub kind: IndexKind,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub id: u64,
    pub name: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<IndexDef>,
}

impl TableSchema {
    pub fn primary_index(&self) -> Option<&IndexDef> {
        self.indexes.iter().find(|idx| idx.kind == IndexKind::Primary)
    }

    pub fn column_by_id(&self, id: u64) -> Option<&Column> {
        self.columns.iter().find(|c| c.id == id)
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseSchema {
    pub id: u64,
    pub name: String,
    pub tables: Vec<TableSchema>,
}

impl DatabaseSchema {
    pub fn table_by_name(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }
}
