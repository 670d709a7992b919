//! Output side of a merge: writer factory contract and stats finalization.

use std::fmt;

use arrow::{
    array::RecordBatch,
    datatypes::SchemaRef,
    error::ArrowError,
    row::{RowConverter, SortField},
};
use futures_util::future::BoxFuture;

use crate::{
    catalog::StorageError,
    id::ObjectId,
    object::{BlockInfo, KeyBound, ObjectStats},
    schema::TableSchema,
};

/// Parameters every writer of a merge is created with.
#[derive(Clone)]
pub struct WriterSpec {
    /// Schema version of the table at merge time.
    pub schema_version: u32,
    /// Sequence numbers of the written columns, in column order.
    pub seq_nums: Vec<u16>,
    /// Position of the sort key among written columns; `None` when blocks
    /// arrive in no particular order.
    pub sort_key_pos: Option<usize>,
    /// Whether the sort key is the table's primary key.
    pub sort_key_is_pk: bool,
    /// Arrow schema of the written columns.
    pub schema: SchemaRef,
}

impl WriterSpec {
    /// Spec writing the data columns of `schema`, ordered by its sort key.
    pub fn for_table(schema: &TableSchema) -> Self {
        Self {
            schema_version: schema.version(),
            seq_nums: schema.data_seq_nums(),
            sort_key_pos: schema.sort_key_pos(),
            sort_key_is_pk: schema.sort_key_is_primary(),
            schema: schema.data_schema().clone(),
        }
    }

    /// Same columns, written in no particular order.
    pub fn unordered(mut self) -> Self {
        self.sort_key_pos = None;
        self
    }
}

impl fmt::Debug for WriterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterSpec")
            .field("schema_version", &self.schema_version)
            .field("seq_nums", &self.seq_nums)
            .field("sort_key_pos", &self.sort_key_pos)
            .field("sort_key_is_pk", &self.sort_key_is_pk)
            .field("columns", &self.schema.fields().len())
            .finish()
    }
}

/// Creates one writer per output object.
pub trait WriterFactory: Send + Sync {
    /// Open a writer for a new object; the writer picks the object id.
    fn new_writer(&self, spec: &WriterSpec) -> Result<Box<dyn ObjectWriter>, StorageError>;
}

/// Writes the blocks of a single immutable object.
pub trait ObjectWriter: Send {
    /// Identifier the finished object will carry.
    fn id(&self) -> ObjectId;

    /// Append one block; blocks are stored in call order.
    fn write_block(&mut self, block: RecordBatch) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Seal the object and return its finalized statistics.
    fn finish(self: Box<Self>) -> BoxFuture<'static, Result<ObjectStats, StorageError>>;
}

/// Accumulates block layout and sort-key bounds while an object is written.
pub struct ObjectStatsBuilder {
    id: ObjectId,
    sort_key_pos: Option<usize>,
    converter: Option<RowConverter>,
    blocks: Vec<BlockInfo>,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
}

impl ObjectStatsBuilder {
    /// Start collecting stats for object `id` written with `spec`.
    pub fn new(id: ObjectId, spec: &WriterSpec) -> Result<Self, ArrowError> {
        let converter = match spec.sort_key_pos {
            Some(pos) => {
                let field = spec.schema.fields().get(pos).ok_or_else(|| {
                    ArrowError::SchemaError(format!("sort key position {pos} out of range"))
                })?;
                Some(RowConverter::new(vec![SortField::new(
                    field.data_type().clone(),
                )])?)
            }
            None => None,
        };
        Ok(Self {
            id,
            sort_key_pos: spec.sort_key_pos,
            converter,
            blocks: Vec::new(),
            min_key: None,
            max_key: None,
        })
    }

    /// Record a written block.
    pub fn observe_block(&mut self, block: &RecordBatch) -> Result<(), ArrowError> {
        self.blocks.push(BlockInfo {
            rows: block.num_rows() as u32,
            bytes: block.get_array_memory_size() as u64,
        });
        let (Some(pos), Some(converter)) = (self.sort_key_pos, self.converter.as_ref()) else {
            return Ok(());
        };
        if block.num_rows() == 0 {
            return Ok(());
        }
        let rows = converter.convert_columns(&[block.column(pos).clone()])?;
        for row in rows.iter() {
            let key = row.as_ref();
            if self.min_key.as_deref().map_or(true, |min| key < min) {
                self.min_key = Some(key.to_vec());
            }
            if self.max_key.as_deref().map_or(true, |max| key > max) {
                self.max_key = Some(key.to_vec());
            }
        }
        Ok(())
    }

    /// Number of blocks observed so far.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Finalize; the object counts as sorted when it was written with a sort key.
    pub fn finish(self) -> ObjectStats {
        ObjectStats::new(self.id, self.blocks, self.sort_key_pos.is_some())
            .with_key_bounds(self.min_key.map(KeyBound::new), self.max_key.map(KeyBound::new))
    }
}
