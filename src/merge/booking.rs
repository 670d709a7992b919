//! Row relocation map produced by a merge.
//!
//! Source blocks are addressed by their global offset across all merged
//! objects. For every source row the booking records where the row landed,
//! or `None` when it was already tombstoned and therefore dropped.

use serde::{Deserialize, Serialize};

/// Position of a row inside the objects created by a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewRowAddr {
    /// Index into the merge's created-object list.
    pub object: u32,
    /// Block offset within that object.
    pub block: u16,
    /// Row offset within that block.
    pub row: u32,
}

/// Old-row to new-row relocation map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    blocks: Vec<Vec<Option<NewRowAddr>>>,
}

impl Booking {
    /// Empty booking for `source_blocks` global block offsets.
    pub fn with_source_blocks(source_blocks: usize) -> Self {
        Self {
            blocks: vec![Vec::new(); source_blocks],
        }
    }

    /// Size the mapping of source block `offset` to `rows` rows.
    ///
    /// Called once per block when it is first loaded; rows not recorded
    /// afterwards stay unmapped.
    pub(crate) fn reserve_block(&mut self, offset: usize, rows: usize) {
        if offset >= self.blocks.len() {
            self.blocks.resize_with(offset + 1, Vec::new);
        }
        self.blocks[offset] = vec![None; rows];
    }

    pub(crate) fn record(&mut self, offset: usize, row: usize, to: NewRowAddr) {
        if let Some(slot) = self
            .blocks
            .get_mut(offset)
            .and_then(|block| block.get_mut(row))
        {
            *slot = Some(to);
        }
    }

    /// Where source row `row` of global block `offset` landed.
    pub fn lookup(&self, offset: usize, row: usize) -> Option<NewRowAddr> {
        self.blocks
            .get(offset)
            .and_then(|block| block.get(row))
            .copied()
            .flatten()
    }

    /// Number of source blocks covered.
    pub fn source_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of rows that were relocated.
    pub fn booked_rows(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| block.iter().filter(|slot| slot.is_some()).count())
            .sum()
    }

    /// Relocations of one source block, indexed by source row.
    pub fn block(&self, offset: usize) -> &[Option<NewRowAddr>] {
        self.blocks.get(offset).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecorded_rows_stay_unmapped() {
        let mut booking = Booking::with_source_blocks(2);
        booking.reserve_block(0, 3);
        booking.reserve_block(1, 2);
        let to = NewRowAddr {
            object: 0,
            block: 1,
            row: 7,
        };
        booking.record(0, 2, to);
        assert_eq!(booking.lookup(0, 2), Some(to));
        assert_eq!(booking.lookup(0, 0), None);
        assert_eq!(booking.lookup(1, 1), None);
        assert_eq!(booking.lookup(5, 0), None);
        assert_eq!(booking.booked_rows(), 1);
        assert_eq!(booking.block(0).len(), 3);
    }
}
