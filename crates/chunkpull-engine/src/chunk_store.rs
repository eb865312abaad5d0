//! Chunk layout arithmetic and the reassembly store.
//!
//! ```text
//! offset:  0        C        2C  ...  (N-1)C        S
//!          [ slot 0 ][ slot 1 ]  ...  [ slot N-1 ]
//!          C bytes   C bytes          S - (N-1)C bytes
//! ```

use bytes::Bytes;

use crate::error::TransferError;

/// Chunk geometry of one transfer: `ceil(total_size / chunk_size)` slots, all
/// `chunk_size` long except possibly the last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    total_size: u64,
    chunk_size: usize,
    chunk_count: usize,
}

/// Why a reply cannot be placed in any slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRejection {
    /// Offset is not a multiple of the chunk size.
    Unaligned,
    /// Offset is at or past the end of the buffer.
    OutOfRange,
    /// Length differs from what this slot holds.
    WrongLength { expected: usize, got: usize },
}

impl ChunkLayout {
    /// Layout for `total_size` bytes, or `None` if `chunk_size` is zero or the
    /// chunk count does not fit in `usize`.
    pub fn try_new(total_size: u64, chunk_size: usize) -> Option<Self> {
        if chunk_size == 0 {
            return None;
        }
        let chunk_count = usize::try_from(total_size.div_ceil(chunk_size as u64)).ok()?;
        Some(Self {
            total_size,
            chunk_size,
            chunk_count,
        })
    }

    /// # Panics
    /// Panics if `chunk_size` is zero or the chunk count does not fit in
    /// `usize`. Sizes from the peer go through [`ChunkLayout::try_new`].
    pub fn new(total_size: u64, chunk_size: usize) -> Self {
        match Self::try_new(total_size, chunk_size) {
            Some(layout) => layout,
            None => panic!("no layout for {} bytes in {}-byte chunks", total_size, chunk_size),
        }
    }

    #[inline]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    #[inline]
    pub fn offset_of(&self, index: usize) -> u64 {
        index as u64 * self.chunk_size as u64
    }

    /// Bytes held by slot `index`. The last slot holds the remainder, or a
    /// full chunk when the size divides evenly.
    pub fn expected_len(&self, index: usize) -> usize {
        if index + 1 == self.chunk_count {
            match (self.total_size % self.chunk_size as u64) as usize {
                0 => self.chunk_size,
                rem => rem,
            }
        } else {
            self.chunk_size
        }
    }

    pub fn index_of(&self, offset: u64) -> Result<usize, SlotRejection> {
        if offset % self.chunk_size as u64 != 0 {
            return Err(SlotRejection::Unaligned);
        }
        let index = (offset / self.chunk_size as u64) as usize;
        if index >= self.chunk_count {
            return Err(SlotRejection::OutOfRange);
        }
        Ok(index)
    }

    /// Slot for a reply at `offset` carrying `len` bytes.
    pub fn slot_for(&self, offset: u64, len: usize) -> Result<usize, SlotRejection> {
        let index = self.index_of(offset)?;
        let expected = self.expected_len(index);
        if len != expected {
            return Err(SlotRejection::WrongLength { expected, got: len });
        }
        Ok(index)
    }
}

/// Result of writing a chunk into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The slot was empty and now holds the chunk.
    Filled,
    /// The slot was already filled; the first payload is kept.
    Duplicate,
}

/// Ordered slots of optional payloads, one per chunk.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    layout: ChunkLayout,
    slots: Vec<Option<Bytes>>,
    filled: usize,
}

impl ChunkStore {
    pub fn new(layout: ChunkLayout) -> Self {
        Self {
            layout,
            slots: vec![None; layout.chunk_count()],
            filled: 0,
        }
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Write a chunk reply at `offset`. The payload must match the slot's
    /// expected length exactly; anything else is rejected untouched.
    pub fn insert(&mut self, offset: u64, data: Bytes) -> Result<InsertOutcome, SlotRejection> {
        let index = self.layout.slot_for(offset, data.len())?;
        let slot = &mut self.slots[index];
        if slot.is_some() {
            return Ok(InsertOutcome::Duplicate);
        }
        *slot = Some(data);
        self.filled += 1;
        Ok(InsertOutcome::Filled)
    }

    #[inline]
    pub fn is_filled(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(Option::is_some)
    }

    #[inline]
    pub fn filled_count(&self) -> usize {
        self.filled
    }

    #[inline]
    pub fn missing_count(&self) -> usize {
        self.slots.len() - self.filled
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    pub fn missing_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index)
            .collect()
    }

    /// Concatenate all slots in index order.
    pub fn assemble(&self) -> Result<Vec<u8>, TransferError> {
        if !self.is_complete() {
            return Err(TransferError::Incomplete {
                missing: self.missing_count(),
            });
        }
        let capacity = usize::try_from(self.layout.total_size()).unwrap_or(0);
        let mut payload = Vec::with_capacity(capacity);
        for chunk in self.slots.iter().flatten() {
            payload.extend_from_slice(chunk);
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(layout: &ChunkLayout, index: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; layout.expected_len(index)])
    }

    #[test]
    fn layout_counts_and_lengths() {
        for (total, size) in [(0u64, 7usize), (1, 7), (6, 7), (7, 7), (8, 7), (3000, 1448), (2896, 1448)] {
            let layout = ChunkLayout::new(total, size);
            let n = layout.chunk_count();
            assert_eq!(n as u64, total.div_ceil(size as u64));

            let sum: u64 = (0..n).map(|i| layout.expected_len(i) as u64).sum();
            assert_eq!(sum, total, "lengths must cover the buffer for {}/{}", total, size);
            for i in 0..n.saturating_sub(1) {
                assert_eq!(layout.expected_len(i), size);
            }
            if n > 0 {
                let rem = (total % size as u64) as usize;
                let last = if rem == 0 { size } else { rem };
                assert_eq!(layout.expected_len(n - 1), last);
            }
        }
    }

    #[test]
    fn three_thousand_bytes_in_1448_chunks() {
        let layout = ChunkLayout::new(3000, 1448);
        assert_eq!(layout.chunk_count(), 3);
        assert_eq!(layout.expected_len(2), 104);
        assert_eq!(layout.offset_of(2), 2896);
    }

    #[test]
    fn try_new_rejects_zero_chunk_size() {
        assert!(ChunkLayout::try_new(3000, 0).is_none());
        assert_eq!(ChunkLayout::try_new(3000, 1448), Some(ChunkLayout::new(3000, 1448)));
    }

    #[test]
    fn index_of_checks_alignment_and_range() {
        let layout = ChunkLayout::new(3000, 1448);
        assert_eq!(layout.index_of(1448), Ok(1));
        assert_eq!(layout.index_of(1000), Err(SlotRejection::Unaligned));
        assert_eq!(layout.index_of(4344), Err(SlotRejection::OutOfRange));
        assert_eq!(
            layout.slot_for(2896, 1448),
            Err(SlotRejection::WrongLength {
                expected: 104,
                got: 1448
            })
        );
    }

    #[test]
    fn duplicates_and_any_order_complete_the_store() {
        let layout = ChunkLayout::new(3000, 1448);
        let mut store = ChunkStore::new(layout);
        assert!(!store.is_complete());

        for index in [2, 0, 2, 0] {
            store
                .insert(layout.offset_of(index), chunk(&layout, index, index as u8))
                .unwrap();
        }
        assert_eq!(store.missing_indices(), vec![1]);
        assert_eq!(store.filled_count(), 2);

        assert_eq!(
            store.insert(1448, chunk(&layout, 1, 1)),
            Ok(InsertOutcome::Filled)
        );
        assert_eq!(
            store.insert(1448, chunk(&layout, 1, 1)),
            Ok(InsertOutcome::Duplicate)
        );
        assert!(store.is_complete());

        let payload = store.assemble().unwrap();
        assert_eq!(payload.len(), 3000);
        assert!(payload[..1448].iter().all(|&b| b == 0));
        assert!(payload[1448..2896].iter().all(|&b| b == 1));
        assert!(payload[2896..].iter().all(|&b| b == 2));
    }

    #[test]
    fn wrong_length_is_never_stored() {
        let layout = ChunkLayout::new(3000, 1448);
        let mut store = ChunkStore::new(layout);
        assert!(store.insert(0, Bytes::from(vec![0u8; 1447])).is_err());
        assert!(store.insert(2896, Bytes::from(vec![0u8; 1448])).is_err());
        assert_eq!(store.filled_count(), 0);
        assert!(!store.is_filled(0));
    }

    #[test]
    fn incomplete_store_does_not_assemble() {
        let store = ChunkStore::new(ChunkLayout::new(3000, 1448));
        assert!(matches!(
            store.assemble(),
            Err(TransferError::Incomplete { missing: 3 })
        ));
    }

    #[test]
    fn empty_buffer_is_complete() {
        let store = ChunkStore::new(ChunkLayout::new(0, 1448));
        assert!(store.is_complete());
        assert!(store.assemble().unwrap().is_empty());
    }
}
