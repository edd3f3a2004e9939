use fixedbitset::FixedBitSet;

/// Maps logical slots onto one of two physical buffers.
///
/// Slots below `fixed_count` have a single buffer and are never flipped.
/// Every other slot `i` lives in buffer `i` or `i + (slot_count - fixed_count)`.
/// `store` snapshots the mapping, `restore` swaps the live mapping with the
/// snapshot. A slot counts as flipped while its live and stored buffers
/// differ, so the stored buffer of a flipped slot is never handed out for
/// writing.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferIndexTable {
    slot_count: usize,
    fixed_count: usize,
    offsets: FixedBitSet,
    stored: FixedBitSet,
}

impl BufferIndexTable {
    pub fn new(slot_count: usize, fixed_count: usize) -> Self {
        debug_assert!(fixed_count <= slot_count);
        BufferIndexTable {
            slot_count,
            fixed_count,
            offsets: FixedBitSet::with_capacity(slot_count),
            stored: FixedBitSet::with_capacity(slot_count),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Number of physical buffers backing the table.
    pub fn buffer_count(&self) -> usize {
        2 * self.slot_count - self.fixed_count
    }

    fn physical(&self, i: usize, flipped: bool) -> usize {
        if flipped {
            i + self.slot_count - self.fixed_count
        } else {
            i
        }
    }

    /// Physical buffer currently holding slot `i`.
    pub fn offset_index(&self, i: usize) -> usize {
        self.physical(i, self.offsets.contains(i))
    }

    /// Physical buffer that `restore` would make current for slot `i`.
    pub fn stored_offset_index(&self, i: usize) -> usize {
        self.physical(i, self.stored.contains(i))
    }

    pub fn is_flipped(&self, i: usize) -> bool {
        self.offsets.contains(i) != self.stored.contains(i)
    }

    /// Unguarded toggle, engine code goes through `flip_once`.
    #[cfg(test)]
    pub(crate) fn flip(&mut self, i: usize) {
        debug_assert!(i >= self.fixed_count, "slot {} has a single buffer", i);
        if i >= self.fixed_count {
            self.offsets.toggle(i);
        }
    }

    /// Flips slot `i` unless it already moved away from its stored buffer.
    /// Returns whether a flip happened.
    pub fn flip_once(&mut self, i: usize) -> bool {
        if i < self.fixed_count || self.is_flipped(i) {
            return false;
        }
        self.offsets.toggle(i);
        true
    }

    pub fn store(&mut self) {
        self.stored.clone_from(&self.offsets);
    }

    pub fn restore(&mut self) {
        std::mem::swap(&mut self.offsets, &mut self.stored);
    }
}

/// All index tables of one engine. Partials and matrices span every node,
/// tips keep a single partials buffer. Scale factors exist per internal
/// node only when scaling is managed by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineBuffers {
    pub partials: BufferIndexTable,
    pub matrices: BufferIndexTable,
    pub scales: Option<BufferIndexTable>,
    pub eigen: BufferIndexTable,
    tip_count: usize,
}

impl EngineBuffers {
    pub fn new(node_count: usize, tip_count: usize, with_scales: bool) -> Self {
        EngineBuffers {
            partials: BufferIndexTable::new(node_count, tip_count),
            matrices: BufferIndexTable::new(node_count, 0),
            scales: with_scales.then(|| BufferIndexTable::new(node_count - tip_count, 0)),
            eigen: BufferIndexTable::new(1, 0),
            tip_count,
        }
    }

    /// Scale slot of an internal node.
    pub fn scale_slot(&self, node: usize) -> usize {
        node - self.tip_count
    }

    pub fn store(&mut self) {
        self.partials.store();
        self.matrices.store();
        self.eigen.store();
        if let Some(scales) = self.scales.as_mut() {
            scales.store();
        }
    }

    pub fn restore(&mut self) {
        self.partials.restore();
        self.matrices.restore();
        self.eigen.restore();
        if let Some(scales) = self.scales.as_mut() {
            scales.restore();
        }
    }
}
