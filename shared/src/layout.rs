//! The layout oracle: pure queries over object geometry. The emitter and
//! the partitioner depend only on these; there is no mutable state.

use crate::encoding::LayoutEncoding;
use crate::kind::StorageKind;

/// Objects are placed at multiples of this within the image heap.
pub const OBJECT_ALIGNMENT: usize = 8;

pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}

/// Object geometry for one build: the reference width plus everything
/// derived from it.
#[derive(Clone, Copy, Debug)]
pub struct ObjectLayout {
    reference_size: usize,
}

impl ObjectLayout {
    pub const fn new(reference_size: usize) -> Self {
        assert!(reference_size == 4 || reference_size == 8);
        Self { reference_size }
    }

    pub const fn reference_size(&self) -> usize {
        self.reference_size
    }

    pub const fn alignment(&self) -> usize {
        OBJECT_ALIGNMENT
    }

    /// Every object starts with its hub reference.
    pub const fn hub_offset(&self) -> usize {
        0
    }

    /// Array length slot, right after the hub reference.
    pub const fn array_length_offset(&self) -> usize {
        self.reference_size
    }

    /// Identity hash slot of arrays, right after the length.
    pub const fn array_hash_offset(&self) -> usize {
        self.array_length_offset() + 4
    }

    /// Offset of the first element of an array with the given component
    /// kind, aligned to the element width.
    pub fn array_base_offset(&self, kind: StorageKind) -> usize {
        align_up(self.array_hash_offset() + 4, kind.width(self.reference_size))
    }

    pub fn array_element_offset(&self, kind: StorageKind, index: usize) -> usize {
        self.array_base_offset(kind) + index * kind.width(self.reference_size)
    }

    /// Total aligned size of an array object.
    pub fn array_size(&self, kind: StorageKind, length: usize) -> usize {
        align_up(
            self.array_base_offset(kind) + length * kind.width(self.reference_size),
            OBJECT_ALIGNMENT,
        )
    }

    pub fn instance_size(&self, encoding: LayoutEncoding) -> usize {
        encoding.instance_size()
    }

    pub const fn is_object_aligned(&self, offset: usize) -> bool {
        offset % OBJECT_ALIGNMENT == 0
    }

    pub const fn is_reference_aligned(&self, offset: usize) -> bool {
        offset % self.reference_size == 0
    }
}
