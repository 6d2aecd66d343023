use crate::meta::{HybridMeta, TypeDescriptor};
use kiln_shared::kind::StorageKind;
use kiln_shared::layout::{align_up, ObjectLayout, OBJECT_ALIGNMENT};

/// Resolved layout of a hybrid type: where the inlined bit region and the
/// tail array live, and how big an instance is for a given tail length.
/// Built once per type and cached by the heap.
#[derive(Clone, Copy, Debug)]
pub struct HybridLayout {
    meta: HybridMeta,
    element_width: usize,
}

impl HybridLayout {
    pub fn new(descriptor: &TypeDescriptor, layout: ObjectLayout) -> Self {
        let meta = *descriptor.hybrid().expect("type has no hybrid layout");
        let element_width = meta.element_kind.width(layout.reference_size());
        assert!(
            meta.array_base_offset % element_width == 0,
            "hybrid tail of {} starts unaligned",
            descriptor.name
        );
        Self {
            meta,
            element_width,
        }
    }

    pub fn array_field(&self) -> usize {
        self.meta.array_field
    }

    pub fn bitset_field(&self) -> Option<usize> {
        self.meta.bitset_field
    }

    pub fn bit_field_offset(&self) -> usize {
        self.meta.bit_field_offset
    }

    pub fn bitset_bytes(&self) -> usize {
        self.meta.bitset_bytes
    }

    pub fn element_kind(&self) -> StorageKind {
        self.meta.element_kind
    }

    pub fn element_offset(&self, index: usize) -> usize {
        self.meta.array_base_offset + index * self.element_width
    }

    /// Total aligned size of a hybrid instance with the given tail length.
    pub fn total_size(&self, length: usize) -> usize {
        align_up(
            self.meta.array_base_offset + length * self.element_width,
            OBJECT_ALIGNMENT,
        )
    }
}
