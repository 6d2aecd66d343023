//! The metadata model supplied by the analysis side of the toolchain:
//! per-type layout encodings, per-field offsets and access flags, and
//! per-method compilation status. The heap builder only reads these.

use crate::host::HostRef;
use kiln_shared::encoding::LayoutEncoding;
use kiln_shared::kind::StorageKind;

/// Index of a type in the universe registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Index of a method in the universe registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MethodId(pub u32);

pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
    /// The runtime metadata object every instance's first word points at.
    pub hub: HostRef,
    pub layout: LayoutEncoding,
    pub is_instantiated: bool,
    /// Byte offset of the identity hash slot of instances, when the hub
    /// declares one.
    pub hash_code_offset: Option<usize>,
    /// Byte offset of the runtime monitor slot, when present. The monitor
    /// is a reference slot written at runtime.
    pub monitor_offset: Option<usize>,
}

impl TypeDescriptor {
    pub fn instance_fields(&self) -> &[FieldDescriptor] {
        match &self.kind {
            TypeKind::Instance { fields, .. } => fields,
            _ => &[],
        }
    }

    pub fn hybrid(&self) -> Option<&HybridMeta> {
        match &self.kind {
            TypeKind::Instance { hybrid, .. } => hybrid.as_ref(),
            _ => None,
        }
    }
}

pub enum TypeKind {
    Primitive,
    Instance {
        fields: Vec<FieldDescriptor>,
        hybrid: Option<HybridMeta>,
    },
    Array {
        component: StorageKind,
        component_type: Option<TypeId>,
    },
}

pub struct FieldDescriptor {
    pub name: String,
    pub kind: StorageKind,
    /// Byte offset within the instance; absent for folded-away fields.
    pub location: Option<usize>,
    pub is_accessed: bool,
    pub is_written: bool,
    pub is_final: bool,
}

/// Layout of a hybrid type: a variable-length tail array and an optional
/// bit set inlined into the instance so the whole structure occupies one
/// contiguous region.
#[derive(Clone, Copy, Debug)]
pub struct HybridMeta {
    /// Index of the instance field holding the tail array on the host side.
    pub array_field: usize,
    /// Index of the instance field holding the bit set on the host side.
    pub bitset_field: Option<usize>,
    /// Byte offset of the inlined bit region.
    pub bit_field_offset: usize,
    /// Reserved length of the inlined bit region.
    pub bitset_bytes: usize,
    pub element_kind: StorageKind,
    /// Byte offset of the first tail element.
    pub array_base_offset: usize,
}

pub struct MethodDescriptor {
    pub name: String,
    pub is_compiled: bool,
}
