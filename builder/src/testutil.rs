//! Test fixtures shared across modules: a small but coherent metadata
//! model plus helpers to build host object graphs and run a full build.

use std::cell::RefCell;

use crate::buffer::ImageBuffer;
use crate::heap::ImageHeap;
use crate::host::{ArrayData, HostData, HostObject, HostRef, HostValue, PrimValue};
use crate::meta::{FieldDescriptor, TypeId, TypeKind};
use crate::universe::{StringMeta, TypeRegistration, Universe};
use kiln_shared::encoding::LayoutEncoding;
use kiln_shared::kind::StorageKind;
use kiln_shared::layout::{align_up, ObjectLayout};

pub struct BaseTypes {
    pub string: TypeId,
    pub char_array: TypeId,
    pub byte_array: TypeId,
    pub string_array: TypeId,
}

/// A universe with string, char[], byte[] and String[] registered the way
/// the metadata side of the toolchain would register them.
pub fn base_universe(reference_size: usize) -> (Universe, BaseTypes) {
    let layout = ObjectLayout::new(reference_size);
    let mut universe = Universe::new();
    let value_offset = reference_size;
    let hash_offset = value_offset + reference_size;
    let string = universe.register_type(TypeRegistration {
        name: "String".into(),
        kind: TypeKind::Instance {
            fields: vec![
                FieldDescriptor {
                    name: "value".into(),
                    kind: StorageKind::Object,
                    location: Some(value_offset),
                    is_accessed: true,
                    is_written: false,
                    is_final: true,
                },
                accessed_field("hash", StorageKind::Int, hash_offset, true),
            ],
            hybrid: None,
        },
        layout: LayoutEncoding::for_instance(align_up(hash_offset + 4, 8)),
        is_instantiated: true,
        class_init_ready: true,
        hash_code_offset: None,
        monitor_offset: None,
    });
    let char_array = register_array(&mut universe, "char[]", StorageKind::Char, None, layout);
    let byte_array = register_array(&mut universe, "byte[]", StorageKind::Byte, None, layout);
    let string_array = register_array(
        &mut universe,
        "String[]",
        StorageKind::Object,
        Some(string),
        layout,
    );
    universe.set_string_meta(StringMeta {
        type_id: string,
        hash_field: 1,
        value_field: 0,
    });
    universe.set_string_array_type(string_array);
    (
        universe,
        BaseTypes {
            string,
            char_array,
            byte_array,
            string_array,
        },
    )
}

pub fn accessed_field(
    name: &str,
    kind: StorageKind,
    location: usize,
    is_written: bool,
) -> FieldDescriptor {
    FieldDescriptor {
        name: name.into(),
        kind,
        location: Some(location),
        is_accessed: true,
        is_written,
        is_final: false,
    }
}

pub fn register_array(
    universe: &mut Universe,
    name: &str,
    component: StorageKind,
    component_type: Option<TypeId>,
    layout: ObjectLayout,
) -> TypeId {
    let base = layout.array_base_offset(component);
    let shift = component.width(layout.reference_size()).trailing_zeros() as u8;
    let encoding = if component == StorageKind::Object {
        LayoutEncoding::for_object_array(base, shift)
    } else {
        LayoutEncoding::for_primitive_array(base, shift)
    };
    universe.register_type(TypeRegistration {
        name: name.into(),
        kind: TypeKind::Array {
            component,
            component_type,
        },
        layout: encoding,
        is_instantiated: true,
        class_init_ready: true,
        hash_code_offset: None,
        monitor_offset: None,
    })
}

pub fn register_instance(
    universe: &mut Universe,
    name: &str,
    fields: Vec<FieldDescriptor>,
    size: usize,
) -> TypeId {
    universe.register_type(TypeRegistration {
        name: name.into(),
        kind: TypeKind::Instance {
            fields,
            hybrid: None,
        },
        layout: LayoutEncoding::for_instance(size),
        is_instantiated: true,
        class_init_ready: true,
        hash_code_offset: None,
        monitor_offset: None,
    })
}

pub fn new_instance(universe: &Universe, type_id: TypeId, fields: Vec<HostValue>) -> HostRef {
    HostObject::new(
        type_id,
        universe.fresh_hash(),
        HostData::Instance {
            fields: RefCell::new(fields),
        },
    )
}

pub fn new_array(universe: &Universe, type_id: TypeId, elements: ArrayData) -> HostRef {
    HostObject::new(
        type_id,
        universe.fresh_hash(),
        HostData::Array {
            elements: RefCell::new(elements),
        },
    )
}

pub fn new_byte_array(universe: &Universe, type_id: TypeId, values: &[i8]) -> HostRef {
    new_array(universe, type_id, ArrayData::Byte(values.to_vec()))
}

/// A host string with an uncomputed (zero) hash field.
pub fn new_string(universe: &Universe, types: &BaseTypes, text: &str) -> HostRef {
    let chars: Vec<u16> = text.encode_utf16().collect();
    let payload = new_array(universe, types.char_array, ArrayData::Char(chars));
    new_instance(
        universe,
        types.string,
        vec![
            HostValue::Ref(Some(payload)),
            HostValue::Prim(PrimValue::Int(0)),
        ],
    )
}

pub const BOUNDARY_FIELDS: [&str; 8] = [
    "first_read_only_primitive_object",
    "last_read_only_primitive_object",
    "first_read_only_reference_object",
    "last_read_only_reference_object",
    "first_writable_primitive_object",
    "last_writable_primitive_object",
    "first_writable_reference_object",
    "last_writable_reference_object",
];

/// Registers the runtime singleton the boundary patcher fills in, with one
/// reference field per partition bound, all initially null.
pub fn register_boundary_holder(universe: &mut Universe, reference_size: usize) -> HostRef {
    let fields = BOUNDARY_FIELDS
        .into_iter()
        .enumerate()
        .map(|(index, name)| {
            accessed_field(
                name,
                StorageKind::Object,
                reference_size * (index + 1),
                true,
            )
        })
        .collect();
    let size = align_up(reference_size * (BOUNDARY_FIELDS.len() + 1), 8);
    let type_id = register_instance(universe, "runtime.HeapBounds", fields, size);
    let holder = new_instance(universe, type_id, vec![HostValue::Ref(None); 8]);
    universe.set_heap_bounds_holder(&holder);
    universe.add_root("heap bounds singleton", &holder);
    holder
}

/// Registers the runtime singleton holding the interned-strings table.
pub fn register_interned_holder(universe: &mut Universe, reference_size: usize) -> HostRef {
    let fields = vec![accessed_field(
        "table",
        StorageKind::Object,
        reference_size,
        true,
    )];
    let size = align_up(reference_size * 2, 8);
    let type_id = register_instance(universe, "runtime.InternedStrings", fields, size);
    let holder = new_instance(universe, type_id, vec![HostValue::Ref(None)]);
    universe.set_interned_table_holder(&holder, 0);
    universe.add_root("interned strings singleton", &holder);
    holder
}

/// Seals the heap, binds both sections (read-only at 0, writable right
/// after), and writes the image.
pub fn write_image(heap: &mut ImageHeap) -> (ImageBuffer, ImageBuffer) {
    heap.add_trailing_objects().expect("sealing the heap failed");
    heap.set_read_only_section("rodata", 0);
    let read_only_size = heap.read_only_section_size();
    heap.set_writable_section("data", align_up(read_only_size, 8));
    let mut read_only = ImageBuffer::new(read_only_size);
    let mut writable = ImageBuffer::new(heap.writable_section_size());
    heap.write_heap(&mut read_only, &mut writable)
        .expect("writing the heap failed");
    (read_only, writable)
}

pub fn read_u32(bytes: &[u8], index: usize) -> u32 {
    u32::from_le_bytes(bytes[index..index + 4].try_into().expect("short read"))
}

pub fn read_u64(bytes: &[u8], index: usize) -> u64 {
    u64::from_le_bytes(bytes[index..index + 8].try_into().expect("short read"))
}
