//! Byte-exact emission of the admitted heap into the output buffers.
//!
//! Every object is written as hub header, then instance fields or array
//! length/hash, then hybrid bit set and tail or array elements. Object
//! references become shifted section offsets when a heap base is in use,
//! and direct relocation records otherwise; function pointers always
//! become relocation records.

use log::debug;
use zerocopy::little_endian::{I16, I32, I64, U16, U32, U64};
use zerocopy::AsBytes;

use crate::buffer::{RelocatableBuffer, RelocationTarget};
use crate::error::{BuildError, Result};
use crate::heap::ImageHeap;
use crate::host::{ArrayData, HostId, HostRef, HostValue, PrimValue, WordValue};
use crate::meta::{MethodId, TypeKind};
use crate::object_info::{ObjectInfo, Reason};
use kiln_shared::kind::StorageKind;

/// Writes admitted objects into the read-only and writable buffers.
pub struct HeapWriter<'heap> {
    heap: &'heap ImageHeap,
    first_relocation: Option<usize>,
}

impl<'heap> HeapWriter<'heap> {
    pub fn new(heap: &'heap ImageHeap) -> Self {
        Self {
            heap,
            first_relocation: None,
        }
    }

    /// Section-relative offset of the first relocation written, if any.
    pub fn first_relocation_offset(&self) -> Option<usize> {
        self.first_relocation
    }

    pub fn write_objects(
        &mut self,
        read_only: &mut dyn RelocatableBuffer,
        writable: &mut dyn RelocatableBuffer,
    ) -> Result<()> {
        let heap = self.heap;
        for index in 0..heap.object_count() {
            let info = heap.info_at(index);
            if info.partition().is_writable() {
                self.write_object(index, info, writable)?;
            } else {
                self.write_object(index, info, read_only)?;
            }
        }
        debug!("wrote {} objects", heap.object_count());
        Ok(())
    }

    fn write_object(
        &mut self,
        index: usize,
        info: &ObjectInfo,
        buffer: &mut dyn RelocatableBuffer,
    ) -> Result<()> {
        let heap = self.heap;
        let layout = heap.layout();
        let base = heap.index_in_buffer(info);
        self.write_hub(buffer, base, info, index)?;
        let descriptor = heap.universe().type_descriptor(info.type_id());
        match &descriptor.kind {
            TypeKind::Instance { fields, hybrid } => {
                for (field_index, field) in fields.iter().enumerate() {
                    if hybrid.is_some_and(|meta| {
                        field_index == meta.array_field || Some(field_index) == meta.bitset_field
                    }) {
                        continue;
                    }
                    if !field.is_accessed {
                        continue;
                    }
                    let Some(location) = field.location else {
                        continue;
                    };
                    let value = heap.universe().read_field(info.object(), field_index);
                    self.write_value(buffer, base + location, field.kind, &value, index)?;
                }
                if hybrid.is_some() {
                    self.write_hybrid_tail(buffer, base, info, index)?;
                }
                if let Some(hash_offset) = descriptor.hash_code_offset {
                    buffer.put_u32(base + hash_offset, info.identity_hash());
                }
            }
            TypeKind::Array { component, .. } => {
                let length = info.object().elements().len();
                buffer.put_u32(base + layout.array_length_offset(), length as u32);
                buffer.put_u32(base + layout.array_hash_offset(), info.identity_hash());
                self.write_elements(buffer, base, info.object(), index, |element_index| {
                    layout.array_element_offset(*component, element_index)
                })?;
            }
            TypeKind::Primitive => {
                panic!("primitive mirror admitted to the image heap")
            }
        }
        Ok(())
    }

    fn write_hybrid_tail(
        &mut self,
        buffer: &mut dyn RelocatableBuffer,
        base: usize,
        info: &ObjectInfo,
        index: usize,
    ) -> Result<()> {
        let heap = self.heap;
        let layout = heap.layout();
        let hybrid = *heap
            .hybrid_layout(info.type_id())
            .expect("hybrid layout not cached during admission");
        if let Some(bitset_field) = hybrid.bitset_field() {
            if let HostValue::Ref(Some(bits)) =
                heap.universe().read_field(info.object(), bitset_field)
            {
                let bits = heap.universe().replace_object(&bits);
                self.write_bit_set(
                    buffer,
                    base + hybrid.bit_field_offset(),
                    hybrid.bitset_bytes(),
                    &bits,
                );
            }
        }
        let tail = match heap.universe().read_field(info.object(), hybrid.array_field()) {
            HostValue::Ref(Some(array)) => Some(heap.universe().replace_object(&array)),
            _ => None,
        };
        let length = tail.as_ref().map_or(0, |array| array.elements().len());
        buffer.put_u32(base + layout.array_length_offset(), length as u32);
        if let Some(tail) = tail {
            self.write_elements(buffer, base, &tail, index, |element_index| {
                hybrid.element_offset(element_index)
            })?;
        }
        Ok(())
    }

    /// Serializes the backing words of a hybrid bit set into its reserved
    /// byte region, one bit at a time.
    fn write_bit_set(
        &self,
        buffer: &mut dyn RelocatableBuffer,
        index: usize,
        region_bytes: usize,
        bits: &HostRef,
    ) {
        let elements = bits.elements();
        let ArrayData::Long(words) = &*elements else {
            panic!("hybrid bit set must be backed by a long array");
        };
        let mut region = vec![0u8; region_bytes];
        for (word_index, word) in words.iter().enumerate() {
            let word = *word as u64;
            for bit in 0..64 {
                if word >> bit & 1 == 1 {
                    let position = word_index * 64 + bit;
                    assert!(
                        position / 8 < region_bytes,
                        "bit {position} outside the reserved bit field"
                    );
                    region[position / 8] |= 1 << (position % 8);
                }
            }
        }
        buffer.put_bytes(index, &region);
    }

    fn write_elements(
        &mut self,
        buffer: &mut dyn RelocatableBuffer,
        base: usize,
        array: &HostRef,
        holder_index: usize,
        offset_of: impl Fn(usize) -> usize,
    ) -> Result<()> {
        match &*array.elements() {
            ArrayData::Boolean(values) => {
                let raw: Vec<u8> = values.iter().map(|&value| u8::from(value)).collect();
                buffer.put_bytes(base + offset_of(0), &raw);
            }
            ArrayData::Byte(values) => {
                buffer.put_bytes(base + offset_of(0), values.as_bytes());
            }
            ArrayData::Char(values) => {
                let raw: Vec<U16> = values.iter().map(|&value| U16::new(value)).collect();
                buffer.put_bytes(base + offset_of(0), raw.as_bytes());
            }
            ArrayData::Short(values) => {
                let raw: Vec<I16> = values.iter().map(|&value| I16::new(value)).collect();
                buffer.put_bytes(base + offset_of(0), raw.as_bytes());
            }
            ArrayData::Int(values) => {
                let raw: Vec<I32> = values.iter().map(|&value| I32::new(value)).collect();
                buffer.put_bytes(base + offset_of(0), raw.as_bytes());
            }
            ArrayData::Long(values) => {
                let raw: Vec<I64> = values.iter().map(|&value| I64::new(value)).collect();
                buffer.put_bytes(base + offset_of(0), raw.as_bytes());
            }
            ArrayData::Float(values) => {
                let raw: Vec<U32> = values.iter().map(|&value| U32::new(value.to_bits())).collect();
                buffer.put_bytes(base + offset_of(0), raw.as_bytes());
            }
            ArrayData::Double(values) => {
                let raw: Vec<U64> = values.iter().map(|&value| U64::new(value.to_bits())).collect();
                buffer.put_bytes(base + offset_of(0), raw.as_bytes());
            }
            ArrayData::Object(slots) => {
                for (element_index, slot) in slots.iter().enumerate() {
                    self.write_reference(
                        buffer,
                        base + offset_of(element_index),
                        slot.as_ref(),
                        holder_index,
                    )?;
                }
            }
            ArrayData::Word(words) => {
                for (element_index, word) in words.iter().enumerate() {
                    match word {
                        WordValue::Raw(value) => {
                            buffer.put_u64(base + offset_of(element_index), *value);
                        }
                        WordValue::Method(method) => {
                            self.write_method_pointer(
                                buffer,
                                base + offset_of(element_index),
                                *method,
                                holder_index,
                            )?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn write_value(
        &mut self,
        buffer: &mut dyn RelocatableBuffer,
        index: usize,
        kind: StorageKind,
        value: &HostValue,
        holder_index: usize,
    ) -> Result<()> {
        match value {
            HostValue::Prim(value) => {
                debug_assert!(kind.is_primitive() || kind == StorageKind::Word);
                write_primitive(buffer, index, *value);
            }
            HostValue::Ref(target) => {
                self.write_reference(buffer, index, target.as_ref(), holder_index)?;
            }
            HostValue::Method(method) => {
                self.write_method_pointer(buffer, index, *method, holder_index)?;
            }
        }
        Ok(())
    }

    fn write_reference(
        &mut self,
        buffer: &mut dyn RelocatableBuffer,
        index: usize,
        target: Option<&HostRef>,
        holder_index: usize,
    ) -> Result<()> {
        let heap = self.heap;
        let layout = heap.layout();
        assert!(
            layout.is_reference_aligned(index),
            "unaligned reference write at index {index}"
        );
        let reference_size = layout.reference_size();
        let Some(target) = target else {
            if reference_size == 4 {
                buffer.put_u32(index, 0);
            } else {
                buffer.put_u64(index, 0);
            }
            return Ok(());
        };
        let target = heap.universe().replace_object(target);
        let Some(target_info) = heap.get_object_info(&target) else {
            return Err(self.unadmitted(&target, holder_index));
        };
        let compress = heap.options().compress;
        if compress.has_base {
            let value = heap.offset_in_section(target_info) >> compress.shift;
            if reference_size == 4 {
                buffer.put_u32(index, value as u32);
            } else {
                buffer.put_u64(index, value as u64);
            }
        } else {
            buffer.add_direct_relocation_without_addend(
                index,
                reference_size,
                RelocationTarget::Object(HostId::of(&target)),
            );
            self.record_relocation(index);
        }
        Ok(())
    }

    fn write_method_pointer(
        &mut self,
        buffer: &mut dyn RelocatableBuffer,
        index: usize,
        method: MethodId,
        holder_index: usize,
    ) -> Result<()> {
        let heap = self.heap;
        let descriptor = heap
            .universe()
            .method(method)
            .expect("method pointer to unregistered method");
        if !descriptor.is_compiled {
            return Err(BuildError::MethodNotCompiled {
                method: descriptor.name.clone(),
                chain: heap.render_chain(None, &Reason::Object(holder_index)),
            });
        }
        // Function pointers are word width regardless of compression.
        assert!(index % 8 == 0, "unaligned method pointer write at {index}");
        buffer.add_direct_relocation_without_addend(index, 8, RelocationTarget::Method(method));
        self.record_relocation(index);
        Ok(())
    }

    fn write_hub(
        &mut self,
        buffer: &mut dyn RelocatableBuffer,
        base: usize,
        info: &ObjectInfo,
        holder_index: usize,
    ) -> Result<()> {
        let heap = self.heap;
        let layout = heap.layout();
        let hub = heap.universe().type_descriptor(info.type_id()).hub.clone();
        let index = base + layout.hub_offset();
        let Some(hub_info) = heap.get_object_info(&hub) else {
            return Err(self.unadmitted(&hub, holder_index));
        };
        let header = heap.header_encoding();
        let compress = heap.options().compress;
        if compress.has_base {
            let bits = header.header_bits(heap.offset_in_section(hub_info) as u64);
            // Reserved bits live below the offset; shifting would destroy
            // them.
            let bits = if header.has_reserved_bits() {
                bits
            } else {
                bits >> compress.shift
            };
            if layout.reference_size() == 4 {
                assert!(bits <= u64::from(u32::MAX), "hub header {bits:#x} overflows");
                buffer.put_u32(index, bits as u32);
            } else {
                buffer.put_u64(index, bits);
            }
        } else {
            buffer.add_direct_relocation_with_addend(
                index,
                layout.reference_size(),
                header.reserved_bits_value(),
                RelocationTarget::Object(HostId::of(&hub)),
            );
            self.record_relocation(index);
        }
        Ok(())
    }

    /// Relocation accounting: with a heap base every relocation must land
    /// inside the relocatable partition; the first offset is recorded for
    /// later consumers.
    fn record_relocation(&mut self, index: usize) {
        if self.heap.options().compress.has_base {
            let (start, end) = self
                .heap
                .partitions()
                .relocatable_range()
                .expect("read-only section not bound");
            assert!(
                index >= start && index < end,
                "relocation at {index} outside the relocatable partition [{start}, {end})"
            );
        }
        if self.first_relocation.map_or(true, |first| index < first) {
            self.first_relocation = Some(index);
        }
    }

    fn unadmitted(&self, target: &HostRef, holder_index: usize) -> BuildError {
        BuildError::UnadmittedTarget {
            what: format!(
                "an object of type {}",
                self.heap
                    .universe()
                    .type_descriptor(target.type_id())
                    .name
            ),
            chain: self
                .heap
                .render_chain(Some(target), &Reason::Object(holder_index)),
        }
    }
}

/// Fixed-width little-endian writes, one per primitive kind.
fn write_primitive(buffer: &mut dyn RelocatableBuffer, index: usize, value: PrimValue) {
    match value {
        PrimValue::Boolean(value) => buffer.put_u8(index, u8::from(value)),
        PrimValue::Byte(value) => buffer.put_u8(index, value as u8),
        PrimValue::Char(value) => buffer.put_u16(index, value),
        PrimValue::Short(value) => buffer.put_u16(index, value as u16),
        PrimValue::Int(value) => buffer.put_u32(index, value as u32),
        PrimValue::Long(value) => buffer.put_u64(index, value as u64),
        PrimValue::Float(value) => buffer.put_u32(index, value.to_bits()),
        PrimValue::Double(value) => buffer.put_u64(index, value.to_bits()),
    }
}

/// Writes one reference slot outside the regular per-object walk. Used by
/// the boundary patcher once final offsets are known.
pub(crate) fn write_reference_slot(
    heap: &ImageHeap,
    buffer: &mut dyn RelocatableBuffer,
    index: usize,
    target: &ObjectInfo,
) {
    let layout = heap.layout();
    assert!(
        layout.is_reference_aligned(index),
        "unaligned reference write at index {index}"
    );
    let compress = heap.options().compress;
    if compress.has_base {
        let value = heap.offset_in_section(target) >> compress.shift;
        if layout.reference_size() == 4 {
            buffer.put_u32(index, value as u32);
        } else {
            buffer.put_u64(index, value as u64);
        }
    } else {
        buffer.add_direct_relocation_without_addend(
            index,
            layout.reference_size(),
            RelocationTarget::Object(HostId::of(target.object())),
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::heap::ImageHeap;
    use crate::host::{ArrayData, HostValue, PrimValue};
    use crate::meta::{FieldDescriptor, HybridMeta, TypeKind};
    use crate::object_info::Reason;
    use crate::partition::PartitionKind;
    use crate::testutil::{
        accessed_field, base_universe, new_array, new_byte_array, new_instance, new_string,
        read_u32, read_u64, register_array, register_instance, write_image,
    };
    use crate::universe::{TypeRegistration, Universe};
    use crate::BuildOptions;
    use kiln_shared::encoding::LayoutEncoding;
    use kiln_shared::header::CompressEncoding;
    use kiln_shared::layout::ObjectLayout;

    fn root() -> Reason {
        Reason::Root("test root".into())
    }

    fn opened_heap(universe: Universe, options: BuildOptions) -> ImageHeap {
        let mut heap = ImageHeap::new(universe, options);
        heap.add_initial_objects().expect("seeding failed");
        heap
    }

    #[test]
    fn byte_array_bytes_are_exact() {
        let (universe, types) = base_universe(4);
        let mut heap = opened_heap(universe, BuildOptions::default());
        let array = new_byte_array(heap.universe(), types.byte_array, &[0x01, 0x02, 0x03]);
        heap.add_object(&array, true, root()).expect("admission failed");
        let (read_only, _writable) = write_image(&mut heap);
        let bytes = read_only.bytes();

        let info = heap.get_object_info(&array).expect("missing");
        let base = heap.index_in_buffer(info);
        // hub header: shifted section offset of the hub
        let hub = heap
            .universe()
            .type_descriptor(types.byte_array)
            .hub
            .clone();
        let hub_info = heap.get_object_info(&hub).expect("hub not admitted");
        let expected_header = (heap.offset_in_section(hub_info) >> 3) as u32;
        assert_eq!(read_u32(bytes, base), expected_header);
        // length, identity hash, elements
        assert_eq!(read_u32(bytes, base + 4), 3);
        assert_eq!(read_u32(bytes, base + 8), info.identity_hash());
        assert_eq!(&bytes[base + 12..base + 15], &[0x01, 0x02, 0x03]);
        // nothing here bears relocations
        assert!(read_only.relocations().is_empty());
        assert_eq!(heap.first_relocatable_pointer_offset_in_section(), None);
    }

    #[test]
    fn reference_fields_hold_shifted_section_offsets() {
        let (mut universe, _types) = base_universe(4);
        let b_type = register_instance(
            &mut universe,
            "B",
            vec![accessed_field("x", StorageKind::Int, 4, false)],
            8,
        );
        let a_type = register_instance(
            &mut universe,
            "A",
            vec![accessed_field("f", StorageKind::Object, 4, false)],
            8,
        );
        let mut heap = opened_heap(universe, BuildOptions::default());
        let b = new_instance(
            heap.universe(),
            b_type,
            vec![HostValue::Prim(PrimValue::Int(42))],
        );
        let a = new_instance(heap.universe(), a_type, vec![HostValue::Ref(Some(b.clone()))]);
        heap.add_object(&a, false, root()).expect("admission failed");
        let (read_only, _writable) = write_image(&mut heap);
        let bytes = read_only.bytes();

        let a_info = heap.get_object_info(&a).expect("missing");
        let b_info = heap.get_object_info(&b).expect("missing");
        assert_eq!(a_info.partition(), PartitionKind::ReadOnlyReference);
        let a_base = heap.index_in_buffer(a_info);
        let expected = (heap.offset_in_section(b_info) >> 3) as u32;
        assert_eq!(read_u32(bytes, a_base + 4), expected);
        // the primitive field of B is written in place
        let b_base = heap.index_in_buffer(b_info);
        assert_eq!(read_u32(bytes, b_base + 4), 42);
    }

    #[test]
    fn method_pointers_become_relocations() {
        let (mut universe, _types) = base_universe(4);
        let method = universe.register_method("dispatch_stub", true);
        let dispatch = register_instance(
            &mut universe,
            "Dispatch",
            vec![accessed_field("target", StorageKind::Word, 8, false)],
            16,
        );
        universe.register_immutable_type(dispatch);
        let mut heap = opened_heap(universe, BuildOptions::default());
        let object = new_instance(heap.universe(), dispatch, vec![HostValue::Method(method)]);
        heap.add_object(&object, false, root()).expect("admission failed");
        let (read_only, _writable) = write_image(&mut heap);

        let info = heap.get_object_info(&object).expect("missing");
        assert_eq!(info.partition(), PartitionKind::ReadOnlyRelocatable);
        let index = heap.index_in_buffer(info) + 8;
        let record = read_only.relocation_at(index).expect("missing relocation");
        assert_eq!(record.size, 8);
        assert_eq!(record.addend, None);
        assert_eq!(record.target, RelocationTarget::Method(method));
        // the relocation lands inside the relocatable partition
        assert_eq!(heap.read_only_relocatable_partition_size(), 16);
        let (start, end) = heap.partitions().relocatable_range().expect("unbound");
        assert!(index >= start && index < end);
        assert_eq!(
            heap.first_relocatable_pointer_offset_in_section(),
            Some(index)
        );
    }

    #[test]
    fn hybrid_bit_set_tail_and_length_are_emitted() {
        let (mut universe, types) = base_universe(4);
        let layout = ObjectLayout::new(4);
        let object_array =
            register_array(&mut universe, "Object[]", StorageKind::Object, None, layout);
        let long_array = register_array(&mut universe, "long[]", StorageKind::Long, None, layout);
        let table_type = universe.register_type(TypeRegistration {
            name: "DispatchTable".into(),
            kind: TypeKind::Instance {
                fields: vec![
                    FieldDescriptor {
                        name: "entries".into(),
                        kind: StorageKind::Object,
                        location: None,
                        is_accessed: true,
                        is_written: false,
                        is_final: true,
                    },
                    FieldDescriptor {
                        name: "flags".into(),
                        kind: StorageKind::Object,
                        location: None,
                        is_accessed: true,
                        is_written: false,
                        is_final: true,
                    },
                ],
                hybrid: Some(HybridMeta {
                    array_field: 0,
                    bitset_field: Some(1),
                    bit_field_offset: 8,
                    bitset_bytes: 8,
                    element_kind: StorageKind::Object,
                    array_base_offset: 16,
                }),
            },
            layout: LayoutEncoding::for_instance(16),
            is_instantiated: true,
            class_init_ready: true,
            hash_code_offset: None,
            monitor_offset: None,
        });
        let mut heap = opened_heap(universe, BuildOptions::default());
        let first = new_byte_array(heap.universe(), types.byte_array, &[1]);
        let second = new_byte_array(heap.universe(), types.byte_array, &[2]);
        let tail = new_array(
            heap.universe(),
            object_array,
            ArrayData::Object(vec![Some(first.clone()), Some(second.clone())]),
        );
        // bits {0, 3, 9}
        let bits = new_array(heap.universe(), long_array, ArrayData::Long(vec![0b10_0000_1001]));
        let table = new_instance(
            heap.universe(),
            table_type,
            vec![HostValue::Ref(Some(tail)), HostValue::Ref(Some(bits))],
        );
        heap.add_object(&table, true, root()).expect("admission failed");
        let (read_only, _writable) = write_image(&mut heap);
        let bytes = read_only.bytes();

        let info = heap.get_object_info(&table).expect("missing");
        let base = heap.index_in_buffer(info);
        assert_eq!(read_u32(bytes, base + 4), 2);
        assert_eq!(&bytes[base + 8..base + 16], &[0x09, 0x02, 0, 0, 0, 0, 0, 0]);
        let first_info = heap.get_object_info(&first).expect("missing");
        let second_info = heap.get_object_info(&second).expect("missing");
        assert_eq!(
            read_u32(bytes, base + 16),
            (heap.offset_in_section(first_info) >> 3) as u32
        );
        assert_eq!(
            read_u32(bytes, base + 20),
            (heap.offset_in_section(second_info) >> 3) as u32
        );
    }

    #[test]
    fn without_heap_base_references_become_relocations() {
        let (mut universe, _types) = base_universe(8);
        let b_type = register_instance(
            &mut universe,
            "B",
            vec![accessed_field("x", StorageKind::Int, 8, false)],
            16,
        );
        let a_type = register_instance(
            &mut universe,
            "A",
            vec![accessed_field("f", StorageKind::Object, 8, false)],
            16,
        );
        let mut heap = opened_heap(
            universe,
            BuildOptions {
                compress: CompressEncoding::NONE,
                ..BuildOptions::default()
            },
        );
        let b = new_instance(
            heap.universe(),
            b_type,
            vec![HostValue::Prim(PrimValue::Int(1))],
        );
        let a = new_instance(heap.universe(), a_type, vec![HostValue::Ref(Some(b.clone()))]);
        heap.add_object(&a, false, root()).expect("admission failed");
        let (read_only, _writable) = write_image(&mut heap);

        let a_info = heap.get_object_info(&a).expect("missing");
        let a_base = heap.index_in_buffer(a_info);
        // field: direct relocation without addend, reference width
        let field = read_only
            .relocation_at(a_base + 8)
            .expect("missing field relocation");
        assert_eq!(field.size, 8);
        assert_eq!(field.addend, None);
        assert_eq!(field.target, RelocationTarget::Object(HostId::of(&b)));
        // hub: direct relocation with the reserved-bit addend
        let hub = read_only
            .relocation_at(a_base)
            .expect("missing hub relocation");
        assert_eq!(hub.addend, Some(0));
        assert!(matches!(hub.target, RelocationTarget::Object(_)));
        // the slots themselves stay zero for the linker to fill
        assert_eq!(read_u64(read_only.bytes(), a_base + 8), 0);
    }

    #[test]
    fn reserved_header_bits_suppress_the_shift() {
        let (universe, types) = base_universe(4);
        let mut heap = opened_heap(
            universe,
            BuildOptions {
                reserved_header_bits: Some(0b001),
                ..BuildOptions::default()
            },
        );
        let array = new_byte_array(heap.universe(), types.byte_array, &[9]);
        heap.add_object(&array, true, root()).expect("admission failed");
        let (read_only, _writable) = write_image(&mut heap);

        let info = heap.get_object_info(&array).expect("missing");
        let base = heap.index_in_buffer(info);
        let hub = heap
            .universe()
            .type_descriptor(types.byte_array)
            .hub
            .clone();
        let hub_info = heap.get_object_info(&hub).expect("hub not admitted");
        let hub_offset = heap.offset_in_section(hub_info) as u32;
        // unshifted offset with the reserved bit OR'd in
        assert_eq!(read_u32(read_only.bytes(), base), hub_offset | 0b001);
    }

    #[test]
    fn instance_identity_hash_is_written_when_declared() {
        let (mut universe, _types) = base_universe(4);
        let hashed = universe.register_type(TypeRegistration {
            name: "Hashed".into(),
            kind: TypeKind::Instance {
                fields: Vec::new(),
                hybrid: None,
            },
            layout: LayoutEncoding::for_instance(16),
            is_instantiated: true,
            class_init_ready: true,
            hash_code_offset: Some(12),
            monitor_offset: None,
        });
        let mut heap = opened_heap(universe, BuildOptions::default());
        let object = new_instance(heap.universe(), hashed, Vec::new());
        heap.add_object(&object, true, root()).expect("admission failed");
        let (read_only, _writable) = write_image(&mut heap);

        let info = heap.get_object_info(&object).expect("missing");
        let base = heap.index_in_buffer(info);
        assert_eq!(read_u32(read_only.bytes(), base + 12), info.identity_hash());
    }

    #[test]
    fn references_to_unadmitted_objects_abort_emission() {
        let (mut universe, _types) = base_universe(4);
        let b_type = register_instance(
            &mut universe,
            "B",
            vec![accessed_field("x", StorageKind::Int, 4, false)],
            8,
        );
        let a_type = register_instance(
            &mut universe,
            "A",
            vec![accessed_field("f", StorageKind::Object, 4, false)],
            8,
        );
        let mut heap = opened_heap(universe, BuildOptions::default());
        let b = new_instance(
            heap.universe(),
            b_type,
            vec![HostValue::Prim(PrimValue::Int(1))],
        );
        let a = new_instance(heap.universe(), a_type, vec![HostValue::Ref(Some(b))]);
        heap.add_object(&a, false, root()).expect("admission failed");
        heap.add_trailing_objects().expect("sealing failed");
        heap.set_read_only_section("rodata", 0);
        heap.set_writable_section(
            "data",
            kiln_shared::layout::align_up(heap.read_only_section_size(), 8),
        );
        // host-side code swapped the field after analysis ran
        let stranger = new_instance(
            heap.universe(),
            b_type,
            vec![HostValue::Prim(PrimValue::Int(9))],
        );
        heap.universe()
            .write_field(&a, 0, HostValue::Ref(Some(stranger)));
        let mut read_only = crate::buffer::ImageBuffer::new(heap.read_only_section_size());
        let mut writable = crate::buffer::ImageBuffer::new(heap.writable_section_size());
        let err = heap
            .write_heap(&mut read_only, &mut writable)
            .expect_err("emission must fail");
        assert!(matches!(err, BuildError::UnadmittedTarget { .. }));
        assert!(err.to_string().contains("B"));
    }

    #[test]
    fn emission_is_deterministic() {
        let (mut universe, types) = base_universe(4);
        let b_type = register_instance(
            &mut universe,
            "B",
            vec![accessed_field("x", StorageKind::Int, 4, false)],
            8,
        );
        let a_type = register_instance(
            &mut universe,
            "A",
            vec![accessed_field("f", StorageKind::Object, 4, false)],
            8,
        );
        let mut heap = opened_heap(universe, BuildOptions::default());
        let b = new_instance(
            heap.universe(),
            b_type,
            vec![HostValue::Prim(PrimValue::Int(7))],
        );
        let a = new_instance(heap.universe(), a_type, vec![HostValue::Ref(Some(b))]);
        let text = new_string(heap.universe(), &types, "det");
        heap.add_object(&a, false, root()).expect("admission failed");
        heap.add_object(&text, false, root()).expect("admission failed");
        let (first_ro, first_rw) = write_image(&mut heap);
        // a second emission of the same admitted set is byte-identical
        let mut second_ro = crate::buffer::ImageBuffer::new(heap.read_only_section_size());
        let mut second_rw = crate::buffer::ImageBuffer::new(heap.writable_section_size());
        heap.write_heap(&mut second_ro, &mut second_rw)
            .expect("second write failed");
        assert_eq!(first_ro.bytes(), second_ro.bytes());
        assert_eq!(first_rw.bytes(), second_rw.bytes());
        assert_eq!(first_ro.relocations(), second_ro.relocations());
    }

    #[test]
    fn char_array_elements_are_little_endian() {
        let (universe, types) = base_universe(4);
        let mut heap = opened_heap(universe, BuildOptions::default());
        let chars = new_array(
            heap.universe(),
            types.char_array,
            ArrayData::Char(vec![0x0041, 0x2713]),
        );
        heap.add_object(&chars, true, root()).expect("admission failed");
        let (read_only, _writable) = write_image(&mut heap);

        let info = heap.get_object_info(&chars).expect("missing");
        let base = heap.index_in_buffer(info);
        assert_eq!(read_u32(read_only.bytes(), base + 4), 2);
        assert_eq!(
            &read_only.bytes()[base + 12..base + 16],
            &[0x41, 0x00, 0x13, 0x27]
        );
    }
}
