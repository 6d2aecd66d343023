//! Partition boundary patching. Generated code walks partition ranges
//! through a runtime singleton whose reference fields are still null when
//! the heap is emitted; once every offset is known they are overwritten
//! with the first and last object of each partition group.

use log::{debug, warn};

use crate::buffer::RelocatableBuffer;
use crate::emit::write_reference_slot;
use crate::error::{BuildError, Result};
use crate::heap::ImageHeap;
use crate::partition::PartitionKind;

pub struct BoundaryPatcher<'heap> {
    heap: &'heap ImageHeap,
}

impl<'heap> BoundaryPatcher<'heap> {
    pub fn new(heap: &'heap ImageHeap) -> Self {
        Self { heap }
    }

    pub fn patch(
        &self,
        read_only: &mut dyn RelocatableBuffer,
        writable: &mut dyn RelocatableBuffer,
    ) -> Result<()> {
        let heap = self.heap;
        let Some(holder) = heap.universe().heap_bounds_holder().cloned() else {
            debug!("no heap boundary singleton registered");
            return Ok(());
        };
        let Some(holder_info) = heap.get_object_info(&holder) else {
            return Err(BuildError::UnadmittedTarget {
                what: "the heap boundary singleton".into(),
                chain: "  reached from root: partition boundary patching".into(),
            });
        };

        let partitions = heap.partitions();
        let read_only_primitive = partitions.get(PartitionKind::ReadOnlyPrimitive);
        let read_only_reference = partitions.get(PartitionKind::ReadOnlyReference);
        let read_only_relocatable = partitions.get(PartitionKind::ReadOnlyRelocatable);
        let writable_primitive = partitions.get(PartitionKind::WritablePrimitive);
        let writable_reference = partitions.get(PartitionKind::WritableReference);

        // The read-only reference boundaries span the union of the two
        // reference-bearing read-only partitions; an empty one falls back
        // to the other's bounds.
        let bounds: [(&str, Option<usize>); 8] = [
            (
                "first_read_only_primitive_object",
                read_only_primitive.first_object(),
            ),
            (
                "last_read_only_primitive_object",
                read_only_primitive.last_object(),
            ),
            (
                "first_read_only_reference_object",
                read_only_reference
                    .first_object()
                    .or(read_only_relocatable.first_object()),
            ),
            (
                "last_read_only_reference_object",
                read_only_relocatable
                    .last_object()
                    .or(read_only_reference.last_object()),
            ),
            (
                "first_writable_primitive_object",
                writable_primitive.first_object(),
            ),
            (
                "last_writable_primitive_object",
                writable_primitive.last_object(),
            ),
            (
                "first_writable_reference_object",
                writable_reference.first_object(),
            ),
            (
                "last_writable_reference_object",
                writable_reference.last_object(),
            ),
        ];

        let holder_base = heap.index_in_buffer(holder_info);
        let holder_type = holder_info.type_id();
        let buffer: &mut dyn RelocatableBuffer = if holder_info.partition().is_writable() {
            writable
        } else {
            read_only
        };
        for (field_name, target) in bounds {
            let Some(field_index) = heap.universe().field_index(holder_type, field_name) else {
                warn!("boundary singleton has no {field_name} field, skipping");
                continue;
            };
            let field = heap.universe().field(holder_type, field_index);
            let (Some(location), true) = (field.location, field.is_accessed) else {
                warn!("boundary field {field_name} is not materialized, skipping");
                continue;
            };
            let Some(target_index) = target else {
                warn!("boundary field {field_name} has no objects, skipping");
                continue;
            };
            let target_info = heap.info_at(target_index);
            write_reference_slot(heap, buffer, holder_base + location, target_info);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::heap::ImageHeap;
    use crate::host::HostValue;
    use crate::object_info::Reason;
    use crate::partition::PartitionKind;
    use crate::testutil::{
        accessed_field, base_universe, new_byte_array, new_instance, new_string, read_u32,
        register_boundary_holder, register_instance, write_image, BOUNDARY_FIELDS,
    };
    use crate::BuildOptions;
    use kiln_shared::kind::StorageKind;

    fn root() -> Reason {
        Reason::Root("test root".into())
    }

    /// Expected slot values, replaying the documented union rule.
    fn expected_bounds(heap: &ImageHeap) -> [Option<usize>; 8] {
        let partitions = heap.partitions();
        let read_only_primitive = partitions.get(PartitionKind::ReadOnlyPrimitive);
        let read_only_reference = partitions.get(PartitionKind::ReadOnlyReference);
        let read_only_relocatable = partitions.get(PartitionKind::ReadOnlyRelocatable);
        let writable_primitive = partitions.get(PartitionKind::WritablePrimitive);
        let writable_reference = partitions.get(PartitionKind::WritableReference);
        [
            read_only_primitive.first_object(),
            read_only_primitive.last_object(),
            read_only_reference
                .first_object()
                .or(read_only_relocatable.first_object()),
            read_only_relocatable
                .last_object()
                .or(read_only_reference.last_object()),
            writable_primitive.first_object(),
            writable_primitive.last_object(),
            writable_reference.first_object(),
            writable_reference.last_object(),
        ]
    }

    fn assert_bounds_patched(
        heap: &ImageHeap,
        writable: &crate::buffer::ImageBuffer,
        holder: &crate::host::HostRef,
    ) {
        let holder_info = heap.get_object_info(holder).expect("holder not admitted");
        assert_eq!(holder_info.partition(), PartitionKind::WritableReference);
        let holder_base = heap.index_in_buffer(holder_info);
        for (index, expected) in expected_bounds(heap).into_iter().enumerate() {
            let slot = read_u32(writable.bytes(), holder_base + 4 * (index + 1));
            match expected {
                Some(object_index) => {
                    let target = heap.info_at(object_index);
                    assert_eq!(
                        slot,
                        (heap.offset_in_section(target) >> 3) as u32,
                        "bad slot for {}",
                        BOUNDARY_FIELDS[index]
                    );
                }
                // empty partitions leave the null written at emission
                None => assert_eq!(slot, 0, "slot for {} not null", BOUNDARY_FIELDS[index]),
            }
        }
    }

    #[test]
    fn boundaries_are_patched_into_the_singleton() {
        let (mut universe, types) = base_universe(4);
        let holder = register_boundary_holder(&mut universe, 4);
        let mut heap = ImageHeap::new(universe, BuildOptions::default());
        heap.add_initial_objects().expect("seeding failed");
        let frozen = new_byte_array(heap.universe(), types.byte_array, &[1]);
        let plain = new_byte_array(heap.universe(), types.byte_array, &[2]);
        let text = new_string(heap.universe(), &types, "a");
        heap.add_object(&frozen, true, root()).expect("admission failed");
        heap.add_object(&plain, false, root()).expect("admission failed");
        heap.add_object(&text, false, root()).expect("admission failed");
        let (_read_only, writable) = write_image(&mut heap);
        // all five content kinds except relocatable are populated here
        assert!(heap.partitions().get(PartitionKind::ReadOnlyRelocatable).count() == 0);
        assert_bounds_patched(&heap, &writable, &holder);
    }

    #[test]
    fn read_only_reference_bounds_fall_back_to_the_relocatable_partition() {
        let (mut universe, _types) = base_universe(4);
        let holder = register_boundary_holder(&mut universe, 4);
        let method = universe.register_method("dispatch_stub", true);
        let dispatch = register_instance(
            &mut universe,
            "Dispatch",
            vec![accessed_field("target", StorageKind::Word, 8, false)],
            16,
        );
        universe.register_immutable_type(dispatch);
        let mut heap = ImageHeap::new(universe, BuildOptions::default());
        heap.add_initial_objects().expect("seeding failed");
        let object = new_instance(heap.universe(), dispatch, vec![HostValue::Method(method)]);
        heap.add_object(&object, false, root()).expect("admission failed");
        let (_read_only, writable) = write_image(&mut heap);
        assert!(heap.partitions().get(PartitionKind::ReadOnlyReference).count() == 0);
        assert!(heap.partitions().get(PartitionKind::ReadOnlyRelocatable).count() == 1);
        assert_bounds_patched(&heap, &writable, &holder);
    }
}
