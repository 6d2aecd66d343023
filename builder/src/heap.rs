//! The image heap model and the discovery traversal.
//!
//! Admission runs through an explicit worklist: every admitted object
//! enqueues its hub, its field targets, and its array elements, so deep
//! object graphs never recurse on the call stack. The identity map is
//! populated before children are enqueued, which both makes re-admission
//! idempotent and terminates cycles.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};

use log::{debug, info, trace};

use crate::buffer::RelocatableBuffer;
use crate::emit::HeapWriter;
use crate::error::{BuildError, Result};
use crate::host::{self, ArrayData, HostData, HostRef, HostValue, IdentityMap, IdentitySet, WordValue};
use crate::hybrid::HybridLayout;
use crate::meta::{MethodId, TypeId, TypeKind};
use crate::object_info::{ObjectInfo, Reason};
use crate::partition::{HeapPartitions, PartitionKind};
use crate::patch::BoundaryPatcher;
use crate::phase::Phase;
use crate::universe::Universe;
use crate::BuildOptions;
use kiln_shared::encoding::LayoutMode;
use kiln_shared::header::HeaderEncoding;
use kiln_shared::kind::StorageKind;
use kiln_shared::layout::ObjectLayout;

struct AddTask {
    object: HostRef,
    immutable: bool,
    reason: Reason,
}

/// The image heap under construction.
pub struct ImageHeap {
    universe: Universe,
    options: BuildOptions,
    layout: ObjectLayout,
    header: HeaderEncoding,
    objects: IdentityMap<usize>,
    infos: Vec<ObjectInfo>,
    blacklist: IdentitySet,
    known_immutable: IdentitySet,
    interned_strings: BTreeMap<String, HostRef>,
    hybrid_layouts: HashMap<TypeId, HybridLayout>,
    worklist: Vec<AddTask>,
    add_objects_phase: Phase,
    intern_strings_phase: Phase,
    partitions: HeapPartitions,
    first_relocatable_pointer: Cell<Option<usize>>,
}

impl ImageHeap {
    pub fn new(universe: Universe, options: BuildOptions) -> Self {
        let layout = ObjectLayout::new(options.reference_size());
        let partitions = HeapPartitions::new(options.compress.has_base, layout.alignment());
        Self {
            universe,
            options,
            layout,
            header: HeaderEncoding::new(options.reserved_header_bits),
            objects: IdentityMap::new(),
            infos: Vec::new(),
            blacklist: IdentitySet::new(),
            known_immutable: IdentitySet::new(),
            interned_strings: BTreeMap::new(),
            hybrid_layouts: HashMap::new(),
            worklist: Vec::new(),
            add_objects_phase: Phase::new("add objects"),
            intern_strings_phase: Phase::new("intern strings"),
            partitions,
            first_relocatable_pointer: Cell::new(None),
        }
    }

    pub fn universe(&self) -> &Universe {
        &self.universe
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn layout(&self) -> ObjectLayout {
        self.layout
    }

    pub fn header_encoding(&self) -> HeaderEncoding {
        self.header
    }

    pub fn partitions(&self) -> &HeapPartitions {
        &self.partitions
    }

    /// All admitted objects, in admission order. Emission iterates this, so
    /// the byte stream is a pure function of the admitted set.
    pub fn objects(&self) -> &[ObjectInfo] {
        &self.infos
    }

    pub fn object_count(&self) -> usize {
        self.infos.len()
    }

    pub fn info_at(&self, index: usize) -> &ObjectInfo {
        &self.infos[index]
    }

    /// Descriptor of an admitted object, if any.
    pub fn get_object_info(&self, object: &HostRef) -> Option<&ObjectInfo> {
        self.objects.get(object).map(|&index| &self.infos[index])
    }

    pub fn hybrid_layout(&self, type_id: TypeId) -> Option<&HybridLayout> {
        self.hybrid_layouts.get(&type_id)
    }

    // ---- lifecycle ----

    /// Opens admission and seeds the heap with the universe's roots.
    pub fn add_initial_objects(&mut self) -> Result<()> {
        self.add_objects_phase.allow();
        self.intern_strings_phase.allow();
        let roots: Vec<(String, HostRef)> = self
            .universe
            .roots()
            .iter()
            .map(|(label, object)| (label.clone(), object.clone()))
            .collect();
        for (label, object) in roots {
            self.push(object, false, Reason::Root(label));
        }
        self.drain()
    }

    /// Publishes the canonical interned-strings table and seals admission.
    pub fn add_trailing_objects(&mut self) -> Result<()> {
        let holder = self
            .universe
            .interned_table_holder()
            .map(|(holder, field_index)| (holder.clone(), field_index));
        if let Some((holder, field_index)) = holder {
            let table_accessed = self
                .universe
                .lookup_type(&holder)
                .instance_fields()[field_index]
                .is_accessed;
            if table_accessed {
                let array_type = self
                    .universe
                    .string_array_type()
                    .expect("no string array type registered");
                let hub = self.universe.type_descriptor(array_type).hub.clone();
                self.push(hub, false, Reason::Root("interned strings table".into()));
                // Seal the intern table before admitting the array built
                // from it: admitting the array must not grow the very
                // collection being serialized.
                self.intern_strings_phase.disallow();
                let strings: Vec<Option<HostRef>> = self
                    .interned_strings
                    .values()
                    .map(|object| Some(object.clone()))
                    .collect();
                debug!("publishing {} interned strings", strings.len());
                let table = self.universe.new_object_array(array_type, strings);
                self.universe
                    .write_field(&holder, field_index, HostValue::Ref(Some(table.clone())));
                self.push(table, true, Reason::Root("interned strings table".into()));
                self.drain()?;
            }
        }
        if self.intern_strings_phase.is_allowed() {
            self.intern_strings_phase.disallow();
        }
        self.add_objects_phase.disallow();
        debug!("admission sealed with {} objects", self.infos.len());
        Ok(())
    }

    /// Registers a host object as immutable even though its type or write
    /// flags say otherwise.
    pub fn register_as_immutable(&mut self, object: &HostRef) {
        let object = self.universe.replace_object(object);
        self.known_immutable.insert(&object);
    }

    // ---- admission ----

    /// Admits `object` and everything transitively reachable from it.
    pub fn add_object(
        &mut self,
        object: &HostRef,
        immutable_from_parent: bool,
        reason: Reason,
    ) -> Result<()> {
        self.add_objects_phase
            .assert_allowed("adding objects to the image heap");
        self.push(object.clone(), immutable_from_parent, reason);
        self.drain()
    }

    fn push(&mut self, object: HostRef, immutable: bool, reason: Reason) {
        self.worklist.push(AddTask {
            object,
            immutable,
            reason,
        });
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(task) = self.worklist.pop() {
            self.admit(task)?;
        }
        Ok(())
    }

    fn admit(&mut self, task: AddTask) -> Result<()> {
        self.add_objects_phase
            .assert_allowed("adding objects to the image heap");
        let object = self.universe.replace_object(&task.object);
        if self.objects.contains(&object) {
            return Ok(());
        }
        if self.blacklist.contains(&object) {
            return Err(self.embedded_error(&object, &task.reason));
        }
        match object.data() {
            HostData::ClassHandle { described } => {
                return Err(BuildError::ClassHandleInHeap {
                    type_name: self.universe.type_descriptor(*described).name.clone(),
                    chain: self.render_chain(None, &task.reason),
                });
            }
            HostData::Hub {
                described,
                class_init_ready,
                ..
            } if !class_init_ready => {
                return Err(BuildError::HubNotInitialized {
                    type_name: self.universe.type_descriptor(*described).name.clone(),
                    chain: self.render_chain(Some(&object), &task.reason),
                });
            }
            _ => {}
        }
        if self.universe.is_string(&object) {
            self.universe.materialize_string_hash(&object);
            if self.universe.is_interned(&object) {
                let value = self.universe.string_value(&object).unwrap_or_default();
                if self.intern_strings_phase.is_allowed() {
                    self.interned_strings
                        .entry(value)
                        .or_insert_with(|| object.clone());
                } else if !self.interned_strings.contains_key(&value) {
                    return Err(BuildError::LateInternedString { value });
                }
            }
        }
        let identity_hash = host::identity_hash(&object);
        let type_id = object.type_id();
        match self.universe.type_descriptor(type_id).layout.mode() {
            LayoutMode::Instance => {
                self.admit_instance(object, type_id, task.immutable, task.reason, identity_hash)
            }
            LayoutMode::PrimitiveArray | LayoutMode::ObjectArray => {
                self.admit_array(object, type_id, task.immutable, task.reason, identity_hash)
            }
            LayoutMode::Word => Err(BuildError::WordValueInHeap {
                type_name: self.universe.type_descriptor(type_id).name.clone(),
                chain: self.render_chain(Some(&object), &task.reason),
            }),
            LayoutMode::Primitive => {
                panic!(
                    "primitive mirror type {} cannot be materialized",
                    self.universe.type_descriptor(type_id).name
                )
            }
        }
    }

    fn admit_instance(
        &mut self,
        object: HostRef,
        type_id: TypeId,
        immutable_from_parent: bool,
        reason: Reason,
        identity_hash: u32,
    ) -> Result<()> {
        let (is_instantiated, layout_encoding, has_monitor, hub, type_name, hybrid_meta, field_count) = {
            let descriptor = self.universe.type_descriptor(type_id);
            (
                descriptor.is_instantiated,
                descriptor.layout,
                descriptor.monitor_offset.is_some(),
                descriptor.hub.clone(),
                descriptor.name.clone(),
                descriptor.hybrid().copied(),
                descriptor.instance_fields().len(),
            )
        };
        if !is_instantiated {
            return Err(BuildError::NotInstantiated {
                type_name,
                chain: self.render_chain(Some(&object), &reason),
            });
        }

        let mut written = false;
        let mut references = false;
        let mut relocatable = false;
        if has_monitor {
            // The monitor slot is a reference slot written at runtime.
            written = true;
            references = true;
        }

        // Hybrid tails are blacklisted before any field recursion so the
        // worklist never emits them standalone.
        let mut tail: Option<HostRef> = None;
        let size = if let Some(_meta) = hybrid_meta {
            let hybrid = if let Some(hybrid) = self.hybrid_layouts.get(&type_id).copied() {
                hybrid
            } else {
                let hybrid =
                    HybridLayout::new(self.universe.type_descriptor(type_id), self.layout);
                self.hybrid_layouts.insert(type_id, hybrid);
                hybrid
            };
            tail = self.read_ref_field(&object, hybrid.array_field());
            let bitset = hybrid
                .bitset_field()
                .and_then(|field| self.read_ref_field(&object, field));
            for embedded in tail.iter().chain(bitset.iter()) {
                if self.objects.contains(embedded) {
                    return Err(self.embedded_error(embedded, &reason));
                }
                self.blacklist.insert(embedded);
            }
            let length = tail.as_ref().map_or(0, |array| array.elements().len());
            hybrid.total_size(length)
        } else {
            self.layout.instance_size(layout_encoding)
        };
        assert!(
            self.layout.is_object_aligned(size),
            "instance size {size} of {type_name} not aligned"
        );

        let info_index = self.infos.len();
        self.objects.insert(&object, info_index);
        self.infos.push(ObjectInfo::new(
            object.clone(),
            type_id,
            size,
            identity_hash,
            reason,
        ));
        trace!("admitted {type_name} ({size} bytes)");

        self.push(hub, false, Reason::Object(info_index));

        // Strings propagate immutability to their payload.
        let is_string = self.universe.is_string(&object);
        for field_index in 0..field_count {
            if hybrid_meta.is_some_and(|meta| {
                field_index == meta.array_field || Some(field_index) == meta.bitset_field
            }) {
                continue;
            }
            let (kind, accessed, has_location, field_written, field_final) = {
                let field = self.universe.field(type_id, field_index);
                (
                    field.kind,
                    field.is_accessed,
                    field.location.is_some(),
                    field.is_written,
                    field.is_final,
                )
            };
            if !accessed || !has_location {
                continue;
            }
            let mut field_relocatable = false;
            match kind {
                StorageKind::Object => {
                    references = true;
                    if let Some(target) = self.read_ref_field(&object, field_index) {
                        self.push(target, is_string, Reason::Object(info_index));
                    }
                }
                StorageKind::Word => {
                    if let HostValue::Method(method) = self.universe.read_field(&object, field_index)
                    {
                        self.check_method(method, info_index)?;
                        if self.options.compress.has_base {
                            field_relocatable = true;
                        }
                    }
                }
                _ => {}
            }
            relocatable |= field_relocatable;
            // Relocation targets are patched once by the dynamic linker and
            // stay read-only for partitioning.
            written |= field_written && !field_final && !field_relocatable;
        }

        if let Some(tail) = &tail {
            match &*tail.elements() {
                ArrayData::Object(slots) => {
                    references = true;
                    let targets: Vec<HostRef> = slots
                        .iter()
                        .flatten()
                        .map(|element| self.universe.replace_object(element))
                        .collect();
                    for target in targets {
                        self.push(target, false, Reason::Object(info_index));
                    }
                }
                ArrayData::Word(words) => {
                    let methods: Vec<MethodId> = words
                        .iter()
                        .filter_map(|word| match word {
                            WordValue::Method(method) => Some(*method),
                            WordValue::Raw(_) => None,
                        })
                        .collect();
                    for method in methods {
                        self.check_method(method, info_index)?;
                        if self.options.compress.has_base {
                            relocatable = true;
                        }
                    }
                }
                _ => {}
            }
        }

        self.classify_and_allocate(
            info_index,
            &object,
            immutable_from_parent,
            written,
            references,
            relocatable,
        );
        Ok(())
    }

    fn admit_array(
        &mut self,
        object: HostRef,
        type_id: TypeId,
        immutable_from_parent: bool,
        reason: Reason,
        identity_hash: u32,
    ) -> Result<()> {
        let (component, hub, type_name) = {
            let descriptor = self.universe.type_descriptor(type_id);
            let TypeKind::Array { component, .. } = &descriptor.kind else {
                panic!("array layout on non-array type {}", descriptor.name);
            };
            (*component, descriptor.hub.clone(), descriptor.name.clone())
        };
        let length = object.elements().len();
        let size = self.layout.array_size(component, length);

        let info_index = self.infos.len();
        self.objects.insert(&object, info_index);
        self.infos.push(ObjectInfo::new(
            object.clone(),
            type_id,
            size,
            identity_hash,
            reason,
        ));
        trace!("admitted {type_name} (length {length}, {size} bytes)");

        self.push(hub, false, Reason::Object(info_index));

        let mut references = false;
        let mut relocatable = false;
        match &*object.elements() {
            ArrayData::Object(slots) => {
                references = true;
                let targets: Vec<HostRef> = slots
                    .iter()
                    .flatten()
                    .map(|element| self.universe.replace_object(element))
                    .collect();
                for target in targets {
                    self.push(target, false, Reason::Object(info_index));
                }
            }
            ArrayData::Word(words) => {
                let methods: Vec<MethodId> = words
                    .iter()
                    .filter_map(|word| match word {
                        WordValue::Method(method) => Some(*method),
                        WordValue::Raw(_) => None,
                    })
                    .collect();
                for method in methods {
                    self.check_method(method, info_index)?;
                    if self.options.compress.has_base {
                        relocatable = true;
                    }
                }
            }
            _ => {}
        }

        // No per-element write tracking; arrays stay conservatively written.
        self.classify_and_allocate(
            info_index,
            &object,
            immutable_from_parent,
            true,
            references,
            relocatable,
        );
        Ok(())
    }

    fn read_ref_field(&self, object: &HostRef, field_index: usize) -> Option<HostRef> {
        match self.universe.read_field(object, field_index) {
            HostValue::Ref(Some(target)) => Some(self.universe.replace_object(&target)),
            _ => None,
        }
    }

    fn check_method(&self, method: MethodId, holder_index: usize) -> Result<()> {
        let descriptor = self
            .universe
            .method(method)
            .unwrap_or_else(|| panic!("method pointer to unregistered method {method:?}"));
        if !descriptor.is_compiled {
            return Err(BuildError::MethodNotCompiled {
                method: descriptor.name.clone(),
                chain: self.render_chain(None, &Reason::Object(holder_index)),
            });
        }
        Ok(())
    }

    fn is_known_immutable(&self, object: &HostRef) -> bool {
        if self.universe.is_string(object) && self.universe.cached_string_hash(object) != 0 {
            return true;
        }
        self.universe.is_immutable_type(object.type_id()) || self.known_immutable.contains(object)
    }

    fn classify_and_allocate(
        &mut self,
        info_index: usize,
        object: &HostRef,
        immutable_from_parent: bool,
        written: bool,
        references: bool,
        relocatable: bool,
    ) {
        let immutable = immutable_from_parent || self.is_known_immutable(object);
        assert!(
            !relocatable || immutable,
            "relocation-bearing objects must be immutable"
        );
        let writable = written && !immutable;
        let kind = if self.options.force_writable && !self.options.compress.has_base {
            PartitionKind::WritableReference
        } else if writable {
            if references {
                PartitionKind::WritableReference
            } else {
                PartitionKind::WritablePrimitive
            }
        } else if relocatable {
            PartitionKind::ReadOnlyRelocatable
        } else if references {
            PartitionKind::ReadOnlyReference
        } else {
            PartitionKind::ReadOnlyPrimitive
        };
        let size = self.infos[info_index].size();
        let offset = self.partitions.get_mut(kind).allocate(info_index, size);
        assert!(
            self.layout.is_object_aligned(offset),
            "offset {offset} in {} not aligned",
            kind.name()
        );
        self.infos[info_index].assign(kind, offset);
    }

    // ---- sections and sizes ----

    pub fn set_read_only_section(&mut self, name: &str, base: usize) {
        assert!(
            self.add_objects_phase.is_after(),
            "sections are bound after admission is sealed"
        );
        self.partitions.set_read_only_section(name, base);
    }

    pub fn set_writable_section(&mut self, name: &str, base: usize) {
        assert!(
            self.add_objects_phase.is_after(),
            "sections are bound after admission is sealed"
        );
        self.partitions.set_writable_section(name, base);
    }

    pub fn align_relocatable_partition(&mut self, alignment: usize) {
        self.partitions.align_relocatable_partition(alignment);
    }

    pub fn read_only_section_size(&self) -> usize {
        self.partitions.read_only_size()
    }

    pub fn writable_section_size(&self) -> usize {
        self.partitions.writable_size()
    }

    pub fn read_only_relocatable_partition_size(&self) -> usize {
        self.partitions.relocatable_size()
    }

    /// Section-relative offset of the first emitted relocation, once the
    /// heap has been written.
    pub fn first_relocatable_pointer_offset_in_section(&self) -> Option<usize> {
        self.first_relocatable_pointer.get()
    }

    /// Heap-relative offset of an admitted object.
    pub fn offset_in_section(&self, info: &ObjectInfo) -> usize {
        self.partitions
            .get(info.partition())
            .offset_in_section(info.offset_in_partition())
    }

    /// Index of an admitted object within its section's output buffer.
    pub fn index_in_buffer(&self, info: &ObjectInfo) -> usize {
        let binding = if info.partition().is_writable() {
            self.partitions.writable_section()
        } else {
            self.partitions.read_only_section()
        };
        self.offset_in_section(info) - binding.expect("section not bound").base
    }

    // ---- emission ----

    /// Emits every admitted object into the output buffers, records
    /// relocations, and patches the partition boundary singleton.
    pub fn write_heap(
        &self,
        read_only: &mut dyn RelocatableBuffer,
        writable: &mut dyn RelocatableBuffer,
    ) -> Result<()> {
        assert!(
            self.add_objects_phase.is_after(),
            "the heap is written after admission is sealed"
        );
        let mut writer = HeapWriter::new(self);
        writer.write_objects(read_only, writable)?;
        BoundaryPatcher::new(self).patch(read_only, writable)?;
        self.first_relocatable_pointer
            .set(writer.first_relocation_offset());
        if self.options.print_partition_sizes {
            self.log_partition_sizes();
        }
        if self.options.print_histogram {
            self.log_histogram();
        }
        Ok(())
    }

    fn log_partition_sizes(&self) {
        for kind in PartitionKind::ALL {
            let partition = self.partitions.get(kind);
            info!(
                "{}: {} bytes, {} objects, {} pre pad, {} post pad",
                kind.name(),
                partition.size(),
                partition.count(),
                partition.pre_pad(),
                partition.post_pad()
            );
        }
    }

    fn log_histogram(&self) {
        let mut by_type: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        for info in &self.infos {
            let name = self.universe.type_descriptor(info.type_id()).name.as_str();
            let entry = by_type.entry(name).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += info.size();
        }
        info!("image heap histogram, {} objects:", self.infos.len());
        for (name, (count, bytes)) in by_type {
            info!("{count:8} objects {bytes:10} bytes  {name}");
        }
    }

    // ---- diagnostics ----

    fn embedded_error(&self, object: &HostRef, reason: &Reason) -> BuildError {
        BuildError::EmbeddedObjectReached {
            what: format!(
                "an object of type {}",
                self.universe.type_descriptor(object.type_id()).name
            ),
            chain: self.render_chain(Some(object), reason),
        }
    }

    /// Renders the reverse reachability chain for an error report, one
    /// object per line, root label last.
    pub(crate) fn render_chain(&self, object: Option<&HostRef>, reason: &Reason) -> String {
        let mut lines = Vec::new();
        if let Some(object) = object {
            lines.push(format!(
                "  object of type {} (identity hash {})",
                self.universe.type_descriptor(object.type_id()).name,
                host::identity_hash(object)
            ));
        }
        let mut current = reason.clone();
        loop {
            match current {
                Reason::Root(label) => {
                    lines.push(format!("  reached from root: {label}"));
                    break;
                }
                Reason::Object(index) => {
                    let info = &self.infos[index];
                    lines.push(format!(
                        "  referenced by object of type {} (identity hash {})",
                        self.universe.type_descriptor(info.type_id()).name,
                        info.identity_hash()
                    ));
                    current = info.reason().clone();
                }
            }
        }
        lines.join("\n")
    }
}
