//! Image heap partitions: append-only arenas that group objects by
//! writability and content kind, later bound into the two output sections.

use log::debug;

use kiln_shared::layout::{align_up, OBJECT_ALIGNMENT};

pub const PARTITION_COUNT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PartitionKind {
    /// Read-only objects without references.
    ReadOnlyPrimitive,
    /// Read-only objects with references but no relocations.
    ReadOnlyReference,
    /// Read-only objects containing at least one relocation-bearing
    /// pointer, patched once by the dynamic linker.
    ReadOnlyRelocatable,
    /// Writable objects without references.
    WritablePrimitive,
    /// Writable objects with references.
    WritableReference,
}

impl PartitionKind {
    pub const ALL: [PartitionKind; PARTITION_COUNT] = [
        PartitionKind::ReadOnlyPrimitive,
        PartitionKind::ReadOnlyReference,
        PartitionKind::ReadOnlyRelocatable,
        PartitionKind::WritablePrimitive,
        PartitionKind::WritableReference,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            PartitionKind::ReadOnlyPrimitive => "read-only primitive",
            PartitionKind::ReadOnlyReference => "read-only reference",
            PartitionKind::ReadOnlyRelocatable => "read-only relocatable",
            PartitionKind::WritablePrimitive => "writable primitive",
            PartitionKind::WritableReference => "writable reference",
        }
    }

    pub const fn is_writable(self) -> bool {
        matches!(
            self,
            PartitionKind::WritablePrimitive | PartitionKind::WritableReference
        )
    }

    const fn index(self) -> usize {
        match self {
            PartitionKind::ReadOnlyPrimitive => 0,
            PartitionKind::ReadOnlyReference => 1,
            PartitionKind::ReadOnlyRelocatable => 2,
            PartitionKind::WritablePrimitive => 3,
            PartitionKind::WritableReference => 4,
        }
    }
}

#[derive(Clone, Debug)]
struct SectionSlot {
    name: String,
    offset: usize,
}

/// One contiguous sub-region of the emitted heap. The size only ever
/// grows; allocation returns the pre-increment size as the object's
/// partition-relative offset.
pub struct Partition {
    kind: PartitionKind,
    size: usize,
    pre_pad: usize,
    post_pad: usize,
    count: usize,
    first_object: Option<usize>,
    last_object: Option<usize>,
    section: Option<SectionSlot>,
}

impl Partition {
    fn new(kind: PartitionKind) -> Self {
        Self {
            kind,
            size: 0,
            pre_pad: 0,
            post_pad: 0,
            count: 0,
            first_object: None,
            last_object: None,
            section: None,
        }
    }

    pub fn kind(&self) -> PartitionKind {
        self.kind
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pre_pad(&self) -> usize {
        self.pre_pad
    }

    pub fn post_pad(&self) -> usize {
        self.post_pad
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Index of the first admitted object, in admission order.
    pub fn first_object(&self) -> Option<usize> {
        self.first_object
    }

    pub fn last_object(&self) -> Option<usize> {
        self.last_object
    }

    /// Reserves `size` bytes for the object identified by `object_index`
    /// and returns its partition-relative offset.
    pub fn allocate(&mut self, object_index: usize, size: usize) -> usize {
        assert!(
            self.section.is_none(),
            "{}: allocation after section binding",
            self.kind.name()
        );
        let offset = self.size;
        self.size += size;
        self.count += 1;
        if self.first_object.is_none() {
            self.first_object = Some(object_index);
        }
        self.last_object = Some(object_index);
        offset
    }

    pub fn add_pre_pad(&mut self, bytes: usize) {
        self.size += bytes;
        self.pre_pad += bytes;
    }

    pub fn add_post_pad(&mut self, bytes: usize) {
        self.size += bytes;
        self.post_pad += bytes;
    }

    pub fn set_section(&mut self, name: &str, offset: usize) {
        assert!(
            self.section.is_none(),
            "{}: bound to a section twice",
            self.kind.name()
        );
        assert!(
            offset % OBJECT_ALIGNMENT == 0,
            "{}: section offset {offset} not aligned",
            self.kind.name()
        );
        debug!(
            "partition {}: {} bytes at {name}+{offset}",
            self.kind.name(),
            self.size
        );
        self.section = Some(SectionSlot {
            name: name.into(),
            offset,
        });
    }

    pub fn section_name(&self) -> Option<&str> {
        self.section.as_ref().map(|slot| slot.name.as_str())
    }

    pub fn section_offset(&self) -> Option<usize> {
        self.section.as_ref().map(|slot| slot.offset)
    }

    /// Section-relative offset of an in-partition offset.
    pub fn offset_in_section(&self, offset: usize) -> usize {
        let slot = self.section.as_ref().expect("partition not bound to a section");
        slot.offset + offset
    }
}

/// Where one of the two output sections starts, heap-relative.
#[derive(Clone, Debug)]
pub struct SectionBinding {
    pub name: String,
    pub base: usize,
}

/// The five-way partition table plus its binding into the read-only and
/// writable output sections.
pub struct HeapPartitions {
    parts: [Partition; PARTITION_COUNT],
    read_only_section: Option<SectionBinding>,
    writable_section: Option<SectionBinding>,
}

const READ_ONLY_ORDER: [PartitionKind; 3] = [
    PartitionKind::ReadOnlyPrimitive,
    PartitionKind::ReadOnlyReference,
    PartitionKind::ReadOnlyRelocatable,
];

const WRITABLE_ORDER: [PartitionKind; 2] = [
    PartitionKind::WritablePrimitive,
    PartitionKind::WritableReference,
];

impl HeapPartitions {
    /// With a heap base in use the first read-only partition starts with a
    /// single alignment-sized pre-pad: object offset zero stays reserved
    /// for the null reference.
    pub fn new(reserve_null_offset: bool, alignment: usize) -> Self {
        let mut partitions = Self {
            parts: PartitionKind::ALL.map(Partition::new),
            read_only_section: None,
            writable_section: None,
        };
        if reserve_null_offset {
            partitions
                .get_mut(PartitionKind::ReadOnlyPrimitive)
                .add_pre_pad(alignment);
        }
        partitions
    }

    pub fn get(&self, kind: PartitionKind) -> &Partition {
        &self.parts[kind.index()]
    }

    pub fn get_mut(&mut self, kind: PartitionKind) -> &mut Partition {
        &mut self.parts[kind.index()]
    }

    /// Binds the read-only partitions into their section, each at the byte
    /// offset immediately following its predecessor.
    pub fn set_read_only_section(&mut self, name: &str, base: usize) {
        assert!(
            self.read_only_section.is_none(),
            "read-only section bound twice"
        );
        let mut offset = base;
        for kind in READ_ONLY_ORDER {
            let partition = self.get_mut(kind);
            partition.set_section(name, offset);
            offset += partition.size();
        }
        self.read_only_section = Some(SectionBinding {
            name: name.into(),
            base,
        });
    }

    pub fn set_writable_section(&mut self, name: &str, base: usize) {
        assert!(
            self.writable_section.is_none(),
            "writable section bound twice"
        );
        let mut offset = base;
        for kind in WRITABLE_ORDER {
            let partition = self.get_mut(kind);
            partition.set_section(name, offset);
            offset += partition.size();
        }
        self.writable_section = Some(SectionBinding {
            name: name.into(),
            base,
        });
    }

    pub fn read_only_section(&self) -> Option<&SectionBinding> {
        self.read_only_section.as_ref()
    }

    pub fn writable_section(&self) -> Option<&SectionBinding> {
        self.writable_section.as_ref()
    }

    /// Pads so the relocatable region begins and ends on an `alignment`
    /// boundary. This bounds the page range the dynamic linker touches.
    pub fn align_relocatable_partition(&mut self, alignment: usize) {
        assert!(
            self.read_only_section.is_none(),
            "relocatable alignment must happen before section binding"
        );
        let start = self.get(PartitionKind::ReadOnlyPrimitive).size()
            + self.get(PartitionKind::ReadOnlyReference).size();
        let pre = align_up(start, alignment) - start;
        if pre > 0 {
            self.get_mut(PartitionKind::ReadOnlyPrimitive).add_pre_pad(pre);
        }
        let end = start + pre + self.get(PartitionKind::ReadOnlyRelocatable).size();
        let post = align_up(end, alignment) - end;
        if post > 0 {
            self.get_mut(PartitionKind::ReadOnlyRelocatable)
                .add_post_pad(post);
        }
    }

    pub fn read_only_size(&self) -> usize {
        READ_ONLY_ORDER.iter().map(|&kind| self.get(kind).size()).sum()
    }

    pub fn writable_size(&self) -> usize {
        WRITABLE_ORDER.iter().map(|&kind| self.get(kind).size()).sum()
    }

    pub fn relocatable_size(&self) -> usize {
        self.get(PartitionKind::ReadOnlyRelocatable).size()
    }

    /// Section-relative byte range of the relocatable partition.
    pub fn relocatable_range(&self) -> Option<(usize, usize)> {
        let binding = self.read_only_section.as_ref()?;
        let partition = self.get(PartitionKind::ReadOnlyRelocatable);
        let start = partition.section_offset()? - binding.base;
        Some((start, start + partition.size()))
    }
}
