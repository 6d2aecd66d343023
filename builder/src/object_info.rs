use crate::host::HostRef;
use crate::meta::TypeId;
use crate::partition::PartitionKind;

/// Why an object is part of the image: a named root, or the admitted
/// object that referenced it. The back-edges form a reverse reachability
/// chain that exists only for error reports; it is never walked on hot
/// paths.
#[derive(Clone, Debug)]
pub enum Reason {
    Root(String),
    /// Index of the referencing object's descriptor.
    Object(usize),
}

/// One admitted image object. The descriptor survives for the entire
/// build; its partition slot is assigned exactly once.
pub struct ObjectInfo {
    object: HostRef,
    type_id: TypeId,
    size: usize,
    identity_hash: u32,
    partition: Option<PartitionKind>,
    offset_in_partition: Option<usize>,
    reason: Reason,
}

impl ObjectInfo {
    pub fn new(
        object: HostRef,
        type_id: TypeId,
        size: usize,
        identity_hash: u32,
        reason: Reason,
    ) -> Self {
        assert!(identity_hash != 0, "identity hash 0 is reserved");
        Self {
            object,
            type_id,
            size,
            identity_hash,
            partition: None,
            offset_in_partition: None,
            reason,
        }
    }

    pub fn object(&self) -> &HostRef {
        &self.object
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn identity_hash(&self) -> u32 {
        self.identity_hash
    }

    pub fn reason(&self) -> &Reason {
        &self.reason
    }

    pub fn partition(&self) -> PartitionKind {
        self.partition.expect("object not assigned to a partition")
    }

    pub fn has_partition(&self) -> bool {
        self.partition.is_some()
    }

    pub fn offset_in_partition(&self) -> usize {
        self.offset_in_partition
            .expect("object not assigned to a partition")
    }

    /// Assigns the partition slot. Happens exactly once per object.
    pub fn assign(&mut self, partition: PartitionKind, offset: usize) {
        assert!(
            self.partition.is_none(),
            "object assigned to a partition twice"
        );
        self.partition = Some(partition);
        self.offset_in_partition = Some(offset);
    }
}
