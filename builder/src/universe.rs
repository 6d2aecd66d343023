//! The analysis universe: everything the heap builder consumes from the
//! rest of the toolchain. Types and methods are registered up front by the
//! build driver; the builder then looks them up, resolves object
//! replacements, and reads host field values through this facade.

use std::cell::Cell;
use std::collections::HashSet;

use once_cell::unsync::OnceCell;

use crate::host::{ArrayData, HostData, HostObject, HostRef, HostValue, IdentitySet, PrimValue};
use crate::meta::{FieldDescriptor, MethodDescriptor, MethodId, TypeDescriptor, TypeId, TypeKind};
use kiln_shared::encoding::LayoutEncoding;

/// Registration input for one type. The universe creates the hub and the
/// backing class handle itself.
pub struct TypeRegistration {
    pub name: String,
    pub kind: TypeKind,
    pub layout: LayoutEncoding,
    pub is_instantiated: bool,
    pub class_init_ready: bool,
    pub hash_code_offset: Option<usize>,
    pub monitor_offset: Option<usize>,
}

/// Which registered type is the string type, and where its hash and
/// payload fields sit in the field list.
pub struct StringMeta {
    pub type_id: TypeId,
    pub hash_field: usize,
    pub value_field: usize,
}

/// Size of a hub instance. Hubs carry no accessed instance fields in this
/// model; their payload lives in the type registry.
const HUB_INSTANCE_SIZE: usize = 16;

type Replacer = Box<dyn Fn(&HostRef) -> Option<HostRef>>;

pub struct Universe {
    types: Vec<TypeDescriptor>,
    methods: Vec<MethodDescriptor>,
    replacers: Vec<Replacer>,
    immutable_types: HashSet<TypeId>,
    interned: IdentitySet,
    roots: Vec<(String, HostRef)>,
    string_meta: Option<StringMeta>,
    string_array_type: Option<TypeId>,
    interned_table_holder: OnceCell<(HostRef, usize)>,
    heap_bounds_holder: OnceCell<HostRef>,
    hub_type: TypeId,
    next_hash: Cell<u32>,
}

impl Universe {
    pub fn new() -> Self {
        let mut universe = Self {
            types: Vec::new(),
            methods: Vec::new(),
            replacers: Vec::new(),
            immutable_types: HashSet::new(),
            interned: IdentitySet::new(),
            roots: Vec::new(),
            string_meta: None,
            string_array_type: None,
            interned_table_holder: OnceCell::new(),
            heap_bounds_holder: OnceCell::new(),
            hub_type: TypeId(0),
            next_hash: Cell::new(1000),
        };
        let hub_type = universe.register_type(TypeRegistration {
            name: "runtime.Hub".into(),
            kind: TypeKind::Instance {
                fields: Vec::new(),
                hybrid: None,
            },
            layout: LayoutEncoding::for_instance(HUB_INSTANCE_SIZE),
            is_instantiated: true,
            class_init_ready: true,
            hash_code_offset: None,
            monitor_offset: None,
        });
        universe.hub_type = hub_type;
        universe
    }

    /// A fresh nonzero identity hash for a host object created during the
    /// build. Sequential so builds stay reproducible.
    pub fn fresh_hash(&self) -> u32 {
        let hash = self.next_hash.get();
        self.next_hash.set(hash + 1);
        hash
    }

    // ---- registries ----

    pub fn register_type(&mut self, registration: TypeRegistration) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        // The very first registered type is the hub type itself; its hub
        // describes its own type.
        let hub_type = if self.types.is_empty() {
            id
        } else {
            self.hub_type
        };
        let class_handle = HostObject::new(
            hub_type,
            self.fresh_hash(),
            HostData::ClassHandle { described: id },
        );
        let hub = HostObject::new(
            hub_type,
            self.fresh_hash(),
            HostData::Hub {
                described: id,
                class_init_ready: registration.class_init_ready,
                class_handle,
            },
        );
        self.types.push(TypeDescriptor {
            name: registration.name,
            kind: registration.kind,
            hub,
            layout: registration.layout,
            is_instantiated: registration.is_instantiated,
            hash_code_offset: registration.hash_code_offset,
            monitor_offset: registration.monitor_offset,
        });
        id
    }

    pub fn register_method(&mut self, name: &str, is_compiled: bool) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        self.methods.push(MethodDescriptor {
            name: name.into(),
            is_compiled,
        });
        id
    }

    pub fn hub_type(&self) -> TypeId {
        self.hub_type
    }

    pub fn type_descriptor(&self, id: TypeId) -> &TypeDescriptor {
        &self.types[id.0 as usize]
    }

    pub fn lookup_type(&self, object: &HostRef) -> &TypeDescriptor {
        self.type_descriptor(object.type_id())
    }

    pub fn method(&self, id: MethodId) -> Option<&MethodDescriptor> {
        self.methods.get(id.0 as usize)
    }

    pub fn field_index(&self, type_id: TypeId, name: &str) -> Option<usize> {
        self.type_descriptor(type_id)
            .instance_fields()
            .iter()
            .position(|field| field.name == name)
    }

    pub fn field(&self, type_id: TypeId, index: usize) -> &FieldDescriptor {
        &self.type_descriptor(type_id).instance_fields()[index]
    }

    // ---- object replacement ----

    /// Registers an analysis-time substitution hook. Hooks run in
    /// registration order whenever a reference is read out of a host field
    /// or array element.
    pub fn add_replacer(&mut self, replacer: impl Fn(&HostRef) -> Option<HostRef> + 'static) {
        self.replacers.push(Box::new(replacer));
    }

    pub fn replace_object(&self, object: &HostRef) -> HostRef {
        let mut current = object.clone();
        for replacer in &self.replacers {
            if let Some(next) = replacer(&current) {
                current = next;
            }
        }
        current
    }

    // ---- immutability and roots ----

    pub fn register_immutable_type(&mut self, id: TypeId) {
        self.immutable_types.insert(id);
    }

    pub fn is_immutable_type(&self, id: TypeId) -> bool {
        self.immutable_types.contains(&id)
    }

    /// Records that the host considers this string interned.
    pub fn intern_string(&mut self, object: &HostRef) {
        self.interned.insert(object);
    }

    pub fn is_interned(&self, object: &HostRef) -> bool {
        self.interned.contains(object)
    }

    /// Registers a static-field holder the traversal starts from.
    pub fn add_root(&mut self, label: &str, object: &HostRef) {
        self.roots.push((label.into(), object.clone()));
    }

    pub fn roots(&self) -> &[(String, HostRef)] {
        &self.roots
    }

    // ---- well-known singletons ----

    pub fn set_interned_table_holder(&self, holder: &HostRef, field_index: usize) {
        assert!(
            self.interned_table_holder
                .set((holder.clone(), field_index))
                .is_ok(),
            "interned-strings holder registered twice"
        );
    }

    pub fn interned_table_holder(&self) -> Option<(&HostRef, usize)> {
        self.interned_table_holder
            .get()
            .map(|(holder, index)| (holder, *index))
    }

    pub fn set_heap_bounds_holder(&self, holder: &HostRef) {
        assert!(
            self.heap_bounds_holder.set(holder.clone()).is_ok(),
            "heap boundary holder registered twice"
        );
    }

    pub fn heap_bounds_holder(&self) -> Option<&HostRef> {
        self.heap_bounds_holder.get()
    }

    // ---- strings ----

    pub fn set_string_meta(&mut self, meta: StringMeta) {
        self.string_meta = Some(meta);
    }

    pub fn set_string_array_type(&mut self, id: TypeId) {
        self.string_array_type = Some(id);
    }

    pub fn string_array_type(&self) -> Option<TypeId> {
        self.string_array_type
    }

    pub fn is_string(&self, object: &HostRef) -> bool {
        self.string_meta
            .as_ref()
            .is_some_and(|meta| meta.type_id == object.type_id())
    }

    fn string_chars(&self, object: &HostRef) -> Option<Vec<u16>> {
        let meta = self.string_meta.as_ref()?;
        if meta.type_id != object.type_id() {
            return None;
        }
        let HostValue::Ref(Some(payload)) = object.field(meta.value_field) else {
            return None;
        };
        let result = match &*payload.elements() {
            ArrayData::Char(chars) => Some(chars.clone()),
            _ => panic!("string payload must be a char array"),
        };
        result
    }

    pub fn string_value(&self, object: &HostRef) -> Option<String> {
        self.string_chars(object)
            .map(|chars| String::from_utf16_lossy(&chars))
    }

    /// Invokes the host's string hash once so the cached-hash field is
    /// materialized. A content hash of 0 stays 0, leaving the string
    /// writable at runtime.
    pub fn materialize_string_hash(&self, object: &HostRef) -> i32 {
        let meta = self.string_meta.as_ref().expect("no string type registered");
        let chars = self.string_chars(object).unwrap_or_default();
        let hash = chars.iter().fold(0i32, |hash, &c| {
            hash.wrapping_mul(31).wrapping_add(i32::from(c))
        });
        object.set_field(meta.hash_field, HostValue::Prim(PrimValue::Int(hash)));
        hash
    }

    pub fn cached_string_hash(&self, object: &HostRef) -> i32 {
        let meta = self.string_meta.as_ref().expect("no string type registered");
        match object.field(meta.hash_field) {
            HostValue::Prim(PrimValue::Int(hash)) => hash,
            _ => panic!("string hash field must be an int"),
        }
    }

    // ---- host value access ----

    pub fn read_field(&self, object: &HostRef, index: usize) -> HostValue {
        object.field(index)
    }

    pub fn write_field(&self, object: &HostRef, index: usize, value: HostValue) {
        object.set_field(index, value);
    }

    /// Creates an object array during the build (e.g. the canonical
    /// interned-strings table).
    pub fn new_object_array(&self, type_id: TypeId, elements: Vec<Option<HostRef>>) -> HostRef {
        HostObject::new(
            type_id,
            self.fresh_hash(),
            HostData::Array {
                elements: std::cell::RefCell::new(ArrayData::Object(elements)),
            },
        )
    }
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}
