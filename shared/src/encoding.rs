use arbitrary_int::{u21, u3};
use bitbybit::bitfield;

/// What a [`LayoutEncoding`] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutMode {
    /// A primitive mirror type. Never materialized as a heap object.
    Primitive,
    /// A pointer-width raw value type. Never materialized as a heap object.
    Word,
    /// An ordinary instance (including hybrid instances).
    Instance,
    /// An array with primitive or word elements.
    PrimitiveArray,
    /// An array with object-reference elements.
    ObjectArray,
}

const MODE_PRIMITIVE: u8 = 0;
const MODE_WORD: u8 = 1;
const MODE_INSTANCE: u8 = 2;
const MODE_PRIMITIVE_ARRAY: u8 = 3;
const MODE_OBJECT_ARRAY: u8 = 4;

/// One `u32` that describes the complete layout of a type: a mode tag, a
/// payload (the aligned instance size, or the array base offset), and the
/// element-size shift for arrays.
#[bitfield(u32, default = 0)]
pub struct LayoutEncoding {
    #[bits(29..=31, rw)]
    mode_bits: u3,
    #[bits(8..=28, rw)]
    payload: u21,
    #[bits(0..=7, rw)]
    element_shift: u8,
}

impl LayoutEncoding {
    pub fn for_primitive() -> Self {
        Self::default().with_mode_bits(u3::new(MODE_PRIMITIVE))
    }

    pub fn for_word() -> Self {
        Self::default().with_mode_bits(u3::new(MODE_WORD))
    }

    /// Encoding for an instance type of the given size. The size must
    /// already include any alignment padding at the end of the instance.
    pub fn for_instance(size: usize) -> Self {
        Self::default()
            .with_mode_bits(u3::new(MODE_INSTANCE))
            .with_payload(u21::new(size as u32))
    }

    pub fn for_primitive_array(base_offset: usize, element_shift: u8) -> Self {
        Self::default()
            .with_mode_bits(u3::new(MODE_PRIMITIVE_ARRAY))
            .with_payload(u21::new(base_offset as u32))
            .with_element_shift(element_shift)
    }

    pub fn for_object_array(base_offset: usize, element_shift: u8) -> Self {
        Self::default()
            .with_mode_bits(u3::new(MODE_OBJECT_ARRAY))
            .with_payload(u21::new(base_offset as u32))
            .with_element_shift(element_shift)
    }

    pub fn mode(&self) -> LayoutMode {
        match self.mode_bits().value() {
            MODE_PRIMITIVE => LayoutMode::Primitive,
            MODE_WORD => LayoutMode::Word,
            MODE_INSTANCE => LayoutMode::Instance,
            MODE_PRIMITIVE_ARRAY => LayoutMode::PrimitiveArray,
            MODE_OBJECT_ARRAY => LayoutMode::ObjectArray,
            bits => panic!("invalid layout mode {bits}"),
        }
    }

    pub fn is_instance(&self) -> bool {
        self.mode() == LayoutMode::Instance
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self.mode(),
            LayoutMode::PrimitiveArray | LayoutMode::ObjectArray
        )
    }

    pub fn is_word(&self) -> bool {
        self.mode() == LayoutMode::Word
    }

    /// Aligned size of an instance of this type.
    pub fn instance_size(&self) -> usize {
        debug_assert!(self.is_instance());
        self.payload().value() as usize
    }

    /// Offset of the first array element.
    pub fn array_base_offset(&self) -> usize {
        debug_assert!(self.is_array());
        self.payload().value() as usize
    }

    pub fn element_size(&self) -> usize {
        debug_assert!(self.is_array());
        1usize << self.element_shift()
    }
}
