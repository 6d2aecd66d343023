use crate::layout::OBJECT_ALIGNMENT;
use arbitrary_int::{u3, u61};
use bitbybit::bitfield;

/// Reference compression: references are stored as 32-bit section offsets,
/// reconstructed at load time as `base + (value << shift)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressEncoding {
    pub shift: u32,
    pub has_base: bool,
}

impl CompressEncoding {
    /// No heap base: references are full-width pointers patched by the
    /// dynamic linker.
    pub const NONE: Self = Self {
        shift: 0,
        has_base: false,
    };
}

/// The first word of every image object: the hub offset packed together with
/// the low bits the runtime reserves for itself. Hub offsets are object
/// aligned, so the reserved bits never collide with offset bits.
#[bitfield(u64, default = 0)]
pub struct ObjectHeader {
    #[bits(3..=63, rw)]
    hub: u61,
    #[bits(0..=2, rw)]
    reserved: u3,
}

/// How hub references are packed into object headers for one build.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderEncoding {
    reserved_bits: Option<u8>,
}

impl HeaderEncoding {
    pub fn new(reserved_bits: Option<u8>) -> Self {
        if let Some(value) = reserved_bits {
            assert!(
                usize::from(value) < OBJECT_ALIGNMENT,
                "reserved header bits overlap hub offset bits"
            );
        }
        Self { reserved_bits }
    }

    pub fn has_reserved_bits(&self) -> bool {
        self.reserved_bits.is_some()
    }

    /// The value OR'd into the low header bits, as a relocation addend.
    pub fn reserved_bits_value(&self) -> u64 {
        u64::from(self.reserved_bits.unwrap_or(0))
    }

    /// Packs a hub offset into header bits. With reserved bits present the
    /// offset is kept unshifted; the caller must not apply the compression
    /// shift on top of the result.
    pub fn header_bits(&self, hub_offset: u64) -> u64 {
        match self.reserved_bits {
            Some(value) => {
                assert!(
                    hub_offset % OBJECT_ALIGNMENT as u64 == 0,
                    "hub offset {hub_offset} not object aligned"
                );
                ObjectHeader::default()
                    .with_hub(u61::new(hub_offset / OBJECT_ALIGNMENT as u64))
                    .with_reserved(u3::new(value))
                    .raw_value()
            }
            None => hub_offset,
        }
    }
}

#[cfg(test)]
mod test {
    use super::HeaderEncoding;

    #[test]
    fn plain_header_is_the_offset() {
        let encoding = HeaderEncoding::new(None);
        assert_eq!(encoding.header_bits(0x140), 0x140);
        assert_eq!(encoding.reserved_bits_value(), 0);
    }

    #[test]
    fn reserved_bits_occupy_low_bits() {
        let encoding = HeaderEncoding::new(Some(0b101));
        assert_eq!(encoding.header_bits(0x140), 0x140 | 0b101);
        assert_eq!(encoding.reserved_bits_value(), 0b101);
    }

    #[test]
    #[should_panic(expected = "not object aligned")]
    fn unaligned_hub_offset_is_rejected() {
        HeaderEncoding::new(Some(1)).header_bits(0x141);
    }
}
