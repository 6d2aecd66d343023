//! Ahead-of-time image heap builder.
//!
//! Takes the closed graph of live host objects discovered by static
//! analysis and materializes it as a byte-exact, relocatable binary image
//! that the generated executable loads as its initial object heap. Objects
//! are discovered through a worklist traversal, classified into five
//! partitions by writability and content kind, and emitted into a
//! read-only and a writable output section together with the relocation
//! records the dynamic linker needs.
//!
//! The builder is strictly single threaded: admission order, partition
//! layout, and the emitted bytes are reproducible from the same inputs.

pub mod buffer;
pub mod emit;
pub mod error;
pub mod heap;
pub mod host;
pub mod hybrid;
pub mod meta;
pub mod object_info;
pub mod partition;
pub mod patch;
pub mod phase;
pub mod universe;

#[cfg(test)]
pub(crate) mod testutil;

use kiln_shared::header::CompressEncoding;

/// Build-wide options observed by the heap builder.
#[derive(Clone, Copy, Debug)]
pub struct BuildOptions {
    /// Reference compression. With a heap base, references are written as
    /// 4-byte shifted section offsets; without one they are 8-byte pointers
    /// backed by relocation records.
    pub compress: CompressEncoding,
    /// Place every object into the writable reference partition. Only
    /// honored when no heap base is in use.
    pub force_writable: bool,
    /// Low header bits reserved by the runtime. When present, the
    /// compression shift is not applied to hub headers.
    pub reserved_header_bits: Option<u8>,
    /// Log a per-type histogram of the admitted heap after writing.
    pub print_histogram: bool,
    /// Log per-partition sizes after writing.
    pub print_partition_sizes: bool,
}

impl BuildOptions {
    pub fn reference_size(&self) -> usize {
        if self.compress.has_base {
            4
        } else {
            8
        }
    }
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            compress: CompressEncoding {
                shift: 3,
                has_base: true,
            },
            force_writable: false,
            reserved_header_bits: None,
            print_histogram: false,
            print_partition_sizes: false,
        }
    }
}
