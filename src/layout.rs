//! Layout management.
//!
//! This module defines owned snapshots of a Mach-O image's segments and
//! sections, taken by the `macho` accessor, plus the allocator that hands out
//! load addresses to KEXTs inside the prelinked text region.

use crate::utils::{align_up, alignment};

pub const PAGE_SIZE: u64 = 0x1000;

/// Represents a section of an input image.
#[derive(Debug, Clone)]
pub struct Section {
    /// 1-based ordinal, as referenced by `n_sect` and section relocations.
    pub ordinal: u32,
    pub name: String,
    pub segment_name: String,
    pub addr: u64,
    pub size: u64,
    /// File offset of the section data.
    pub offset: u32,
    /// Alignment as a power-of-two exponent.
    pub align: u32,
    pub flags: u32,
    pub reserved1: u32,
    /// Offset of the `section_64` header within the image.
    pub header_offset: usize,
}

impl Section {
    /// The address this section ends up at once the image is linked at `load_address`.
    pub fn link_address(&self, load_address: u64) -> Option<u64> {
        let align = alignment(self.align)?;
        Some(align_up(self.addr.wrapping_add(load_address), align))
    }

    /// Distance the section moves when linked at `load_address`.
    pub fn link_delta(&self, load_address: u64) -> Option<u64> {
        self.link_address(load_address)
            .map(|linked| linked.wrapping_sub(self.addr))
    }

    pub fn section_type(&self) -> u32 {
        self.flags & object::macho::SECTION_TYPE
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.addr && address - self.addr < self.size
    }
}

/// Represents a segment of an input image.
///
/// A `Segment` aggregates its sections and remembers where its load command
/// lives, so callers can patch the command after reading the snapshot.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Name of the segment (e.g., "__TEXT", "__LINKEDIT").
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    /// Offset of the `segment_command_64` within the image.
    pub command_offset: usize,
    pub sections: Vec<Section>,
}

impl Segment {
    /// Whether `[address, address + len)` lies inside the segment's memory range.
    pub fn contains(&self, address: u64, len: u64) -> bool {
        address >= self.vmaddr
            && address
                .checked_add(len)
                .map_or(false, |end| end - self.vmaddr <= self.vmsize)
    }

    /// File offset backing `address`, when the bytes are present in the file.
    pub fn file_offset(&self, address: u64, len: u64) -> Option<u64> {
        if !self.contains(address, len) {
            return None;
        }
        let delta = address - self.vmaddr;
        if delta.checked_add(len)? > self.filesize {
            return None;
        }
        self.fileoff.checked_add(delta)
    }

    /// End of the segment's memory range.
    pub fn end(&self) -> u64 {
        self.vmaddr.wrapping_add(self.vmsize)
    }
}

/// Hands out page-aligned load addresses past everything already placed.
#[derive(Debug, Clone)]
pub struct LoadAddressAllocator {
    next: u64,
}

impl LoadAddressAllocator {
    /// Starts allocating at `base`, rounded up to a page.
    pub fn new(base: u64) -> Self {
        Self {
            next: align_up(base, PAGE_SIZE),
        }
    }

    /// The address the next allocation will receive.
    pub fn next_address(&self) -> u64 {
        self.next
    }

    /// Makes sure nothing is placed below `end`.
    pub fn reserve_through(&mut self, end: u64) {
        let end = align_up(end, PAGE_SIZE);
        if end > self.next {
            self.next = end;
        }
    }

    /// Reserves `size` bytes and returns their start address.
    pub fn allocate(&mut self, size: u64) -> u64 {
        let address = self.next;
        self.next = align_up(address.wrapping_add(size), PAGE_SIZE);
        tracing::trace!("allocated {:#x} bytes at {:#x}", size, address);
        address
    }
}
