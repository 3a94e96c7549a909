//! Kernel address plausibility checks and prototype-PTE decoding
//!
//! Every pointer read out of snapshot memory goes through these checks
//! before it is dereferenced. Kernel structures in a hostile or corrupted
//! snapshot carry no schema, so an out-of-range pointer is the common case,
//! not the exception.

/// Page size on x64 (4 KiB).
pub const PAGE_SIZE: u64 = 0x1000;

/// Page shift on x64.
pub const PAGE_SHIFT: u32 = 12;

/// Sector size used by subsection extents (512 B).
pub const SECTOR_SIZE: u64 = 512;

/// Sector shift.
pub const SECTOR_SHIFT: u32 = 9;

/// Start of the canonical kernel half of the x64 address space.
pub const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;

/// Check if an address is canonical (sign-extended 48-bit).
pub fn is_canonical(va: u64) -> bool {
    let top = va >> 47;
    top == 0 || top == 0x1FFFF
}

/// Check if an address falls in kernel space.
pub fn is_kernel_address(va: u64) -> bool {
    va >= KERNEL_SPACE_START
}

/// Check if a value read from memory looks like a dereferenceable kernel
/// pointer. The all-ones pattern shows up in freed pool and poison fills,
/// so it is rejected along with user-space and non-canonical values.
pub fn is_plausible_kernel_pointer(va: u64) -> bool {
    is_kernel_address(va) && is_canonical(va) && va != u64::MAX
}

/// Like [`is_plausible_kernel_pointer`], but additionally requires natural
/// pointer alignment. Structure pointers in kernel pool are 8-aligned;
/// anything else is corruption.
pub fn is_plausible_struct_pointer(va: u64) -> bool {
    is_plausible_kernel_pointer(va) && va & 0x7 == 0
}

/// Prototype-PTE bit decoding.
///
/// Only the hardware-valid view matters here: a valid prototype PTE maps a
/// resident physical frame, anything else is treated as a hole in the file.
pub mod pte {
    /// Present/valid bit.
    pub const VALID: u64 = 1;

    /// Physical address mask (bits 12-51).
    pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Check the hardware valid bit.
    pub fn is_valid(raw: u64) -> bool {
        raw & VALID != 0
    }

    /// Extract the page frame number from a valid PTE.
    pub fn page_frame(raw: u64) -> u64 {
        (raw & ADDR_MASK) >> super::PAGE_SHIFT
    }

    /// Physical address of a byte within the page a valid PTE maps.
    pub fn physical_address(raw: u64, offset_in_page: u64) -> u64 {
        (raw & ADDR_MASK) | (offset_in_page & (super::PAGE_SIZE - 1))
    }
}
