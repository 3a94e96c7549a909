//! File content recovery
//!
//! Translates (file, offset, length) through the subsection extents and
//! prototype PTEs into physical reads. A page that was never resident, an
//! out-of-range PTE index, or a failed physical read degrades that
//! sub-range to zeros and the read keeps going; the only way to get fewer
//! bytes than requested is the end of the file.

use crate::addr::{pte, PAGE_SHIFT, PAGE_SIZE};
use crate::object::{FileObjectRecord, SectionPointersRecord};
use crate::source::{MemorySource, ProcessContext};

/// Behavior modifiers for a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFlags(pub u32);

impl ReadFlags {
    /// Stop at the first unbacked byte instead of zero-filling holes.
    pub const NO_ZERO_FILL: u32 = 1;

    pub fn no_zero_fill(self) -> bool {
        self.0 & Self::NO_ZERO_FILL != 0
    }
}

/// What a read produced. `bytes` counts everything placed in the buffer,
/// zero-filled holes included; `gap_bytes` says how much of that was holes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: usize,
    pub gap_bytes: usize,
}

/// Extent-list reader over one acquisition source.
pub struct FileDataReader<'a> {
    source: &'a dyn MemorySource,
}

impl<'a> FileDataReader<'a> {
    pub fn new(source: &'a dyn MemorySource) -> Self {
        Self { source }
    }

    /// Fill `buf` from the file starting at `offset`.
    ///
    /// Reading at or past end of file returns zero bytes; a missing extent
    /// list turns the whole range into one hole.
    pub fn read(
        &self,
        file: &FileObjectRecord,
        sections: Option<&SectionPointersRecord>,
        offset: u64,
        buf: &mut [u8],
        flags: ReadFlags,
    ) -> ReadOutcome {
        if offset >= file.size || buf.is_empty() {
            return ReadOutcome::default();
        }
        let len = buf.len().min((file.size - offset) as usize);
        let end = offset + len as u64;

        let mut pos = offset;
        let mut gap_bytes = 0usize;
        while pos < end {
            let dst = (pos - offset) as usize;
            let (chunk, copied) = match sections.and_then(|s| s.subsection_at(pos)) {
                Some(sub) => {
                    let rel = pos - sub.byte_start();
                    let pte_index = rel >> PAGE_SHIFT;
                    let window_end = sub.byte_start() + ((pte_index + 1) << PAGE_SHIFT);
                    let chunk = (end.min(window_end).min(sub.byte_end()) - pos) as usize;
                    // A corrupt base can sit close enough to the top of the
                    // address space that the slot address wraps; that slot
                    // is a hole like any other unbacked page
                    let pte_address = (pte_index < u64::from(sub.ptes_in_subsection))
                        .then(|| sub.base.checked_add(pte_index * 8))
                        .flatten();
                    let copied = match pte_address {
                        Some(pte_address) => self.read_page_slice(
                            pte_address,
                            rel & (PAGE_SIZE - 1),
                            &mut buf[dst..dst + chunk],
                        ),
                        None => 0,
                    };
                    (chunk, copied)
                }
                None => {
                    // Hole until the next extent begins, or the read ends
                    let next = sections
                        .and_then(|s| s.next_extent_start(pos))
                        .unwrap_or(end)
                        .clamp(pos + 1, end);
                    ((next - pos) as usize, 0)
                }
            };

            if copied < chunk {
                if flags.no_zero_fill() {
                    return ReadOutcome {
                        bytes: dst + copied,
                        gap_bytes,
                    };
                }
                buf[dst + copied..dst + chunk].fill(0);
                gap_bytes += chunk - copied;
            }
            pos += chunk as u64;
        }

        if gap_bytes > 0 {
            tracing::debug!(
                path = %file.path,
                offset,
                len,
                gap_bytes,
                "read degraded to zero-fill"
            );
        }
        ReadOutcome {
            bytes: len,
            gap_bytes,
        }
    }

    /// Resolve one prototype PTE and copy from the physical page it maps.
    /// Returns how many bytes actually arrived.
    fn read_page_slice(&self, pte_address: u64, offset_in_page: u64, dst: &mut [u8]) -> usize {
        let raw = match self.source.read_u64(ProcessContext::Kernel, pte_address) {
            Ok(raw) => raw,
            Err(_) => return 0,
        };
        if !pte::is_valid(raw) {
            return 0;
        }
        let pa = pte::physical_address(raw, offset_in_page);
        match self.source.read_physical(pa, dst.len()) {
            Ok(data) => {
                let n = data.len().min(dst.len());
                dst[..n].copy_from_slice(&data[..n]);
                n
            }
            Err(_) => 0,
        }
    }
}
