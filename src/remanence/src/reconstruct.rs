//! File-object reconstruction
//!
//! Resolves a candidate virtual address into a [`FileObjectRecord`] and,
//! transitively, the section/segment/subsection chain backing it. Nothing
//! here trusts the snapshot: every pointer is range-checked before it is
//! dereferenced, and a failed check surfaces as a clean [`ResolveError`]
//! instead of a wild read. Memoization of results (successes and failures
//! both) is the cache's job; this module stays stateless.

use crate::addr::{is_plausible_kernel_pointer, is_plausible_struct_pointer};
use crate::object::{
    ChainStatus, FailureKind, FileObjectRecord, SectionFlags, SectionPointersRecord, SegmentInfo,
    SharedCacheMapInfo, Subsection,
};
use crate::profile::KernelProfile;
use crate::source::{MemorySource, ProcessContext};
use byteorder::{ByteOrder, LE};
use std::collections::HashSet;
use thiserror::Error;

/// Hard cap on the subsection chain walk, matching the declared maximum.
pub const SUBSECTION_CHAIN_CAP: usize = 0x20;

/// Longest FileName buffer honored, in bytes.
const MAX_NAME_BYTES: usize = 0x1000;

/// Why a resolution was abandoned.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Nothing recognizable at the address.
    #[error("no recognizable object at {0:#x}")]
    NotFound(u64),

    /// A plausibility check failed partway through the structure.
    #[error("malformed structure at {address:#x}: {reason}")]
    Malformed { address: u64, reason: &'static str },
}

impl ResolveError {
    fn malformed(address: u64, reason: &'static str) -> Self {
        Self::Malformed { address, reason }
    }

    /// Map onto the sentinel recorded in the cache.
    pub fn kind(&self) -> FailureKind {
        match self {
            ResolveError::NotFound(_) => FailureKind::NotFound,
            ResolveError::Malformed { .. } => FailureKind::Malformed,
        }
    }
}

/// Stateless resolver over one acquisition source and offset profile.
pub struct FileObjectReconstructor<'a> {
    source: &'a dyn MemorySource,
    profile: &'a KernelProfile,
}

impl<'a> FileObjectReconstructor<'a> {
    pub fn new(source: &'a dyn MemorySource, profile: &'a KernelProfile) -> Self {
        Self { source, profile }
    }

    /// Check whether the bytes at `va` carry the FILE_OBJECT type/size pair.
    /// Used by the scanner for cheap candidate classification.
    pub fn looks_like_file_object(&self, va: u64) -> bool {
        if !is_plausible_struct_pointer(va) {
            return false;
        }
        let Ok(head) = self.source.read_exact(ProcessContext::Kernel, va, 4) else {
            return false;
        };
        LE::read_u16(&head[0..2]) == self.profile.file_object.type_magic
            && LE::read_u16(&head[2..4]) == self.profile.file_object.size_magic
    }

    /// Resolve a file object at `va`.
    ///
    /// `lookup_sections` is consulted before the section-pointers structure
    /// is walked, so an instance shared between several files (hardlinks,
    /// mapped views) is resolved once per generation. The second element of
    /// the result is a freshly resolved record the caller should store, or
    /// `None` when an existing instance was reused (or none was referenced).
    pub fn resolve_file(
        &self,
        va: u64,
        lookup_sections: impl FnOnce(u64) -> Option<SectionPointersRecord>,
    ) -> Result<(FileObjectRecord, Option<SectionPointersRecord>), ResolveError> {
        if !is_plausible_struct_pointer(va) {
            return Err(ResolveError::NotFound(va));
        }

        let fo = &self.profile.file_object;
        let span = (fo.file_name + 0x10).max(fo.section_object_pointer + 8) as usize;
        let header = self
            .source
            .read_exact(ProcessContext::Kernel, va, span)
            .map_err(|_| ResolveError::NotFound(va))?;

        if LE::read_u16(&header[0..2]) != fo.type_magic
            || LE::read_u16(&header[2..4]) != fo.size_magic
        {
            return Err(ResolveError::NotFound(va));
        }

        let path = self.read_file_name(va, &header)?;
        let sop_ptr = LE::read_u64(&header[fo.section_object_pointer as usize..][..8]);

        let (size, sop_addr, fresh) = if sop_ptr == 0 {
            (0, None, None)
        } else {
            if !is_plausible_struct_pointer(sop_ptr) {
                return Err(ResolveError::malformed(va, "section pointers field"));
            }
            if let Some(existing) = lookup_sections(sop_ptr) {
                (existing.file_size(), Some(sop_ptr), None)
            } else {
                let resolved = self.resolve_section_pointers(sop_ptr)?;
                (resolved.file_size(), Some(sop_ptr), Some(resolved))
            }
        };

        let record = FileObjectRecord {
            name: FileObjectRecord::leaf_name(&path),
            path,
            size,
            section_pointers: sop_addr,
        };
        Ok((record, fresh))
    }

    /// Decode the FileName UNICODE_STRING. An unreadable (but plausible)
    /// buffer degrades to an empty name; an implausible non-null buffer
    /// pointer is corruption.
    fn read_file_name(&self, va: u64, header: &[u8]) -> Result<String, ResolveError> {
        let off = self.profile.file_object.file_name as usize;
        let length = LE::read_u16(&header[off..off + 2]) as usize;
        let buffer = LE::read_u64(&header[off + 8..off + 16]);

        if buffer == 0 || length == 0 {
            return Ok(String::new());
        }
        if !is_plausible_kernel_pointer(buffer) {
            return Err(ResolveError::malformed(va, "file name buffer"));
        }

        let take = length.min(MAX_NAME_BYTES) & !1;
        match self.source.read_exact(ProcessContext::Kernel, buffer, take) {
            Ok(bytes) => {
                let units: Vec<u16> = bytes.chunks_exact(2).map(LE::read_u16).collect();
                Ok(String::from_utf16_lossy(&units))
            }
            Err(_) => {
                tracing::debug!(file_object = format_args!("{va:#x}"), "file name unreadable");
                Ok(String::new())
            }
        }
    }

    /// Resolve a SECTION_OBJECT_POINTERS structure.
    ///
    /// Each optional piece (cache map, segment, subsection chain) degrades
    /// independently; only an implausible or unreadable structure address
    /// fails the resolution outright.
    pub fn resolve_section_pointers(
        &self,
        va: u64,
    ) -> Result<SectionPointersRecord, ResolveError> {
        if !is_plausible_struct_pointer(va) {
            return Err(ResolveError::malformed(va, "section pointers address"));
        }

        let sp = &self.profile.section_pointers;
        let span = sp
            .data_section_object
            .max(sp.shared_cache_map)
            .max(sp.image_section_object) as usize
            + 8;
        let raw = self
            .source
            .read_exact(ProcessContext::Kernel, va, span)
            .map_err(|_| ResolveError::malformed(va, "unreadable section pointers"))?;

        let data_section = LE::read_u64(&raw[sp.data_section_object as usize..][..8]);
        let shared_cache = LE::read_u64(&raw[sp.shared_cache_map as usize..][..8]);
        let image_section = LE::read_u64(&raw[sp.image_section_object as usize..][..8]);

        let mut flags = SectionFlags::default();
        if is_plausible_struct_pointer(shared_cache) {
            flags = flags.with_cached_data();
        }
        if is_plausible_struct_pointer(data_section) {
            flags = flags.with_user_mapping();
        }
        if is_plausible_struct_pointer(image_section) {
            flags = flags.with_image();
        }

        let cache_map = flags
            .has_cached_data()
            .then(|| self.read_cache_map(shared_cache))
            .flatten();

        let control_area = if flags.has_user_mapping() {
            Some(data_section)
        } else if flags.is_image() {
            Some(image_section)
        } else {
            None
        };

        let (segment, subsections, chain) = match control_area {
            Some(ca) => self.walk_control_area(ca),
            None => (None, Vec::new(), ChainStatus::Complete),
        };

        Ok(SectionPointersRecord {
            address: va,
            flags,
            cache_map,
            segment,
            subsections,
            chain,
        })
    }

    fn read_cache_map(&self, va: u64) -> Option<SharedCacheMapInfo> {
        let scm = &self.profile.shared_cache_map;
        let span = scm
            .file_size
            .max(scm.section_size)
            .max(scm.valid_data_length)
            .max(scm.vacbs) as usize
            + 8;
        let raw = match self.source.read_exact(ProcessContext::Kernel, va, span) {
            Ok(raw) => raw,
            Err(_) => {
                tracing::debug!(cache_map = format_args!("{va:#x}"), "shared cache map unreadable");
                return None;
            }
        };
        Some(SharedCacheMapInfo {
            address: va,
            file_size: LE::read_u64(&raw[scm.file_size as usize..][..8]),
            valid_size: LE::read_u64(&raw[scm.valid_data_length as usize..][..8]),
            section_size: LE::read_u64(&raw[scm.section_size as usize..][..8]),
            vacb_table: LE::read_u64(&raw[scm.vacbs as usize..][..8]),
        })
    }

    /// Read the segment behind a control area and walk the subsection
    /// chain starting right after it.
    fn walk_control_area(&self, ca: u64) -> (Option<SegmentInfo>, Vec<Subsection>, ChainStatus) {
        let (segment, degraded) = match self.read_segment(ca) {
            Ok(segment) => (segment, false),
            Err(()) => (None, true),
        };

        let first = ca + self.profile.control_area.first_subsection;
        let (subsections, walk_status) = self.walk_subsections(first, ca);

        let chain = if degraded {
            ChainStatus::Malformed
        } else {
            walk_status
        };
        (segment, subsections, chain)
    }

    fn read_segment(&self, ca: u64) -> Result<Option<SegmentInfo>, ()> {
        let seg_ptr = self
            .source
            .read_u64(ProcessContext::Kernel, ca + self.profile.control_area.segment)
            .map_err(|_| ())?;
        if seg_ptr == 0 {
            return Ok(None);
        }
        if !is_plausible_struct_pointer(seg_ptr) {
            return Err(());
        }

        let sg = &self.profile.segment;
        let span = sg
            .control_area
            .max(sg.total_ptes)
            .max(sg.size_of_segment)
            .max(sg.prototype_pte) as usize
            + 8;
        let raw = self
            .source
            .read_exact(ProcessContext::Kernel, seg_ptr, span)
            .map_err(|_| ())?;

        // The segment points back at its owning control area; a mismatch
        // means one of the two is not what it claims to be.
        let back = LE::read_u64(&raw[sg.control_area as usize..][..8]);
        if back != ca {
            tracing::warn!(
                control_area = format_args!("{ca:#x}"),
                segment = format_args!("{seg_ptr:#x}"),
                "segment back-pointer mismatch"
            );
            return Err(());
        }

        Ok(Some(SegmentInfo {
            address: seg_ptr,
            size_of_segment: LE::read_u64(&raw[sg.size_of_segment as usize..][..8]),
            prototype_pte_base: LE::read_u64(&raw[sg.prototype_pte as usize..][..8]),
            total_ptes: LE::read_u32(&raw[sg.total_ptes as usize..][..4]),
        }))
    }

    /// Bounded walk over the subsection chain. Stops on a null link, the
    /// hard cap, a cycle, a zero-sector node, or an extent that breaks the
    /// ascending non-overlapping order; the collected prefix is kept.
    fn walk_subsections(&self, first: u64, ca: u64) -> (Vec<Subsection>, ChainStatus) {
        let ss = &self.profile.subsection;
        let span = ss
            .control_area
            .max(ss.subsection_base)
            .max(ss.next_subsection) as usize
            + 8;
        let span = span.max(ss.ptes_in_subsection as usize + 4);

        let mut out = Vec::new();
        let mut seen: HashSet<u64> = HashSet::new();
        let mut cursor = first;

        loop {
            if cursor == 0 {
                return (out, ChainStatus::Complete);
            }
            if out.len() >= SUBSECTION_CHAIN_CAP {
                tracing::debug!(
                    control_area = format_args!("{ca:#x}"),
                    "subsection chain hit the cap"
                );
                return (out, ChainStatus::Capped);
            }
            if !is_plausible_struct_pointer(cursor) || !seen.insert(cursor) {
                return (out, ChainStatus::Malformed);
            }

            let raw = match self.source.read_exact(ProcessContext::Kernel, cursor, span) {
                Ok(raw) => raw,
                Err(_) => return (out, ChainStatus::Malformed),
            };

            let owner = LE::read_u64(&raw[ss.control_area as usize..][..8]);
            let base = LE::read_u64(&raw[ss.subsection_base as usize..][..8]);
            let next = LE::read_u64(&raw[ss.next_subsection as usize..][..8]);
            let starting_sector = LE::read_u32(&raw[ss.starting_sector as usize..][..4]);
            let full_sector_count = LE::read_u32(&raw[ss.number_of_full_sectors as usize..][..4]);
            let ptes_in_subsection = LE::read_u32(&raw[ss.ptes_in_subsection as usize..][..4]);

            if owner != ca || full_sector_count == 0 || !is_plausible_kernel_pointer(base) {
                return (out, ChainStatus::Malformed);
            }

            let sub = Subsection {
                base,
                starting_sector,
                full_sector_count,
                ptes_in_subsection,
            };
            if let Some(last) = out.last() {
                if sub.byte_start() < last.byte_end() {
                    return (out, ChainStatus::Malformed);
                }
            }
            out.push(sub);
            cursor = next;
        }
    }
}
