//! Reconstructed kernel-object records
//!
//! Plain data carried by cache slots: file objects, the section-pointer
//! structures backing them, and the memoized-failure sentinel. Extent
//! arithmetic over the subsection list lives here too, in 512-byte sector
//! units.

use crate::addr::{SECTOR_SHIFT, SECTOR_SIZE};
use serde::Serialize;

/// Coarse object classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ObjectType {
    File,
    SectionPointers,
}

impl ObjectType {
    /// Numeric index used across the VFS seam.
    pub fn as_index(self) -> u32 {
        match self {
            ObjectType::File => 0,
            ObjectType::SectionPointers => 1,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(ObjectType::File),
            1 => Some(ObjectType::SectionPointers),
            _ => None,
        }
    }
}

/// Section flags derived from which SECTION_OBJECT_POINTERS slots are
/// populated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SectionFlags(pub u32);

impl SectionFlags {
    /// Cache manager holds cached data (shared cache map present).
    pub const CACHED_DATA: u32 = 1;
    /// File has been mapped as data (data section present).
    pub const USER_MAPPING: u32 = 2;
    /// File has been mapped as an executable image.
    pub const IMAGE: u32 = 4;

    pub fn with_cached_data(mut self) -> Self {
        self.0 |= Self::CACHED_DATA;
        self
    }

    pub fn with_user_mapping(mut self) -> Self {
        self.0 |= Self::USER_MAPPING;
        self
    }

    pub fn with_image(mut self) -> Self {
        self.0 |= Self::IMAGE;
        self
    }

    pub fn has_cached_data(&self) -> bool {
        self.0 & Self::CACHED_DATA != 0
    }

    pub fn has_user_mapping(&self) -> bool {
        self.0 & Self::USER_MAPPING != 0
    }

    pub fn is_image(&self) -> bool {
        self.0 & Self::IMAGE != 0
    }
}

/// Shared-cache-map fields preserved for display; reads never go through
/// the VACB view, only through subsection extents.
#[derive(Debug, Clone, Serialize)]
pub struct SharedCacheMapInfo {
    pub address: u64,
    pub file_size: u64,
    pub valid_size: u64,
    pub section_size: u64,
    pub vacb_table: u64,
}

/// Segment fields needed to reach the prototype-PTE array.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentInfo {
    pub address: u64,
    pub size_of_segment: u64,
    pub prototype_pte_base: u64,
    pub total_ptes: u32,
}

/// One subsection: a contiguous run of the file's backing store mapped to
/// a slice of prototype-PTE slots.
#[derive(Debug, Clone, Serialize)]
pub struct Subsection {
    /// Base of this subsection's prototype-PTE slice.
    pub base: u64,
    /// First 512-byte sector of the file this subsection covers.
    pub starting_sector: u32,
    /// Number of full sectors covered.
    pub full_sector_count: u32,
    /// PTE slots available in the slice.
    pub ptes_in_subsection: u32,
}

impl Subsection {
    /// Byte offset in the file where this subsection starts.
    pub fn byte_start(&self) -> u64 {
        (self.starting_sector as u64) << SECTOR_SHIFT
    }

    /// Bytes of the file this subsection covers.
    pub fn byte_len(&self) -> u64 {
        (self.full_sector_count as u64) * SECTOR_SIZE
    }

    /// Exclusive byte end.
    pub fn byte_end(&self) -> u64 {
        self.byte_start() + self.byte_len()
    }

    pub fn covers(&self, offset: u64) -> bool {
        offset >= self.byte_start() && offset < self.byte_end()
    }
}

/// Outcome of the bounded subsection-chain walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChainStatus {
    /// Walked to a null link.
    Complete,
    /// Hit the hard chain cap; the collected prefix is kept.
    Capped,
    /// Cycle, zero-sector node, or overlapping extent; prefix kept, reads
    /// past it degrade to holes.
    Malformed,
}

/// Resolved SECTION_OBJECT_POINTERS instance. Shared: several file objects
/// (hardlinks, mapped views) may reference the same address.
#[derive(Debug, Clone, Serialize)]
pub struct SectionPointersRecord {
    pub address: u64,
    pub flags: SectionFlags,
    pub cache_map: Option<SharedCacheMapInfo>,
    pub segment: Option<SegmentInfo>,
    /// Ordered by ascending sector, non-overlapping.
    pub subsections: Vec<Subsection>,
    pub chain: ChainStatus,
}

impl SectionPointersRecord {
    /// Find the subsection covering a byte offset.
    pub fn subsection_at(&self, offset: u64) -> Option<&Subsection> {
        // Ordered and non-overlapping, so partition point is the candidate
        let idx = self
            .subsections
            .partition_point(|s| s.byte_start() <= offset);
        let candidate = self.subsections.get(idx.checked_sub(1)?)?;
        candidate.covers(offset).then_some(candidate)
    }

    /// Next extent start at or after a byte offset, if any.
    pub fn next_extent_start(&self, offset: u64) -> Option<u64> {
        self.subsections
            .iter()
            .map(Subsection::byte_start)
            .find(|&s| s >= offset)
    }

    /// Best size estimate: exact cache-manager file size when present,
    /// segment allocation size otherwise.
    pub fn file_size(&self) -> u64 {
        if let Some(scm) = &self.cache_map {
            return scm.file_size;
        }
        self.segment.as_ref().map_or(0, |s| s.size_of_segment)
    }
}

/// Reconstructed FILE_OBJECT header fields.
#[derive(Debug, Clone, Serialize)]
pub struct FileObjectRecord {
    /// Final path component, empty for anonymous file objects.
    pub name: String,
    /// Full kernel path from the FileName field.
    pub path: String,
    /// Logical byte size of the backing file.
    pub size: u64,
    /// Address of the shared SectionPointersRecord, looked up in the cache
    /// rather than owned here.
    pub section_pointers: Option<u64>,
}

impl FileObjectRecord {
    pub fn leaf_name(path: &str) -> String {
        path.rsplit(['\\', '/'])
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

/// Why a resolution was abandoned; memoized so repeat queries within a
/// generation do not re-walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// Nothing recognizable at the address.
    NotFound,
    /// Failed a plausibility check partway through.
    Malformed,
}

/// A cache slot's payload.
#[derive(Debug, Clone, Serialize)]
pub enum ObjectRecord {
    File(FileObjectRecord),
    SectionPointers(SectionPointersRecord),
    /// Sentinel recorded when resolution failed.
    ResolveFailed(FailureKind),
}

impl ObjectRecord {
    pub fn object_type(&self) -> ObjectType {
        match self {
            ObjectRecord::File(_) | ObjectRecord::ResolveFailed(_) => ObjectType::File,
            ObjectRecord::SectionPointers(_) => ObjectType::SectionPointers,
        }
    }

    pub fn as_file(&self) -> Option<&FileObjectRecord> {
        match self {
            ObjectRecord::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_section_pointers(&self) -> Option<&SectionPointersRecord> {
        match self {
            ObjectRecord::SectionPointers(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subsections(layout: &[(u32, u32)]) -> Vec<Subsection> {
        layout
            .iter()
            .map(|&(start, count)| Subsection {
                base: 0xFFFF_8000_0000_0000 + u64::from(start) * 8,
                starting_sector: start,
                full_sector_count: count,
                ptes_in_subsection: count.div_ceil(8),
            })
            .collect()
    }

    fn record(layout: &[(u32, u32)]) -> SectionPointersRecord {
        SectionPointersRecord {
            address: 0xFFFF_8000_0000_2000,
            flags: SectionFlags::default().with_user_mapping(),
            cache_map: None,
            segment: None,
            subsections: subsections(layout),
            chain: ChainStatus::Complete,
        }
    }

    #[test]
    fn test_subsection_byte_ranges() {
        let s = Subsection {
            base: 0,
            starting_sector: 2,
            full_sector_count: 3,
            ptes_in_subsection: 1,
        };
        assert_eq!(s.byte_start(), 1024);
        assert_eq!(s.byte_len(), 1536);
        assert_eq!(s.byte_end(), 2560);
        assert!(s.covers(1024));
        assert!(s.covers(2559));
        assert!(!s.covers(2560));
    }

    #[test]
    fn test_subsection_lookup_by_offset() {
        let rec = record(&[(0, 2), (2, 3)]);

        assert_eq!(rec.subsection_at(0).unwrap().starting_sector, 0);
        assert_eq!(rec.subsection_at(1023).unwrap().starting_sector, 0);
        assert_eq!(rec.subsection_at(1024).unwrap().starting_sector, 2);
        assert_eq!(rec.subsection_at(2559).unwrap().starting_sector, 2);
        assert!(rec.subsection_at(2560).is_none());
    }

    #[test]
    fn test_subsection_lookup_in_gap() {
        // Sectors 4..8 unmapped between the two extents
        let rec = record(&[(0, 4), (8, 4)]);

        assert!(rec.subsection_at(4 * 512).is_none());
        assert_eq!(rec.next_extent_start(4 * 512), Some(8 * 512));
        assert_eq!(rec.next_extent_start(9 * 512), None);
    }

    #[test]
    fn test_file_size_prefers_cache_map() {
        let mut rec = record(&[(0, 2)]);
        rec.segment = Some(SegmentInfo {
            address: 0xFFFF_8000_0000_3000,
            size_of_segment: 0x2000,
            prototype_pte_base: 0xFFFF_8000_0000_4000,
            total_ptes: 2,
        });
        assert_eq!(rec.file_size(), 0x2000);

        rec.cache_map = Some(SharedCacheMapInfo {
            address: 0xFFFF_8000_0000_5000,
            file_size: 0x1A37,
            valid_size: 0x1000,
            section_size: 0x2000,
            vacb_table: 0,
        });
        assert_eq!(rec.file_size(), 0x1A37);
    }

    #[test]
    fn test_leaf_name() {
        assert_eq!(
            FileObjectRecord::leaf_name("\\Windows\\System32\\ntdll.dll"),
            "ntdll.dll"
        );
        assert_eq!(FileObjectRecord::leaf_name("ntdll.dll"), "ntdll.dll");
        assert_eq!(FileObjectRecord::leaf_name(""), "");
    }

    #[test]
    fn test_object_type_index_round_trip() {
        assert_eq!(ObjectType::from_index(0), Some(ObjectType::File));
        assert_eq!(
            ObjectType::from_index(ObjectType::SectionPointers.as_index()),
            Some(ObjectType::SectionPointers)
        );
        assert_eq!(ObjectType::from_index(7), None);
    }
}
