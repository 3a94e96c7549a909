//! Kernel structure layout profile
//!
//! Field offsets for the kernel structures walked during discovery and
//! reconstruction. Defaults match Windows 10 x64 build 19041; individual
//! fields can be overridden from a snapshot's TOML sidecar when the target
//! build moved something.

use serde::Deserialize;

/// Offsets into FILE_OBJECT plus the type/size magic used for body-shape
/// classification. The object-header type index is cookie-obfuscated on
/// modern builds, so candidates are recognized by the leading type/size
/// pair instead.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileObjectOffsets {
    /// Expected value of the i16 type field at offset 0.
    pub type_magic: u16,
    /// Expected value of the i16 size field at offset 2.
    pub size_magic: u16,
    /// SectionObjectPointer field.
    pub section_object_pointer: u64,
    /// FileName UNICODE_STRING (length u16, max u16, pad, buffer at +8).
    pub file_name: u64,
}

impl Default for FileObjectOffsets {
    fn default() -> Self {
        Self {
            type_magic: 5,
            size_magic: 0xD8,
            section_object_pointer: 0x28,
            file_name: 0x58,
        }
    }
}

/// Offsets into SECTION_OBJECT_POINTERS.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SectionPointersOffsets {
    pub data_section_object: u64,
    pub shared_cache_map: u64,
    pub image_section_object: u64,
}

impl Default for SectionPointersOffsets {
    fn default() -> Self {
        Self {
            data_section_object: 0x00,
            shared_cache_map: 0x08,
            image_section_object: 0x10,
        }
    }
}

/// Offsets into CONTROL_AREA.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlAreaOffsets {
    pub segment: u64,
    /// FilePointer, an EX_FAST_REF (low 4 bits carry a refcount).
    pub file_pointer: u64,
    /// The first SUBSECTION immediately follows the control area.
    pub first_subsection: u64,
}

impl Default for ControlAreaOffsets {
    fn default() -> Self {
        Self {
            segment: 0x00,
            file_pointer: 0x40,
            first_subsection: 0x80,
        }
    }
}

/// Offsets into SEGMENT.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmentOffsets {
    /// Back pointer to the owning control area, used to validate the pair.
    pub control_area: u64,
    pub total_ptes: u64,
    pub size_of_segment: u64,
    pub prototype_pte: u64,
}

impl Default for SegmentOffsets {
    fn default() -> Self {
        Self {
            control_area: 0x00,
            total_ptes: 0x08,
            size_of_segment: 0x20,
            prototype_pte: 0x48,
        }
    }
}

/// Offsets into SUBSECTION.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubsectionOffsets {
    pub control_area: u64,
    /// Base of this subsection's prototype-PTE slice.
    pub subsection_base: u64,
    pub next_subsection: u64,
    pub starting_sector: u64,
    pub number_of_full_sectors: u64,
    pub ptes_in_subsection: u64,
}

impl Default for SubsectionOffsets {
    fn default() -> Self {
        Self {
            control_area: 0x00,
            subsection_base: 0x08,
            next_subsection: 0x10,
            starting_sector: 0x24,
            number_of_full_sectors: 0x28,
            ptes_in_subsection: 0x2C,
        }
    }
}

/// Offsets into SHARED_CACHE_MAP.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SharedCacheMapOffsets {
    pub file_size: u64,
    pub section_size: u64,
    pub valid_data_length: u64,
    pub vacbs: u64,
}

impl Default for SharedCacheMapOffsets {
    fn default() -> Self {
        Self {
            file_size: 0x08,
            section_size: 0x20,
            valid_data_length: 0x30,
            vacbs: 0x60,
        }
    }
}

/// Object-header geometry. Handle-table entries point at the header; the
/// object body follows it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectHeaderOffsets {
    pub body: u64,
}

impl Default for ObjectHeaderOffsets {
    fn default() -> Self {
        Self { body: 0x30 }
    }
}

/// Offsets into EPROCESS.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessOffsets {
    pub unique_process_id: u64,
    pub object_table: u64,
    pub vad_root: u64,
}

impl Default for ProcessOffsets {
    fn default() -> Self {
        Self {
            unique_process_id: 0x440,
            object_table: 0x570,
            vad_root: 0x7D8,
        }
    }
}

/// Offsets into HANDLE_TABLE and the Win8+ entry encoding shifts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandleTableOffsets {
    pub next_handle_needing_pool: u64,
    pub table_code: u64,
}

impl Default for HandleTableOffsets {
    fn default() -> Self {
        Self {
            next_handle_needing_pool: 0x00,
            table_code: 0x08,
        }
    }
}

/// OBJECT_DIRECTORY geometry: an array of hash buckets, each heading a
/// chain of OBJECT_DIRECTORY_ENTRY { chain_link, object }.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectoryOffsets {
    pub bucket_count: u64,
    pub entry_chain_link: u64,
    pub entry_object: u64,
}

impl Default for DirectoryOffsets {
    fn default() -> Self {
        Self {
            bucket_count: 37,
            entry_chain_link: 0x00,
            entry_object: 0x08,
        }
    }
}

/// Offsets into MMVAD (full) nodes and the embedded RTL_BALANCED_NODE.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadOffsets {
    pub left_child: u64,
    pub right_child: u64,
    pub flags: u64,
    pub subsection: u64,
}

impl Default for VadOffsets {
    fn default() -> Self {
        Self {
            left_child: 0x00,
            right_child: 0x08,
            flags: 0x30,
            subsection: 0x48,
        }
    }
}

/// Complete offset profile for one kernel build.
///
/// Deserializes from the sidecar's `[profile.*]` tables; any field left out
/// keeps its Windows 10 x64 19041 default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KernelProfile {
    pub file_object: FileObjectOffsets,
    pub section_pointers: SectionPointersOffsets,
    pub control_area: ControlAreaOffsets,
    pub segment: SegmentOffsets,
    pub subsection: SubsectionOffsets,
    pub shared_cache_map: SharedCacheMapOffsets,
    pub object_header: ObjectHeaderOffsets,
    pub process: ProcessOffsets,
    pub handle_table: HandleTableOffsets,
    pub directory: DirectoryOffsets,
    pub vad: VadOffsets,
}

impl KernelProfile {
    /// EX_FAST_REF pointers keep a refcount in the low 4 bits.
    pub fn strip_fast_ref(ptr: u64) -> u64 {
        ptr & !0xF
    }
}
