//! Synthetic VFS entries
//!
//! The sole seam toward the external VFS namespace router: each cached
//! object is presented as a tiny directory of synthetic entries — the raw
//! data stream and a summary-metadata text — listable and readable by
//! (type index, address). The summary formatter doubles as the CLI lookup
//! output.

use crate::object::{ObjectRecord, ObjectType, SectionPointersRecord};
use serde::Serialize;
use std::fmt::Write;

/// Raw recovered content of the file.
pub const DATA_ENTRY: &str = "data";

/// Human-readable reconstruction summary.
pub const INFO_ENTRY: &str = "info.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsStatus {
    Ok,
    /// No such object, wrong type index, or no such entry.
    NotFound,
}

/// One synthetic listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct VfsEntry {
    pub name: &'static str,
    pub size: u64,
}

/// Populate `out` with the entries an object of this type exposes.
pub fn list(
    type_index: u32,
    address: u64,
    record: &ObjectRecord,
    sections: Option<&SectionPointersRecord>,
    out: &mut Vec<VfsEntry>,
) -> VfsStatus {
    if ObjectType::from_index(type_index) != Some(record.object_type()) {
        return VfsStatus::NotFound;
    }

    if let Some(file) = record.as_file() {
        out.push(VfsEntry {
            name: DATA_ENTRY,
            size: file.size,
        });
    }
    out.push(VfsEntry {
        name: INFO_ENTRY,
        size: format_summary(address, record, sections).len() as u64,
    });
    VfsStatus::Ok
}

/// Copy a slice of the formatted metadata text. Reading past its end
/// returns zero bytes, mirroring the data-stream contract.
pub fn read_metadata(text: &str, offset: u64, buf: &mut [u8]) -> usize {
    let bytes = text.as_bytes();
    if offset >= bytes.len() as u64 {
        return 0;
    }
    let start = offset as usize;
    let n = buf.len().min(bytes.len() - start);
    buf[..n].copy_from_slice(&bytes[start..start + n]);
    n
}

/// The `info.txt` body for one object.
pub fn format_summary(
    address: u64,
    record: &ObjectRecord,
    sections: Option<&SectionPointersRecord>,
) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "address:  {address:#x}");

    match record {
        ObjectRecord::File(file) => {
            let _ = writeln!(text, "type:     file object");
            let _ = writeln!(text, "name:     {}", file.name);
            let _ = writeln!(text, "path:     {}", file.path);
            let _ = writeln!(text, "size:     {} bytes", file.size);
            match file.section_pointers {
                Some(sop) => {
                    let _ = writeln!(text, "sections: {sop:#x}");
                }
                None => {
                    let _ = writeln!(text, "sections: none");
                }
            }
        }
        ObjectRecord::SectionPointers(own) => {
            let _ = writeln!(text, "type:     section object pointers");
            format_sections(&mut text, own);
        }
        ObjectRecord::ResolveFailed(kind) => {
            let _ = writeln!(text, "type:     file object");
            let _ = writeln!(text, "status:   resolution failed ({kind:?})");
        }
    }

    if record.as_file().is_some() {
        if let Some(sections) = sections {
            format_sections(&mut text, sections);
        }
    }
    text
}

fn format_sections(text: &mut String, sections: &SectionPointersRecord) {
    let _ = writeln!(
        text,
        "flags:    cached={} mapped={} image={}",
        sections.flags.has_cached_data(),
        sections.flags.has_user_mapping(),
        sections.flags.is_image()
    );
    if let Some(scm) = &sections.cache_map {
        let _ = writeln!(
            text,
            "cache:    map={:#x} file_size={} valid={} section={} vacbs={:#x}",
            scm.address, scm.file_size, scm.valid_size, scm.section_size, scm.vacb_table
        );
    }
    if let Some(segment) = &sections.segment {
        let _ = writeln!(
            text,
            "segment:  {:#x} size={:#x} ptes={} proto={:#x}",
            segment.address, segment.size_of_segment, segment.total_ptes, segment.prototype_pte_base
        );
    }
    let _ = writeln!(text, "chain:    {:?}", sections.chain);
    let _ = writeln!(text, "extents:  {}", sections.subsections.len());
    for sub in &sections.subsections {
        let _ = writeln!(
            text,
            "  sector {:>8}  count {:>8}  bytes {:#x}..{:#x}",
            sub.starting_sector,
            sub.full_sector_count,
            sub.byte_start(),
            sub.byte_end()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ChainStatus, FailureKind, FileObjectRecord, SectionFlags, Subsection};

    fn file_record() -> ObjectRecord {
        ObjectRecord::File(FileObjectRecord {
            name: "pagefile.sys".into(),
            path: "\\pagefile.sys".into(),
            size: 4096,
            section_pointers: Some(0xFFFF_8000_0000_2000),
        })
    }

    fn sections_record() -> SectionPointersRecord {
        SectionPointersRecord {
            address: 0xFFFF_8000_0000_2000,
            flags: SectionFlags::default().with_cached_data(),
            cache_map: None,
            segment: None,
            subsections: vec![Subsection {
                base: 0xFFFF_8000_0000_3000,
                starting_sector: 0,
                full_sector_count: 8,
                ptes_in_subsection: 1,
            }],
            chain: ChainStatus::Complete,
        }
    }

    #[test]
    fn test_file_lists_data_and_info() {
        let mut out = Vec::new();
        let status = list(0, 0x2000, &file_record(), Some(&sections_record()), &mut out);
        assert_eq!(status, VfsStatus::Ok);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].name, DATA_ENTRY);
        assert_eq!(out[0].size, 4096);
        assert_eq!(out[1].name, INFO_ENTRY);
        assert!(out[1].size > 0);
    }

    #[test]
    fn test_type_index_mismatch_is_not_found() {
        let mut out = Vec::new();
        let status = list(1, 0x2000, &file_record(), None, &mut out);
        assert_eq!(status, VfsStatus::NotFound);
        assert!(out.is_empty());
    }

    #[test]
    fn test_summary_carries_extent_table() {
        let text = format_summary(0x2000, &file_record(), Some(&sections_record()));
        assert!(text.contains("path:     \\pagefile.sys"));
        assert!(text.contains("chain:    Complete"));
        assert!(text.contains("sector        0  count        8"));
    }

    #[test]
    fn test_sentinel_summary_names_the_failure() {
        let record = ObjectRecord::ResolveFailed(FailureKind::Malformed);
        let text = format_summary(0x2000, &record, None);
        assert!(text.contains("resolution failed (Malformed)"));
    }

    #[test]
    fn test_metadata_read_window() {
        let text = "0123456789";
        let mut buf = [0u8; 4];
        assert_eq!(read_metadata(text, 0, &mut buf), 4);
        assert_eq!(&buf, b"0123");
        assert_eq!(read_metadata(text, 8, &mut buf), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(read_metadata(text, 10, &mut buf), 0);
    }
}
