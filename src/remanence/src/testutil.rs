//! Byte-exact kernel-structure fixtures for tests
//!
//! Assembles FILE_OBJECT / SECTION_OBJECT_POINTERS / control-area /
//! segment / subsection / prototype-PTE / directory / handle-table / VAD
//! images on a [`MockMemorySource`], laid out per the default
//! [`KernelProfile`]. Corruption is injected either by patching a field in
//! a built block or by simply never mapping a structure an address points
//! at.

use crate::addr::{PAGE_SIZE, SECTOR_SIZE};
use crate::profile::KernelProfile;
use crate::source::{MockMemorySource, ProcessHandle};
use byteorder::{ByteOrder, LE};
use std::collections::HashMap;

/// Addresses of everything built for one mapped file.
pub struct FileFixture {
    pub file_object: u64,
    pub section_pointers: u64,
    pub control_area: u64,
    pub segment: u64,
    pub subsections: Vec<u64>,
    pub pte_bases: Vec<u64>,
}

pub struct KernelImageBuilder {
    pub mock: MockMemorySource,
    pub profile: KernelProfile,
    blocks: HashMap<u64, Vec<u8>>,
    next: u64,
    next_frame: u64,
}

impl KernelImageBuilder {
    pub fn new() -> Self {
        Self {
            mock: MockMemorySource::new(),
            profile: KernelProfile::default(),
            blocks: HashMap::new(),
            next: 0xFFFF_9000_0000_0000,
            next_frame: 0x100,
        }
    }

    fn alloc(&mut self, len: u64) -> u64 {
        let va = self.next;
        self.next += (len + 0xFF) & !0xFF;
        va
    }

    fn alloc_frame(&mut self) -> u64 {
        let frame = self.next_frame;
        self.next_frame += 1;
        frame
    }

    /// Place a block, remembering it so fields can be patched later.
    pub fn write_virtual(&mut self, va: u64, data: &[u8]) {
        self.blocks.insert(va, data.to_vec());
        self.mock.write_virtual(va, data);
    }

    pub fn write_physical(&mut self, pa: u64, data: &[u8]) {
        self.mock.write_physical(pa, data);
    }

    /// Overwrite bytes inside a previously built block and re-map it.
    fn patch(&mut self, base: u64, offset: u64, bytes: &[u8]) {
        let block = self.blocks.get_mut(&base).expect("patch target was never built");
        let offset = offset as usize;
        block[offset..offset + bytes.len()].copy_from_slice(bytes);
        let shadow = block.clone();
        self.mock.write_virtual(base, &shadow);
    }

    fn patch_u32(&mut self, base: u64, offset: u64, value: u32) {
        let mut raw = [0u8; 4];
        LE::write_u32(&mut raw, value);
        self.patch(base, offset, &raw);
    }

    fn patch_u64(&mut self, base: u64, offset: u64, value: u64) {
        let mut raw = [0u8; 8];
        LE::write_u64(&mut raw, value);
        self.patch(base, offset, &raw);
    }

    /// A bare FILE_OBJECT with a name but whatever section pointer the
    /// caller wants, including garbage.
    pub fn file_object(&mut self, path: &str, section_pointers: u64) -> u64 {
        let va = self.alloc(0xD8);
        self.file_object_at(va, path, section_pointers);
        va
    }

    fn file_object_at(&mut self, va: u64, path: &str, section_pointers: u64) {
        let fo = self.profile.file_object.clone();
        let name_field = fo.file_name;

        let buffer = if path.is_empty() {
            0
        } else {
            let units: Vec<u16> = path.encode_utf16().collect();
            let mut raw = vec![0u8; units.len() * 2];
            for (i, unit) in units.iter().enumerate() {
                LE::write_u16(&mut raw[i * 2..], *unit);
            }
            let buffer = self.alloc(raw.len() as u64);
            self.write_virtual(buffer, &raw);
            buffer
        };

        let mut block = vec![0u8; 0xD8];
        LE::write_u16(&mut block[0..], fo.type_magic);
        LE::write_u16(&mut block[2..], fo.size_magic);
        LE::write_u64(&mut block[fo.section_object_pointer as usize..], section_pointers);
        let name_len = (path.encode_utf16().count() * 2) as u16;
        LE::write_u16(&mut block[name_field as usize..], name_len);
        LE::write_u16(&mut block[name_field as usize + 2..], name_len);
        LE::write_u64(&mut block[name_field as usize + 8..], buffer);
        self.write_virtual(va, &block);
    }

    /// Full chain for one file with a single extent backed by `content`.
    pub fn mapped_file(&mut self, path: &str, content: &[u8]) -> FileFixture {
        let sectors = (content.len() as u64).div_ceil(SECTOR_SIZE) as u32;
        self.build_file(path, content.len() as u64, &[(0, sectors, content.to_vec())])
    }

    /// Full chain with one subsection per extent; each extent's backing
    /// pages are filled with its fill byte. Gaps between extents stay
    /// unbacked.
    pub fn mapped_file_extents(
        &mut self,
        path: &str,
        file_size: u64,
        extents: &[(u32, u32, u8)],
    ) -> FileFixture {
        let filled: Vec<(u32, u32, Vec<u8>)> = extents
            .iter()
            .map(|&(start, count, fill)| {
                (start, count, vec![fill; (u64::from(count) * SECTOR_SIZE) as usize])
            })
            .collect();
        self.build_file(path, file_size, &filled)
    }

    fn build_file(
        &mut self,
        path: &str,
        file_size: u64,
        extents: &[(u32, u32, Vec<u8>)],
    ) -> FileFixture {
        // Backing pages and prototype-PTE slices, one slice per extent
        let mut pte_bases = Vec::new();
        let mut pte_counts = Vec::new();
        for (_, count, data) in extents {
            let bytes = u64::from(*count) * SECTOR_SIZE;
            let pages = bytes.div_ceil(PAGE_SIZE);
            let mut ptes = vec![0u8; (pages * 8) as usize];
            for page in 0..pages {
                let frame = self.alloc_frame();
                let lo = (page * PAGE_SIZE) as usize;
                let hi = data.len().min(lo + PAGE_SIZE as usize);
                if lo < hi {
                    self.mock.write_physical(frame * PAGE_SIZE, &data[lo..hi]);
                }
                LE::write_u64(&mut ptes[(page * 8) as usize..], (frame * PAGE_SIZE) | 1);
            }
            let base = self.alloc(pages * 8);
            self.write_virtual(base, &ptes);
            pte_bases.push(base);
            pte_counts.push(pages as u32);
        }

        let ca = self.alloc(0x80 + 0x30);
        let segment = self.alloc(0x50);
        let file_object = self.alloc(0xD8);

        // Subsection chain; the first node sits right after the control area
        let ss = self.profile.subsection.clone();
        let mut subsections = Vec::new();
        for i in 0..extents.len() {
            let va = if i == 0 {
                ca + self.profile.control_area.first_subsection
            } else {
                self.alloc(0x30)
            };
            subsections.push(va);
        }
        for (i, (start, count, _)) in extents.iter().enumerate() {
            let next = subsections.get(i + 1).copied().unwrap_or(0);
            let mut block = vec![0u8; 0x30];
            LE::write_u64(&mut block[ss.control_area as usize..], ca);
            LE::write_u64(&mut block[ss.subsection_base as usize..], pte_bases[i]);
            LE::write_u64(&mut block[ss.next_subsection as usize..], next);
            LE::write_u32(&mut block[ss.starting_sector as usize..], *start);
            LE::write_u32(&mut block[ss.number_of_full_sectors as usize..], *count);
            LE::write_u32(&mut block[ss.ptes_in_subsection as usize..], pte_counts[i]);
            self.write_virtual(subsections[i], &block);
        }

        let sg = self.profile.segment.clone();
        let total_ptes: u32 = pte_counts.iter().sum();
        let mut block = vec![0u8; 0x50];
        LE::write_u64(&mut block[sg.control_area as usize..], ca);
        LE::write_u32(&mut block[sg.total_ptes as usize..], total_ptes);
        LE::write_u64(
            &mut block[sg.size_of_segment as usize..],
            u64::from(total_ptes) * PAGE_SIZE,
        );
        LE::write_u64(
            &mut block[sg.prototype_pte as usize..],
            pte_bases.first().copied().unwrap_or(0),
        );
        self.write_virtual(segment, &block);

        let caoff = self.profile.control_area.clone();
        let mut block = vec![0u8; 0x80];
        LE::write_u64(&mut block[caoff.segment as usize..], segment);
        // EX_FAST_REF: low bits carry a refcount
        LE::write_u64(&mut block[caoff.file_pointer as usize..], file_object | 0xD);
        self.write_virtual(ca, &block);

        let scmoff = self.profile.shared_cache_map.clone();
        let scm = self.alloc(0x80);
        let mut block = vec![0u8; 0x80];
        LE::write_u64(&mut block[scmoff.file_size as usize..], file_size);
        LE::write_u64(&mut block[scmoff.valid_data_length as usize..], file_size);
        LE::write_u64(
            &mut block[scmoff.section_size as usize..],
            file_size.div_ceil(PAGE_SIZE) * PAGE_SIZE,
        );
        self.write_virtual(scm, &block);

        let spoff = self.profile.section_pointers.clone();
        let sop = self.alloc(0x18);
        let mut block = vec![0u8; 0x18];
        LE::write_u64(&mut block[spoff.data_section_object as usize..], ca);
        LE::write_u64(&mut block[spoff.shared_cache_map as usize..], scm);
        self.write_virtual(sop, &block);

        self.file_object_at(file_object, path, sop);

        FileFixture {
            file_object,
            section_pointers: sop,
            control_area: ca,
            segment,
            subsections,
            pte_bases,
        }
    }

    /// Point a subsection's next link somewhere else (cycle injection).
    pub fn relink_subsection(&mut self, node: u64, next: u64) {
        let off = self.profile.subsection.next_subsection;
        self.patch_u64(node, off, next);
    }

    pub fn corrupt_subsection_sector_count(&mut self, node: u64, count: u32) {
        let off = self.profile.subsection.number_of_full_sectors;
        self.patch_u32(node, off, count);
    }

    pub fn corrupt_segment_back_pointer(&mut self, segment: u64) {
        let off = self.profile.segment.control_area;
        self.patch_u64(segment, off, 0xFFFF_8000_DEAD_0000);
    }

    /// Swap the name buffer pointer for a plausible but unmapped address.
    pub fn detach_file_name(&mut self, file_object: u64) {
        let off = self.profile.file_object.file_name + 8;
        self.patch_u64(file_object, off, 0xFFFF_F000_DEAD_0000);
    }

    /// Clear one entry of a prototype-PTE slice (page never resident).
    pub fn clear_pte(&mut self, pte_base: u64, index: u64) {
        self.patch_u64(pte_base, index * 8, 0);
    }

    /// An OBJECT_DIRECTORY whose buckets hold the given object bodies.
    /// Objects land in bucket `i % 37`, chained on collision.
    pub fn directory(&mut self, objects: &[u64]) -> u64 {
        let doff = self.profile.directory.clone();
        let buckets = doff.bucket_count as usize;
        let mut heads = vec![0u64; buckets];
        for (i, &object) in objects.iter().enumerate() {
            let entry = self.alloc(0x10);
            let mut block = vec![0u8; 0x10];
            LE::write_u64(&mut block[doff.entry_chain_link as usize..], heads[i % buckets]);
            LE::write_u64(&mut block[doff.entry_object as usize..], object);
            self.write_virtual(entry, &block);
            heads[i % buckets] = entry;
        }

        let dir = self.alloc(buckets as u64 * 8);
        let mut block = vec![0u8; buckets * 8];
        for (i, head) in heads.iter().enumerate() {
            LE::write_u64(&mut block[i * 8..], *head);
        }
        self.write_virtual(dir, &block);
        dir
    }

    /// Replace one bucket head of a built directory (corruption injection).
    pub fn corrupt_directory_bucket(&mut self, dir: u64, bucket: usize, value: u64) {
        self.patch_u64(dir, bucket as u64 * 8, value);
    }

    /// A free-standing directory entry, for splicing into a bucket.
    pub fn directory_entry(&mut self, object: u64) -> u64 {
        let doff = self.profile.directory.clone();
        let entry = self.alloc(0x10);
        let mut block = vec![0u8; 0x10];
        LE::write_u64(&mut block[doff.entry_object as usize..], object);
        self.write_virtual(entry, &block);
        entry
    }

    /// A process with a single-level handle table over the given object
    /// bodies and an optional VAD root.
    pub fn process(&mut self, pid: u32, bodies: &[u64], vad_root: u64) -> ProcessHandle {
        let header_body = self.profile.object_header.body;

        // Win8+ entry encoding: the object header pointer is carried in
        // bits 16.. shifted down by 4; the low bit is the lock bit.
        let mut page = vec![0u8; PAGE_SIZE as usize];
        for (i, &body) in bodies.iter().enumerate() {
            let header = body - header_body;
            let entry = (((header & 0x0000_FFFF_FFFF_FFFF) >> 4) << 16) | 1;
            LE::write_u64(&mut page[(i + 1) * 16..], entry);
        }
        let level0 = self.alloc(PAGE_SIZE);
        self.write_virtual(level0, &page);

        let ht = self.profile.handle_table.clone();
        let table = self.alloc(0x10);
        let mut block = vec![0u8; 0x10];
        LE::write_u32(
            &mut block[ht.next_handle_needing_pool as usize..],
            (bodies.len() as u32 + 1) * 4,
        );
        LE::write_u64(&mut block[ht.table_code as usize..], level0);
        self.write_virtual(table, &block);

        let pr = self.profile.process.clone();
        let eprocess = self.alloc(0x800);
        let mut block = vec![0u8; 0x800];
        LE::write_u64(&mut block[pr.unique_process_id as usize..], u64::from(pid));
        LE::write_u64(&mut block[pr.object_table as usize..], table);
        LE::write_u64(&mut block[pr.vad_root as usize..], vad_root);
        self.write_virtual(eprocess, &block);

        ProcessHandle {
            pid,
            object: eprocess,
        }
    }

    /// A right-leaning VAD tree with one node per subsection.
    pub fn vad_tree(&mut self, subsections: &[u64]) -> u64 {
        let voff = self.profile.vad.clone();
        let mut next_node = 0u64;
        for &subsection in subsections.iter().rev() {
            let node = self.alloc(0x60);
            let mut block = vec![0u8; 0x60];
            LE::write_u64(&mut block[voff.right_child as usize..], next_node);
            LE::write_u64(&mut block[voff.subsection as usize..], subsection);
            self.write_virtual(node, &block);
            next_node = node;
        }
        next_node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, ProcessContext};

    #[test]
    fn test_mapped_file_layout_round_trips() {
        let mut image = KernelImageBuilder::new();
        let fixture = image.mapped_file("\\a\\b.txt", &[0x42u8; 700]);

        // File object magic and section pointer land where the profile says
        let head = image
            .mock
            .read_exact(ProcessContext::Kernel, fixture.file_object, 4)
            .unwrap();
        assert_eq!(LE::read_u16(&head[0..2]), image.profile.file_object.type_magic);
        let sop = image
            .mock
            .read_u64(
                ProcessContext::Kernel,
                fixture.file_object + image.profile.file_object.section_object_pointer,
            )
            .unwrap();
        assert_eq!(sop, fixture.section_pointers);

        // Backing page carries the content through the PTE
        let pte = image
            .mock
            .read_u64(ProcessContext::Kernel, fixture.pte_bases[0])
            .unwrap();
        assert_eq!(pte & 1, 1);
        let page = image.mock.read_physical(pte & !0xFFF, 700).unwrap();
        assert_eq!(page, vec![0x42u8; 700]);
    }

    #[test]
    fn test_patch_rewrites_mapped_block() {
        let mut image = KernelImageBuilder::new();
        let fixture = image.mapped_file("\\p.txt", &[1u8; 512]);
        image.corrupt_subsection_sector_count(fixture.subsections[0], 0);

        let off = image.profile.subsection.number_of_full_sectors;
        let count = image
            .mock
            .read_u32(ProcessContext::Kernel, fixture.subsections[0] + off)
            .unwrap();
        assert_eq!(count, 0);
    }
}
