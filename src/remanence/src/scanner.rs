//! Kernel-object discovery
//!
//! Walks the object-manager namespace, per-process handle tables, or
//! per-process VAD trees to find file-object candidates. Every walk is
//! bounded (visited sets plus hard caps) and every failure is local: an
//! unreadable or malformed branch is counted and skipped, never allowed to
//! abort the rest of the scan.

use crate::addr::is_plausible_struct_pointer;
use crate::profile::KernelProfile;
use crate::reconstruct::FileObjectReconstructor;
use crate::source::{MemorySource, ProcessContext, ProcessHandle};
use byteorder::{ByteOrder, LE};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

/// Directories visited before a namespace walk gives up.
const MAX_DIRECTORIES: usize = 0x1000;

/// Entries followed in one directory bucket chain.
const MAX_BUCKET_CHAIN: usize = 0x100;

/// Handle-table entries decoded per process.
const MAX_HANDLES: usize = 0x10000;

/// VAD nodes visited per process.
const MAX_VAD_NODES: usize = 0x10000;

/// What to walk for a given scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanScope {
    /// The global namespace plus every known process. Slow; may take a
    /// long time on a first run against a large snapshot.
    System,
    /// One process only. Bounded and fast.
    Process(ProcessHandle),
}

/// Which per-process structure supplies candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ScanSource {
    #[default]
    HandleTable,
    Vad,
}

/// Tally of one scan. `skipped > 0` means branches were unreadable and the
/// result is incomplete but still usable.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ScanReport {
    /// Candidates emitted for the first time.
    pub discovered: usize,
    /// Candidates already seen by this scan's consumer.
    pub duplicates: usize,
    /// Unreadable or malformed branches skipped over.
    pub skipped: usize,
}

impl ScanReport {
    pub fn incomplete(&self) -> bool {
        self.skipped > 0
    }

    pub fn absorb(&mut self, other: ScanReport) {
        self.discovered += other.discovered;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
    }
}

enum Candidate {
    File,
    Directory,
    Other,
    Unreadable,
}

/// Candidate discovery over one acquisition source and offset profile.
///
/// The visit callback returns whether the address was new to the caller;
/// the scanner only tallies, it never stores.
pub struct ObjectManagerScanner<'a> {
    source: &'a dyn MemorySource,
    profile: &'a KernelProfile,
}

impl<'a> ObjectManagerScanner<'a> {
    pub fn new(source: &'a dyn MemorySource, profile: &'a KernelProfile) -> Self {
        Self { source, profile }
    }

    fn emit(&self, va: u64, report: &mut ScanReport, visit: &mut dyn FnMut(u64) -> bool) {
        if visit(va) {
            report.discovered += 1;
        } else {
            report.duplicates += 1;
        }
    }

    /// Coarse classification by body shape. The object-header type index is
    /// cookie-obfuscated on modern builds, so candidates are recognized by
    /// what their first bytes look like instead.
    fn classify(&self, va: u64) -> Candidate {
        let reconstructor = FileObjectReconstructor::new(self.source, self.profile);
        if reconstructor.looks_like_file_object(va) {
            return Candidate::File;
        }

        let buckets = self.profile.directory.bucket_count as usize;
        match self
            .source
            .read_exact(ProcessContext::Kernel, va, buckets * 8)
        {
            Ok(raw) => {
                let directory_shaped = raw.chunks_exact(8).map(LE::read_u64).all(|head| {
                    head == 0 || is_plausible_struct_pointer(head)
                });
                if directory_shaped {
                    Candidate::Directory
                } else {
                    Candidate::Other
                }
            }
            Err(_) => {
                // The 4-byte probe in looks_like_file_object also failed
                // for anything we cannot read at all
                if self
                    .source
                    .read_exact(ProcessContext::Kernel, va, 4)
                    .is_err()
                {
                    Candidate::Unreadable
                } else {
                    Candidate::Other
                }
            }
        }
    }

    /// Breadth-first walk of the namespace tree from the root directory.
    pub fn scan_namespace(
        &self,
        root: u64,
        visit: &mut dyn FnMut(u64) -> bool,
    ) -> ScanReport {
        let mut report = ScanReport::default();
        let mut visited: HashSet<u64> = HashSet::new();
        let mut queue: VecDeque<u64> = VecDeque::from([root]);
        let buckets = self.profile.directory.bucket_count as usize;
        let doff = &self.profile.directory;

        while let Some(dir) = queue.pop_front() {
            if !visited.insert(dir) {
                continue;
            }
            if visited.len() > MAX_DIRECTORIES {
                tracing::warn!("namespace walk hit the directory cap");
                report.skipped += 1 + queue.len();
                break;
            }

            let heads = match self
                .source
                .read_exact(ProcessContext::Kernel, dir, buckets * 8)
            {
                Ok(raw) => raw,
                Err(_) => {
                    tracing::debug!(directory = format_args!("{dir:#x}"), "unreadable directory");
                    report.skipped += 1;
                    continue;
                }
            };

            for head in heads.chunks_exact(8).map(LE::read_u64) {
                let mut entry = head;
                let mut hops = 0;
                while entry != 0 {
                    if hops >= MAX_BUCKET_CHAIN || !is_plausible_struct_pointer(entry) {
                        report.skipped += 1;
                        break;
                    }
                    hops += 1;

                    let raw = match self.source.read_exact(ProcessContext::Kernel, entry, 0x10) {
                        Ok(raw) => raw,
                        Err(_) => {
                            tracing::debug!(
                                entry = format_args!("{entry:#x}"),
                                "unreadable directory entry"
                            );
                            report.skipped += 1;
                            break;
                        }
                    };
                    let object = LE::read_u64(&raw[doff.entry_object as usize..][..8]);
                    let next = LE::read_u64(&raw[doff.entry_chain_link as usize..][..8]);

                    if object != 0 {
                        if is_plausible_struct_pointer(object) {
                            match self.classify(object) {
                                Candidate::File => self.emit(object, &mut report, visit),
                                Candidate::Directory => queue.push_back(object),
                                Candidate::Other => {}
                                Candidate::Unreadable => report.skipped += 1,
                            }
                        } else {
                            report.skipped += 1;
                        }
                    }
                    entry = next;
                }
            }
        }
        report
    }

    /// Decode a process's handle table. Every entry that decodes to a
    /// file-object body is emitted; entries of other types are ignored.
    pub fn scan_handle_table(
        &self,
        process: ProcessHandle,
        visit: &mut dyn FnMut(u64) -> bool,
    ) -> ScanReport {
        let mut report = ScanReport::default();

        let table = match self.read_struct_pointer(process.object, self.profile.process.object_table)
        {
            Some(table) => table,
            None => {
                report.skipped += 1;
                return report;
            }
        };

        let ht = &self.profile.handle_table;
        let next_handle = self
            .source
            .read_u32(ProcessContext::Kernel, table + ht.next_handle_needing_pool)
            .unwrap_or(0);
        let code = match self
            .source
            .read_u64(ProcessContext::Kernel, table + ht.table_code)
        {
            Ok(code) => code,
            Err(_) => {
                report.skipped += 1;
                return report;
            }
        };

        let level = (code & 7) as u32;
        let base = code & !7;
        let mut budget = ((next_handle / 4) as usize).min(MAX_HANDLES);
        self.walk_table_level(base, level, &mut budget, &mut report, visit);
        report
    }

    fn walk_table_level(
        &self,
        page: u64,
        level: u32,
        budget: &mut usize,
        report: &mut ScanReport,
        visit: &mut dyn FnMut(u64) -> bool,
    ) {
        if *budget == 0 {
            return;
        }
        if !is_plausible_struct_pointer(page) || level > 2 {
            report.skipped += 1;
            return;
        }
        let raw = match self.source.read_exact(ProcessContext::Kernel, page, 0x1000) {
            Ok(raw) => raw,
            Err(_) => {
                tracing::debug!(page = format_args!("{page:#x}"), "unreadable handle-table page");
                report.skipped += 1;
                return;
            }
        };

        if level > 0 {
            for next in raw.chunks_exact(8).map(LE::read_u64) {
                if *budget == 0 {
                    return;
                }
                if next != 0 {
                    self.walk_table_level(next, level - 1, budget, report, visit);
                }
            }
            return;
        }

        // 16 bytes per entry; the object header pointer sits in bits 16..
        // of the low quadword, shifted down by 4 (Win8+ encoding)
        for entry in raw.chunks_exact(16) {
            if *budget == 0 {
                return;
            }
            *budget -= 1;
            let low = LE::read_u64(&entry[0..8]);
            if low == 0 {
                continue;
            }
            let header = 0xFFFF_0000_0000_0000u64 | ((low >> 16) << 4);
            if !is_plausible_struct_pointer(header) {
                continue;
            }
            let body = header + self.profile.object_header.body;
            if let Candidate::File = self.classify(body) {
                self.emit(body, report, visit);
            }
        }
    }

    /// Walk a process's VAD tree, following each mapped node's subsection
    /// to its control area and from there to the owning file object.
    pub fn scan_vad(
        &self,
        process: ProcessHandle,
        visit: &mut dyn FnMut(u64) -> bool,
    ) -> ScanReport {
        let mut report = ScanReport::default();

        let root = match self.read_struct_pointer(process.object, self.profile.process.vad_root) {
            Some(root) => root,
            None => {
                report.skipped += 1;
                return report;
            }
        };

        let voff = &self.profile.vad;
        let mut visited: HashSet<u64> = HashSet::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if !visited.insert(node) || visited.len() > MAX_VAD_NODES {
                continue;
            }
            if !is_plausible_struct_pointer(node) {
                report.skipped += 1;
                continue;
            }
            let span = voff.left_child.max(voff.right_child).max(voff.subsection) as usize + 8;
            let raw = match self.source.read_exact(ProcessContext::Kernel, node, span) {
                Ok(raw) => raw,
                Err(_) => {
                    tracing::debug!(node = format_args!("{node:#x}"), "unreadable VAD node");
                    report.skipped += 1;
                    continue;
                }
            };

            for child in [
                LE::read_u64(&raw[voff.left_child as usize..][..8]),
                LE::read_u64(&raw[voff.right_child as usize..][..8]),
            ] {
                if child != 0 {
                    stack.push(child);
                }
            }

            let subsection = LE::read_u64(&raw[voff.subsection as usize..][..8]);
            if subsection == 0 {
                continue;
            }
            match self.file_behind_subsection(subsection) {
                Some(file) => self.emit(file, &mut report, visit),
                None => report.skipped += 1,
            }
        }
        report
    }

    /// subsection -> control area -> FilePointer (EX_FAST_REF) -> body.
    fn file_behind_subsection(&self, subsection: u64) -> Option<u64> {
        let ca = self.read_struct_pointer(subsection, self.profile.subsection.control_area)?;
        let fast_ref = self
            .source
            .read_u64(
                ProcessContext::Kernel,
                ca + self.profile.control_area.file_pointer,
            )
            .ok()?;
        let file = KernelProfile::strip_fast_ref(fast_ref);
        if !is_plausible_struct_pointer(file) {
            return None;
        }
        let reconstructor = FileObjectReconstructor::new(self.source, self.profile);
        reconstructor.looks_like_file_object(file).then_some(file)
    }

    fn read_struct_pointer(&self, base: u64, offset: u64) -> Option<u64> {
        if !is_plausible_struct_pointer(base) {
            return None;
        }
        let value = self
            .source
            .read_u64(ProcessContext::Kernel, base + offset)
            .ok()?;
        is_plausible_struct_pointer(value).then_some(value)
    }
}
