//! Object map context
//!
//! The explicit top-level context callers hold instead of a process-wide
//! singleton: owns the acquisition source, the offset profile, the known
//! process list, and the object cache, and wires discovery, reconstruction,
//! reads and the VFS seam together. Everything takes `&self`; concurrent
//! queries are the expected case.

use crate::cache::{GenerationBuilder, ObjectCache, ObjectHandle};
use crate::object::{ObjectRecord, ObjectType};
use crate::profile::KernelProfile;
use crate::reader::{FileDataReader, ReadFlags, ReadOutcome};
use crate::reconstruct::FileObjectReconstructor;
use crate::scanner::{ObjectManagerScanner, ScanReport, ScanScope, ScanSource};
use crate::source::{MemorySource, ProcessHandle};
use crate::vfs::{self, VfsEntry, VfsStatus};
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

struct FullScan {
    generation: u64,
    addresses: Vec<u64>,
    report: ScanReport,
}

/// Reconstructed-object map over one memory source.
pub struct ObjectMap {
    source: Arc<dyn MemorySource>,
    profile: KernelProfile,
    root_directory: Option<u64>,
    processes: Vec<ProcessHandle>,
    cache: ObjectCache,
    /// System-wide scans memoized per generation and source; a full walk
    /// may take a long time on first run, so it runs at most once per
    /// generation.
    full_scans: Mutex<HashMap<ScanSource, FullScan>>,
}

impl ObjectMap {
    pub fn new(
        source: Arc<dyn MemorySource>,
        profile: KernelProfile,
        root_directory: Option<u64>,
        processes: Vec<ProcessHandle>,
    ) -> Self {
        Self {
            source,
            profile,
            root_directory,
            processes,
            cache: ObjectCache::new(),
            full_scans: Mutex::new(HashMap::new()),
        }
    }

    pub fn profile(&self) -> &KernelProfile {
        &self.profile
    }

    pub fn processes(&self) -> &[ProcessHandle] {
        &self.processes
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Eagerly build the first generation.
    pub fn initialize(&self) -> Result<ScanReport> {
        self.refresh()
    }

    /// Rebuild the whole population into a new generation.
    ///
    /// All-or-nothing: if the walk turns up nothing readable at all, the
    /// previous generation stays active and untouched. Handles checked out
    /// before the swap stay valid until released.
    pub fn refresh(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        self.cache.refresh(|builder| {
            let reconstructor = FileObjectReconstructor::new(self.source.as_ref(), &self.profile);
            let scanner = ObjectManagerScanner::new(self.source.as_ref(), &self.profile);
            let mut visit = |va: u64| Self::admit(&reconstructor, builder, va);

            if let Some(root) = self.root_directory {
                report.absorb(scanner.scan_namespace(root, &mut visit));
            }
            for process in &self.processes {
                report.absorb(scanner.scan_handle_table(*process, &mut visit));
            }

            if report.discovered == 0 && report.skipped > 0 {
                bail!(
                    "no readable objects, {} branches unreadable; keeping previous generation",
                    report.skipped
                );
            }
            Ok(())
        })?;

        // Memoized full scans belong to the retired generation
        self.full_scans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        tracing::info!(
            discovered = report.discovered,
            skipped = report.skipped,
            incomplete = report.incomplete(),
            "object map refreshed"
        );
        Ok(report)
    }

    /// Resolve one candidate into a generation under construction. Both
    /// successes and failures are recorded so nothing is walked twice.
    fn admit(
        reconstructor: &FileObjectReconstructor<'_>,
        builder: &mut GenerationBuilder,
        va: u64,
    ) -> bool {
        if builder.contains(va) {
            return false;
        }
        match reconstructor.resolve_file(va, |sop| {
            builder
                .get(sop)
                .and_then(ObjectRecord::as_section_pointers)
                .cloned()
        }) {
            Ok((file, fresh)) => {
                if let Some(sections) = fresh {
                    builder.insert(sections.address, ObjectRecord::SectionPointers(sections));
                }
                builder.insert(va, ObjectRecord::File(file))
            }
            Err(err) => {
                tracing::debug!(address = format_args!("{va:#x}"), %err, "resolution failed");
                builder.insert(va, ObjectRecord::ResolveFailed(err.kind()))
            }
        }
    }

    /// Pure cache lookup; does not touch the snapshot.
    pub fn lookup_by_address(&self, va: u64) -> Option<ObjectHandle> {
        self.cache.lookup(va)
    }

    /// Lookup-or-resolve. The returned handle may carry the memoized
    /// resolution-failure sentinel; repeat queries never re-walk.
    pub fn resolve_address(&self, va: u64) -> ObjectHandle {
        if let Some(handle) = self.cache.lookup(va) {
            return handle;
        }
        let reconstructor = FileObjectReconstructor::new(self.source.as_ref(), &self.profile);
        match reconstructor.resolve_file(va, |sop| {
            self.cache
                .lookup(sop)
                .and_then(|h| h.record().as_section_pointers().cloned())
        }) {
            Ok((file, fresh)) => {
                if let Some(sections) = fresh {
                    self.cache
                        .insert(sections.address, ObjectRecord::SectionPointers(sections))
                        .release();
                }
                self.cache.insert(va, ObjectRecord::File(file))
            }
            Err(err) => self.cache.insert(va, ObjectRecord::ResolveFailed(err.kind())),
        }
    }

    /// First process whose handle table references the object. Multiple
    /// associations are possible; only the first is reported.
    pub fn associated_process(&self, va: u64) -> Option<ProcessHandle> {
        let scanner = ObjectManagerScanner::new(self.source.as_ref(), &self.profile);
        for process in &self.processes {
            let mut found = false;
            scanner.scan_handle_table(*process, &mut |addr| {
                found |= addr == va;
                true
            });
            if found {
                return Some(*process);
            }
        }
        None
    }

    /// Discover and resolve file objects. System scope walks the namespace
    /// plus every known process and is memoized per generation; process
    /// scope is bounded and never memoized.
    pub fn get_all(
        &self,
        scope: ScanScope,
        source: ScanSource,
    ) -> (Vec<ObjectHandle>, ScanReport) {
        if scope == ScanScope::System {
            if let Some(memoized) = self.memoized_full_scan(source) {
                return memoized;
            }
        }

        let scanner = ObjectManagerScanner::new(self.source.as_ref(), &self.profile);
        let mut seen: HashSet<u64> = HashSet::new();
        let mut addresses: Vec<u64> = Vec::new();
        let mut report = ScanReport::default();
        {
            let mut visit = |va: u64| {
                if seen.insert(va) {
                    addresses.push(va);
                    true
                } else {
                    false
                }
            };
            let scan_process = |process: ProcessHandle, visit: &mut dyn FnMut(u64) -> bool| {
                match source {
                    ScanSource::HandleTable => scanner.scan_handle_table(process, visit),
                    ScanSource::Vad => scanner.scan_vad(process, visit),
                }
            };
            match scope {
                ScanScope::System => {
                    if let Some(root) = self.root_directory {
                        report.absorb(scanner.scan_namespace(root, &mut visit));
                    }
                    for process in &self.processes {
                        report.absorb(scan_process(*process, &mut visit));
                    }
                }
                ScanScope::Process(process) => {
                    report.absorb(scan_process(process, &mut visit));
                }
            }
        }

        let mut handles = Vec::new();
        for &va in &addresses {
            let handle = self.resolve_address(va);
            if handle.record().as_file().is_some() {
                handles.push(handle);
            } else {
                report.skipped += 1;
                handle.release();
            }
        }

        if scope == ScanScope::System {
            let mut memo = self
                .full_scans
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            memo.insert(
                source,
                FullScan {
                    generation: self.cache.generation(),
                    addresses: handles.iter().map(ObjectHandle::address).collect(),
                    report,
                },
            );
        }
        (handles, report)
    }

    fn memoized_full_scan(&self, source: ScanSource) -> Option<(Vec<ObjectHandle>, ScanReport)> {
        let memo = self
            .full_scans
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let scan = memo.get(&source)?;
        if scan.generation != self.cache.generation() {
            return None;
        }
        let handles = scan
            .addresses
            .iter()
            .filter_map(|&va| self.cache.lookup(va))
            .collect();
        Some((handles, scan.report))
    }

    /// Read file content through a checked-out handle. The shared
    /// section-pointers record is resolved within the handle's own
    /// generation, so reads through retired-generation handles keep their
    /// original extent list.
    pub fn read(
        &self,
        handle: &ObjectHandle,
        offset: u64,
        buf: &mut [u8],
        flags: ReadFlags,
    ) -> ReadOutcome {
        let Some(file) = handle.record().as_file() else {
            return ReadOutcome::default();
        };
        let sections_handle = file.section_pointers.and_then(|addr| handle.peer(addr));
        let sections = sections_handle
            .as_ref()
            .and_then(|h| h.record().as_section_pointers());
        FileDataReader::new(self.source.as_ref()).read(file, sections, offset, buf, flags)
    }

    /// Convenience: resolve-and-read straight from a raw object address,
    /// with cache lookup/insert handled transparently.
    pub fn read_from_address(
        &self,
        va: u64,
        offset: u64,
        buf: &mut [u8],
        flags: ReadFlags,
    ) -> ReadOutcome {
        let handle = self.resolve_address(va);
        let outcome = self.read(&handle, offset, buf, flags);
        handle.release();
        outcome
    }

    /// Populate a caller-supplied listing with the object's synthetic
    /// entries.
    pub fn vfs_list(&self, type_index: u32, va: u64, out: &mut Vec<VfsEntry>) -> VfsStatus {
        let handle = self.resolve_address(va);
        let sections_handle = handle
            .record()
            .as_file()
            .and_then(|f| f.section_pointers)
            .and_then(|addr| handle.peer(addr));
        vfs::list(
            type_index,
            va,
            handle.record(),
            sections_handle
                .as_ref()
                .and_then(|h| h.record().as_section_pointers()),
            out,
        )
    }

    /// Read one synthetic entry: the data stream goes through the file
    /// reader, summaries through the metadata formatter.
    pub fn vfs_read(
        &self,
        entry: &str,
        type_index: u32,
        va: u64,
        buf: &mut [u8],
        offset: u64,
    ) -> (VfsStatus, usize) {
        let handle = self.resolve_address(va);
        let record = handle.record();
        if ObjectType::from_index(type_index) != Some(record.object_type()) {
            return (VfsStatus::NotFound, 0);
        }
        match entry {
            vfs::DATA_ENTRY if record.as_file().is_some() => {
                let outcome = self.read(&handle, offset, buf, ReadFlags::default());
                (VfsStatus::Ok, outcome.bytes)
            }
            vfs::INFO_ENTRY => {
                let sections_handle = record
                    .as_file()
                    .and_then(|f| f.section_pointers)
                    .and_then(|addr| handle.peer(addr));
                let text = vfs::format_summary(
                    va,
                    record,
                    sections_handle
                        .as_ref()
                        .and_then(|h| h.record().as_section_pointers()),
                );
                (VfsStatus::Ok, vfs::read_metadata(&text, offset, buf))
            }
            _ => (VfsStatus::NotFound, 0),
        }
    }
}
