//! # remanence
//!
//! Kernel-object reconstruction over captured memory - discovery, caching,
//! and file content recovery.
//!
//! This library provides functionality to:
//! - Scan the object-manager namespace, handle tables, and VAD trees for
//!   file-object candidates
//! - Rebuild file objects and their section/subsection chains from raw
//!   structure bytes, tolerating corruption
//! - Cache reconstructed objects in refcounted generations so a refresh
//!   never invalidates a reader
//! - Recover file content through prototype PTEs, zero-filling what was
//!   never resident
//! - Expose each object as a tiny synthetic directory for VFS-style access
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use remanence::{KernelProfile, ObjectMap, ReadFlags};
//!
//! # fn open_source() -> Arc<dyn remanence::MemorySource> { unimplemented!() }
//! # fn main() -> anyhow::Result<()> {
//! let source = open_source();
//! let map = ObjectMap::new(source, KernelProfile::default(), Some(0xFFFF_8000_1234_0000), vec![]);
//! let report = map.initialize()?;
//! println!("{} objects, {} branches skipped", report.discovered, report.skipped);
//!
//! for handle in map.cache().snapshot() {
//!     if let Some(file) = handle.record().as_file() {
//!         let mut buf = vec![0u8; file.size as usize];
//!         let outcome = map.read(&handle, 0, &mut buf, ReadFlags::default());
//!         println!("{}: {} bytes ({} zero-filled)", file.path, outcome.bytes, outcome.gap_bytes);
//!     }
//!     handle.release();
//! }
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod cache;
pub mod map;
pub mod object;
pub mod profile;
pub mod reader;
pub mod reconstruct;
pub mod scanner;
pub mod source;
pub mod vfs;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{ObjectCache, ObjectHandle, Snapshot};
pub use map::ObjectMap;
pub use object::{
    ChainStatus, FailureKind, FileObjectRecord, ObjectRecord, ObjectType, SectionFlags,
    SectionPointersRecord, Subsection,
};
pub use profile::KernelProfile;
pub use reader::{FileDataReader, ReadFlags, ReadOutcome};
pub use reconstruct::{FileObjectReconstructor, ResolveError};
pub use scanner::{ObjectManagerScanner, ScanReport, ScanScope, ScanSource};
pub use source::{MemorySource, ProcessContext, ProcessHandle};
pub use vfs::{VfsEntry, VfsStatus, DATA_ENTRY, INFO_ENTRY};
