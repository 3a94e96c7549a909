//! Raw snapshot transport
//!
//! Memory source over a raw physical memory image: the file is mapped once,
//! a run table relocates physical ranges to file offsets, and virtual reads
//! go through a 4-level x64 table walk rooted at the sidecar's dtb.

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LE};
use memmap2::Mmap;
use remanence::{KernelProfile, MemorySource, ProcessContext, ProcessHandle};
use serde::Deserialize;
use std::fs::{self, File};
use std::path::Path;

const PAGE_SIZE: u64 = 0x1000;

/// TOML integers are i64, which cannot carry kernel-space addresses.
/// Address fields accept either a plain integer or a hex string.
mod addr_repr {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Int(u64),
        Text(String),
    }

    fn parse<E: serde::de::Error>(repr: Repr) -> Result<u64, E> {
        match repr {
            Repr::Int(value) => Ok(value),
            Repr::Text(text) => {
                let text = text.trim().replace('_', "");
                let (digits, radix) = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                    Some(hex) => (hex, 16),
                    None => (text.as_str(), 10),
                };
                u64::from_str_radix(digits, radix)
                    .map_err(|_| E::custom(format!("invalid address: {text}")))
            }
        }
    }

    pub fn required<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        parse(Repr::deserialize(deserializer)?)
    }

    pub fn optional<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        Option::<Repr>::deserialize(deserializer)?.map(parse).transpose()
    }
}

/// One contiguous physical range and where it sits in the image file.
#[derive(Debug, Clone, Deserialize)]
pub struct RunSpec {
    pub physical: u64,
    pub offset: u64,
    pub length: u64,
}

/// One process named by the sidecar.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessSpec {
    pub pid: u32,
    #[serde(deserialize_with = "addr_repr::required")]
    pub eprocess: u64,
    #[serde(default)]
    pub name: String,
}

/// TOML sidecar describing a snapshot: translation root, namespace root,
/// known processes, the physical run table, and structure-offset overrides.
/// An empty run table means the image is a dense dump starting at physical 0.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SnapshotMeta {
    /// Page-table root (CR3) of any kernel-mapped address space.
    #[serde(deserialize_with = "addr_repr::required")]
    pub dtb: u64,
    /// Object-manager root directory, when known.
    #[serde(deserialize_with = "addr_repr::optional")]
    pub root_directory: Option<u64>,
    #[serde(rename = "process")]
    pub processes: Vec<ProcessSpec>,
    #[serde(rename = "run")]
    pub runs: Vec<RunSpec>,
    pub profile: KernelProfile,
}

impl SnapshotMeta {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read sidecar from {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse sidecar {}", path.display()))
    }

    pub fn process_handles(&self) -> Vec<ProcessHandle> {
        self.processes
            .iter()
            .map(|p| ProcessHandle {
                pid: p.pid,
                object: p.eprocess,
            })
            .collect()
    }
}

/// Memory-mapped raw snapshot.
pub struct SnapshotFile {
    mmap: Mmap,
    runs: Vec<RunSpec>,
    dtb: u64,
}

impl SnapshotFile {
    const ENTRY_PRESENT: u64 = 1;
    const ENTRY_LARGE: u64 = 1 << 7;
    const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    pub fn open(image: &Path, meta: &SnapshotMeta) -> Result<Self> {
        let file = File::open(image)
            .with_context(|| format!("Failed to open image {}", image.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to mmap image {}", image.display()))?;

        if meta.dtb == 0 {
            bail!("sidecar does not specify a dtb; virtual reads are impossible");
        }
        let runs = if meta.runs.is_empty() {
            vec![RunSpec {
                physical: 0,
                offset: 0,
                length: mmap.len() as u64,
            }]
        } else {
            meta.runs.clone()
        };

        tracing::info!(
            image = %image.display(),
            size = mmap.len(),
            runs = runs.len(),
            dtb = format_args!("{:#x}", meta.dtb),
            "snapshot opened"
        );
        Ok(Self {
            mmap,
            runs,
            dtb: meta.dtb,
        })
    }

    /// Map a physical address to (file offset, bytes left in its run).
    fn locate(&self, pa: u64) -> Option<(usize, usize)> {
        for run in &self.runs {
            if pa >= run.physical && pa < run.physical + run.length {
                let delta = pa - run.physical;
                return Some(((run.offset + delta) as usize, (run.length - delta) as usize));
            }
        }
        None
    }

    fn table_entry(&self, table: u64, index: u64) -> Option<u64> {
        let (offset, avail) = self.locate(table + index * 8)?;
        if avail < 8 || offset + 8 > self.mmap.len() {
            return None;
        }
        let entry = LE::read_u64(&self.mmap[offset..offset + 8]);
        (entry & Self::ENTRY_PRESENT != 0).then_some(entry)
    }

    /// 4-level x64 table walk, honoring 1 GiB and 2 MiB large pages.
    fn translate(&self, va: u64) -> Option<u64> {
        let pml4e = self.table_entry(self.dtb & Self::ENTRY_ADDR_MASK, (va >> 39) & 0x1FF)?;
        let pdpte = self.table_entry(pml4e & Self::ENTRY_ADDR_MASK, (va >> 30) & 0x1FF)?;
        if pdpte & Self::ENTRY_LARGE != 0 {
            return Some((pdpte & 0x000F_FFFF_C000_0000) + (va & 0x3FFF_FFFF));
        }
        let pde = self.table_entry(pdpte & Self::ENTRY_ADDR_MASK, (va >> 21) & 0x1FF)?;
        if pde & Self::ENTRY_LARGE != 0 {
            return Some((pde & 0x000F_FFFF_FFE0_0000) + (va & 0x1F_FFFF));
        }
        let pte = self.table_entry(pde & Self::ENTRY_ADDR_MASK, (va >> 12) & 0x1FF)?;
        Some((pte & Self::ENTRY_ADDR_MASK) + (va & (PAGE_SIZE - 1)))
    }
}

impl MemorySource for SnapshotFile {
    /// Gathers page by page and stops at the first untranslatable or
    /// unbacked page, per the partial-read contract.
    fn read_virtual(&self, _ctx: ProcessContext, address: u64, len: usize) -> Result<Vec<u8>> {
        let end = address.saturating_add(len as u64);
        let mut out = Vec::with_capacity(len);
        let mut va = address;
        while va < end {
            let in_page = PAGE_SIZE - (va & (PAGE_SIZE - 1));
            let chunk = in_page.min(end - va) as usize;
            let Some(pa) = self.translate(va) else { break };
            let Ok(bytes) = self.read_physical(pa, chunk) else {
                break;
            };
            let got = bytes.len();
            out.extend_from_slice(&bytes);
            if got < chunk {
                break;
            }
            va += chunk as u64;
        }
        if out.is_empty() {
            bail!("nothing readable at {:#x}", address);
        }
        Ok(out)
    }

    fn read_physical(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let (offset, avail) = self
            .locate(address)
            .with_context(|| format!("physical address {address:#x} outside every run"))?;
        let n = len.min(avail).min(self.mmap.len().saturating_sub(offset));
        if n == 0 {
            bail!("physical address {:#x} has no backing bytes", address);
        }
        Ok(self.mmap[offset..offset + n].to_vec())
    }
}
