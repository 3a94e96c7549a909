//! Command handlers

use crate::cli::ScanVia;
use crate::snapshot::{SnapshotFile, SnapshotMeta};
use anyhow::{bail, Context, Result};
use remanence::{
    ObjectHandle, ObjectMap, ReadFlags, ScanScope, ScanSource, VfsStatus, INFO_ENTRY,
};
use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Open the image plus its sidecar and assemble the object map.
pub fn open_map(image: &Path, meta_path: Option<&Path>) -> Result<(ObjectMap, SnapshotMeta)> {
    let sidecar = match meta_path {
        Some(path) => path.to_path_buf(),
        None => image.with_extension("toml"),
    };
    let meta = SnapshotMeta::load(&sidecar)?;
    let snapshot = SnapshotFile::open(image, &meta)?;
    let map = ObjectMap::new(
        Arc::new(snapshot),
        meta.profile.clone(),
        meta.root_directory,
        meta.process_handles(),
    );
    Ok((map, meta))
}

/// Parse a hex or decimal address string.
fn parse_address(address: &str) -> Result<u64> {
    if let Some(hex) = address.strip_prefix("0x").or_else(|| address.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16).context("Invalid hex address")
    } else {
        address.parse::<u64>().context("Invalid address")
    }
}

pub fn info(map: &ObjectMap, meta: &SnapshotMeta) -> Result<()> {
    let report = map.initialize()?;

    println!("generation: {}", map.cache().generation());
    println!("objects:    {}", map.cache().len());
    println!("discovered: {}", report.discovered);
    println!("duplicates: {}", report.duplicates);
    println!("skipped:    {}", report.skipped);
    if report.incomplete() {
        eprintln!("warning: some branches were unreadable; the map is incomplete");
    }

    println!("processes:  {}", meta.processes.len());
    for process in &meta.processes {
        println!(
            "  pid {:>6}  eprocess {:#x}  {}",
            process.pid, process.eprocess, process.name
        );
    }
    Ok(())
}

pub fn scan(
    map: &ObjectMap,
    pid: Option<u32>,
    via: ScanVia,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let source = match via {
        ScanVia::Handles => ScanSource::HandleTable,
        ScanVia::Vad => ScanSource::Vad,
    };
    let scope = match pid {
        Some(pid) => {
            let process = map
                .processes()
                .iter()
                .find(|p| p.pid == pid)
                .copied()
                .with_context(|| format!("pid {pid} is not in the sidecar's process list"))?;
            ScanScope::Process(process)
        }
        None => ScanScope::System,
    };

    let (mut handles, report) = map.get_all(scope, source);
    handles.sort_by_key(ObjectHandle::address);
    let total = handles.len();
    if let Some(limit) = limit {
        for extra in handles.split_off(limit.min(total)) {
            extra.release();
        }
    }

    if json {
        let objects: Vec<_> = handles
            .iter()
            .filter_map(|handle| {
                let file = handle.record().as_file()?;
                Some(json!({
                    "address": format!("{:#x}", handle.address()),
                    "path": file.path,
                    "size": file.size,
                    "sections": file.section_pointers.map(|sop| format!("{sop:#x}")),
                }))
            })
            .collect();
        let doc = json!({
            "objects": objects,
            "total": total,
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        for handle in &handles {
            if let Some(file) = handle.record().as_file() {
                println!(
                    "{:#018x}  {:>12}  {}",
                    handle.address(),
                    file.size,
                    file.path
                );
            }
        }
        println!(
            "{} of {} objects shown ({} skipped branches)",
            handles.len(),
            total,
            report.skipped
        );
    }

    handles.into_iter().for_each(ObjectHandle::release);
    Ok(())
}

pub fn lookup(map: &ObjectMap, address: &str) -> Result<()> {
    let va = parse_address(address)?;
    let text = read_info(map, va)?;
    print!("{text}");
    Ok(())
}

pub fn ls(map: &ObjectMap, address: &str) -> Result<()> {
    let va = parse_address(address)?;
    let (type_index, entries) = list_entries(map, va)?;
    for entry in &entries {
        println!("{:>12}  {}", entry.size, entry.name);
    }
    tracing::debug!(type_index, count = entries.len(), "listed entries");
    Ok(())
}

pub fn cat(
    map: &ObjectMap,
    address: &str,
    entry: &str,
    offset: u64,
    length: Option<u64>,
    out: Option<&Path>,
) -> Result<()> {
    let va = parse_address(address)?;
    let (type_index, entries) = list_entries(map, va)?;
    let entry_size = entries
        .iter()
        .find(|e| e.name == entry)
        .map(|e| e.size)
        .with_context(|| format!("object {va:#x} has no entry named {entry:?}"))?;

    let end = match length {
        Some(length) => entry_size.min(offset.saturating_add(length)),
        None => entry_size,
    };

    let stdout = std::io::stdout();
    let mut file;
    let mut stdout_lock;
    let sink: &mut dyn Write = match out {
        Some(path) => {
            file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            &mut file
        }
        None => {
            stdout_lock = stdout.lock();
            &mut stdout_lock
        }
    };

    let mut buf = vec![0u8; 1 << 20];
    let mut pos = offset;
    while pos < end {
        let want = ((end - pos) as usize).min(buf.len());
        let (status, n) = map.vfs_read(entry, type_index, va, &mut buf[..want], pos);
        if status != VfsStatus::Ok {
            bail!("entry {entry:?} went away mid-read");
        }
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n])?;
        pos += n as u64;
    }
    sink.flush()?;
    Ok(())
}

pub fn read(map: &ObjectMap, address: &str, offset: u64, length: usize) -> Result<()> {
    let va = parse_address(address)?;
    let mut buf = vec![0u8; length];
    let outcome = map.read_from_address(va, offset, &mut buf, ReadFlags::default());
    if outcome.bytes == 0 {
        bail!("no content recovered at {va:#x} offset {offset:#x}");
    }

    println!(
        "Recovered {} bytes at {:#x} offset {:#x} ({} zero-filled):",
        outcome.bytes, va, offset, outcome.gap_bytes
    );
    for (i, chunk) in buf[..outcome.bytes].chunks(16).enumerate() {
        print!("{:08x}  ", offset as usize + i * 16);
        for (j, byte) in chunk.iter().enumerate() {
            print!("{:02x} ", byte);
            if j == 7 {
                print!(" ");
            }
        }
        if chunk.len() < 16 {
            for j in chunk.len()..16 {
                print!("   ");
                if j == 7 {
                    print!(" ");
                }
            }
        }
        print!(" |");
        for byte in chunk {
            let c = *byte as char;
            if c.is_ascii_graphic() || c == ' ' {
                print!("{}", c);
            } else {
                print!(".");
            }
        }
        println!("|");
    }
    Ok(())
}

fn list_entries(map: &ObjectMap, va: u64) -> Result<(u32, Vec<remanence::VfsEntry>)> {
    let handle = map.resolve_address(va);
    let type_index = handle.object_type().as_index();
    handle.release();

    let mut entries = Vec::new();
    if map.vfs_list(type_index, va, &mut entries) != VfsStatus::Ok {
        bail!("no object at {va:#x}");
    }
    Ok((type_index, entries))
}

fn read_info(map: &ObjectMap, va: u64) -> Result<String> {
    let (type_index, entries) = list_entries(map, va)?;
    let size = entries
        .iter()
        .find(|e| e.name == INFO_ENTRY)
        .map(|e| e.size)
        .unwrap_or(0);
    let mut buf = vec![0u8; size as usize];
    let (status, n) = map.vfs_read(INFO_ENTRY, type_index, va, &mut buf, 0);
    if status != VfsStatus::Ok {
        bail!("object at {va:#x} has no summary");
    }
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}
