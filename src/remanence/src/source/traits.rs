//! Memory source trait
//!
//! Core abstraction over the acquisition layer. Reads are partial by
//! contract: a source returns the prefix it could acquire, and only errors
//! when it could read nothing at all.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LE};

/// Opaque process identity supplied by process management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    /// Stable numeric identity (PID).
    pub pid: u32,
    /// Virtual address of the kernel process object.
    pub object: u64,
}

/// Address-space selector for virtual reads.
///
/// Every structure this subsystem walks lives in kernel space, which any
/// process's page tables resolve; the per-process variant exists for
/// sources that key translation off a specific process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessContext {
    /// Kernel address space.
    #[default]
    Kernel,
    /// A specific process's address space.
    Process(ProcessHandle),
}

/// Trait for reading memory from an acquisition backend.
pub trait MemorySource: Send + Sync {
    /// Read bytes from a virtual address. May return fewer bytes than
    /// requested when the tail of the range is unmapped; errors only when
    /// nothing at the address is readable.
    fn read_virtual(&self, ctx: ProcessContext, address: u64, len: usize) -> Result<Vec<u8>>;

    /// Read bytes from a physical address. Same partial-read contract as
    /// [`MemorySource::read_virtual`].
    fn read_physical(&self, address: u64, len: usize) -> Result<Vec<u8>>;

    /// Read a u16 from a virtual address.
    fn read_u16(&self, ctx: ProcessContext, address: u64) -> Result<u16> {
        let bytes = self.read_exact(ctx, address, 2)?;
        Ok(LE::read_u16(&bytes))
    }

    /// Read a u32 from a virtual address.
    fn read_u32(&self, ctx: ProcessContext, address: u64) -> Result<u32> {
        let bytes = self.read_exact(ctx, address, 4)?;
        Ok(LE::read_u32(&bytes))
    }

    /// Read a u64 from a virtual address.
    fn read_u64(&self, ctx: ProcessContext, address: u64) -> Result<u64> {
        let bytes = self.read_exact(ctx, address, 8)?;
        Ok(LE::read_u64(&bytes))
    }

    /// Read a pointer-sized value from a virtual address.
    fn read_ptr(&self, ctx: ProcessContext, address: u64) -> Result<u64> {
        self.read_u64(ctx, address)
    }

    /// Read exactly `len` bytes or fail; scalar accessors cannot use a
    /// partial result.
    fn read_exact(&self, ctx: ProcessContext, address: u64, len: usize) -> Result<Vec<u8>> {
        let bytes = self.read_virtual(ctx, address, len)?;
        if bytes.len() < len {
            bail!(
                "short read at {:#x}: wanted {} bytes, got {}",
                address,
                len,
                bytes.len()
            );
        }
        Ok(bytes)
    }
}
