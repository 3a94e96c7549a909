//! Mock memory source
//!
//! Sparse virtual and physical planes for tests. Anything not explicitly
//! written is unreadable, which doubles as the corruption-injection
//! mechanism: leave a node out and the walk over it must degrade, not die.

use super::{MemorySource, ProcessContext};
use anyhow::{bail, Result};

struct Span {
    base: u64,
    data: Vec<u8>,
}

impl Span {
    fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.data.len() as u64
    }
}

/// Test source with independent virtual and physical address spaces.
#[derive(Default)]
pub struct MockMemorySource {
    virt: Vec<Span>,
    phys: Vec<Span>,
}

impl MockMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place bytes at a virtual address. Later writes shadow earlier ones.
    pub fn write_virtual(&mut self, address: u64, data: &[u8]) {
        self.virt.insert(
            0,
            Span {
                base: address,
                data: data.to_vec(),
            },
        );
    }

    /// Place bytes at a physical address.
    pub fn write_physical(&mut self, address: u64, data: &[u8]) {
        self.phys.insert(
            0,
            Span {
                base: address,
                data: data.to_vec(),
            },
        );
    }

    fn read_plane(plane: &[Span], address: u64, len: usize) -> Result<Vec<u8>> {
        let span = plane
            .iter()
            .find(|s| s.contains(address))
            .ok_or_else(|| anyhow::anyhow!("no data mapped at {:#x}", address))?;

        let offset = (address - span.base) as usize;
        let available = span.data.len() - offset;
        let take = len.min(available);
        Ok(span.data[offset..offset + take].to_vec())
    }
}

impl MemorySource for MockMemorySource {
    fn read_virtual(&self, _ctx: ProcessContext, address: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            bail!("zero-length read at {:#x}", address);
        }
        Self::read_plane(&self.virt, address, len)
    }

    fn read_physical(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            bail!("zero-length read at {:#x}", address);
        }
        Self::read_plane(&self.phys, address, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_address_fails() {
        let mock = MockMemorySource::new();
        assert!(mock
            .read_virtual(ProcessContext::Kernel, 0xFFFF_8000_0000_0000, 8)
            .is_err());
        assert!(mock.read_physical(0x1000, 8).is_err());
    }

    #[test]
    fn test_partial_read_at_span_end() {
        let mut mock = MockMemorySource::new();
        mock.write_virtual(0xFFFF_8000_0000_1000, &[1, 2, 3, 4]);

        let got = mock
            .read_virtual(ProcessContext::Kernel, 0xFFFF_8000_0000_1002, 16)
            .unwrap();
        assert_eq!(got, vec![3, 4]);
    }

    #[test]
    fn test_later_write_shadows_earlier() {
        let mut mock = MockMemorySource::new();
        mock.write_virtual(0xFFFF_8000_0000_1000, &[0xAA; 4]);
        mock.write_virtual(0xFFFF_8000_0000_1000, &[0xBB; 4]);

        let got = mock
            .read_virtual(ProcessContext::Kernel, 0xFFFF_8000_0000_1000, 4)
            .unwrap();
        assert_eq!(got, vec![0xBB; 4]);
    }

    #[test]
    fn test_planes_are_independent() {
        let mut mock = MockMemorySource::new();
        mock.write_virtual(0x1000, &[1]);
        mock.write_physical(0x1000, &[2]);

        assert_eq!(
            mock.read_virtual(ProcessContext::Kernel, 0x1000, 1).unwrap(),
            vec![1]
        );
        assert_eq!(mock.read_physical(0x1000, 1).unwrap(), vec![2]);
    }
}
