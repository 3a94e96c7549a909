//! Memory acquisition seam
//!
//! The subsystem never acquires memory itself; it consumes virtual and
//! physical read primitives through [`MemorySource`], whatever the
//! transport behind them (snapshot file, live driver, DMA).

mod traits;

#[cfg(test)]
mod mock;

pub use traits::{MemorySource, ProcessContext, ProcessHandle};

#[cfg(test)]
pub use mock::MockMemorySource;
