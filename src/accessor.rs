//! Capability seam to the process-binding layer. The engine only ever
//! reads and writes foreign memory through this trait; production
//! implementations (driver, /proc, ptrace) live outside this crate.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One mapped region of the bound process, as enumerated by the binding
/// layer. The engine consumes regions as opaque intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub start: u64,
    pub end: u64,
    pub perm: String,
    pub name: String,
}

pub trait MemoryAccessor: Send + Sync {
    /// Reads `buf.len()` bytes at `address`. All-or-nothing: a partial
    /// read is reported as failure.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    fn write(&self, address: u64, data: &[u8]) -> Result<()>;

    /// Per-request results; one faulted address never fails the batch.
    fn batch_read(&self, addresses: &[u64], sizes: &[usize]) -> Vec<Result<Vec<u8>>> {
        addresses
            .iter()
            .zip(sizes.iter())
            .map(|(&addr, &size)| {
                let mut buf = vec![0u8; size];
                self.read(addr, &mut buf).map(|_| buf)
            })
            .collect()
    }

    fn is_process_bound(&self) -> bool;

    fn bound_pid(&self) -> Option<i32>;

    fn query_regions(&self, pid: i32) -> Result<Vec<RegionInfo>>;
}
