//! In-process fake of the accessor seam: a handful of owned byte
//! regions at fixed virtual bases, with optional fault windows and a
//! per-read delay for exercising cancellation and single-flight.

use anyhow::{Result, bail};
use std::sync::RwLock;
use std::time::Duration;

use crate::accessor::{MemoryAccessor, RegionInfo};
use crate::search::types::MemoryRange;

struct MockRegion {
    base: u64,
    data: Vec<u8>,
}

pub struct MockMemory {
    regions: RwLock<Vec<MockRegion>>,
    /// Absolute address windows where every overlapping read fails.
    faulty: RwLock<Vec<(u64, u64)>>,
    read_delay: RwLock<Option<Duration>>,
    bound: RwLock<bool>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(Vec::new()),
            faulty: RwLock::new(Vec::new()),
            read_delay: RwLock::new(None),
            bound: RwLock::new(true),
        }
    }

    /// Adds a zero-filled region and returns its range. Bases should be
    /// 64 KiB aligned so chunk page-alignment never walks below them.
    pub fn add_region(&self, base: u64, size: usize) -> MemoryRange {
        assert_eq!(base % 0x10000, 0, "test regions must be 64 KiB aligned");
        self.regions
            .write()
            .unwrap()
            .push(MockRegion { base, data: vec![0u8; size] });
        MemoryRange::new(base, base + size as u64)
    }

    pub fn poke(&self, address: u64, bytes: &[u8]) {
        self.write(address, bytes).expect("poke outside mock regions");
    }

    pub fn poke_u32(&self, address: u64, value: u32) {
        self.poke(address, &value.to_le_bytes());
    }

    /// Marks `[start, end)` as faulting for reads.
    pub fn mark_faulty(&self, start: u64, end: u64) {
        self.faulty.write().unwrap().push((start, end));
    }

    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.write().unwrap() = Some(delay);
    }

    pub fn set_bound(&self, bound: bool) {
        *self.bound.write().unwrap() = bound;
    }
}

impl MemoryAccessor for MockMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        if let Some(delay) = *self.read_delay.read().unwrap() {
            std::thread::sleep(delay);
        }
        let end = address + buf.len() as u64;
        for &(fault_start, fault_end) in self.faulty.read().unwrap().iter() {
            if address < fault_end && end > fault_start {
                bail!("mock fault at {:#x}..{:#x}", fault_start, fault_end);
            }
        }
        let regions = self.regions.read().unwrap();
        for region in regions.iter() {
            let region_end = region.base + region.data.len() as u64;
            if address >= region.base && end <= region_end {
                let offset = (address - region.base) as usize;
                buf.copy_from_slice(&region.data[offset..offset + buf.len()]);
                return Ok(());
            }
        }
        bail!("mock read outside mapped regions: {:#x}+{}", address, buf.len())
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        let end = address + data.len() as u64;
        let mut regions = self.regions.write().unwrap();
        for region in regions.iter_mut() {
            let region_end = region.base + region.data.len() as u64;
            if address >= region.base && end <= region_end {
                let offset = (address - region.base) as usize;
                region.data[offset..offset + data.len()].copy_from_slice(data);
                return Ok(());
            }
        }
        bail!("mock write outside mapped regions: {:#x}+{}", address, data.len())
    }

    fn is_process_bound(&self) -> bool {
        *self.bound.read().unwrap()
    }

    fn bound_pid(&self) -> Option<i32> {
        self.is_process_bound().then_some(4242)
    }

    fn query_regions(&self, _pid: i32) -> Result<Vec<RegionInfo>> {
        Ok(self
            .regions
            .read()
            .unwrap()
            .iter()
            .map(|region| RegionInfo {
                start: region.base,
                end: region.base + region.data.len() as u64,
                perm: "rw-p".to_string(),
                name: "[mock]".to_string(),
            })
            .collect())
    }
}
