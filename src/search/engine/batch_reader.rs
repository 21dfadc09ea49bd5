//! Clustered batch reads for refine passes.
//!
//! Refines never read per address: nearby stored addresses are merged
//! into one read request, fetched in parallel, and split back into
//! per-item values. A failed batch read falls back to individual reads
//! so one bad page does not drop a whole cluster.

use anyhow::Result;
use log::{Level, debug, log_enabled};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::accessor::MemoryAccessor;

/// Two addresses closer than one page are merged into the same batch.
const BATCH_MAX_GAP: u64 = 4096;

/// Upper bound on a single batched read.
const BATCH_MAX_SIZE: usize = 64 * 1024;

/// One contiguous-enough span of stored addresses.
#[derive(Debug)]
pub struct AddressBatch {
    start_addr: u64,
    total_size: usize,
    items: Vec<BatchItemRef>,
}

#[derive(Debug, Clone, Copy)]
struct BatchItemRef {
    /// Byte offset inside the batch buffer.
    offset: usize,
    /// Index into the caller's item list.
    item_index: usize,
    value_size: usize,
}

impl AddressBatch {
    fn new(start_addr: u64, size: usize, index: usize) -> Self {
        Self {
            start_addr,
            total_size: size,
            items: vec![BatchItemRef {
                offset: 0,
                item_index: index,
                value_size: size,
            }],
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Clusters `(address, read_size)` items into batches. Items are
/// expected mostly ascending (store insertion order); an out-of-order
/// address simply starts a new batch.
pub fn cluster_addresses(items: &[(u64, usize)]) -> Vec<AddressBatch> {
    if items.is_empty() {
        return Vec::new();
    }

    let mut batches = Vec::new();
    let mut current: Option<AddressBatch> = None;

    for (idx, &(addr, size)) in items.iter().enumerate() {
        let extended = match current.as_mut() {
            Some(batch) if addr >= batch.start_addr => {
                let batch_end = batch.start_addr + batch.total_size as u64;
                let gap = addr.saturating_sub(batch_end);
                let new_total = (addr + size as u64 - batch.start_addr) as usize;

                if gap <= BATCH_MAX_GAP && new_total <= BATCH_MAX_SIZE {
                    batch.total_size = batch.total_size.max(new_total);
                    batch.items.push(BatchItemRef {
                        offset: (addr - batch.start_addr) as usize,
                        item_index: idx,
                        value_size: size,
                    });
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        if !extended
            && let Some(prev) = current.replace(AddressBatch::new(addr, size, idx))
        {
            batches.push(prev);
        }
    }

    if let Some(batch) = current {
        batches.push(batch);
    }
    batches
}

/// Reads every batch in parallel and returns `(item_index, bytes)` for
/// each address that could be read. Cancellation is cooperative at
/// batch granularity; `on_processed` receives the cumulative item count.
pub fn parallel_batch_read<P, F>(
    accessor: &dyn MemoryAccessor,
    batches: &[AddressBatch],
    on_processed: &P,
    check_cancelled: Option<&F>,
) -> Result<Vec<(usize, Vec<u8>)>>
where
    P: Fn(usize) + Sync,
    F: Fn() -> bool + Sync,
{
    let processed = AtomicUsize::new(0);
    let cancelled = AtomicBool::new(false);

    batches
        .par_iter()
        .take_any_while(|_| {
            if cancelled.load(Ordering::Relaxed) {
                return false;
            }
            if let Some(check) = check_cancelled
                && check()
            {
                cancelled.store(true, Ordering::Relaxed);
                return false;
            }
            true
        })
        .try_fold(
            Vec::new,
            |mut acc, batch| -> Result<Vec<(usize, Vec<u8>)>> {
                let mut buffer = vec![0u8; batch.total_size];

                match accessor.read(batch.start_addr, &mut buffer) {
                    Ok(()) => {
                        for item in &batch.items {
                            let bytes = buffer[item.offset..item.offset + item.value_size].to_vec();
                            acc.push((item.item_index, bytes));
                        }
                    }
                    Err(error) => {
                        if log_enabled!(Level::Debug) {
                            debug!(
                                "Batch read failed at 0x{:X} (size {}), falling back to individual reads: {:?}",
                                batch.start_addr, batch.total_size, error
                            );
                        }
                        for item in &batch.items {
                            let mut small = vec![0u8; item.value_size];
                            let addr = batch.start_addr + item.offset as u64;
                            if accessor.read(addr, &mut small).is_ok() {
                                acc.push((item.item_index, small));
                            }
                        }
                    }
                }

                let done = processed.fetch_add(batch.items.len(), Ordering::Relaxed)
                    + batch.items.len();
                on_processed(done);
                Ok(acc)
            },
        )
        .try_reduce(Vec::new, |mut a, mut b| {
            a.append(&mut b);
            Ok(a)
        })
}
