//! Unknown-value search: an initial pass records every aligned slot's
//! current value, later passes keep the slots whose change satisfies a
//! comparison condition.

use anyhow::Result;
use log::{Level, debug, log_enabled, warn};
use rayon::prelude::*;

use super::batch_reader::{cluster_addresses, parallel_batch_read};
use super::manager::PAGE_SIZE;
use super::scanner::{ScanOptions, ScanOutcome, ScanProgress};
use crate::accessor::MemoryAccessor;
use crate::search::store::MatchRecord;
use crate::search::types::{FuzzyCondition, MatchKind, MemoryRange, ValueType};

/// Records every `width`-aligned slot across the ranges as a fuzzy
/// match. Same chunk loop, failure accounting and boundary carry as the
/// pattern scanner; the sink receives one batch per chunk.
pub fn unknown_initial_scan<C, S>(
    accessor: &dyn MemoryAccessor,
    ranges: &[MemoryRange],
    value_type: ValueType,
    width: usize,
    options: &ScanOptions,
    check_cancelled: &C,
    sink: &mut S,
) -> Result<ScanOutcome>
where
    C: Fn() -> bool,
    S: FnMut(Vec<MatchRecord>, &ScanProgress) -> Result<()>,
{
    let page_mask = !(*PAGE_SIZE as u64 - 1);
    let valid: Vec<MemoryRange> = ranges.iter().copied().filter(MemoryRange::is_valid).collect();
    let total_bytes: u64 = valid
        .iter()
        .map(|r| r.end.saturating_sub(r.start & page_mask))
        .sum();

    let mut progress = ScanProgress {
        regions_done: 0,
        total_regions: valid.len(),
        bytes_scanned: 0,
        total_bytes,
        matches_so_far: 0,
    };
    let mut outcome = ScanOutcome {
        total_found: 0,
        regions_done: 0,
        cancelled: false,
    };

    let mut chunk_buffer = vec![0u8; options.chunk_size];
    let mut carry: Vec<u8> = Vec::with_capacity(width.saturating_sub(1));

    for range in &valid {
        carry.clear();
        let mut consecutive_failures = 0u32;
        let mut current = range.start & page_mask;

        while current < range.end {
            if check_cancelled() {
                outcome.cancelled = true;
                return Ok(outcome);
            }

            let chunk_end = (current + options.chunk_size as u64).min(range.end);
            let chunk_len = (chunk_end - current) as usize;

            match accessor.read(current, &mut chunk_buffer[..chunk_len]) {
                Ok(()) => {
                    consecutive_failures = 0;
                    let records = record_window(
                        &carry,
                        &chunk_buffer[..chunk_len],
                        current,
                        range,
                        value_type,
                        width,
                    );

                    let keep = width.saturating_sub(1).min(chunk_len);
                    carry.clear();
                    carry.extend_from_slice(&chunk_buffer[chunk_len - keep..chunk_len]);

                    progress.bytes_scanned += chunk_len as u64;
                    progress.matches_so_far += records.len() as u64;
                    outcome.total_found = progress.matches_so_far;
                    sink(records, &progress)?;
                }
                Err(error) => {
                    if log_enabled!(Level::Debug) {
                        warn!(
                            "Failed to read chunk 0x{:X} - 0x{:X}: {:?}",
                            current, chunk_end, error
                        );
                    }
                    consecutive_failures += 1;
                    carry.clear();
                    progress.bytes_scanned += chunk_len as u64;
                    sink(Vec::new(), &progress)?;

                    if consecutive_failures > options.failed_page_threshold {
                        debug!(
                            "Abandoning region 0x{:X} - 0x{:X} after {} consecutive read failures",
                            range.start, range.end, consecutive_failures
                        );
                        progress.bytes_scanned += range.end.saturating_sub(chunk_end);
                        break;
                    }
                }
            }

            current = chunk_end;
        }

        progress.regions_done += 1;
        outcome.regions_done = progress.regions_done;
    }

    Ok(outcome)
}

/// Every aligned slot fully inside the window and the range. Slots
/// wholly inside the previous chunk were recorded there; a slot that
/// starts in the carry always extends into the new chunk, so nothing is
/// recorded twice.
fn record_window(
    carry: &[u8],
    chunk: &[u8],
    chunk_addr: u64,
    range: &MemoryRange,
    value_type: ValueType,
    width: usize,
) -> Vec<MatchRecord> {
    let stitched: Vec<u8>;
    let (window, base_addr): (&[u8], u64) = if carry.is_empty() {
        (chunk, chunk_addr)
    } else {
        let mut buf = Vec::with_capacity(carry.len() + chunk.len());
        buf.extend_from_slice(carry);
        buf.extend_from_slice(chunk);
        stitched = buf;
        (stitched.as_slice(), chunk_addr - carry.len() as u64)
    };

    if window.len() < width {
        return Vec::new();
    }

    let first_addr = {
        let lower = base_addr.max(range.start);
        let rem = lower % width as u64;
        if rem == 0 { lower } else { lower + width as u64 - rem }
    };
    if first_addr < base_addr {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut offset = (first_addr - base_addr) as usize;
    let mut addr = first_addr;
    while offset + width <= window.len() && addr + width as u64 <= range.end {
        out.push(MatchRecord::from_bytes(
            addr,
            &window[offset..offset + width],
            value_type,
            MatchKind::Fuzzy,
        ));
        offset += width;
        addr += width as u64;
    }
    out
}

/// Re-reads every stored slot and keeps the records whose old-to-new
/// change satisfies `condition`, snapshotting the new value. Survivors
/// keep store insertion order; dropped reads count as non-matches.
pub fn condition_refine<C, P>(
    accessor: &dyn MemoryAccessor,
    records: &[MatchRecord],
    condition: FuzzyCondition,
    check_cancelled: &C,
    on_processed: &P,
) -> Result<Vec<MatchRecord>>
where
    C: Fn() -> bool + Sync,
    P: Fn(usize) + Sync,
{
    if records.is_empty() {
        return Ok(Vec::new());
    }

    let items: Vec<(u64, usize)> = records
        .iter()
        .map(|r| {
            (
                r.address,
                r.value_type().fixed_width().unwrap_or(4).min(8),
            )
        })
        .collect();
    let batches = cluster_addresses(&items);

    if log_enabled!(Level::Debug) {
        debug!(
            "Condition refine: {} items in {} batches ({:.1} items/batch)",
            items.len(),
            batches.len(),
            items.len() as f64 / batches.len() as f64
        );
    }

    let mut reads =
        parallel_batch_read(accessor, &batches, on_processed, Some(check_cancelled))?;
    // Batch results arrive in rayon task order; restore storage order so
    // survivor positions stay deterministic.
    reads.sort_unstable_by_key(|(index, _)| *index);

    let survivors: Vec<MatchRecord> = reads
        .into_par_iter()
        .filter_map(|(index, bytes)| {
            let record = &records[index];
            if record.matches_condition(&bytes, condition) {
                Some(record.with_new_value(&bytes))
            } else {
                None
            }
        })
        .collect();

    if log_enabled!(Level::Debug) {
        debug!(
            "Condition refine: {} -> {} records",
            records.len(),
            survivors.len()
        );
    }
    Ok(survivors)
}
