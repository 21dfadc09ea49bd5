//! Chunked pattern scan over a set of address ranges.
//!
//! Ranges are walked strictly in the order supplied, chunks in ascending
//! address order, so store insertion order is deterministic. A sliding
//! window carries the tail `pattern.len() - 1` bytes of each chunk into
//! the next, so matches straddling a chunk boundary are found exactly
//! once. Read failures are counted per region; past the failed-page
//! threshold the remainder of the region is abandoned without failing
//! the scan.

use anyhow::Result;
use log::{Level, debug, log_enabled, warn};

use super::manager::PAGE_SIZE;
use super::memchr_ext::MemchrExt;
use crate::accessor::MemoryAccessor;
use crate::search::store::MatchRecord;
use crate::search::types::{MatchKind, MemoryRange, ValueType};

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub chunk_size: usize,
    pub failed_page_threshold: u32,
}

/// Per-chunk progress tick handed to the sink.
#[derive(Debug, Clone, Copy)]
pub struct ScanProgress {
    pub regions_done: usize,
    pub total_regions: usize,
    pub bytes_scanned: u64,
    pub total_bytes: u64,
    pub matches_so_far: u64,
}

impl ScanProgress {
    #[inline]
    pub fn percent(&self) -> i32 {
        if self.total_bytes == 0 {
            return 100;
        }
        ((self.bytes_scanned as f64 / self.total_bytes as f64) * 100.0) as i32
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScanOutcome {
    pub total_found: u64,
    pub regions_done: usize,
    pub cancelled: bool,
}

/// Walks `ranges` in order, matching `pattern` at `align`-stepped
/// addresses (alignment judged against the absolute address). The sink
/// receives each chunk's matches together with a progress tick; a sink
/// error aborts the scan.
pub fn scan_ranges<C, S>(
    accessor: &dyn MemoryAccessor,
    ranges: &[MemoryRange],
    pattern: &[u8],
    value_type: ValueType,
    deep: bool,
    options: &ScanOptions,
    check_cancelled: &C,
    sink: &mut S,
) -> Result<ScanOutcome>
where
    C: Fn() -> bool,
    S: FnMut(Vec<MatchRecord>, &ScanProgress) -> Result<()>,
{
    let align = if deep { 1 } else { value_type.natural_alignment() };
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
    // Boundary carry: the tail pattern.len()-1 bytes of the previous
    // successfully read chunk in the current region.
    let mut carry: Vec<u8> = Vec::with_capacity(pattern.len().saturating_sub(1));

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
                    let records = scan_window(
                        &carry,
                        &chunk_buffer[..chunk_len],
                        current,
                        range,
                        pattern,
                        value_type,
                        align,
                    );

                    let keep = pattern.len().saturating_sub(1).min(chunk_len);
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
                    // A match cannot be stitched across an unreadable hole.
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

/// Matches `pattern` inside the carry-stitched window of one chunk.
///
/// Every window match ends past the carry (the carry is shorter than
/// the pattern), so matches wholly inside the previous chunk are never
/// reported twice.
fn scan_window(
    carry: &[u8],
    chunk: &[u8],
    chunk_addr: u64,
    range: &MemoryRange,
    pattern: &[u8],
    value_type: ValueType,
    align: usize,
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

    if pattern.len() > window.len() {
        return Vec::new();
    }

    let phase = (base_addr % align as u64) as usize;
    // Anchor-byte SIMD path degenerates on an all-zero pattern: nearly
    // every position becomes a candidate. Fall back to stepping then.
    let positions = if pattern.iter().any(|&b| b != 0) {
        window.find_aligned_phased(pattern, align, phase)
    } else {
        stepped_positions(window, pattern, align, phase)
    };

    positions
        .into_iter()
        .filter_map(|pos| {
            let address = base_addr + pos as u64;
            if address < range.start || address + pattern.len() as u64 > range.end {
                return None;
            }
            Some(MatchRecord::from_bytes(
                address,
                pattern,
                value_type,
                MatchKind::Exact,
            ))
        })
        .collect()
}

fn stepped_positions(window: &[u8], pattern: &[u8], align: usize, phase: usize) -> Vec<usize> {
    let align = align.max(1);
    let mut out = Vec::new();
    let mut pos = (align - phase % align) % align;
    while pos + pattern.len() <= window.len() {
        if &window[pos..pos + pattern.len()] == pattern {
            out.push(pos);
        }
        pos += align;
    }
    out
}
