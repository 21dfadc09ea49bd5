//! Shared progress block between the engine and its controlling client.
//!
//! The block is a fixed 32-byte little-endian layout allocated by the
//! client and registered once. The engine writes status, progress,
//! counters, heartbeat and error code; the client writes only the cancel
//! flag. Writer sets are disjoint per field, so neither side locks, and
//! no two fields are ever assumed mutually consistent.

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

/// Minimum byte length of a registered progress block.
pub const SHARED_BUFFER_SIZE: usize = 32;

/// Field offsets inside the progress block.
pub mod offsets {
    /// Session status (i32), see [`SearchStatus`](super::SearchStatus).
    pub const STATUS: usize = 0;
    /// Progress percentage (i32): 0-100.
    pub const PROGRESS: usize = 4;
    /// Regions completed so far (i32); carries processed-record counts
    /// during refine passes.
    pub const REGIONS_DONE: usize = 8;
    /// Cumulative matches found (i64).
    pub const FOUND_COUNT: usize = 12;
    /// Liveness counter (i32), bumped on every chunk tick.
    pub const HEARTBEAT: usize = 20;
    /// Cancel request flag (i32), written by the client.
    pub const CANCEL_FLAG: usize = 24;
    /// Error code (i32), valid when status is Error.
    pub const ERROR_CODE: usize = 28;
}

/// Session status as seen across the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    Idle = 0,
    Searching = 1,
    Completed = 2,
    Cancelled = 3,
    Error = 4,
}

impl SearchStatus {
    #[inline]
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(SearchStatus::Idle),
            1 => Some(SearchStatus::Searching),
            2 => Some(SearchStatus::Completed),
            3 => Some(SearchStatus::Cancelled),
            4 => Some(SearchStatus::Error),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SearchStatus::Completed | SearchStatus::Cancelled | SearchStatus::Error
        )
    }
}

/// Error code surfaced through the block when status is Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchErrorCode {
    None = 0,
    NotInitialized = 1,
    InvalidQuery = 2,
    MemoryReadFailed = 3,
    InternalError = 4,
    AlreadySearching = 5,
}

/// Engine-side handle to the client-registered progress block.
///
/// All writes are silently dropped while no block is registered; the
/// engine works headless just as well.
pub struct SharedProgressBuffer {
    ptr: AtomicPtr<u8>,
    len: AtomicUsize,
    heartbeat_counter: AtomicU32,
}

impl SharedProgressBuffer {
    pub fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
            len: AtomicUsize::new(0),
            heartbeat_counter: AtomicU32::new(0),
        }
    }

    /// Registers the client's block.
    ///
    /// # Safety
    /// The pointer must stay valid and at least `SHARED_BUFFER_SIZE`
    /// bytes long until [`clear`](Self::clear) or engine drop.
    pub fn set(&self, ptr: *mut u8, len: usize) -> bool {
        if ptr.is_null() || len < SHARED_BUFFER_SIZE {
            return false;
        }
        self.len.store(len, Ordering::SeqCst);
        self.ptr.store(ptr, Ordering::SeqCst);
        true
    }

    /// Unregisters the block; later writes become no-ops.
    pub fn clear(&self) {
        self.ptr.store(std::ptr::null_mut(), Ordering::SeqCst);
        self.len.store(0, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        !self.ptr.load(Ordering::Relaxed).is_null()
    }

    /// Zeroes the whole block. Done once at session start, before the
    /// Searching status is published.
    pub fn reset(&self) {
        let ptr = self.ptr.load(Ordering::Relaxed);
        if ptr.is_null() {
            return;
        }
        unsafe {
            std::ptr::write_bytes(ptr, 0, SHARED_BUFFER_SIZE);
        }
    }

    #[inline]
    fn write_i32(&self, offset: usize, value: i32) {
        let ptr = self.ptr.load(Ordering::Relaxed);
        if ptr.is_null() || offset + 4 > self.len.load(Ordering::Relaxed) {
            return;
        }
        unsafe {
            let dest = ptr.add(offset) as *mut i32;
            dest.write_volatile(value);
        }
    }

    #[inline]
    fn write_i64(&self, offset: usize, value: i64) {
        let ptr = self.ptr.load(Ordering::Relaxed);
        if ptr.is_null() || offset + 8 > self.len.load(Ordering::Relaxed) {
            return;
        }
        unsafe {
            // The layout places this field at a 4-byte boundary; readers
            // treat it as advisory while a scan is running.
            let dest = ptr.add(offset) as *mut i64;
            dest.write_unaligned(value);
        }
    }

    #[inline]
    fn read_i32(&self, offset: usize) -> i32 {
        let ptr = self.ptr.load(Ordering::Relaxed);
        if ptr.is_null() || offset + 4 > self.len.load(Ordering::Relaxed) {
            return 0;
        }
        unsafe {
            let src = ptr.add(offset) as *const i32;
            src.read_volatile()
        }
    }

    pub fn write_status(&self, status: SearchStatus) {
        self.write_i32(offsets::STATUS, status as i32);
    }

    pub fn write_progress(&self, progress: i32) {
        self.write_i32(offsets::PROGRESS, progress.clamp(0, 100));
    }

    pub fn write_regions_done(&self, count: i32) {
        self.write_i32(offsets::REGIONS_DONE, count);
    }

    pub fn write_found_count(&self, count: i64) {
        self.write_i64(offsets::FOUND_COUNT, count);
    }

    pub fn write_error_code(&self, code: SearchErrorCode) {
        self.write_i32(offsets::ERROR_CODE, code as i32);
    }

    pub fn update_heartbeat(&self) {
        let value = self.heartbeat_counter.fetch_add(1, Ordering::Relaxed);
        self.write_i32(offsets::HEARTBEAT, value as i32);
    }

    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.read_i32(offsets::CANCEL_FLAG) != 0
    }

    pub fn clear_cancel_flag(&self) {
        self.write_i32(offsets::CANCEL_FLAG, 0);
    }

    /// Per-tick composite update from the scan loop.
    pub fn update_search_progress(&self, progress: i32, regions_done: i32, found: i64) {
        self.write_progress(progress);
        self.write_regions_done(regions_done);
        self.write_found_count(found);
        self.update_heartbeat();
    }
}

impl Default for SharedProgressBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: the pointer is only exchanged through atomics and every field
// access is a single volatile load/store on a client-owned allocation.
unsafe impl Send for SharedProgressBuffer {}
unsafe impl Sync for SharedProgressBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Vec<u8> {
        vec![0u8; SHARED_BUFFER_SIZE]
    }

    fn read_i32_at(buf: &[u8], offset: usize) -> i32 {
        i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
    }

    fn read_i64_at(buf: &[u8], offset: usize) -> i64 {
        i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
    }

    #[test]
    fn test_rejects_null_and_short_buffers() {
        let shared = SharedProgressBuffer::new();
        assert!(!shared.set(std::ptr::null_mut(), SHARED_BUFFER_SIZE));
        let mut short = vec![0u8; SHARED_BUFFER_SIZE - 1];
        assert!(!shared.set(short.as_mut_ptr(), short.len()));
        assert!(!shared.is_initialized());
    }

    #[test]
    fn test_field_layout() {
        let mut buf = block();
        let shared = SharedProgressBuffer::new();
        assert!(shared.set(buf.as_mut_ptr(), buf.len()));

        shared.write_status(SearchStatus::Searching);
        shared.write_progress(42);
        shared.write_regions_done(7);
        shared.write_found_count(1_234_567_890_123);
        shared.write_error_code(SearchErrorCode::MemoryReadFailed);

        assert_eq!(read_i32_at(&buf, offsets::STATUS), 1);
        assert_eq!(read_i32_at(&buf, offsets::PROGRESS), 42);
        assert_eq!(read_i32_at(&buf, offsets::REGIONS_DONE), 7);
        assert_eq!(read_i64_at(&buf, offsets::FOUND_COUNT), 1_234_567_890_123);
        assert_eq!(read_i32_at(&buf, offsets::ERROR_CODE), 3);
    }

    #[test]
    fn test_progress_clamped() {
        let mut buf = block();
        let shared = SharedProgressBuffer::new();
        shared.set(buf.as_mut_ptr(), buf.len());
        shared.write_progress(150);
        assert_eq!(read_i32_at(&buf, offsets::PROGRESS), 100);
        shared.write_progress(-3);
        assert_eq!(read_i32_at(&buf, offsets::PROGRESS), 0);
    }

    #[test]
    fn test_cancel_flag_round_trip() {
        let mut buf = block();
        let shared = SharedProgressBuffer::new();
        shared.set(buf.as_mut_ptr(), buf.len());

        assert!(!shared.is_cancel_requested());
        buf[offsets::CANCEL_FLAG..offsets::CANCEL_FLAG + 4]
            .copy_from_slice(&1i32.to_le_bytes());
        assert!(shared.is_cancel_requested());
        shared.clear_cancel_flag();
        assert!(!shared.is_cancel_requested());
    }

    #[test]
    fn test_heartbeat_monotonic() {
        let mut buf = block();
        let shared = SharedProgressBuffer::new();
        shared.set(buf.as_mut_ptr(), buf.len());

        shared.update_heartbeat();
        let first = read_i32_at(&buf, offsets::HEARTBEAT);
        shared.update_heartbeat();
        shared.update_heartbeat();
        let later = read_i32_at(&buf, offsets::HEARTBEAT);
        assert_eq!(later, first + 2);
    }

    #[test]
    fn test_unregistered_writes_are_noops() {
        let shared = SharedProgressBuffer::new();
        shared.write_status(SearchStatus::Error);
        shared.write_found_count(99);
        shared.update_heartbeat();
        assert!(!shared.is_cancel_requested());
    }

    #[test]
    fn test_reset_zeroes_block() {
        let mut buf = block();
        let shared = SharedProgressBuffer::new();
        shared.set(buf.as_mut_ptr(), buf.len());
        shared.write_status(SearchStatus::Completed);
        shared.write_found_count(5);
        shared.reset();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_status_from_i32() {
        assert_eq!(SearchStatus::from_i32(0), Some(SearchStatus::Idle));
        assert_eq!(SearchStatus::from_i32(4), Some(SearchStatus::Error));
        assert_eq!(SearchStatus::from_i32(5), None);
        assert!(SearchStatus::Completed.is_terminal());
        assert!(!SearchStatus::Searching.is_terminal());
    }
}
