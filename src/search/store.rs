//! Match record storage: a growable in-memory buffer with mmap-backed
//! disk spillover, dense-position indexing and compacting removal.

use anyhow::{Result, anyhow};
use log::{debug, info};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::path::PathBuf;

use super::filter::ResultFilter;
use super::types::{
    ExactResultItem, FuzzyCondition, FuzzyResultItem, MatchKind, SearchResultItem, ValueType,
};

const RESULT_CACHE_FILE: &str = "memscout_results.bin";
const DISK_EXTEND_BYTES: usize = 64 * 1024 * 1024;

/// One stored match. Values are capped at 8 bytes (the widest fixed
/// type); string matches keep their leading bytes and the store records
/// the full query width per generation.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct MatchRecord {
    pub address: u64,
    pub value: [u8; 8],
    type_id: u8,
    kind: u8,
}

impl MatchRecord {
    #[inline]
    pub fn from_bytes(address: u64, bytes: &[u8], value_type: ValueType, kind: MatchKind) -> Self {
        let mut value = [0u8; 8];
        let len = bytes.len().min(8);
        value[..len].copy_from_slice(&bytes[..len]);
        MatchRecord {
            address,
            value,
            type_id: value_type.to_id() as u8,
            kind: match kind {
                MatchKind::Exact => 0,
                MatchKind::Fuzzy => 1,
            },
        }
    }

    #[inline]
    pub fn value_type(&self) -> ValueType {
        ValueType::from_id(self.type_id as i32).unwrap_or(ValueType::Auto)
    }

    #[inline]
    pub fn kind(&self) -> MatchKind {
        if self.kind == 0 { MatchKind::Exact } else { MatchKind::Fuzzy }
    }

    /// Snapshot reinterpreted as a signed integer for comparisons.
    #[inline]
    pub fn as_i64(&self) -> i64 {
        let value = self.value;
        match self.value_type() {
            ValueType::Byte => value[0] as i8 as i64,
            ValueType::Word => i16::from_le_bytes([value[0], value[1]]) as i64,
            ValueType::Qword => i64::from_le_bytes(value),
            ValueType::Float => f32::from_le_bytes([value[0], value[1], value[2], value[3]]) as i64,
            ValueType::Double => f64::from_le_bytes(value) as i64,
            // Dword, Xor, Auto and everything else compare as i32.
            _ => i32::from_le_bytes([value[0], value[1], value[2], value[3]]) as i64,
        }
    }

    #[inline]
    pub fn as_f64(&self) -> f64 {
        let value = self.value;
        match self.value_type() {
            ValueType::Byte => value[0] as i8 as f64,
            ValueType::Word => i16::from_le_bytes([value[0], value[1]]) as f64,
            ValueType::Qword => i64::from_le_bytes(value) as f64,
            ValueType::Float => f32::from_le_bytes([value[0], value[1], value[2], value[3]]) as f64,
            ValueType::Double => f64::from_le_bytes(value),
            _ => i32::from_le_bytes([value[0], value[1], value[2], value[3]]) as f64,
        }
    }

    /// Tests whether the change from this snapshot to `new_bytes`
    /// satisfies the refine condition.
    #[inline]
    pub fn matches_condition(&self, new_bytes: &[u8], condition: FuzzyCondition) -> bool {
        let vt = self.value_type();
        let new_record = MatchRecord::from_bytes(self.address, new_bytes, vt, self.kind());
        if vt.is_float_type() {
            self.matches_condition_float(&new_record, condition)
        } else {
            self.matches_condition_int(&new_record, condition)
        }
    }

    fn matches_condition_int(&self, new_record: &MatchRecord, condition: FuzzyCondition) -> bool {
        let old_val = self.as_i64();
        let new_val = new_record.as_i64();
        let diff = new_val.wrapping_sub(old_val);

        match condition {
            FuzzyCondition::Unchanged => old_val == new_val,
            FuzzyCondition::Changed => old_val != new_val,
            FuzzyCondition::Increased => new_val > old_val,
            FuzzyCondition::Decreased => new_val < old_val,
            FuzzyCondition::IncreasedBy(amount) => diff == amount,
            FuzzyCondition::DecreasedBy(amount) => diff == -amount,
            FuzzyCondition::IncreasedByRange(min, max) => diff >= min && diff <= max,
            FuzzyCondition::DecreasedByRange(min, max) => {
                let neg_diff = -diff;
                neg_diff >= min && neg_diff <= max
            }
            FuzzyCondition::IncreasedByPercent(percent) => {
                if old_val == 0 {
                    new_val > 0
                } else {
                    let threshold = (old_val as f64 * (1.0 + percent as f64)) as i64;
                    new_val >= threshold
                }
            }
            FuzzyCondition::DecreasedByPercent(percent) => {
                if old_val == 0 {
                    new_val < 0
                } else {
                    let threshold = (old_val as f64 * (1.0 - percent as f64)) as i64;
                    new_val <= threshold
                }
            }
        }
    }

    fn matches_condition_float(&self, new_record: &MatchRecord, condition: FuzzyCondition) -> bool {
        let old_val = self.as_f64();
        let new_val = new_record.as_f64();
        let diff = new_val - old_val;
        let epsilon = 1e-9;

        match condition {
            FuzzyCondition::Unchanged => (old_val - new_val).abs() < epsilon,
            FuzzyCondition::Changed => (old_val - new_val).abs() >= epsilon,
            FuzzyCondition::Increased => new_val > old_val + epsilon,
            FuzzyCondition::Decreased => new_val < old_val - epsilon,
            FuzzyCondition::IncreasedBy(amount) => (diff - amount as f64).abs() < epsilon,
            FuzzyCondition::DecreasedBy(amount) => (diff + amount as f64).abs() < epsilon,
            FuzzyCondition::IncreasedByRange(min, max) => diff >= min as f64 && diff <= max as f64,
            FuzzyCondition::DecreasedByRange(min, max) => {
                let neg_diff = -diff;
                neg_diff >= min as f64 && neg_diff <= max as f64
            }
            FuzzyCondition::IncreasedByPercent(percent) => {
                if old_val.abs() < epsilon {
                    new_val > epsilon
                } else {
                    new_val >= old_val * (1.0 + percent as f64)
                }
            }
            FuzzyCondition::DecreasedByPercent(percent) => {
                if old_val.abs() < epsilon {
                    new_val < -epsilon
                } else {
                    new_val <= old_val * (1.0 - percent as f64)
                }
            }
        }
    }

    /// Same slot with an updated snapshot, for refine survivors.
    #[inline]
    pub fn with_new_value(&self, new_bytes: &[u8]) -> Self {
        MatchRecord::from_bytes(self.address, new_bytes, self.value_type(), self.kind())
    }

    /// Public paging form, tagged with the storage position it was read
    /// from. `value_len` is the generation's query width.
    pub fn to_item(&self, position: u64, value_len: usize) -> SearchResultItem {
        let vt = self.value_type();
        let len = vt.fixed_width().unwrap_or(value_len.max(1)).min(8);
        let snapshot = self.value;
        let value = snapshot[..len].to_vec();
        match self.kind() {
            MatchKind::Exact => SearchResultItem::Exact(ExactResultItem {
                native_position: position,
                address: self.address,
                value_type: vt,
                value,
            }),
            MatchKind::Fuzzy => SearchResultItem::Fuzzy(FuzzyResultItem {
                native_position: position,
                address: self.address,
                value_type: vt,
                value,
            }),
        }
    }
}

/// Ordered match store. Grows in memory up to the configured byte budget,
/// then spills fixed-size records into an mmap-backed cache file. Every
/// mutating operation compacts; positions are dense indices from 0 and
/// are invalidated by any removal or retention call.
pub struct ResultStore {
    memory_buffer: Vec<MatchRecord>,
    memory_capacity: usize,
    cache_dir: PathBuf,
    disk_file_path: Option<PathBuf>,
    disk_file: Option<File>,
    mmap: Option<MmapMut>,
    disk_count: usize,
    total_count: usize,
    value_len: usize,
    generation: u64,
}

impl ResultStore {
    const ITEM_SIZE: usize = size_of::<MatchRecord>();

    pub fn new(memory_buffer_bytes: usize, cache_dir: PathBuf) -> Self {
        let capacity = if memory_buffer_bytes == 0 {
            0
        } else {
            memory_buffer_bytes / Self::ITEM_SIZE
        };

        if capacity == 0 {
            info!("Result store in direct disk mode, cache_dir={:?}", cache_dir);
        } else {
            info!(
                "Result store holds {} records in memory ({} KB), cache_dir={:?}",
                capacity,
                memory_buffer_bytes / 1024,
                cache_dir
            );
        }

        ResultStore {
            memory_buffer: Vec::with_capacity(capacity.min(1 << 20)),
            memory_capacity: capacity,
            cache_dir,
            disk_file_path: None,
            disk_file: None,
            mmap: None,
            disk_count: 0,
            total_count: 0,
            value_len: 0,
            generation: 0,
        }
    }

    #[inline]
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn value_len(&self) -> usize {
        self.value_len
    }

    #[inline]
    pub fn set_value_len(&mut self, len: usize) {
        self.value_len = len;
    }

    #[inline]
    pub fn memory_count(&self) -> usize {
        self.memory_buffer.len()
    }

    #[inline]
    pub fn disk_count(&self) -> usize {
        self.disk_count
    }

    /// Resets to an empty store and a new generation. Drops the cache
    /// file; a following scan starts from a clean slate.
    pub fn clear(&mut self) -> Result<()> {
        self.memory_buffer.clear();
        self.total_count = 0;
        self.value_len = 0;
        self.generation += 1;
        self.drop_disk_file()?;
        debug!("Result store cleared, generation {}", self.generation);
        Ok(())
    }

    fn drop_disk_file(&mut self) -> Result<()> {
        drop(self.mmap.take());
        drop(self.disk_file.take());
        if let Some(path) = self.disk_file_path.take()
            && path.exists()
        {
            std::fs::remove_file(&path)?;
            debug!("Removed result cache file: {:?}", path);
        }
        self.disk_count = 0;
        Ok(())
    }

    pub fn append(&mut self, record: MatchRecord) -> Result<()> {
        if self.memory_capacity == 0 || self.memory_buffer.len() >= self.memory_capacity {
            self.write_to_disk(&record)?;
        } else {
            self.memory_buffer.push(record);
        }
        self.total_count += 1;
        Ok(())
    }

    pub fn append_batch(&mut self, records: &[MatchRecord]) -> Result<()> {
        for record in records {
            self.append(*record)?;
        }
        Ok(())
    }

    fn write_to_disk(&mut self, record: &MatchRecord) -> Result<()> {
        if self.disk_file.is_none() {
            self.init_disk_file()?;
        }

        let offset = self.disk_count * Self::ITEM_SIZE;
        let mmap_size = self.mmap.as_ref().map(|m| m.len()).unwrap_or(0);

        if offset + Self::ITEM_SIZE > mmap_size {
            drop(self.mmap.take());
            let new_size = mmap_size + DISK_EXTEND_BYTES;
            let file = self
                .disk_file
                .as_ref()
                .ok_or_else(|| anyhow!("disk file handle missing during extend"))?;
            file.set_len(new_size as u64)?;
            self.mmap = Some(unsafe { MmapMut::map_mut(file)? });
        }

        let mmap = self
            .mmap
            .as_mut()
            .ok_or_else(|| anyhow!("result cache mmap missing"))?;
        unsafe {
            let ptr = mmap.as_mut_ptr().add(offset) as *mut MatchRecord;
            ptr.write_unaligned(*record);
        }
        self.disk_count += 1;
        Ok(())
    }

    fn init_disk_file(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let file_path = self.cache_dir.join(RESULT_CACHE_FILE);
        debug!("Creating result cache file: {:?}", file_path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&file_path)?;
        file.set_len(DISK_EXTEND_BYTES as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        self.disk_file_path = Some(file_path);
        self.disk_file = Some(file);
        self.mmap = Some(mmap);
        info!(
            "Result cache file initialized with size {} MB",
            DISK_EXTEND_BYTES / 1024 / 1024
        );
        Ok(())
    }

    /// Raw page over storage order, no filter.
    pub fn get(&self, start: usize, size: usize) -> Result<Vec<MatchRecord>> {
        if start >= self.total_count {
            return Ok(Vec::new());
        }
        let end = std::cmp::min(start + size, self.total_count);
        let mut results = Vec::with_capacity(end - start);
        let memory_len = self.memory_buffer.len();

        if start < memory_len {
            let memory_end = end.min(memory_len);
            results.extend_from_slice(&self.memory_buffer[start..memory_end]);
        }

        if end > memory_len {
            let disk_start = start.saturating_sub(memory_len);
            let disk_end = end - memory_len;
            if disk_end <= self.disk_count
                && let Some(ref mmap) = self.mmap
            {
                let count = disk_end - disk_start;
                let src_offset = disk_start * Self::ITEM_SIZE;
                results.reserve(count);
                unsafe {
                    let src = mmap.as_ptr().add(src_offset) as *const MatchRecord;
                    let dst_start = results.len();
                    results.set_len(dst_start + count);
                    std::ptr::copy_nonoverlapping(src, results.as_mut_ptr().add(dst_start), count);
                }
            }
        }

        Ok(results)
    }

    pub fn get_all(&self) -> Result<Vec<MatchRecord>> {
        self.get(0, self.total_count)
    }

    /// Filtered page: walks storage in order, skipping records the
    /// filter rejects, and tags every returned record with its storage
    /// position. `offset`/`count` are view-relative.
    pub fn get_view(
        &self,
        filter: &ResultFilter,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(u64, MatchRecord)>> {
        if filter.is_empty() {
            let page = self.get(offset, count)?;
            return Ok(page
                .into_iter()
                .enumerate()
                .map(|(i, record)| ((offset + i) as u64, record))
                .collect());
        }

        const WALK_PAGE: usize = 8192;
        let mut out = Vec::with_capacity(count.min(WALK_PAGE));
        let mut skipped = 0usize;
        let mut pos = 0usize;

        while pos < self.total_count && out.len() < count {
            let page = self.get(pos, WALK_PAGE.min(self.total_count - pos))?;
            if page.is_empty() {
                break;
            }
            for (i, record) in page.iter().enumerate() {
                let address = record.address;
                if !filter.matches(address, record.value_type()) {
                    continue;
                }
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                out.push(((pos + i) as u64, *record));
                if out.len() == count {
                    break;
                }
            }
            pos += page.len();
        }

        Ok(out)
    }

    /// Record count the current filter exposes.
    pub fn view_count(&self, filter: &ResultFilter) -> Result<usize> {
        if filter.is_empty() {
            return Ok(self.total_count);
        }

        const WALK_PAGE: usize = 8192;
        let mut n = 0usize;
        let mut pos = 0usize;
        while pos < self.total_count {
            let page = self.get(pos, WALK_PAGE.min(self.total_count - pos))?;
            if page.is_empty() {
                break;
            }
            for record in &page {
                let address = record.address;
                if filter.matches(address, record.value_type()) {
                    n += 1;
                }
            }
            pos += page.len();
        }
        Ok(n)
    }

    /// Replaces the whole content, keeping the current generation's
    /// width. Used by refine passes; positions are renumbered densely.
    pub fn replace_all(&mut self, results: Vec<MatchRecord>) -> Result<()> {
        self.memory_buffer.clear();
        self.total_count = 0;
        self.disk_count = 0;

        if results.is_empty() {
            self.drop_disk_file()?;
            return Ok(());
        }

        let total = results.len();
        if self.memory_capacity > 0 && total <= self.memory_capacity {
            self.drop_disk_file()?;
            self.memory_buffer = results;
            self.total_count = total;
            return Ok(());
        }

        let mut results = results;
        if self.memory_capacity == 0 {
            if self.disk_file.is_none() {
                self.init_disk_file()?;
            }
            self.write_batch_to_disk(&results)?;
        } else {
            let disk_part: Vec<MatchRecord> = results.drain(self.memory_capacity..).collect();
            self.memory_buffer = results;
            if self.disk_file.is_none() {
                self.init_disk_file()?;
            }
            self.write_batch_to_disk(&disk_part)?;
        }
        self.total_count = total;
        Ok(())
    }

    fn write_batch_to_disk(&mut self, records: &[MatchRecord]) -> Result<()> {
        if records.is_empty() {
            self.disk_count = 0;
            return Ok(());
        }

        let required = records.len() * Self::ITEM_SIZE;
        let current = self.mmap.as_ref().map(|m| m.len()).unwrap_or(0);
        if required > current {
            drop(self.mmap.take());
            let new_size = required.div_ceil(DISK_EXTEND_BYTES) * DISK_EXTEND_BYTES;
            let file = self
                .disk_file
                .as_ref()
                .ok_or_else(|| anyhow!("disk file handle missing during batch write"))?;
            file.set_len(new_size as u64)?;
            self.mmap = Some(unsafe { MmapMut::map_mut(file)? });
        }

        let mmap = self
            .mmap
            .as_mut()
            .ok_or_else(|| anyhow!("result cache mmap missing"))?;
        unsafe {
            let dst = mmap.as_mut_ptr() as *mut MatchRecord;
            std::ptr::copy_nonoverlapping(records.as_ptr(), dst, records.len());
        }
        self.disk_count = records.len();
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<()> {
        if index >= self.total_count {
            return Err(anyhow!("index out of bounds: {} >= {}", index, self.total_count));
        }

        if index < self.memory_buffer.len() {
            self.memory_buffer.remove(index);
        } else {
            let disk_index = index - self.memory_buffer.len();
            self.remove_disk_range(disk_index)?;
        }
        self.total_count -= 1;
        debug!("Removed result at {}, total {}", index, self.total_count);
        Ok(())
    }

    fn remove_disk_range(&mut self, disk_index: usize) -> Result<()> {
        if disk_index >= self.disk_count {
            return Err(anyhow!("disk index out of bounds"));
        }
        if let Some(ref mut mmap) = self.mmap {
            let move_count = self.disk_count - disk_index - 1;
            if move_count > 0 {
                unsafe {
                    let src = mmap.as_ptr().add((disk_index + 1) * Self::ITEM_SIZE);
                    let dst = mmap.as_mut_ptr().add(disk_index * Self::ITEM_SIZE);
                    std::ptr::copy(src, dst, move_count * Self::ITEM_SIZE);
                }
            }
            self.disk_count -= 1;
        }
        Ok(())
    }

    /// Batch removal with in-place compaction. Indices are storage
    /// positions; survivors are renumbered densely from 0.
    pub fn remove_batch(&mut self, mut indices: Vec<usize>) -> Result<()> {
        if indices.is_empty() {
            return Ok(());
        }

        indices.sort_unstable();
        indices.dedup();
        indices.retain(|&idx| idx < self.total_count);
        if indices.is_empty() {
            return Ok(());
        }

        let delete_count = indices.len();
        let memory_len = self.memory_buffer.len();
        let (memory_indices, disk_indices): (Vec<usize>, Vec<usize>) =
            indices.into_iter().partition(|&idx| idx < memory_len);

        if !memory_indices.is_empty() {
            self.remove_memory_batch(&memory_indices);
        }
        if !disk_indices.is_empty() {
            let adjusted: Vec<usize> = disk_indices.iter().map(|&idx| idx - memory_len).collect();
            self.remove_disk_batch(&adjusted)?;
        }

        self.total_count -= delete_count;
        debug!("Batch removed {} results, total {}", delete_count, self.total_count);
        Ok(())
    }

    fn remove_memory_batch(&mut self, sorted_indices: &[usize]) {
        if sorted_indices.is_empty() || self.memory_buffer.is_empty() {
            return;
        }
        let first_del = sorted_indices[0];
        let mem_len = self.memory_buffer.len();
        if first_del >= mem_len {
            return;
        }

        let mut write_pos = first_del;
        let mut delete_iter = sorted_indices.iter().peekable();
        for read_pos in first_del..mem_len {
            if let Some(&&del_idx) = delete_iter.peek()
                && read_pos == del_idx
            {
                delete_iter.next();
                continue;
            }
            if write_pos != read_pos {
                self.memory_buffer[write_pos] = self.memory_buffer[read_pos];
            }
            write_pos += 1;
        }
        self.memory_buffer.truncate(write_pos);
    }

    fn remove_disk_batch(&mut self, sorted_disk_indices: &[usize]) -> Result<()> {
        if sorted_disk_indices.is_empty() || self.disk_count == 0 {
            return Ok(());
        }
        let Some(ref mut mmap) = self.mmap else {
            return Ok(());
        };

        let first_del = sorted_disk_indices[0];
        if first_del >= self.disk_count {
            return Ok(());
        }

        let mut write_pos = first_del;
        let mut delete_iter = sorted_disk_indices.iter().peekable();
        for read_pos in first_del..self.disk_count {
            if let Some(&&del_idx) = delete_iter.peek() {
                if del_idx >= self.disk_count {
                    while delete_iter.next().is_some() {}
                } else if read_pos == del_idx {
                    delete_iter.next();
                    continue;
                }
            }
            if write_pos != read_pos {
                unsafe {
                    let src = mmap.as_ptr().add(read_pos * Self::ITEM_SIZE);
                    let dst = mmap.as_mut_ptr().add(write_pos * Self::ITEM_SIZE);
                    std::ptr::copy_nonoverlapping(src, dst, Self::ITEM_SIZE);
                }
            }
            write_pos += 1;
        }
        self.disk_count = write_pos;
        Ok(())
    }

    /// Retains only the given storage positions. Rebuilds when the keep
    /// set is the smaller side, otherwise deletes the complement.
    pub fn keep_only(&mut self, mut keep_indices: Vec<usize>) -> Result<()> {
        if keep_indices.is_empty() {
            self.memory_buffer.clear();
            self.disk_count = 0;
            self.total_count = 0;
            debug!("Kept 0 results, store emptied");
            return Ok(());
        }

        keep_indices.sort_unstable();
        keep_indices.dedup();
        keep_indices.retain(|&idx| idx < self.total_count);

        let keep_count = keep_indices.len();
        let remove_count = self.total_count.saturating_sub(keep_count);
        if remove_count == 0 {
            debug!("Keep retains all {} results", self.total_count);
            return Ok(());
        }

        if keep_count <= remove_count {
            let mut kept: Vec<MatchRecord> = Vec::with_capacity(keep_count);
            for &idx in &keep_indices {
                if idx < self.memory_buffer.len() {
                    kept.push(self.memory_buffer[idx]);
                } else {
                    let disk_index = idx - self.memory_buffer.len();
                    if disk_index < self.disk_count
                        && let Some(ref mmap) = self.mmap
                    {
                        unsafe {
                            let ptr = mmap.as_ptr().add(disk_index * Self::ITEM_SIZE)
                                as *const MatchRecord;
                            kept.push(ptr.read_unaligned());
                        }
                    }
                }
            }

            self.memory_buffer.clear();
            self.disk_count = 0;
            self.total_count = 0;
            for record in kept {
                self.append(record)?;
            }
            debug!("Keep rebuilt store with {} results", self.total_count);
        } else {
            let keep_set: std::collections::HashSet<usize> = keep_indices.into_iter().collect();
            let remove_indices: Vec<usize> =
                (0..self.total_count).filter(|i| !keep_set.contains(i)).collect();
            self.remove_batch(remove_indices)?;
            debug!("Keep deleted complement, {} results remain", self.total_count);
        }
        Ok(())
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.memory_buffer.clear();
        self.total_count = 0;
        self.drop_disk_file()?;
        Ok(())
    }
}

impl Drop for ResultStore {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}
