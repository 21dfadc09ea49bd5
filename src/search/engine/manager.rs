//! The engine handle: owns the result store, session state machine,
//! progress channel and the runtime the scan tasks run on. One handle
//! per bound process; there is no global engine state.

use anyhow::{Result, anyhow};
use lazy_static::lazy_static;
use log::{Level, debug, error, info, log_enabled, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::fuzzy;
use super::scanner::{self, ScanOptions, ScanOutcome};
use super::session::{SearchSession, SessionSummary};
use super::shared_buffer::{SearchErrorCode, SearchStatus, SharedProgressBuffer};
use crate::accessor::MemoryAccessor;
use crate::search::codec::{self, CodecError};
use crate::search::filter::ResultFilter;
use crate::search::store::{MatchRecord, ResultStore};
use crate::search::types::{FuzzyCondition, MemoryRange, SearchResultItem, ValueType};

pub const CHUNK_SIZE_128K: usize = 128 * 1024;
pub const CHUNK_SIZE_512K: usize = 512 * 1024;
pub const CHUNK_SIZE_1M: usize = 1024 * 1024;
pub const CHUNK_SIZE_4M: usize = 4 * 1024 * 1024;

pub const DEFAULT_RESULT_BUFFER_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_FAILED_PAGE_THRESHOLD: u32 = 4;

lazy_static! {
    pub static ref PAGE_SIZE: usize = {
        nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .filter(|&size| size > 0)
            .map(|size| size as usize)
            .unwrap_or(4096)
    };
    pub static ref PAGE_MASK: usize = !(*PAGE_SIZE - 1);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// In-memory result budget before the store spills to disk.
    pub result_buffer_bytes: usize,
    /// Directory for the spillover cache file.
    pub cache_dir: PathBuf,
    /// Chunk read size; 0 falls back to the 512 KiB default.
    pub chunk_size: usize,
    /// Consecutive chunk-read failures tolerated before a region is
    /// abandoned.
    pub failed_page_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            result_buffer_bytes: DEFAULT_RESULT_BUFFER_BYTES,
            cache_dir: std::env::temp_dir(),
            chunk_size: CHUNK_SIZE_512K,
            failed_page_threshold: DEFAULT_FAILED_PAGE_THRESHOLD,
        }
    }
}

/// Synchronous-call failures. Asynchronous scan faults never surface
/// here; they travel through the progress block as status + error code.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not bound to a target process")]
    NotInitialized,
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] CodecError),
    #[error("a search is already in progress")]
    AlreadySearching,
    #[error("operation rejected while a search is running")]
    Busy,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct SearchEngine {
    accessor: Arc<dyn MemoryAccessor>,
    store: Arc<RwLock<ResultStore>>,
    filter: RwLock<ResultFilter>,
    shared: Arc<SharedProgressBuffer>,
    session: Arc<SearchSession>,
    chunk_size: usize,
    failed_page_threshold: u32,
    runtime: tokio::runtime::Runtime,
}

impl SearchEngine {
    pub fn new(config: EngineConfig, accessor: Arc<dyn MemoryAccessor>) -> Result<Self> {
        let chunk_size = if config.chunk_size == 0 {
            CHUNK_SIZE_512K
        } else {
            config.chunk_size
        };
        std::fs::create_dir_all(&config.cache_dir)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("memscout-search")
            .enable_all()
            .build()?;

        info!(
            "Search engine initialized: chunk_size={} KB, buffer={} MB, cache_dir={:?}",
            chunk_size / 1024,
            config.result_buffer_bytes / 1024 / 1024,
            config.cache_dir
        );

        Ok(Self {
            accessor,
            store: Arc::new(RwLock::new(ResultStore::new(
                config.result_buffer_bytes,
                config.cache_dir,
            ))),
            filter: RwLock::new(ResultFilter::default()),
            shared: Arc::new(SharedProgressBuffer::new()),
            session: Arc::new(SearchSession::new()),
            chunk_size,
            failed_page_threshold: config.failed_page_threshold,
            runtime,
        })
    }

    /// Registers the client-allocated progress block.
    ///
    /// # Safety
    /// The pointer must stay valid and at least `SHARED_BUFFER_SIZE`
    /// bytes long until [`clear_shared_buffer`](Self::clear_shared_buffer)
    /// or engine drop.
    pub fn set_shared_buffer(&self, ptr: *mut u8, len: usize) -> bool {
        self.shared.set(ptr, len)
    }

    pub fn clear_shared_buffer(&self) {
        self.shared.clear();
    }

    #[inline]
    pub fn is_searching(&self) -> bool {
        self.session.is_searching()
    }

    #[inline]
    pub fn session_status(&self) -> SearchStatus {
        self.session.status()
    }

    pub fn last_summary(&self) -> Option<SessionSummary> {
        self.session.last_summary()
    }

    /// Cooperative cancel; a no-op unless a search is running. The
    /// caller polls for the `Cancelled` transition.
    pub fn request_cancel(&self) {
        self.session.request_cancel();
    }

    fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            chunk_size: self.chunk_size,
            failed_page_threshold: self.failed_page_threshold,
        }
    }

    /// Starts a full scan of `ranges` for `query` encoded as
    /// `value_type`. Returns immediately; progress and completion are
    /// observed through the progress block. A failing precondition
    /// never writes the block, so a losing race cannot clobber the
    /// running session's channel.
    pub fn start_search_async(
        &self,
        query: &str,
        value_type: ValueType,
        ranges: Vec<MemoryRange>,
        deep: bool,
    ) -> Result<(), EngineError> {
        if !self.accessor.is_process_bound() {
            return Err(EngineError::NotInitialized);
        }
        let pattern = codec::encode(query, value_type)?;
        let token = self.session.try_begin().ok_or(EngineError::AlreadySearching)?;

        if let Err(err) = self.prepare_store_for_scan(pattern.len()) {
            self.fail_claimed_session();
            return Err(err.into());
        }

        self.shared.reset();
        self.shared.clear_cancel_flag();
        self.shared.write_status(SearchStatus::Searching);

        if log_enabled!(Level::Debug) {
            debug!(
                "Starting search: type={}, pattern_len={}, regions={}, chunk_size={} KB, deep={}",
                value_type,
                pattern.len(),
                ranges.len(),
                self.chunk_size / 1024,
                deep
            );
        }

        let ctx = self.task_context(token);
        let options = self.scan_options();
        self.runtime.spawn(async move {
            run_scan_task(ctx, pattern, value_type, ranges, deep, options).await;
        });
        Ok(())
    }

    /// Narrows the existing result set by re-testing each stored
    /// address's current memory value against the new query. An empty
    /// store completes immediately with zero found rather than failing.
    pub fn start_refine_async(
        &self,
        query: &str,
        value_type: ValueType,
    ) -> Result<(), EngineError> {
        if !self.accessor.is_process_bound() {
            return Err(EngineError::NotInitialized);
        }
        let pattern = codec::encode(query, value_type)?;
        let token = self.session.try_begin().ok_or(EngineError::AlreadySearching)?;

        let snapshot = match self.snapshot_store() {
            Ok(records) => records,
            Err(err) => {
                self.fail_claimed_session();
                return Err(err.into());
            }
        };

        if snapshot.is_empty() {
            warn!("No results to refine");
            self.complete_claimed_session(0, 0);
            return Ok(());
        }

        self.shared.reset();
        self.shared.clear_cancel_flag();
        self.shared.write_status(SearchStatus::Searching);

        let ctx = self.task_context(token);
        self.runtime.spawn(async move {
            run_refine_task(ctx, pattern, value_type, snapshot).await;
        });
        Ok(())
    }

    /// Records every aligned slot's current value across `ranges` as a
    /// fuzzy result, replacing the store.
    pub fn start_unknown_search_async(
        &self,
        value_type: ValueType,
        ranges: Vec<MemoryRange>,
    ) -> Result<(), EngineError> {
        if !self.accessor.is_process_bound() {
            return Err(EngineError::NotInitialized);
        }
        let width = value_type.fixed_width().ok_or_else(|| {
            EngineError::InvalidArgument(format!(
                "{value_type} has no fixed width for an unknown-value scan"
            ))
        })?;
        let token = self.session.try_begin().ok_or(EngineError::AlreadySearching)?;

        if let Err(err) = self.prepare_store_for_scan(width) {
            self.fail_claimed_session();
            return Err(err.into());
        }

        self.shared.reset();
        self.shared.clear_cancel_flag();
        self.shared.write_status(SearchStatus::Searching);

        let ctx = self.task_context(token);
        let options = self.scan_options();
        self.runtime.spawn(async move {
            run_unknown_scan_task(ctx, value_type, width, ranges, options).await;
        });
        Ok(())
    }

    /// Keeps the stored slots whose old-to-new change satisfies
    /// `condition`, updating each survivor's snapshot.
    pub fn start_fuzzy_refine_async(&self, condition: FuzzyCondition) -> Result<(), EngineError> {
        if !self.accessor.is_process_bound() {
            return Err(EngineError::NotInitialized);
        }
        let token = self.session.try_begin().ok_or(EngineError::AlreadySearching)?;

        let snapshot = match self.snapshot_store() {
            Ok(records) => records,
            Err(err) => {
                self.fail_claimed_session();
                return Err(err.into());
            }
        };

        if snapshot.is_empty() {
            warn!("No results to refine");
            self.complete_claimed_session(0, 0);
            return Ok(());
        }

        self.shared.reset();
        self.shared.clear_cancel_flag();
        self.shared.write_status(SearchStatus::Searching);

        let ctx = self.task_context(token);
        self.runtime.spawn(async move {
            run_fuzzy_refine_task(ctx, condition, snapshot).await;
        });
        Ok(())
    }

    /// Blocking wrapper over the async scan: starts it and waits on the
    /// session's completion channel, polling the state machine as a
    /// fallback in case the channel handoff is missed.
    pub fn search_blocking(
        &self,
        query: &str,
        value_type: ValueType,
        ranges: Vec<MemoryRange>,
        deep: bool,
    ) -> Result<SessionSummary, EngineError> {
        self.start_search_async(query, value_type, ranges, deep)?;
        let receiver = self.session.completion_receiver();

        loop {
            if let Some(ref rx) = receiver {
                match rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(summary) => return Ok(summary),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            } else {
                break;
            }
            if !self.session.is_searching()
                && let Some(summary) = self.session.last_summary()
            {
                return Ok(summary);
            }
        }

        self.session
            .last_summary()
            .ok_or_else(|| EngineError::Internal(anyhow!("search finished without a summary")))
    }

    /// One page of results honoring the applied filter. Every item is
    /// tagged with its storage position; those positions are what the
    /// mutating calls below expect, and any such call invalidates them.
    pub fn results(&self, offset: usize, count: usize) -> Result<Vec<SearchResultItem>, EngineError> {
        let filter = self
            .filter
            .read()
            .map_err(|_| anyhow!("filter lock poisoned"))?
            .clone();
        let store = self
            .store
            .read()
            .map_err(|_| anyhow!("result store lock poisoned"))?;
        let page = store.get_view(&filter, offset, count)?;
        let value_len = store.value_len();
        Ok(page
            .into_iter()
            .map(|(position, record)| record.to_item(position, value_len))
            .collect())
    }

    /// Result count as seen through the applied filter.
    pub fn total_results(&self) -> Result<u64, EngineError> {
        let filter = self
            .filter
            .read()
            .map_err(|_| anyhow!("filter lock poisoned"))?
            .clone();
        let store = self
            .store
            .read()
            .map_err(|_| anyhow!("result store lock poisoned"))?;
        Ok(store.view_count(&filter)? as u64)
    }

    pub fn clear_results(&self) -> Result<(), EngineError> {
        self.ensure_not_searching()?;
        let mut store = self
            .store
            .write()
            .map_err(|_| anyhow!("result store lock poisoned"))?;
        store.clear()?;
        Ok(())
    }

    pub fn remove_result(&self, position: u64) -> Result<(), EngineError> {
        self.remove_results(&[position])
    }

    /// Removes the given storage positions and compacts. All positions
    /// fetched before this call are invalid afterwards.
    pub fn remove_results(&self, positions: &[u64]) -> Result<(), EngineError> {
        self.ensure_not_searching()?;
        let mut store = self
            .store
            .write()
            .map_err(|_| anyhow!("result store lock poisoned"))?;
        store.remove_batch(positions.iter().map(|&p| p as usize).collect())?;
        Ok(())
    }

    /// Retains only the given storage positions; same compaction and
    /// invalidation rule as [`remove_results`](Self::remove_results).
    pub fn keep_only_results(&self, positions: &[u64]) -> Result<(), EngineError> {
        self.ensure_not_searching()?;
        let mut store = self
            .store
            .write()
            .map_err(|_| anyhow!("result store lock poisoned"))?;
        store.keep_only(positions.iter().map(|&p| p as usize).collect())?;
        Ok(())
    }

    pub fn set_filter(&self, filter: ResultFilter) -> Result<(), EngineError> {
        self.ensure_not_searching()?;
        let mut slot = self
            .filter
            .write()
            .map_err(|_| anyhow!("filter lock poisoned"))?;
        *slot = filter;
        Ok(())
    }

    pub fn clear_filter(&self) -> Result<(), EngineError> {
        self.set_filter(ResultFilter::default())
    }

    fn ensure_not_searching(&self) -> Result<(), EngineError> {
        if self.session.is_searching() {
            return Err(EngineError::Busy);
        }
        Ok(())
    }

    fn prepare_store_for_scan(&self, value_len: usize) -> Result<()> {
        let mut store = self
            .store
            .write()
            .map_err(|_| anyhow!("result store lock poisoned"))?;
        store.clear()?;
        store.set_value_len(value_len);
        Ok(())
    }

    fn snapshot_store(&self) -> Result<Vec<MatchRecord>> {
        let store = self
            .store
            .read()
            .map_err(|_| anyhow!("result store lock poisoned"))?;
        store.get_all()
    }

    /// Terminal bookkeeping for a session that failed before its task
    /// was spawned. The block is untouched: a synchronous error must
    /// not overwrite whatever the client last observed.
    fn fail_claimed_session(&self) {
        self.session.finish(SessionSummary {
            status: SearchStatus::Error,
            total_found: 0,
            total_regions: 0,
            elapsed_millis: 0,
        });
    }

    /// Immediate completion for degenerate starts (refine over an empty
    /// store). This one does write the block: the session was claimed
    /// and the client expects a terminal status to poll.
    fn complete_claimed_session(&self, found: u64, regions: usize) {
        self.shared.write_progress(100);
        self.shared.write_found_count(found as i64);
        self.shared.write_status(SearchStatus::Completed);
        self.session.finish(SessionSummary {
            status: SearchStatus::Completed,
            total_found: found,
            total_regions: regions,
            elapsed_millis: 0,
        });
    }

    fn task_context(&self, token: CancellationToken) -> TaskContext {
        TaskContext {
            accessor: Arc::clone(&self.accessor),
            store: Arc::clone(&self.store),
            shared: Arc::clone(&self.shared),
            session: Arc::clone(&self.session),
            token,
        }
    }
}

/// Everything a background task needs, detached from the handle's
/// lifetime guarantees by `Arc`s.
struct TaskContext {
    accessor: Arc<dyn MemoryAccessor>,
    store: Arc<RwLock<ResultStore>>,
    shared: Arc<SharedProgressBuffer>,
    session: Arc<SearchSession>,
    token: CancellationToken,
}

impl TaskContext {
    fn check_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.shared.is_cancel_requested()
    }

    /// Terminal transition: progress fields first, status last, summary
    /// into the session. No store lock is held at this point, so a
    /// client that sees the terminal status can page results at once.
    fn finish(&self, status: SearchStatus, code: SearchErrorCode, summary: SessionSummary) {
        self.shared.write_found_count(summary.total_found as i64);
        if status == SearchStatus::Completed {
            self.shared.write_progress(100);
            self.shared.write_regions_done(summary.total_regions as i32);
        }
        if status == SearchStatus::Error {
            self.shared.write_error_code(code);
        }
        self.shared.write_status(status);
        self.session.finish(summary);
    }
}

async fn run_scan_task(
    ctx: TaskContext,
    pattern: Vec<u8>,
    value_type: ValueType,
    ranges: Vec<MemoryRange>,
    deep: bool,
    options: ScanOptions,
) {
    let started = Instant::now();
    let accessor = Arc::clone(&ctx.accessor);
    let store = Arc::clone(&ctx.store);
    let shared = Arc::clone(&ctx.shared);
    let token = ctx.token.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<ScanOutcome> {
        let check_cancelled = || token.is_cancelled() || shared.is_cancel_requested();
        let mut sink = |records: Vec<MatchRecord>, progress: &scanner::ScanProgress| -> Result<()> {
            if !records.is_empty() {
                let mut store = store
                    .write()
                    .map_err(|_| anyhow!("result store lock poisoned"))?;
                store.append_batch(&records)?;
            }
            shared.update_search_progress(
                progress.percent(),
                progress.regions_done as i32,
                progress.matches_so_far as i64,
            );
            Ok(())
        };
        scanner::scan_ranges(
            accessor.as_ref(),
            &ranges,
            &pattern,
            value_type,
            deep,
            &options,
            &check_cancelled,
            &mut sink,
        )
    })
    .await;

    settle_scan_outcome(&ctx, result, started, "Search");
}

async fn run_unknown_scan_task(
    ctx: TaskContext,
    value_type: ValueType,
    width: usize,
    ranges: Vec<MemoryRange>,
    options: ScanOptions,
) {
    let started = Instant::now();
    let accessor = Arc::clone(&ctx.accessor);
    let store = Arc::clone(&ctx.store);
    let shared = Arc::clone(&ctx.shared);
    let token = ctx.token.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<ScanOutcome> {
        let check_cancelled = || token.is_cancelled() || shared.is_cancel_requested();
        let mut sink = |records: Vec<MatchRecord>, progress: &scanner::ScanProgress| -> Result<()> {
            if !records.is_empty() {
                let mut store = store
                    .write()
                    .map_err(|_| anyhow!("result store lock poisoned"))?;
                store.append_batch(&records)?;
            }
            shared.update_search_progress(
                progress.percent(),
                progress.regions_done as i32,
                progress.matches_so_far as i64,
            );
            Ok(())
        };
        fuzzy::unknown_initial_scan(
            accessor.as_ref(),
            &ranges,
            value_type,
            width,
            &options,
            &check_cancelled,
            &mut sink,
        )
    })
    .await;

    settle_scan_outcome(&ctx, result, started, "Unknown-value scan");
}

/// Shared terminal handling for the chunk-walking tasks.
fn settle_scan_outcome(
    ctx: &TaskContext,
    result: Result<Result<ScanOutcome>, tokio::task::JoinError>,
    started: Instant,
    what: &str,
) {
    let elapsed_millis = started.elapsed().as_millis() as u64;
    match result {
        Ok(Ok(outcome)) => {
            let status = if outcome.cancelled || ctx.check_cancelled() {
                SearchStatus::Cancelled
            } else {
                SearchStatus::Completed
            };
            info!(
                "{} {}: {} results over {} regions in {} ms",
                what,
                if status == SearchStatus::Cancelled { "cancelled" } else { "completed" },
                outcome.total_found,
                outcome.regions_done,
                elapsed_millis
            );
            ctx.finish(
                status,
                SearchErrorCode::None,
                SessionSummary {
                    status,
                    total_found: outcome.total_found,
                    total_regions: outcome.regions_done,
                    elapsed_millis,
                },
            );
        }
        Ok(Err(err)) => {
            error!("{} failed: {:?}", what, err);
            ctx.finish(
                SearchStatus::Error,
                SearchErrorCode::InternalError,
                SessionSummary {
                    status: SearchStatus::Error,
                    total_found: 0,
                    total_regions: 0,
                    elapsed_millis,
                },
            );
        }
        Err(join_err) => {
            error!("{} task panicked: {:?}", what, join_err);
            ctx.finish(
                SearchStatus::Error,
                SearchErrorCode::InternalError,
                SessionSummary {
                    status: SearchStatus::Error,
                    total_found: 0,
                    total_regions: 0,
                    elapsed_millis,
                },
            );
        }
    }
}

async fn run_refine_task(
    ctx: TaskContext,
    pattern: Vec<u8>,
    value_type: ValueType,
    snapshot: Vec<MatchRecord>,
) {
    let started = Instant::now();
    let total = snapshot.len();
    let pattern_len = pattern.len();
    let accessor = Arc::clone(&ctx.accessor);
    let shared = Arc::clone(&ctx.shared);
    let token = ctx.token.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<(Vec<MatchRecord>, bool)> {
        let check_cancelled = || token.is_cancelled() || shared.is_cancel_requested();
        if check_cancelled() {
            return Ok((Vec::new(), true));
        }

        // Records of another type cannot match the new pattern; drop
        // them up front so the batch widths stay uniform.
        let candidates: Vec<MatchRecord> = snapshot
            .into_iter()
            .filter(|record| record.value_type() == value_type)
            .collect();

        let items: Vec<(u64, usize)> = candidates
            .iter()
            .map(|record| (record.address, pattern.len()))
            .collect();
        let batches = super::batch_reader::cluster_addresses(&items);

        let on_processed = |processed: usize| {
            let percent = if total == 0 {
                100
            } else {
                ((processed as f64 / total as f64) * 100.0) as i32
            };
            // regionsDone carries processed-record counts during refines.
            shared.update_search_progress(percent, processed as i32, 0);
        };

        let mut reads = super::batch_reader::parallel_batch_read(
            accessor.as_ref(),
            &batches,
            &on_processed,
            Some(&check_cancelled),
        )?;
        if check_cancelled() {
            return Ok((Vec::new(), true));
        }
        reads.sort_unstable_by_key(|(index, _)| *index);

        let survivors: Vec<MatchRecord> = reads
            .into_iter()
            .filter_map(|(index, bytes)| {
                if bytes == pattern {
                    Some(candidates[index].with_new_value(&bytes))
                } else {
                    None
                }
            })
            .collect();
        Ok((survivors, false))
    })
    .await;

    settle_refine_outcome(&ctx, result, started, total, Some(pattern_len), "Refine");
}

async fn run_fuzzy_refine_task(
    ctx: TaskContext,
    condition: FuzzyCondition,
    snapshot: Vec<MatchRecord>,
) {
    let started = Instant::now();
    let total = snapshot.len();
    let accessor = Arc::clone(&ctx.accessor);
    let shared = Arc::clone(&ctx.shared);
    let token = ctx.token.clone();

    let result = tokio::task::spawn_blocking(move || -> Result<(Vec<MatchRecord>, bool)> {
        let check_cancelled = || token.is_cancelled() || shared.is_cancel_requested();
        if check_cancelled() {
            return Ok((Vec::new(), true));
        }

        let on_processed = |processed: usize| {
            let percent = if total == 0 {
                100
            } else {
                ((processed as f64 / total as f64) * 100.0) as i32
            };
            shared.update_search_progress(percent, processed as i32, 0);
        };

        let survivors = fuzzy::condition_refine(
            accessor.as_ref(),
            &snapshot,
            condition,
            &check_cancelled,
            &on_processed,
        )?;
        let cancelled = check_cancelled();
        Ok((survivors, cancelled))
    })
    .await;

    settle_refine_outcome(&ctx, result, started, total, None, "Fuzzy refine");
}

/// Shared terminal handling for the refine tasks. A cancelled refine
/// leaves the previous result set untouched; a completed one replaces
/// the store with the survivors before the terminal status is written.
fn settle_refine_outcome(
    ctx: &TaskContext,
    result: Result<Result<(Vec<MatchRecord>, bool)>, tokio::task::JoinError>,
    started: Instant,
    total_before: usize,
    new_value_len: Option<usize>,
    what: &str,
) {
    let elapsed_millis = started.elapsed().as_millis() as u64;
    let settled: Result<(Vec<MatchRecord>, bool)> = match result {
        Ok(inner) => inner,
        Err(join_err) => Err(anyhow!("{} task panicked: {:?}", what, join_err)),
    };

    match settled {
        Ok((_, true)) => {
            info!("{} cancelled; previous result set kept", what);
            ctx.finish(
                SearchStatus::Cancelled,
                SearchErrorCode::None,
                SessionSummary {
                    status: SearchStatus::Cancelled,
                    total_found: total_before as u64,
                    total_regions: 0,
                    elapsed_millis,
                },
            );
        }
        Ok((survivors, false)) => {
            let count = survivors.len() as u64;
            let replace = {
                match ctx.store.write() {
                    Ok(mut store) => {
                        let outcome = store.replace_all(survivors);
                        if outcome.is_ok()
                            && let Some(len) = new_value_len
                            && len > 0
                        {
                            store.set_value_len(len);
                        }
                        outcome
                    }
                    Err(_) => Err(anyhow!("result store lock poisoned")),
                }
                // Lock released before the terminal status goes out.
            };
            match replace {
                Ok(()) => {
                    info!(
                        "{} completed: {} -> {} results in {} ms",
                        what, total_before, count, elapsed_millis
                    );
                    // regionsDone reports records processed for refines.
                    ctx.finish(
                        SearchStatus::Completed,
                        SearchErrorCode::None,
                        SessionSummary {
                            status: SearchStatus::Completed,
                            total_found: count,
                            total_regions: total_before,
                            elapsed_millis,
                        },
                    );
                }
                Err(err) => {
                    error!("{} failed to store results: {:?}", what, err);
                    ctx.finish(
                        SearchStatus::Error,
                        SearchErrorCode::InternalError,
                        SessionSummary {
                            status: SearchStatus::Error,
                            total_found: 0,
                            total_regions: 0,
                            elapsed_millis,
                        },
                    );
                }
            }
        }
        Err(err) => {
            error!("{} failed: {:?}", what, err);
            ctx.finish(
                SearchStatus::Error,
                SearchErrorCode::InternalError,
                SessionSummary {
                    status: SearchStatus::Error,
                    total_found: 0,
                    total_regions: 0,
                    elapsed_millis,
                },
            );
        }
    }
}
