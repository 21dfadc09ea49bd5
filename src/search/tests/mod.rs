mod mock_memory;
mod refine_search_tests;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::search::engine::{CHUNK_SIZE_128K, EngineConfig, SHARED_BUFFER_SIZE, SearchEngine};
use mock_memory::MockMemory;

/// Engine over a mock accessor with a tempdir-backed cache. The tempdir
/// must outlive the engine.
fn test_engine(mock: Arc<MockMemory>) -> (SearchEngine, tempfile::TempDir) {
    test_engine_with_chunk(mock, CHUNK_SIZE_128K)
}

fn test_engine_with_chunk(
    mock: Arc<MockMemory>,
    chunk_size: usize,
) -> (SearchEngine, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = EngineConfig {
        result_buffer_bytes: 1024 * 1024,
        cache_dir: dir.path().to_path_buf(),
        chunk_size,
        failed_page_threshold: 4,
    };
    let engine = SearchEngine::new(config, mock).expect("engine");
    (engine, dir)
}

/// Client-side stand-in for the shared progress block.
struct TestBlock {
    buf: Box<[u8; SHARED_BUFFER_SIZE]>,
}

impl TestBlock {
    fn new() -> Self {
        Self { buf: Box::new([0u8; SHARED_BUFFER_SIZE]) }
    }

    fn register(&mut self, engine: &SearchEngine) {
        assert!(engine.set_shared_buffer(self.buf.as_mut_ptr(), SHARED_BUFFER_SIZE));
    }

    fn read_i32(&self, offset: usize) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[offset..offset + 4]);
        i32::from_le_bytes(bytes)
    }

    fn status(&self) -> i32 {
        self.read_i32(0)
    }

    fn progress(&self) -> i32 {
        self.read_i32(4)
    }

    fn regions_done(&self) -> i32 {
        self.read_i32(8)
    }

    fn found_count(&self) -> i64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[12..20]);
        i64::from_le_bytes(bytes)
    }

    fn error_code(&self) -> i32 {
        self.read_i32(28)
    }

    fn request_cancel(&mut self) {
        self.buf[24..28].copy_from_slice(&1i32.to_le_bytes());
    }
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}

/// Waits for the engine's session to leave `Searching`.
fn wait_terminal(engine: &SearchEngine) {
    assert!(
        wait_until(Duration::from_secs(20), || !engine.is_searching()),
        "search did not finish in time"
    );
}
