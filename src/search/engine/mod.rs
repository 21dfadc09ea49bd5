mod batch_reader;
mod memchr_ext;

pub mod fuzzy;
pub mod manager;
pub mod scanner;
pub mod session;
pub mod shared_buffer;

pub use manager::{
    CHUNK_SIZE_128K, CHUNK_SIZE_1M, CHUNK_SIZE_4M, CHUNK_SIZE_512K, EngineConfig, EngineError,
    PAGE_MASK, PAGE_SIZE, SearchEngine,
};
pub use session::{SearchSession, SessionSummary};
pub use shared_buffer::{
    SHARED_BUFFER_SIZE, SearchErrorCode, SearchStatus, SharedProgressBuffer,
};
