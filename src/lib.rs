//! memscout: value search over a target process's address space.
//!
//! The crate is organized around [`search::SearchEngine`], which scans
//! the regions reported by a [`accessor::MemoryAccessor`], keeps the
//! matches in a spillable result store, and reports progress through a
//! client-shared 32-byte block.

pub mod accessor;
pub mod search;

pub use accessor::{MemoryAccessor, RegionInfo};
pub use search::{
    EngineConfig, EngineError, MatchRecord, MemoryRange, ResultFilter, SearchEngine,
    SearchResultItem, SearchStatus, ValueType,
};
